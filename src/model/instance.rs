use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::element::ElementType;

/// 运行时实例模型

/// 流程实例状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowInstanceStatus {
    Active,
    Completed,
    Terminated,
}

/// 流程实例，一次部署流程的执行
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowInstance {
    pub flow_instance_id: String,
    pub flow_deploy_id: String,
    pub flow_module_id: String,
    pub flow_key: String,
    /// 顶层调用方的流程 key，嵌套层级配置按它查询
    pub root_flow_key: String,
    pub parent_instance_id: Option<String>,
    pub parent_node_instance_id: Option<String>,
    pub nesting_depth: u32,
    pub status: FlowInstanceStatus,
    /// 当前活动节点实例指针，仅在成功挂起时前移
    pub current_node_instance_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// 节点实例状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeInstanceStatus {
    Active,
    Completed,
    Terminated,
    /// 被回滚作废，保留在历史中
    Disabled,
}

impl NodeInstanceStatus {
    /// 状态机允许的迁移；Completed→Active 仅发生在回滚重新激活
    pub fn can_transition(self, to: NodeInstanceStatus) -> bool {
        use NodeInstanceStatus::*;
        matches!(
            (self, to),
            (Active, Completed)
                | (Active, Terminated)
                | (Active, Disabled)
                | (Completed, Disabled)
                | (Completed, Active)
        )
    }
}

/// 节点实例，流程实例内一个节点的执行记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInstance {
    pub node_instance_id: String,
    pub flow_instance_id: String,
    pub node_key: String,
    pub element_type: ElementType,
    pub source_node_instance_id: Option<String>,
    pub source_node_key: Option<String>,
    /// CallActivity 节点创建的子流程实例
    pub child_flow_instance_id: Option<String>,
    /// 本记录创建时的变量快照版本，回滚回退到该版本
    pub data_version: u64,
    pub status: NodeInstanceStatus,
    /// 实例内单调递增的执行序号，回滚按它倒序遍历
    pub sequence: u64,
    pub created_at: u64,
    pub completed_at: Option<u64>,
}

/// 节点实例状态变更日志，只追加，仅供历史查询
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInstanceLog {
    pub log_id: String,
    pub flow_instance_id: String,
    pub node_instance_id: String,
    pub node_key: String,
    pub element_type: ElementType,
    /// 进入的状态
    pub status: NodeInstanceStatus,
    pub sequence: u64,
    pub created_at: u64,
}

/// 一个命名变量
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceData {
    pub key: String,
    pub value: Value,
}

/// 变量快照记录的来源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceDataType {
    Init,
    Commit,
    Hook,
    Service,
    CallActivity,
    Rollback,
}

/// 变量快照记录：版本递增的全量快照，历史永不删除
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceDataRecord {
    pub instance_data_id: String,
    pub flow_instance_id: String,
    pub node_instance_id: Option<String>,
    pub node_key: Option<String>,
    pub data: BTreeMap<String, Value>,
    pub version: u64,
    pub record_type: InstanceDataType,
    pub created_at: u64,
}

impl InstanceDataRecord {
    /// 按 key 排序输出变量列表
    pub fn variables(&self) -> Vec<InstanceData> {
        self.data
            .iter()
            .map(|(key, value)| InstanceData {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }
}
