use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{FlowInstanceStatus, FlowModel, FlowModuleStatus, NodeInstance};

/// 引擎操作的参数与结果

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateFlowParam {
    pub flow_key: String,
    pub flow_name: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub remark: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateFlowParam {
    pub flow_module_id: String,
    #[serde(default)]
    pub flow_key: Option<String>,
    #[serde(default)]
    pub flow_name: Option<String>,
    #[serde(default)]
    pub flow_model: Option<FlowModel>,
    #[serde(default)]
    pub remark: Option<String>,
}

/// flow_deploy_id 优先于 flow_module_id
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetFlowModuleParam {
    #[serde(default)]
    pub flow_module_id: Option<String>,
    #[serde(default)]
    pub flow_deploy_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StartProcessParam {
    #[serde(default)]
    pub flow_deploy_id: Option<String>,
    #[serde(default)]
    pub flow_module_id: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

/// 流程定义信息视图
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowModuleInfo {
    pub flow_module_id: String,
    pub flow_key: String,
    pub flow_name: String,
    pub flow_model: Option<FlowModel>,
    pub version: u32,
    pub status: FlowModuleStatus,
    pub remark: String,
}

/// start/commit/rollback/terminate 的统一结果。
/// active_task 可能属于子流程实例，其 flow_instance_id 指明提交目标。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessResult {
    pub flow_instance_id: String,
    pub status: FlowInstanceStatus,
    pub active_task: Option<NodeInstance>,
}
