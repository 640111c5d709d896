use serde::{Deserialize, Serialize};

use super::element::FlowModel;

/// 流程定义生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowModuleStatus {
    /// 已创建，模型尚未设置
    Init,
    /// 模型编辑中，尚未（重新）部署
    Editing,
    /// 至少部署过一次
    Published,
}

/// 流程定义，版本单调递增，部署后由新版本取代而非修改
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub flow_module_id: String,
    pub flow_key: String,
    pub flow_name: String,
    pub flow_model: Option<FlowModel>,
    pub version: u32,
    pub status: FlowModuleStatus,
    pub operator: String,
    pub remark: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// 流程部署，某一版本定义的不可变快照，实例只认部署
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowDeployment {
    pub flow_deploy_id: String,
    pub flow_module_id: String,
    pub flow_key: String,
    pub flow_name: String,
    pub flow_model: FlowModel,
    pub version: u32,
    pub created_at: u64,
}
