use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    FlowDefinition, FlowDeployment, FlowInstance, InstanceDataRecord, NodeInstance,
    NodeInstanceLog,
};

/// 持久化协作方接口，引擎按聚合原子读写
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn save_definition(&self, definition: FlowDefinition) -> Result<()>;
    async fn definition(&self, flow_module_id: &str) -> Result<Option<FlowDefinition>>;
    async fn update_definition(&self, definition: FlowDefinition) -> Result<()>;

    async fn save_deployment(&self, deployment: FlowDeployment) -> Result<()>;
    async fn deployment(&self, flow_deploy_id: &str) -> Result<Option<FlowDeployment>>;
    async fn latest_deployment_by_module(
        &self,
        flow_module_id: &str,
    ) -> Result<Option<FlowDeployment>>;
    async fn latest_deployment_by_key(&self, flow_key: &str) -> Result<Option<FlowDeployment>>;

    async fn save_instance(&self, instance: FlowInstance) -> Result<()>;
    async fn instance(&self, flow_instance_id: &str) -> Result<Option<FlowInstance>>;
    async fn update_instance(&self, instance: FlowInstance) -> Result<()>;
    async fn child_instances(&self, parent_instance_id: &str) -> Result<Vec<FlowInstance>>;

    async fn save_node_instance(&self, node_instance: NodeInstance) -> Result<()>;
    async fn update_node_instance(&self, node_instance: NodeInstance) -> Result<()>;
    async fn node_instance(
        &self,
        flow_instance_id: &str,
        node_instance_id: &str,
    ) -> Result<Option<NodeInstance>>;
    /// 按 sequence 升序
    async fn node_instances(&self, flow_instance_id: &str) -> Result<Vec<NodeInstance>>;

    async fn append_log(&self, log: NodeInstanceLog) -> Result<()>;
    async fn logs(&self, flow_instance_id: &str) -> Result<Vec<NodeInstanceLog>>;

    async fn append_data_record(&self, record: InstanceDataRecord) -> Result<()>;
    async fn data_record(
        &self,
        flow_instance_id: &str,
        instance_data_id: &str,
    ) -> Result<Option<InstanceDataRecord>>;
    /// 版本最高的快照
    async fn latest_data_record(
        &self,
        flow_instance_id: &str,
    ) -> Result<Option<InstanceDataRecord>>;
    /// 指定版本的快照，回滚回退数据时使用
    async fn data_record_by_version(
        &self,
        flow_instance_id: &str,
        version: u64,
    ) -> Result<Option<InstanceDataRecord>>;
}

#[cfg(feature = "memory-store")]
mod memory;
#[cfg(feature = "memory-store")]
pub use memory::MemoryStore;
