use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{ProcflowError, Result};
use crate::model::{
    FlowDefinition, FlowDeployment, FlowInstance, InstanceDataRecord, NodeInstance,
    NodeInstanceLog,
};

use super::FlowStore;

/// 内存存储实现
#[derive(Default)]
pub struct MemoryStore {
    definitions: RwLock<HashMap<String, FlowDefinition>>,
    /// 按部署顺序追加，最新部署取末尾匹配项
    deployments: RwLock<Vec<FlowDeployment>>,
    instances: RwLock<HashMap<String, FlowInstance>>,
    node_instances: RwLock<HashMap<String, Vec<NodeInstance>>>,
    logs: RwLock<HashMap<String, Vec<NodeInstanceLog>>>,
    data_records: RwLock<HashMap<String, Vec<InstanceDataRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn save_definition(&self, definition: FlowDefinition) -> Result<()> {
        self.definitions
            .write()
            .insert(definition.flow_module_id.clone(), definition);
        Ok(())
    }

    async fn definition(&self, flow_module_id: &str) -> Result<Option<FlowDefinition>> {
        Ok(self.definitions.read().get(flow_module_id).cloned())
    }

    async fn update_definition(&self, definition: FlowDefinition) -> Result<()> {
        let mut definitions = self.definitions.write();
        if !definitions.contains_key(&definition.flow_module_id) {
            return Err(ProcflowError::Store(format!(
                "definition `{}` does not exist",
                definition.flow_module_id
            )));
        }
        definitions.insert(definition.flow_module_id.clone(), definition);
        Ok(())
    }

    async fn save_deployment(&self, deployment: FlowDeployment) -> Result<()> {
        self.deployments.write().push(deployment);
        Ok(())
    }

    async fn deployment(&self, flow_deploy_id: &str) -> Result<Option<FlowDeployment>> {
        Ok(self
            .deployments
            .read()
            .iter()
            .find(|d| d.flow_deploy_id == flow_deploy_id)
            .cloned())
    }

    async fn latest_deployment_by_module(
        &self,
        flow_module_id: &str,
    ) -> Result<Option<FlowDeployment>> {
        Ok(self
            .deployments
            .read()
            .iter()
            .rev()
            .find(|d| d.flow_module_id == flow_module_id)
            .cloned())
    }

    async fn latest_deployment_by_key(&self, flow_key: &str) -> Result<Option<FlowDeployment>> {
        Ok(self
            .deployments
            .read()
            .iter()
            .rev()
            .find(|d| d.flow_key == flow_key)
            .cloned())
    }

    async fn save_instance(&self, instance: FlowInstance) -> Result<()> {
        self.instances
            .write()
            .insert(instance.flow_instance_id.clone(), instance);
        Ok(())
    }

    async fn instance(&self, flow_instance_id: &str) -> Result<Option<FlowInstance>> {
        Ok(self.instances.read().get(flow_instance_id).cloned())
    }

    async fn update_instance(&self, instance: FlowInstance) -> Result<()> {
        let mut instances = self.instances.write();
        if !instances.contains_key(&instance.flow_instance_id) {
            return Err(ProcflowError::Store(format!(
                "flow instance `{}` does not exist",
                instance.flow_instance_id
            )));
        }
        instances.insert(instance.flow_instance_id.clone(), instance);
        Ok(())
    }

    async fn child_instances(&self, parent_instance_id: &str) -> Result<Vec<FlowInstance>> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| i.parent_instance_id.as_deref() == Some(parent_instance_id))
            .cloned()
            .collect())
    }

    async fn save_node_instance(&self, node_instance: NodeInstance) -> Result<()> {
        self.node_instances
            .write()
            .entry(node_instance.flow_instance_id.clone())
            .or_default()
            .push(node_instance);
        Ok(())
    }

    async fn update_node_instance(&self, node_instance: NodeInstance) -> Result<()> {
        let mut all = self.node_instances.write();
        let list = all
            .get_mut(&node_instance.flow_instance_id)
            .ok_or_else(|| {
                ProcflowError::Store(format!(
                    "flow instance `{}` has no node instances",
                    node_instance.flow_instance_id
                ))
            })?;
        let slot = list
            .iter_mut()
            .find(|n| n.node_instance_id == node_instance.node_instance_id)
            .ok_or_else(|| {
                ProcflowError::Store(format!(
                    "node instance `{}` does not exist",
                    node_instance.node_instance_id
                ))
            })?;
        *slot = node_instance;
        Ok(())
    }

    async fn node_instance(
        &self,
        flow_instance_id: &str,
        node_instance_id: &str,
    ) -> Result<Option<NodeInstance>> {
        Ok(self
            .node_instances
            .read()
            .get(flow_instance_id)
            .and_then(|list| {
                list.iter()
                    .find(|n| n.node_instance_id == node_instance_id)
                    .cloned()
            }))
    }

    async fn node_instances(&self, flow_instance_id: &str) -> Result<Vec<NodeInstance>> {
        let mut list = self
            .node_instances
            .read()
            .get(flow_instance_id)
            .cloned()
            .unwrap_or_default();
        list.sort_by_key(|n| n.sequence);
        Ok(list)
    }

    async fn append_log(&self, log: NodeInstanceLog) -> Result<()> {
        self.logs
            .write()
            .entry(log.flow_instance_id.clone())
            .or_default()
            .push(log);
        Ok(())
    }

    async fn logs(&self, flow_instance_id: &str) -> Result<Vec<NodeInstanceLog>> {
        Ok(self
            .logs
            .read()
            .get(flow_instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_data_record(&self, record: InstanceDataRecord) -> Result<()> {
        self.data_records
            .write()
            .entry(record.flow_instance_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn data_record(
        &self,
        flow_instance_id: &str,
        instance_data_id: &str,
    ) -> Result<Option<InstanceDataRecord>> {
        Ok(self
            .data_records
            .read()
            .get(flow_instance_id)
            .and_then(|list| {
                list.iter()
                    .find(|r| r.instance_data_id == instance_data_id)
                    .cloned()
            }))
    }

    async fn latest_data_record(
        &self,
        flow_instance_id: &str,
    ) -> Result<Option<InstanceDataRecord>> {
        Ok(self
            .data_records
            .read()
            .get(flow_instance_id)
            .and_then(|list| list.iter().max_by_key(|r| r.version).cloned()))
    }

    async fn data_record_by_version(
        &self,
        flow_instance_id: &str,
        version: u64,
    ) -> Result<Option<InstanceDataRecord>> {
        Ok(self
            .data_records
            .read()
            .get(flow_instance_id)
            .and_then(|list| list.iter().find(|r| r.version == version).cloned()))
    }
}
