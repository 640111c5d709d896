use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::model::InstanceData;

/// 钩子服务：网关求值前刷新变量的外部回调
///
/// 返回的变量在条件求值前并入变量快照，
/// 失败按求值硬失败处理，引擎不做重试。
#[async_trait]
pub trait HookService: Send + Sync {
    async fn invoke(
        &self,
        flow_instance_id: &str,
        node_instance_id: &str,
        node_key: &str,
        hook_param: Option<&str>,
    ) -> anyhow::Result<Vec<InstanceData>>;
}

/// 钩子注册表，按节点 key 注册 0..N 个实现，按注册顺序调用
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<String, Vec<Arc<dyn HookService>>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_key: impl Into<String>, service: Arc<dyn HookService>) {
        self.hooks
            .write()
            .entry(node_key.into())
            .or_default()
            .push(service);
    }

    pub fn services(&self, node_key: &str) -> Vec<Arc<dyn HookService>> {
        self.hooks
            .read()
            .get(node_key)
            .cloned()
            .unwrap_or_default()
    }
}

/// ServiceTask 的自动行为协作方
#[async_trait]
pub trait ServiceTaskHandler: Send + Sync {
    async fn execute(
        &self,
        flow_instance_id: &str,
        node_key: &str,
        variables: &BTreeMap<String, Value>,
    ) -> anyhow::Result<Vec<InstanceData>>;
}

/// ServiceTask 处理器注册表，按节点 key 查找
#[derive(Default)]
pub struct ServiceTaskRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ServiceTaskHandler>>>,
}

impl ServiceTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_key: impl Into<String>, handler: Arc<dyn ServiceTaskHandler>) {
        self.handlers.write().insert(node_key.into(), handler);
    }

    pub fn handler(&self, node_key: &str) -> Option<Arc<dyn ServiceTaskHandler>> {
        self.handlers.read().get(node_key).cloned()
    }
}
