use tracing::debug;

use crate::error::{ProcflowError, Result};
use crate::model::{FlowInstance, Node, NodeInstance, NodeInstanceLog, NodeInstanceStatus};
use crate::storage::FlowStore;
use crate::utils::{gen_id, now_millis};

/// 节点实例状态机：创建与状态迁移，每次迁移追加一条日志

pub(crate) async fn create_node_instance(
    store: &dyn FlowStore,
    instance: &FlowInstance,
    node: &Node,
    source: Option<&NodeInstance>,
    data_version: u64,
) -> Result<NodeInstance> {
    let sequence = store
        .node_instances(&instance.flow_instance_id)
        .await?
        .len() as u64
        + 1;
    let node_instance = NodeInstance {
        node_instance_id: gen_id("ni"),
        flow_instance_id: instance.flow_instance_id.clone(),
        node_key: node.key.clone(),
        element_type: node.element_type(),
        source_node_instance_id: source.map(|s| s.node_instance_id.clone()),
        source_node_key: source.map(|s| s.node_key.clone()),
        child_flow_instance_id: None,
        data_version,
        status: NodeInstanceStatus::Active,
        sequence,
        created_at: now_millis(),
        completed_at: None,
    };
    store.save_node_instance(node_instance.clone()).await?;
    append_log(store, &node_instance).await?;
    debug!(
        node_key = %node_instance.node_key,
        node_instance_id = %node_instance.node_instance_id,
        sequence,
        "node instance created"
    );
    Ok(node_instance)
}

pub(crate) async fn transition(
    store: &dyn FlowStore,
    node_instance: &mut NodeInstance,
    to: NodeInstanceStatus,
) -> Result<()> {
    if !node_instance.status.can_transition(to) {
        return Err(ProcflowError::InvalidState(format!(
            "node instance `{}` ({}) cannot go from {:?} to {:?}",
            node_instance.node_instance_id, node_instance.node_key, node_instance.status, to
        )));
    }
    node_instance.status = to;
    match to {
        NodeInstanceStatus::Completed => node_instance.completed_at = Some(now_millis()),
        // 重新激活时清掉上一轮的完成时间
        NodeInstanceStatus::Active => node_instance.completed_at = None,
        _ => {}
    }
    store.update_node_instance(node_instance.clone()).await?;
    append_log(store, node_instance).await?;
    debug!(
        node_key = %node_instance.node_key,
        node_instance_id = %node_instance.node_instance_id,
        status = ?to,
        "node instance transition"
    );
    Ok(())
}

async fn append_log(store: &dyn FlowStore, node_instance: &NodeInstance) -> Result<()> {
    store
        .append_log(NodeInstanceLog {
            log_id: gen_id("log"),
            flow_instance_id: node_instance.flow_instance_id.clone(),
            node_instance_id: node_instance.node_instance_id.clone(),
            node_key: node_instance.node_key.clone(),
            element_type: node_instance.element_type,
            status: node_instance.status,
            sequence: node_instance.sequence,
            created_at: now_millis(),
        })
        .await
}
