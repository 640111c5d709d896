use std::collections::BTreeMap;

use serde_json::Value;
use tracing::info;

use crate::error::{ProcflowError, Result};
use crate::model::{
    FlowInstance, FlowInstanceStatus, InstanceDataType, NodeInstance, NodeInstanceStatus,
};
use crate::utils::{gen_id, now_millis};

use super::executor::{ExecutionOutcome, FlowExecutor};

/// 子流程（CallActivity）协调：创建子实例、限制嵌套深度、
/// 把完成/挂起结果传回父遍历

pub(crate) enum CallOutcome {
    /// 子流程挂起在自己的 UserTask
    Suspended(NodeInstance),
    /// 子流程完成，携带最终变量快照
    Completed(BTreeMap<String, Value>),
}

impl FlowExecutor {
    pub(crate) async fn invoke_call_activity(
        &self,
        parent: &FlowInstance,
        called_flow_key: &str,
        node_instance: &mut NodeInstance,
    ) -> Result<CallOutcome> {
        // 深度检查在创建任何子状态之前，按顶层调用方的流程 key 取上限
        let depth = parent.nesting_depth + 1;
        let limit = self.nesting.nested_level(&parent.root_flow_key);
        if depth > limit {
            return Err(ProcflowError::NestedLevelExceeded {
                flow_key: parent.root_flow_key.clone(),
                limit,
            });
        }

        let deployment = self
            .store
            .latest_deployment_by_key(called_flow_key)
            .await?
            .ok_or_else(|| {
                ProcflowError::NotFound(format!("deployment for flow `{called_flow_key}`"))
            })?;

        let now = now_millis();
        let child = FlowInstance {
            flow_instance_id: gen_id("fi"),
            flow_deploy_id: deployment.flow_deploy_id.clone(),
            flow_module_id: deployment.flow_module_id.clone(),
            flow_key: deployment.flow_key.clone(),
            root_flow_key: parent.root_flow_key.clone(),
            parent_instance_id: Some(parent.flow_instance_id.clone()),
            parent_node_instance_id: Some(node_instance.node_instance_id.clone()),
            nesting_depth: depth,
            status: FlowInstanceStatus::Active,
            current_node_instance_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store.save_instance(child.clone()).await?;
        node_instance.child_flow_instance_id = Some(child.flow_instance_id.clone());
        self.store.update_node_instance(node_instance.clone()).await?;
        info!(
            parent = %parent.flow_instance_id,
            child = %child.flow_instance_id,
            flow_key = %called_flow_key,
            depth,
            "call activity invoked"
        );

        let input = self.current_snapshot(&parent.flow_instance_id).await?;
        let outcome = self.execute(child, None, input).await?;
        match outcome.active_task {
            Some(task) => Ok(CallOutcome::Suspended(task)),
            None => {
                let outputs = self
                    .current_snapshot(&outcome.flow_instance.flow_instance_id)
                    .await?;
                Ok(CallOutcome::Completed(outputs))
            }
        }
    }

    /// 子流程完成后逐级驱动父流程：合并子输出，提交父 CallActivity
    /// 节点并继续父遍历，直到某级挂起或根实例完成
    pub(crate) async fn continue_parents(
        &self,
        mut outcome: ExecutionOutcome,
    ) -> Result<ExecutionOutcome> {
        loop {
            if outcome.active_task.is_some()
                || outcome.flow_instance.status != FlowInstanceStatus::Completed
            {
                return Ok(outcome);
            }
            let (Some(parent_id), Some(parent_ni_id)) = (
                outcome.flow_instance.parent_instance_id.clone(),
                outcome.flow_instance.parent_node_instance_id.clone(),
            ) else {
                return Ok(outcome);
            };
            let parent = self.store.instance(&parent_id).await?.ok_or_else(|| {
                ProcflowError::NotFound(format!("flow instance `{parent_id}`"))
            })?;
            let parent_ni = self
                .store
                .node_instance(&parent_id, &parent_ni_id)
                .await?
                .ok_or_else(|| {
                    ProcflowError::NotFound(format!("node instance `{parent_ni_id}`"))
                })?;
            if parent_ni.status != NodeInstanceStatus::Active {
                return Err(ProcflowError::InvalidState(format!(
                    "call activity `{}` in parent is not active",
                    parent_ni.node_key
                )));
            }
            let outputs = self
                .current_snapshot(&outcome.flow_instance.flow_instance_id)
                .await?;
            self.merge_snapshot(
                &parent_id,
                Some(&parent_ni),
                outputs,
                InstanceDataType::CallActivity,
            )
            .await?;
            outcome = self.execute(parent, Some(parent_ni), BTreeMap::new()).await?;
        }
    }
}
