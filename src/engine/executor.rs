use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::NestingConfig;
use crate::error::{ProcflowError, Result};
use crate::expr::Evaluator;
use crate::hook::{HookRegistry, ServiceTaskRegistry};
use crate::model::{
    ElementType, FlowInstance, FlowInstanceStatus, FlowModel, InstanceData, InstanceDataRecord,
    InstanceDataType, Node, NodeInstance, NodeInstanceStatus, NodeKind, SequenceFlow,
};
use crate::storage::FlowStore;
use crate::utils::{gen_id, now_millis};

use super::state;
use super::subflow::CallOutcome;

/// 流程遍历引擎：从恢复点向前执行，直到挂起或结束

pub(crate) struct FlowExecutor {
    pub(crate) store: Arc<dyn FlowStore>,
    pub(crate) hooks: Arc<HookRegistry>,
    pub(crate) services: Arc<ServiceTaskRegistry>,
    pub(crate) nesting: NestingConfig,
}

/// 一次遍历的结果；active_task 可能属于子流程实例
pub(crate) struct ExecutionOutcome {
    pub flow_instance: FlowInstance,
    pub active_task: Option<NodeInstance>,
}

enum Step {
    Suspend(NodeInstance),
    Finished,
    Continue,
}

impl FlowExecutor {
    pub(crate) fn new(
        store: Arc<dyn FlowStore>,
        hooks: Arc<HookRegistry>,
        services: Arc<ServiceTaskRegistry>,
        nesting: NestingConfig,
    ) -> Self {
        Self {
            store,
            hooks,
            services,
            nesting,
        }
    }

    /// 从给定节点实例（或开始事件）恢复遍历。
    /// Box::pin 切断 CallActivity 引起的递归 Future 循环。
    pub(crate) fn execute<'a>(
        &'a self,
        instance: FlowInstance,
        from: Option<NodeInstance>,
        variables: BTreeMap<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionOutcome>> + Send + 'a>> {
        Box::pin(self.execute_inner(instance, from, variables))
    }

    async fn execute_inner(
        &self,
        mut instance: FlowInstance,
        from: Option<NodeInstance>,
        variables: BTreeMap<String, Value>,
    ) -> Result<ExecutionOutcome> {
        let deployment = self
            .store
            .deployment(&instance.flow_deploy_id)
            .await?
            .ok_or_else(|| {
                ProcflowError::NotFound(format!("flow deployment `{}`", instance.flow_deploy_id))
            })?;
        let model = deployment.flow_model;

        let resumed = from.is_some();
        let current = match from {
            None => {
                let start = model.start_event()?.clone();
                let version = self
                    .merge_snapshot(
                        &instance.flow_instance_id,
                        None,
                        variables,
                        InstanceDataType::Init,
                    )
                    .await?;
                let mut start_ni =
                    state::create_node_instance(&*self.store, &instance, &start, None, version)
                        .await?;
                state::transition(&*self.store, &mut start_ni, NodeInstanceStatus::Completed)
                    .await?;
                start_ni
            }
            Some(mut resume_ni) => {
                if resume_ni.status != NodeInstanceStatus::Active {
                    return Err(ProcflowError::InvalidState(format!(
                        "node instance `{}` cannot be committed in status {:?}",
                        resume_ni.node_instance_id, resume_ni.status
                    )));
                }
                self.merge_snapshot(
                    &instance.flow_instance_id,
                    Some(&resume_ni),
                    variables,
                    InstanceDataType::Commit,
                )
                .await?;
                state::transition(&*self.store, &mut resume_ni, NodeInstanceStatus::Completed)
                    .await?;
                resume_ni
            }
        };

        match self.traverse(&model, &mut instance, current.clone()).await {
            Ok(active_task) => Ok(ExecutionOutcome {
                flow_instance: instance,
                active_task,
            }),
            Err(err) => {
                // 失败的步骤不得推进活动任务指针：把恢复点还原为 Active，
                // MissingBinding 一类可恢复错误允许补齐变量后重试同一提交
                if resumed {
                    if let Ok(Some(mut resume_ni)) = self
                        .store
                        .node_instance(&instance.flow_instance_id, &current.node_instance_id)
                        .await
                    {
                        if resume_ni.status == NodeInstanceStatus::Completed {
                            if let Err(cleanup_err) = state::transition(
                                &*self.store,
                                &mut resume_ni,
                                NodeInstanceStatus::Active,
                            )
                            .await
                            {
                                warn!(
                                    node_instance_id = %resume_ni.node_instance_id,
                                    %cleanup_err,
                                    "failed to reactivate the resume node after a failed step"
                                );
                            }
                        }
                    }
                }
                Err(err)
            }
        }
    }

    async fn traverse(
        &self,
        model: &FlowModel,
        instance: &mut FlowInstance,
        mut current: NodeInstance,
    ) -> Result<Option<NodeInstance>> {
        loop {
            let node = model.node(&current.node_key).ok_or_else(|| {
                ProcflowError::Validation(format!(
                    "node `{}` is not part of the deployed model",
                    current.node_key
                ))
            })?;
            let flow = match self.select_flow(node, instance).await {
                Ok(flow) => flow,
                Err(err) => {
                    // 网关选路失败时作废网关实例，重试提交会重新进入网关
                    if current.element_type == ElementType::ExclusiveGateway {
                        if let Err(cleanup_err) = state::transition(
                            &*self.store,
                            &mut current,
                            NodeInstanceStatus::Disabled,
                        )
                        .await
                        {
                            warn!(
                                node_instance_id = %current.node_instance_id,
                                %cleanup_err,
                                "failed to disable the gateway after a routing failure"
                            );
                        }
                    }
                    return Err(err);
                }
            };
            let target = model.node(&flow.target).ok_or_else(|| {
                ProcflowError::Validation(format!(
                    "sequence flow target `{}` is not part of the deployed model",
                    flow.target
                ))
            })?;

            let version = self.current_version(&instance.flow_instance_id).await?;
            let mut target_ni =
                state::create_node_instance(&*self.store, instance, target, Some(&current), version)
                    .await?;

            let step = match self.run_node(instance, target, &mut target_ni).await {
                Ok(step) => step,
                Err(err) => {
                    // 出错的节点实例不能以 Active 悬挂在历史里
                    if target_ni.status == NodeInstanceStatus::Active {
                        if let Err(cleanup_err) = state::transition(
                            &*self.store,
                            &mut target_ni,
                            NodeInstanceStatus::Terminated,
                        )
                        .await
                        {
                            warn!(
                                node_instance_id = %target_ni.node_instance_id,
                                %cleanup_err,
                                "failed to terminate the node instance after a failed step"
                            );
                        }
                    }
                    return Err(err);
                }
            };

            match step {
                Step::Suspend(active_task) => {
                    instance.current_node_instance_id = Some(target_ni.node_instance_id.clone());
                    instance.updated_at = now_millis();
                    self.store.update_instance(instance.clone()).await?;
                    debug!(
                        flow_instance_id = %instance.flow_instance_id,
                        node_key = %active_task.node_key,
                        "flow instance suspended"
                    );
                    return Ok(Some(active_task));
                }
                Step::Finished => {
                    instance.status = FlowInstanceStatus::Completed;
                    instance.current_node_instance_id = None;
                    instance.updated_at = now_millis();
                    self.store.update_instance(instance.clone()).await?;
                    info!(flow_instance_id = %instance.flow_instance_id, "flow instance completed");
                    return Ok(None);
                }
                Step::Continue => current = target_ni,
            }
        }
    }

    async fn run_node(
        &self,
        instance: &FlowInstance,
        node: &Node,
        node_instance: &mut NodeInstance,
    ) -> Result<Step> {
        match &node.kind {
            NodeKind::UserTask => Ok(Step::Suspend(node_instance.clone())),
            NodeKind::EndEvent => {
                state::transition(&*self.store, node_instance, NodeInstanceStatus::Completed)
                    .await?;
                Ok(Step::Finished)
            }
            NodeKind::ServiceTask => {
                if let Some(handler) = self.services.handler(&node.key) {
                    let snapshot = self.current_snapshot(&instance.flow_instance_id).await?;
                    let outputs = handler
                        .execute(&instance.flow_instance_id, &node.key, &snapshot)
                        .await
                        .map_err(|err| {
                            ProcflowError::Evaluation(format!(
                                "service task `{}` failed: {err}",
                                node.key
                            ))
                        })?;
                    self.merge_instance_data(
                        &instance.flow_instance_id,
                        Some(node_instance),
                        outputs,
                        InstanceDataType::Service,
                    )
                    .await?;
                } else {
                    debug!(node_key = %node.key, "no service task handler registered, passing through");
                }
                state::transition(&*self.store, node_instance, NodeInstanceStatus::Completed)
                    .await?;
                Ok(Step::Continue)
            }
            NodeKind::ExclusiveGateway { hook_param } => {
                self.invoke_hooks(instance, node, node_instance, hook_param.as_deref())
                    .await?;
                state::transition(&*self.store, node_instance, NodeInstanceStatus::Completed)
                    .await?;
                Ok(Step::Continue)
            }
            NodeKind::CallActivity { called_flow_key } => {
                match self
                    .invoke_call_activity(instance, called_flow_key, node_instance)
                    .await?
                {
                    CallOutcome::Suspended(task) => Ok(Step::Suspend(task)),
                    CallOutcome::Completed(outputs) => {
                        self.merge_snapshot(
                            &instance.flow_instance_id,
                            Some(node_instance),
                            outputs,
                            InstanceDataType::CallActivity,
                        )
                        .await?;
                        state::transition(
                            &*self.store,
                            node_instance,
                            NodeInstanceStatus::Completed,
                        )
                        .await?;
                        Ok(Step::Continue)
                    }
                }
            }
            NodeKind::StartEvent => Err(ProcflowError::Validation(format!(
                "start event `{}` cannot be a traversal target",
                node.key
            ))),
        }
    }

    /// 选择出边：排他网关按定义顺序取第一条为真的条件流，
    /// 否则落到无条件默认流；其余节点走唯一出边。
    async fn select_flow<'m>(
        &self,
        node: &'m Node,
        instance: &FlowInstance,
    ) -> Result<&'m SequenceFlow> {
        if matches!(node.kind, NodeKind::ExclusiveGateway { .. }) {
            let snapshot = self.current_snapshot(&instance.flow_instance_id).await?;
            for flow in &node.outgoing {
                let Some(condition) = &flow.condition else {
                    continue;
                };
                if Evaluator::evaluate_bool(condition, &snapshot)? {
                    debug!(node_key = %node.key, target = %flow.target, "gateway condition matched");
                    return Ok(flow);
                }
            }
            if let Some(default) = node.default_flow() {
                debug!(node_key = %node.key, target = %default.target, "gateway fell through to default flow");
                return Ok(default);
            }
            return Err(ProcflowError::NoMatchingFlow {
                node_key: node.key.clone(),
            });
        }
        node.outgoing.first().ok_or_else(|| {
            ProcflowError::Validation(format!("node `{}` has no outgoing flow", node.key))
        })
    }

    async fn invoke_hooks(
        &self,
        instance: &FlowInstance,
        node: &Node,
        node_instance: &NodeInstance,
        hook_param: Option<&str>,
    ) -> Result<()> {
        let services = self.hooks.services(&node.key);
        if services.is_empty() {
            return Ok(());
        }
        let mut outputs = Vec::new();
        for service in services {
            let data = service
                .invoke(
                    &instance.flow_instance_id,
                    &node_instance.node_instance_id,
                    &node.key,
                    hook_param,
                )
                .await
                .map_err(|err| {
                    ProcflowError::Evaluation(format!("hook on `{}` failed: {err}", node.key))
                })?;
            outputs.extend(data);
        }
        info!(node_key = %node.key, count = outputs.len(), "hook variables merged before gateway evaluation");
        self.merge_instance_data(
            &instance.flow_instance_id,
            Some(node_instance),
            outputs,
            InstanceDataType::Hook,
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn current_snapshot(
        &self,
        flow_instance_id: &str,
    ) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .store
            .latest_data_record(flow_instance_id)
            .await?
            .map(|record| record.data)
            .unwrap_or_default())
    }

    async fn current_version(&self, flow_instance_id: &str) -> Result<u64> {
        Ok(self
            .store
            .latest_data_record(flow_instance_id)
            .await?
            .map(|record| record.version)
            .unwrap_or(0))
    }

    async fn merge_instance_data(
        &self,
        flow_instance_id: &str,
        node_instance: Option<&NodeInstance>,
        outputs: Vec<InstanceData>,
        record_type: InstanceDataType,
    ) -> Result<u64> {
        let variables: BTreeMap<String, Value> = outputs
            .into_iter()
            .map(|data| (data.key, data.value))
            .collect();
        self.merge_snapshot(flow_instance_id, node_instance, variables, record_type)
            .await
    }

    /// 把变量并入当前快照，追加一条版本递增的全量记录。
    /// 除 Init 外，空变量集不产生新版本。
    pub(crate) async fn merge_snapshot(
        &self,
        flow_instance_id: &str,
        node_instance: Option<&NodeInstance>,
        variables: BTreeMap<String, Value>,
        record_type: InstanceDataType,
    ) -> Result<u64> {
        let latest = self.store.latest_data_record(flow_instance_id).await?;
        let current_version = latest.as_ref().map(|r| r.version).unwrap_or(0);
        if variables.is_empty() && record_type != InstanceDataType::Init {
            return Ok(current_version);
        }
        let mut data = latest.map(|r| r.data).unwrap_or_default();
        data.extend(variables);
        let version = current_version + 1;
        self.store
            .append_data_record(InstanceDataRecord {
                instance_data_id: gen_id("data"),
                flow_instance_id: flow_instance_id.to_string(),
                node_instance_id: node_instance.map(|n| n.node_instance_id.clone()),
                node_key: node_instance.map(|n| n.node_key.clone()),
                data,
                version,
                record_type,
                created_at: now_millis(),
            })
            .await?;
        Ok(version)
    }
}
