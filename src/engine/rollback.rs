use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;

use crate::error::{ProcflowError, Result};
use crate::model::{
    ElementType, FlowInstance, FlowInstanceStatus, InstanceDataRecord, InstanceDataType,
    NodeInstance, NodeInstanceStatus,
};
use crate::storage::FlowStore;
use crate::utils::{gen_id, now_millis};

use super::executor::ExecutionOutcome;
use super::state;

/// 回滚协调：按节点实例历史倒序作废执行记录，
/// 停靠在上一个 UserTask 或开始事件，数据回退到对应版本

pub(crate) struct RollbackCoordinator {
    store: Arc<dyn FlowStore>,
}

enum WalkStop {
    /// 停靠在重新激活的 UserTask（可能属于子流程）
    Task(NodeInstance),
    /// 走到了开始事件，由调用侧决定重新激活还是整体作废
    Start(NodeInstance),
}

impl RollbackCoordinator {
    pub(crate) fn new(store: Arc<dyn FlowStore>) -> Self {
        Self { store }
    }

    pub(crate) async fn rollback(
        &self,
        instance: FlowInstance,
        node_instance_id: &str,
    ) -> Result<ExecutionOutcome> {
        if instance.status != FlowInstanceStatus::Active {
            return Err(ProcflowError::InvalidState(format!(
                "flow instance `{}` is not active",
                instance.flow_instance_id
            )));
        }
        let mut target = self
            .store
            .node_instance(&instance.flow_instance_id, node_instance_id)
            .await?
            .ok_or_else(|| {
                ProcflowError::NotFound(format!("node instance `{node_instance_id}`"))
            })?;
        if target.element_type != ElementType::UserTask
            || target.status != NodeInstanceStatus::Active
        {
            return Err(ProcflowError::InvalidState(format!(
                "rollback target `{}` must be an active user task",
                target.node_instance_id
            )));
        }
        // 挂起中的目标任务被回滚即作废
        state::transition(&*self.store, &mut target, NodeInstanceStatus::Disabled).await?;

        let mut inst = instance;
        let mut before_sequence = target.sequence;
        loop {
            match self
                .walk_back(&inst.flow_instance_id, before_sequence)
                .await?
            {
                WalkStop::Task(task) => {
                    let refreshed = self
                        .store
                        .instance(&inst.flow_instance_id)
                        .await?
                        .ok_or_else(|| {
                            ProcflowError::NotFound(format!(
                                "flow instance `{}`",
                                inst.flow_instance_id
                            ))
                        })?;
                    info!(
                        flow_instance_id = %refreshed.flow_instance_id,
                        node_key = %task.node_key,
                        "rollback reactivated user task"
                    );
                    return Ok(ExecutionOutcome {
                        flow_instance: refreshed,
                        active_task: Some(task),
                    });
                }
                WalkStop::Start(mut start_ni) => {
                    if let (Some(parent_id), Some(parent_ni_id)) = (
                        inst.parent_instance_id.clone(),
                        inst.parent_node_instance_id.clone(),
                    ) {
                        // 子流程里没有可停靠的任务：整体作废并越过父 CallActivity 继续
                        state::transition(
                            &*self.store,
                            &mut start_ni,
                            NodeInstanceStatus::Disabled,
                        )
                        .await?;
                        inst.status = FlowInstanceStatus::Terminated;
                        inst.current_node_instance_id = None;
                        inst.updated_at = now_millis();
                        self.store.update_instance(inst).await?;

                        let parent =
                            self.store.instance(&parent_id).await?.ok_or_else(|| {
                                ProcflowError::NotFound(format!("flow instance `{parent_id}`"))
                            })?;
                        let mut parent_ni = self
                            .store
                            .node_instance(&parent_id, &parent_ni_id)
                            .await?
                            .ok_or_else(|| {
                                ProcflowError::NotFound(format!(
                                    "node instance `{parent_ni_id}`"
                                ))
                            })?;
                        state::transition(
                            &*self.store,
                            &mut parent_ni,
                            NodeInstanceStatus::Disabled,
                        )
                        .await?;
                        before_sequence = parent_ni.sequence;
                        inst = parent;
                    } else {
                        // 回到顶层开始事件：重新激活，允许等价于重新启动的再进入
                        state::transition(
                            &*self.store,
                            &mut start_ni,
                            NodeInstanceStatus::Active,
                        )
                        .await?;
                        self.revert_data(&inst.flow_instance_id, &start_ni).await?;
                        inst.current_node_instance_id =
                            Some(start_ni.node_instance_id.clone());
                        inst.updated_at = now_millis();
                        self.store.update_instance(inst.clone()).await?;
                        info!(
                            flow_instance_id = %inst.flow_instance_id,
                            "rollback reached the start event"
                        );
                        return Ok(ExecutionOutcome {
                            flow_instance: inst,
                            active_task: None,
                        });
                    }
                }
            }
        }
    }

    /// 倒序遍历 sequence 小于 before_sequence 的有效节点实例。
    /// Box::pin 切断跨实例递归的 Future 循环。
    fn walk_back<'a>(
        &'a self,
        flow_instance_id: &'a str,
        before_sequence: u64,
    ) -> Pin<Box<dyn Future<Output = Result<WalkStop>> + Send + 'a>> {
        Box::pin(async move {
            let mut history: Vec<NodeInstance> = self
                .store
                .node_instances(flow_instance_id)
                .await?
                .into_iter()
                .filter(|n| {
                    n.sequence < before_sequence
                        && n.status != NodeInstanceStatus::Disabled
                        && n.status != NodeInstanceStatus::Terminated
                })
                .collect();
            history.sort_by(|a, b| b.sequence.cmp(&a.sequence));

            for mut node_instance in history {
                match node_instance.element_type {
                    ElementType::StartEvent => return Ok(WalkStop::Start(node_instance)),
                    ElementType::UserTask => {
                        state::transition(
                            &*self.store,
                            &mut node_instance,
                            NodeInstanceStatus::Active,
                        )
                        .await?;
                        self.revert_data(flow_instance_id, &node_instance).await?;
                        let mut inst = self
                            .store
                            .instance(flow_instance_id)
                            .await?
                            .ok_or_else(|| {
                                ProcflowError::NotFound(format!(
                                    "flow instance `{flow_instance_id}`"
                                ))
                            })?;
                        inst.status = FlowInstanceStatus::Active;
                        inst.current_node_instance_id =
                            Some(node_instance.node_instance_id.clone());
                        inst.updated_at = now_millis();
                        self.store.update_instance(inst).await?;
                        return Ok(WalkStop::Task(node_instance));
                    }
                    ElementType::CallActivity => {
                        let Some(child_id) = node_instance.child_flow_instance_id.clone()
                        else {
                            state::transition(
                                &*self.store,
                                &mut node_instance,
                                NodeInstanceStatus::Disabled,
                            )
                            .await?;
                            continue;
                        };
                        match self.walk_back(&child_id, u64::MAX).await? {
                            WalkStop::Task(task) => {
                                // 子流程停在自己的 UserTask，父 CallActivity 回到 Active
                                state::transition(
                                    &*self.store,
                                    &mut node_instance,
                                    NodeInstanceStatus::Active,
                                )
                                .await?;
                                self.revert_data(flow_instance_id, &node_instance).await?;
                                let mut inst = self
                                    .store
                                    .instance(flow_instance_id)
                                    .await?
                                    .ok_or_else(|| {
                                        ProcflowError::NotFound(format!(
                                            "flow instance `{flow_instance_id}`"
                                        ))
                                    })?;
                                inst.status = FlowInstanceStatus::Active;
                                inst.current_node_instance_id =
                                    Some(node_instance.node_instance_id.clone());
                                inst.updated_at = now_millis();
                                self.store.update_instance(inst).await?;
                                return Ok(WalkStop::Task(task));
                            }
                            WalkStop::Start(mut child_start) => {
                                state::transition(
                                    &*self.store,
                                    &mut child_start,
                                    NodeInstanceStatus::Disabled,
                                )
                                .await?;
                                let mut child = self
                                    .store
                                    .instance(&child_id)
                                    .await?
                                    .ok_or_else(|| {
                                        ProcflowError::NotFound(format!(
                                            "flow instance `{child_id}`"
                                        ))
                                    })?;
                                child.status = FlowInstanceStatus::Terminated;
                                child.current_node_instance_id = None;
                                child.updated_at = now_millis();
                                self.store.update_instance(child).await?;
                                state::transition(
                                    &*self.store,
                                    &mut node_instance,
                                    NodeInstanceStatus::Disabled,
                                )
                                .await?;
                            }
                        }
                    }
                    _ => {
                        // 自动节点与结束事件一律作废
                        state::transition(
                            &*self.store,
                            &mut node_instance,
                            NodeInstanceStatus::Disabled,
                        )
                        .await?;
                    }
                }
            }
            Err(ProcflowError::InvalidState(format!(
                "flow instance `{flow_instance_id}` has no node to roll back to"
            )))
        })
    }

    /// 数据回退：追加一条 Rollback 记录，内容等于节点创建时的快照版本
    async fn revert_data(
        &self,
        flow_instance_id: &str,
        node_instance: &NodeInstance,
    ) -> Result<()> {
        let latest_version = self
            .store
            .latest_data_record(flow_instance_id)
            .await?
            .map(|r| r.version)
            .unwrap_or(0);
        if latest_version == node_instance.data_version {
            return Ok(());
        }
        let data = if node_instance.data_version == 0 {
            BTreeMap::new()
        } else {
            self.store
                .data_record_by_version(flow_instance_id, node_instance.data_version)
                .await?
                .map(|r| r.data)
                .ok_or_else(|| {
                    ProcflowError::Store(format!(
                        "snapshot version {} of flow instance `{flow_instance_id}` is missing",
                        node_instance.data_version
                    ))
                })?
        };
        self.store
            .append_data_record(InstanceDataRecord {
                instance_data_id: gen_id("data"),
                flow_instance_id: flow_instance_id.to_string(),
                node_instance_id: Some(node_instance.node_instance_id.clone()),
                node_key: Some(node_instance.node_key.clone()),
                data,
                version: latest_version + 1,
                record_type: InstanceDataType::Rollback,
                created_at: now_millis(),
            })
            .await?;
        Ok(())
    }
}
