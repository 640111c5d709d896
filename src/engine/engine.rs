use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::config::NestingConfig;
use crate::error::{ProcflowError, Result};
use crate::hook::{HookRegistry, ServiceTaskRegistry};
use crate::model::{
    ElementType, FlowDefinition, FlowDeployment, FlowInstance, FlowInstanceStatus,
    FlowModuleStatus, InstanceData, NodeInstance, NodeInstanceLog, NodeInstanceStatus,
};
use crate::storage::FlowStore;
use crate::utils::{gen_id, now_millis};

use super::state;
use super::types::{
    CreateFlowParam, FlowModuleInfo, GetFlowModuleParam, ProcessResult, StartProcessParam,
    UpdateFlowParam,
};
use super::{ExecutionOutcome, FlowExecutor, RollbackCoordinator};

/// 流程引擎入口：定义流程并部署，处理和驱动已部署的流程
pub struct ProcessEngine {
    store: Arc<dyn FlowStore>,
    hooks: Arc<HookRegistry>,
    services: Arc<ServiceTaskRegistry>,
    nesting: NestingConfig,
}

impl ProcessEngine {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self {
            store,
            hooks: Arc::new(HookRegistry::new()),
            services: Arc::new(ServiceTaskRegistry::new()),
            nesting: NestingConfig::from_env(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_services(mut self, services: Arc<ServiceTaskRegistry>) -> Self {
        self.services = services;
        self
    }

    pub fn with_nesting_config(mut self, nesting: NestingConfig) -> Self {
        self.nesting = nesting;
        self
    }

    fn executor(&self) -> FlowExecutor {
        FlowExecutor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.hooks),
            Arc::clone(&self.services),
            self.nesting.clone(),
        )
    }

    /// 创建流程定义，模型为空，待 update_flow 填充
    pub async fn create_flow(&self, param: CreateFlowParam) -> Result<String> {
        if param.flow_key.trim().is_empty() || param.flow_name.trim().is_empty() {
            return Err(ProcflowError::Validation(
                "flow key and flow name must not be empty".to_string(),
            ));
        }
        let now = now_millis();
        let definition = FlowDefinition {
            flow_module_id: gen_id("fm"),
            flow_key: param.flow_key,
            flow_name: param.flow_name,
            flow_model: None,
            version: 1,
            status: FlowModuleStatus::Init,
            operator: param.operator,
            remark: param.remark,
            created_at: now,
            updated_at: now,
        };
        let flow_module_id = definition.flow_module_id.clone();
        self.store.save_definition(definition).await?;
        info!(%flow_module_id, "flow created");
        Ok(flow_module_id)
    }

    /// 更新定义内容并递增版本；已有部署不受影响
    pub async fn update_flow(&self, param: UpdateFlowParam) -> Result<()> {
        let mut definition = self
            .store
            .definition(&param.flow_module_id)
            .await?
            .ok_or_else(|| {
                ProcflowError::NotFound(format!("flow definition `{}`", param.flow_module_id))
            })?;
        if let Some(flow_key) = param.flow_key {
            definition.flow_key = flow_key;
        }
        if let Some(flow_name) = param.flow_name {
            definition.flow_name = flow_name;
        }
        if let Some(flow_model) = param.flow_model {
            definition.flow_model = Some(flow_model);
        }
        if let Some(remark) = param.remark {
            definition.remark = remark;
        }
        definition.version += 1;
        definition.status = FlowModuleStatus::Editing;
        definition.updated_at = now_millis();
        self.store.update_definition(definition).await?;
        Ok(())
    }

    /// 部署流程：校验模型后生成不可变快照
    pub async fn deploy_flow(&self, flow_module_id: &str) -> Result<String> {
        let mut definition = self
            .store
            .definition(flow_module_id)
            .await?
            .ok_or_else(|| {
                ProcflowError::NotFound(format!("flow definition `{flow_module_id}`"))
            })?;
        let flow_model = definition.flow_model.clone().ok_or_else(|| {
            ProcflowError::Validation(format!(
                "flow definition `{flow_module_id}` has no model to deploy"
            ))
        })?;
        flow_model.validate()?;
        let deployment = FlowDeployment {
            flow_deploy_id: gen_id("fd"),
            flow_module_id: definition.flow_module_id.clone(),
            flow_key: definition.flow_key.clone(),
            flow_name: definition.flow_name.clone(),
            flow_model,
            version: definition.version,
            created_at: now_millis(),
        };
        let flow_deploy_id = deployment.flow_deploy_id.clone();
        self.store.save_deployment(deployment).await?;
        definition.status = FlowModuleStatus::Published;
        definition.updated_at = now_millis();
        self.store.update_definition(definition).await?;
        info!(%flow_module_id, %flow_deploy_id, "flow deployed");
        Ok(flow_deploy_id)
    }

    pub async fn get_flow_module(&self, param: GetFlowModuleParam) -> Result<FlowModuleInfo> {
        if let Some(flow_deploy_id) = &param.flow_deploy_id {
            let deployment = self.store.deployment(flow_deploy_id).await?.ok_or_else(|| {
                ProcflowError::NotFound(format!("flow deployment `{flow_deploy_id}`"))
            })?;
            let definition = self
                .store
                .definition(&deployment.flow_module_id)
                .await?
                .ok_or_else(|| {
                    ProcflowError::NotFound(format!(
                        "flow definition `{}`",
                        deployment.flow_module_id
                    ))
                })?;
            return Ok(FlowModuleInfo {
                flow_module_id: deployment.flow_module_id,
                flow_key: deployment.flow_key,
                flow_name: deployment.flow_name,
                flow_model: Some(deployment.flow_model),
                version: deployment.version,
                status: definition.status,
                remark: definition.remark,
            });
        }
        let flow_module_id = param.flow_module_id.as_deref().ok_or_else(|| {
            ProcflowError::Validation(
                "either flow_module_id or flow_deploy_id is required".to_string(),
            )
        })?;
        let definition = self
            .store
            .definition(flow_module_id)
            .await?
            .ok_or_else(|| {
                ProcflowError::NotFound(format!("flow definition `{flow_module_id}`"))
            })?;
        Ok(FlowModuleInfo {
            flow_module_id: definition.flow_module_id,
            flow_key: definition.flow_key,
            flow_name: definition.flow_name,
            flow_model: definition.flow_model,
            version: definition.version,
            status: definition.status,
            remark: definition.remark,
        })
    }

    /// 启动流程：创建实例并从开始事件驱动到挂起点或结束
    pub async fn start_process(&self, param: StartProcessParam) -> Result<ProcessResult> {
        let deployment = match (&param.flow_deploy_id, &param.flow_module_id) {
            (Some(flow_deploy_id), _) => {
                self.store.deployment(flow_deploy_id).await?.ok_or_else(|| {
                    ProcflowError::NotFound(format!("flow deployment `{flow_deploy_id}`"))
                })?
            }
            (None, Some(flow_module_id)) => self
                .store
                .latest_deployment_by_module(flow_module_id)
                .await?
                .ok_or_else(|| {
                    ProcflowError::NotFound(format!(
                        "deployment for flow definition `{flow_module_id}`"
                    ))
                })?,
            (None, None) => {
                return Err(ProcflowError::Validation(
                    "either flow_deploy_id or flow_module_id is required".to_string(),
                ))
            }
        };
        let now = now_millis();
        let instance = FlowInstance {
            flow_instance_id: gen_id("fi"),
            flow_deploy_id: deployment.flow_deploy_id.clone(),
            flow_module_id: deployment.flow_module_id.clone(),
            flow_key: deployment.flow_key.clone(),
            root_flow_key: deployment.flow_key.clone(),
            parent_instance_id: None,
            parent_node_instance_id: None,
            nesting_depth: 0,
            status: FlowInstanceStatus::Active,
            current_node_instance_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store.save_instance(instance.clone()).await?;
        info!(flow_instance_id = %instance.flow_instance_id, flow_key = %instance.flow_key, "process started");
        let outcome = self
            .executor()
            .execute(instance, None, param.variables)
            .await?;
        Ok(Self::to_result(outcome))
    }

    /// 提交挂起的 UserTask（或回滚后重新激活的开始事件）并继续驱动。
    /// 节点实例可以属于任意层级的子流程实例。
    pub async fn commit_task(
        &self,
        flow_instance_id: &str,
        node_instance_id: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<ProcessResult> {
        let (instance, node_instance) = self
            .find_node_instance(flow_instance_id, node_instance_id)
            .await?;
        match instance.status {
            FlowInstanceStatus::Active => {}
            FlowInstanceStatus::Completed => {
                return Err(ProcflowError::InvalidState(format!(
                    "flow instance `{}` is already completed",
                    instance.flow_instance_id
                )))
            }
            FlowInstanceStatus::Terminated => {
                return Err(ProcflowError::InvalidState(format!(
                    "flow instance `{}` is terminated",
                    instance.flow_instance_id
                )))
            }
        }
        if node_instance.status != NodeInstanceStatus::Active {
            return Err(ProcflowError::InvalidState(format!(
                "node instance `{}` cannot be committed in status {:?}",
                node_instance.node_instance_id, node_instance.status
            )));
        }
        if !matches!(
            node_instance.element_type,
            ElementType::UserTask | ElementType::StartEvent
        ) {
            return Err(ProcflowError::InvalidState(format!(
                "node instance `{}` ({:?}) is not committable",
                node_instance.node_instance_id, node_instance.element_type
            )));
        }
        if instance.current_node_instance_id.as_deref() != Some(node_instance_id) {
            return Err(ProcflowError::InvalidState(format!(
                "node instance `{node_instance_id}` is not the current active task"
            )));
        }
        let executor = self.executor();
        let outcome = executor
            .execute(instance, Some(node_instance), variables)
            .await?;
        let outcome = executor.continue_parents(outcome).await?;
        Ok(Self::to_result(outcome))
    }

    /// 回滚挂起的 UserTask，停靠在上一个 UserTask 或开始事件
    pub async fn rollback_task(
        &self,
        flow_instance_id: &str,
        node_instance_id: &str,
    ) -> Result<ProcessResult> {
        let (instance, _) = self
            .find_node_instance(flow_instance_id, node_instance_id)
            .await?;
        let outcome = RollbackCoordinator::new(Arc::clone(&self.store))
            .rollback(instance, node_instance_id)
            .await?;
        Ok(Self::to_result(outcome))
    }

    /// 终止流程，幂等；已完成/已终止的实例原样返回
    pub async fn terminate_process(
        &self,
        flow_instance_id: &str,
        effective_for_sub_flow: bool,
    ) -> Result<ProcessResult> {
        let instance = self
            .store
            .instance(flow_instance_id)
            .await?
            .ok_or_else(|| {
                ProcflowError::NotFound(format!("flow instance `{flow_instance_id}`"))
            })?;
        if instance.status != FlowInstanceStatus::Active {
            info!(%flow_instance_id, status = ?instance.status, "terminate is a no-op");
            return Ok(ProcessResult {
                flow_instance_id: instance.flow_instance_id,
                status: instance.status,
                active_task: None,
            });
        }
        let mut stack = vec![instance.flow_instance_id.clone()];
        while let Some(id) = stack.pop() {
            let Some(mut inst) = self.store.instance(&id).await? else {
                continue;
            };
            if inst.status != FlowInstanceStatus::Active {
                continue;
            }
            for mut node_instance in self.store.node_instances(&id).await? {
                if node_instance.status == NodeInstanceStatus::Active {
                    state::transition(
                        &*self.store,
                        &mut node_instance,
                        NodeInstanceStatus::Terminated,
                    )
                    .await?;
                }
            }
            inst.status = FlowInstanceStatus::Terminated;
            inst.current_node_instance_id = None;
            inst.updated_at = now_millis();
            self.store.update_instance(inst).await?;
            info!(flow_instance_id = %id, "flow instance terminated");
            if effective_for_sub_flow {
                for child in self.store.child_instances(&id).await? {
                    stack.push(child.flow_instance_id);
                }
            }
        }
        Ok(ProcessResult {
            flow_instance_id: flow_instance_id.to_string(),
            status: FlowInstanceStatus::Terminated,
            active_task: None,
        })
    }

    /// 已处理 UserTask 列表，按处理时间降序，不含被回滚作废的
    pub async fn get_history_user_task_list(
        &self,
        flow_instance_id: &str,
        effective_for_sub_flow: bool,
    ) -> Result<Vec<NodeInstance>> {
        let mut tasks = Vec::new();
        for inst in self
            .instance_tree(flow_instance_id, effective_for_sub_flow)
            .await?
        {
            for node_instance in self.store.node_instances(&inst.flow_instance_id).await? {
                if node_instance.element_type == ElementType::UserTask
                    && matches!(
                        node_instance.status,
                        NodeInstanceStatus::Active | NodeInstanceStatus::Completed
                    )
                {
                    tasks.push(node_instance);
                }
            }
        }
        // 活动任务尚无完成时间，排在最前
        tasks.sort_by(|a, b| {
            let ka = (a.completed_at.unwrap_or(u64::MAX), a.created_at, a.sequence);
            let kb = (b.completed_at.unwrap_or(u64::MAX), b.created_at, b.sequence);
            kb.cmp(&ka)
        });
        Ok(tasks)
    }

    /// 快照视图：按执行顺序的有效节点实例，子流程紧随其 CallActivity
    pub async fn get_history_element_list(
        &self,
        flow_instance_id: &str,
        effective_for_sub_flow: bool,
    ) -> Result<Vec<NodeInstance>> {
        self.store
            .instance(flow_instance_id)
            .await?
            .ok_or_else(|| {
                ProcflowError::NotFound(format!("flow instance `{flow_instance_id}`"))
            })?;
        self.collect_elements(flow_instance_id, effective_for_sub_flow)
            .await
    }

    fn collect_elements<'a>(
        &'a self,
        flow_instance_id: &'a str,
        effective_for_sub_flow: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<NodeInstance>>> + Send + 'a>> {
        Box::pin(async move {
            let mut elements = Vec::new();
            for node_instance in self.store.node_instances(flow_instance_id).await? {
                if node_instance.status == NodeInstanceStatus::Disabled {
                    continue;
                }
                let child_id = node_instance.child_flow_instance_id.clone();
                elements.push(node_instance);
                if effective_for_sub_flow {
                    if let Some(child_id) = child_id {
                        elements.extend(self.collect_elements(&child_id, true).await?);
                    }
                }
            }
            Ok(elements)
        })
    }

    /// 最新变量快照，或指定快照记录的内容
    pub async fn get_instance_data(
        &self,
        flow_instance_id: &str,
        instance_data_id: Option<&str>,
        effective_for_sub_flow: bool,
    ) -> Result<Vec<InstanceData>> {
        match instance_data_id {
            None => {
                self.store
                    .instance(flow_instance_id)
                    .await?
                    .ok_or_else(|| {
                        ProcflowError::NotFound(format!("flow instance `{flow_instance_id}`"))
                    })?;
                Ok(self
                    .store
                    .latest_data_record(flow_instance_id)
                    .await?
                    .map(|record| record.variables())
                    .unwrap_or_default())
            }
            Some(instance_data_id) => {
                for inst in self
                    .instance_tree(flow_instance_id, effective_for_sub_flow)
                    .await?
                {
                    if let Some(record) = self
                        .store
                        .data_record(&inst.flow_instance_id, instance_data_id)
                        .await?
                    {
                        return Ok(record.variables());
                    }
                }
                Err(ProcflowError::NotFound(format!(
                    "instance data `{instance_data_id}`"
                )))
            }
        }
    }

    pub async fn get_node_instance(
        &self,
        flow_instance_id: &str,
        node_instance_id: &str,
        effective_for_sub_flow: bool,
    ) -> Result<NodeInstance> {
        if effective_for_sub_flow {
            let (_, node_instance) = self
                .find_node_instance(flow_instance_id, node_instance_id)
                .await?;
            return Ok(node_instance);
        }
        self.store
            .node_instance(flow_instance_id, node_instance_id)
            .await?
            .ok_or_else(|| {
                ProcflowError::NotFound(format!("node instance `{node_instance_id}`"))
            })
    }

    /// 节点实例状态变更日志，按发生顺序，含被作废/终止记录的完整轨迹
    pub async fn get_node_instance_logs(
        &self,
        flow_instance_id: &str,
    ) -> Result<Vec<NodeInstanceLog>> {
        self.store
            .instance(flow_instance_id)
            .await?
            .ok_or_else(|| {
                ProcflowError::NotFound(format!("flow instance `{flow_instance_id}`"))
            })?;
        self.store.logs(flow_instance_id).await
    }

    pub async fn get_flow_instance(&self, flow_instance_id: &str) -> Result<FlowInstance> {
        self.store
            .instance(flow_instance_id)
            .await?
            .ok_or_else(|| {
                ProcflowError::NotFound(format!("flow instance `{flow_instance_id}`"))
            })
    }

    /// 在实例及其子孙中定位节点实例
    async fn find_node_instance(
        &self,
        flow_instance_id: &str,
        node_instance_id: &str,
    ) -> Result<(FlowInstance, NodeInstance)> {
        for inst in self.instance_tree(flow_instance_id, true).await? {
            if let Some(node_instance) = self
                .store
                .node_instance(&inst.flow_instance_id, node_instance_id)
                .await?
            {
                return Ok((inst, node_instance));
            }
        }
        Err(ProcflowError::NotFound(format!(
            "node instance `{node_instance_id}`"
        )))
    }

    async fn instance_tree(
        &self,
        flow_instance_id: &str,
        with_descendants: bool,
    ) -> Result<Vec<FlowInstance>> {
        let root = self
            .store
            .instance(flow_instance_id)
            .await?
            .ok_or_else(|| {
                ProcflowError::NotFound(format!("flow instance `{flow_instance_id}`"))
            })?;
        let mut all = vec![root];
        if with_descendants {
            let mut index = 0;
            while index < all.len() {
                let children = self
                    .store
                    .child_instances(&all[index].flow_instance_id)
                    .await?;
                all.extend(children);
                index += 1;
            }
        }
        Ok(all)
    }

    fn to_result(outcome: ExecutionOutcome) -> ProcessResult {
        ProcessResult {
            flow_instance_id: outcome.flow_instance.flow_instance_id,
            status: outcome.flow_instance.status,
            active_task: outcome.active_task,
        }
    }
}
