use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ProcflowError, Result};

/// 流程图模型定义

/// 节点类型，封闭集合，遍历算法按固定变体分发
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeKind {
    StartEvent,
    EndEvent,
    UserTask,
    ExclusiveGateway {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hook_param: Option<String>,
    },
    ServiceTask,
    CallActivity {
        called_flow_key: String,
    },
}

/// 节点类型标签，用于实例记录与日志
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementType {
    StartEvent,
    EndEvent,
    UserTask,
    ExclusiveGateway,
    ServiceTask,
    CallActivity,
}

/// 顺序流，condition 为空表示无条件（默认）流
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// 流程图节点
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub outgoing: Vec<SequenceFlow>,
}

impl Node {
    pub fn element_type(&self) -> ElementType {
        match self.kind {
            NodeKind::StartEvent => ElementType::StartEvent,
            NodeKind::EndEvent => ElementType::EndEvent,
            NodeKind::UserTask => ElementType::UserTask,
            NodeKind::ExclusiveGateway { .. } => ElementType::ExclusiveGateway,
            NodeKind::ServiceTask => ElementType::ServiceTask,
            NodeKind::CallActivity { .. } => ElementType::CallActivity,
        }
    }

    /// 无条件（默认）出边
    pub fn default_flow(&self) -> Option<&SequenceFlow> {
        self.outgoing.iter().find(|flow| flow.condition.is_none())
    }
}

/// 流程图：有向图，一个开始事件，可含多个结束事件
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowModel {
    pub nodes: Vec<Node>,
}

impl FlowModel {
    pub fn node(&self, key: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.key == key)
    }

    pub fn start_event(&self) -> Result<&Node> {
        self.nodes
            .iter()
            .find(|node| node.kind == NodeKind::StartEvent)
            .ok_or_else(|| ProcflowError::Validation("flow model has no start event".to_string()))
    }

    /// 部署前校验图结构
    pub fn validate(&self) -> Result<()> {
        let mut keys = HashSet::new();
        let mut start_count = 0usize;
        for node in &self.nodes {
            if node.key.trim().is_empty() {
                return Err(ProcflowError::Validation(
                    "node key must not be empty".to_string(),
                ));
            }
            if !keys.insert(node.key.as_str()) {
                return Err(ProcflowError::Validation(format!(
                    "duplicate node key `{}`",
                    node.key
                )));
            }
            if node.kind == NodeKind::StartEvent {
                start_count += 1;
            }
        }
        if start_count != 1 {
            return Err(ProcflowError::Validation(format!(
                "flow model must contain exactly one start event, found {}",
                start_count
            )));
        }

        for node in &self.nodes {
            for flow in &node.outgoing {
                if self.node(&flow.target).is_none() {
                    return Err(ProcflowError::Validation(format!(
                        "sequence flow from `{}` targets unknown node `{}`",
                        node.key, flow.target
                    )));
                }
            }
            match &node.kind {
                NodeKind::StartEvent => {
                    if node.outgoing.is_empty() {
                        return Err(ProcflowError::Validation(format!(
                            "start event `{}` has no outgoing flow",
                            node.key
                        )));
                    }
                }
                NodeKind::EndEvent => {
                    if !node.outgoing.is_empty() {
                        return Err(ProcflowError::Validation(format!(
                            "end event `{}` must not have outgoing flows",
                            node.key
                        )));
                    }
                }
                NodeKind::ExclusiveGateway { .. } => {
                    let defaults = node
                        .outgoing
                        .iter()
                        .filter(|flow| flow.condition.is_none())
                        .count();
                    if defaults > 1 {
                        return Err(ProcflowError::Validation(format!(
                            "gateway `{}` has more than one unconditional flow",
                            node.key
                        )));
                    }
                    if node.outgoing.is_empty() {
                        return Err(ProcflowError::Validation(format!(
                            "gateway `{}` has no outgoing flow",
                            node.key
                        )));
                    }
                }
                NodeKind::CallActivity { called_flow_key } => {
                    if called_flow_key.trim().is_empty() {
                        return Err(ProcflowError::Validation(format!(
                            "call activity `{}` has no called flow key",
                            node.key
                        )));
                    }
                }
                _ => {}
            }
            if node.outgoing.len() > 1
                && !matches!(node.kind, NodeKind::ExclusiveGateway { .. })
            {
                return Err(ProcflowError::Validation(format!(
                    "node `{}` has multiple outgoing flows but is not a gateway",
                    node.key
                )));
            }
        }
        Ok(())
    }
}
