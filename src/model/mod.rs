pub mod definition;
pub mod element;
pub mod instance;

pub use definition::{FlowDefinition, FlowDeployment, FlowModuleStatus};
pub use element::{ElementType, FlowModel, Node, NodeKind, SequenceFlow};
pub use instance::{
    FlowInstance, FlowInstanceStatus, InstanceData, InstanceDataRecord, InstanceDataType,
    NodeInstance, NodeInstanceLog, NodeInstanceStatus,
};
