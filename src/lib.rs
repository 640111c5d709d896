pub mod config;
pub mod engine;
pub mod error;
pub mod expr;
pub mod hook;
pub mod model;
pub mod storage;
pub mod utils;

pub use config::{NestingConfig, MAX_NESTED_LEVEL, MIN_NESTED_LEVEL, UNLIMITED_NESTED_LEVEL};
pub use engine::{
    CreateFlowParam, FlowModuleInfo, GetFlowModuleParam, ProcessEngine, ProcessResult,
    StartProcessParam, UpdateFlowParam,
};
pub use error::{ProcflowError, Result};
pub use expr::Evaluator;
pub use hook::{HookRegistry, HookService, ServiceTaskHandler, ServiceTaskRegistry};
pub use model::{
    ElementType, FlowDefinition, FlowDeployment, FlowInstance, FlowInstanceStatus, FlowModel,
    FlowModuleStatus, InstanceData, InstanceDataRecord, InstanceDataType, Node, NodeInstance,
    NodeInstanceLog, NodeInstanceStatus, NodeKind, SequenceFlow,
};
pub use storage::FlowStore;
#[cfg(feature = "memory-store")]
pub use storage::MemoryStore;
pub use utils::logging;
