mod engine;
mod executor;
mod rollback;
mod state;
mod subflow;
mod types;

pub use engine::ProcessEngine;
pub use types::{
    CreateFlowParam, FlowModuleInfo, GetFlowModuleParam, ProcessResult, StartProcessParam,
    UpdateFlowParam,
};

pub(crate) use executor::{ExecutionOutcome, FlowExecutor};
pub(crate) use rollback::RollbackCoordinator;
