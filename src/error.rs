use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcflowError>;

/// 引擎统一错误类型，每个变体带稳定错误码
#[derive(Debug, Error)]
pub enum ProcflowError {
    #[error("invalid flow model: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("no matching sequence flow out of gateway `{node_key}`")]
    NoMatchingFlow { node_key: String },
    #[error("expression references missing variable `{name}`")]
    MissingBinding { name: String },
    #[error("expression evaluation failed: {0}")]
    Evaluation(String),
    #[error("call activity nested level exceeded for flow `{flow_key}` (limit {limit})")]
    NestedLevelExceeded { flow_key: String, limit: u32 },
    #[error("storage error: {0}")]
    Store(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcflowError {
    /// 错误码，供调用层映射为业务提示
    pub fn code(&self) -> u32 {
        match self {
            ProcflowError::Validation(_) => 4001,
            ProcflowError::NotFound(_) => 4002,
            ProcflowError::InvalidState(_) => 4003,
            ProcflowError::NoMatchingFlow { .. } => 4004,
            ProcflowError::MissingBinding { .. } => 4005,
            ProcflowError::NestedLevelExceeded { .. } => 4006,
            ProcflowError::Evaluation(_) => 5001,
            ProcflowError::Store(_) => 5002,
            ProcflowError::Other(_) => 5000,
        }
    }

    /// 仅 MissingBinding 可由调用方补齐变量后重试同一调用
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProcflowError::MissingBinding { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binding_is_the_only_recoverable_kind() {
        assert!(ProcflowError::MissingBinding {
            name: "x".to_string()
        }
        .is_recoverable());
        assert!(!ProcflowError::Evaluation("boom".to_string()).is_recoverable());
        assert!(!ProcflowError::InvalidState("done".to_string()).is_recoverable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ProcflowError::Validation(String::new()).code(), 4001);
        assert_eq!(
            ProcflowError::MissingBinding {
                name: "y".to_string()
            }
            .code(),
            4005
        );
    }
}
