use std::collections::HashMap;
use std::env;

use tracing::warn;

/// CallActivity 嵌套层级配置

/// -1 表示不限制（内部仍以硬上限封顶）
pub const UNLIMITED_NESTED_LEVEL: i32 = -1;
/// 0 表示流程不允许使用 CallActivity 节点
pub const MIN_NESTED_LEVEL: i32 = 0;
/// 硬上限
pub const MAX_NESTED_LEVEL: i32 = 10;

/// 嵌套层级按顶层调用方的流程 key 查询。
///
/// flowA 引用 flowB 时 flowA 的层级为 1；
/// flowA 引用 flowB、flowB 引用 flowC 时为 2。
#[derive(Clone, Debug, Default)]
pub struct NestingConfig {
    levels: HashMap<String, i32>,
}

impl NestingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 PROCFLOW_NESTED_LEVEL 读取 JSON 配置，如 `{"flowA":1,"flowB":-1}`
    pub fn from_env() -> Self {
        let Some(raw) = env::var("PROCFLOW_NESTED_LEVEL").ok() else {
            return Self::default();
        };
        match serde_json::from_str::<HashMap<String, i32>>(&raw) {
            Ok(levels) => Self { levels },
            Err(err) => {
                warn!(%err, "PROCFLOW_NESTED_LEVEL is not a valid JSON object, ignoring");
                Self::default()
            }
        }
    }

    pub fn with_level(mut self, flow_key: impl Into<String>, level: i32) -> Self {
        self.levels.insert(flow_key.into(), level);
        self
    }

    /// 解析生效的嵌套上限：未配置或 -1 封顶为 10，超过 10 亦封顶
    pub fn nested_level(&self, root_flow_key: &str) -> u32 {
        match self.levels.get(root_flow_key) {
            None => MAX_NESTED_LEVEL as u32,
            Some(&level) if level < MIN_NESTED_LEVEL => MAX_NESTED_LEVEL as u32,
            Some(&level) if level > MAX_NESTED_LEVEL => MAX_NESTED_LEVEL as u32,
            Some(&level) => level as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_flow_gets_the_hard_ceiling() {
        let config = NestingConfig::new();
        assert_eq!(config.nested_level("anything"), 10);
    }

    #[test]
    fn unlimited_is_capped_at_the_hard_ceiling() {
        let config = NestingConfig::new().with_level("flowA", UNLIMITED_NESTED_LEVEL);
        assert_eq!(config.nested_level("flowA"), 10);
    }

    #[test]
    fn explicit_levels_apply_and_large_values_are_capped() {
        let config = NestingConfig::new()
            .with_level("flowA", 1)
            .with_level("flowB", 0)
            .with_level("flowC", 99);
        assert_eq!(config.nested_level("flowA"), 1);
        assert_eq!(config.nested_level("flowB"), 0);
        assert_eq!(config.nested_level("flowC"), 10);
    }
}
