use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ProcflowError, Result};

/// 进程级共享的脚本引擎，进程启动时创建，从不销毁
static ENGINE: Lazy<Engine> = Lazy::new(Engine::new);

/// 编译结果缓存，按表达式原文为键，只增不减；表达式集合小且稳定
static AST_CACHE: Lazy<RwLock<HashMap<String, AST>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// 条件/计算表达式求值器
pub struct Evaluator;

impl Evaluator {
    /// 对变量快照求值。空表达式直接返回 None，不进脚本引擎。
    ///
    /// 表达式引用了快照中不存在的变量时返回 MissingBinding，
    /// 调用方补齐变量后可重试；其余脚本错误一律是 Evaluation 硬失败。
    pub fn evaluate(expression: &str, variables: &BTreeMap<String, Value>) -> Result<Option<Value>> {
        if expression.trim().is_empty() {
            warn!("evaluate: expression is empty");
            return Ok(None);
        }
        let ast = Self::compiled(expression)?;
        let mut scope = Scope::new();
        for (key, value) in variables {
            let dynamic = rhai::serde::to_dynamic(value)
                .map_err(|err| ProcflowError::Evaluation(err.to_string()))?;
            scope.push_dynamic(key.as_str(), dynamic);
        }
        let result = ENGINE
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(Self::map_eval_error)?;
        debug!(expression, result = %result, "evaluate");
        let value = rhai::serde::from_dynamic(&result)
            .map_err(|err| ProcflowError::Evaluation(err.to_string()))?;
        Ok(Some(value))
    }

    /// 网关条件求值，结果按真值规则折算
    pub fn evaluate_bool(expression: &str, variables: &BTreeMap<String, Value>) -> Result<bool> {
        Ok(Self::evaluate(expression, variables)?
            .map(Self::is_truthy)
            .unwrap_or(false))
    }

    fn compiled(expression: &str) -> Result<AST> {
        if let Some(ast) = AST_CACHE.read().get(expression) {
            return Ok(ast.clone());
        }
        let ast = ENGINE
            .compile(expression)
            .map_err(|err| ProcflowError::Evaluation(err.to_string()))?;
        AST_CACHE
            .write()
            .entry(expression.to_string())
            .or_insert_with(|| ast.clone());
        Ok(ast)
    }

    fn map_eval_error(err: Box<EvalAltResult>) -> ProcflowError {
        match *err {
            EvalAltResult::ErrorVariableNotFound(name, _) => {
                ProcflowError::MissingBinding { name }
            }
            other => ProcflowError::Evaluation(other.to_string()),
        }
    }

    fn is_truthy(value: Value) -> bool {
        match value {
            Value::Null => false,
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn blank_expression_evaluates_to_none() {
        assert_eq!(Evaluator::evaluate("", &BTreeMap::new()).unwrap(), None);
        assert_eq!(Evaluator::evaluate("   ", &BTreeMap::new()).unwrap(), None);
    }

    #[test]
    fn comparison_against_bound_variable() {
        let snapshot = vars(&[("x", json!(15))]);
        assert!(Evaluator::evaluate_bool("x > 10", &snapshot).unwrap());
        let snapshot = vars(&[("x", json!(5))]);
        assert!(!Evaluator::evaluate_bool("x > 10", &snapshot).unwrap());
    }

    #[test]
    fn missing_variable_is_reported_as_missing_binding() {
        let err = Evaluator::evaluate_bool("x > 10", &BTreeMap::new()).unwrap_err();
        match err {
            ProcflowError::MissingBinding { name } => assert_eq!(name, "x"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_binding_recovers_after_supplying_the_variable() {
        let expr = "amount >= 100";
        assert!(Evaluator::evaluate_bool(expr, &BTreeMap::new()).is_err());
        let snapshot = vars(&[("amount", json!(250))]);
        assert!(Evaluator::evaluate_bool(expr, &snapshot).unwrap());
    }

    #[test]
    fn repeated_evaluation_hits_the_cache_and_stays_deterministic() {
        let snapshot = vars(&[("y", json!(3))]);
        let first = Evaluator::evaluate("y * 2", &snapshot).unwrap();
        for _ in 0..5 {
            assert_eq!(Evaluator::evaluate("y * 2", &snapshot).unwrap(), first);
        }
        assert_eq!(first, Some(json!(6)));
    }

    #[test]
    fn syntax_error_is_a_hard_evaluation_failure() {
        let err = Evaluator::evaluate("x >>> 1 ===", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ProcflowError::Evaluation(_)));
    }

    #[test]
    fn truthiness_rules() {
        assert!(Evaluator::is_truthy(json!(true)));
        assert!(!Evaluator::is_truthy(json!(false)));
        assert!(!Evaluator::is_truthy(json!(0)));
        assert!(Evaluator::is_truthy(json!(1)));
        assert!(!Evaluator::is_truthy(json!(null)));
        assert!(!Evaluator::is_truthy(json!("")));
        assert!(Evaluator::is_truthy(json!("ok")));
    }
}
