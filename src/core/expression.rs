//! Evaluation of dynamic rate-limit expressions.
//!
//! The evaluator itself is external; this module fixes its contract and
//! enforces the output type each expression kind requires.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::rate_limit::{ExpressionEval, ExpressionKind};
use crate::core::SchedulerError;

/// Typed output of an expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EvaluatedValue {
    /// String result.
    Str(String),
    /// Integer result.
    Int(i64),
}

/// External expression evaluator.
#[async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` against a step run's input and context.
    async fn evaluate(
        &self,
        expression: &str,
        input: &serde_json::Value,
    ) -> Result<EvaluatedValue, SchedulerError>;
}

/// Dynamic rate-limit expression declared on a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitExpression {
    /// Expression group, one per dynamic limit on the step.
    pub key: String,
    /// Parameter the expression computes.
    pub kind: ExpressionKind,
    /// Expression source.
    pub expression: String,
}

/// Evaluate every expression for one step run.
///
/// KEY and WINDOW must produce strings, VALUE and UNITS integers. The first
/// failure aborts the batch and is returned to the caller.
pub async fn evaluate_rate_limit_expressions(
    evaluator: &dyn ExpressionEvaluator,
    step_run_id: &str,
    input: &serde_json::Value,
    expressions: &[RateLimitExpression],
) -> Result<Vec<ExpressionEval>, SchedulerError> {
    let mut evals = Vec::with_capacity(expressions.len());
    for expr in expressions {
        let value = evaluator.evaluate(&expr.expression, input).await?;
        let (value_str, value_int) = match (expr.kind, value) {
            (ExpressionKind::Key | ExpressionKind::Window, EvaluatedValue::Str(s)) => (Some(s), None),
            (ExpressionKind::Value | ExpressionKind::Units, EvaluatedValue::Int(i)) => (None, Some(i)),
            (kind, other) => {
                return Err(SchedulerError::Evaluation(format!(
                    "expression `{}` for {kind:?} returned {other:?}",
                    expr.expression
                )));
            }
        };
        evals.push(ExpressionEval {
            step_run_id: step_run_id.to_string(),
            key: expr.key.clone(),
            kind: expr.kind,
            value_str,
            value_int,
        });
    }
    Ok(evals)
}
