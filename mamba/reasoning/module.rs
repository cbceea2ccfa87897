use std::{fmt, sync::Arc};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unit of sensed input recorded by the control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perception {
    /// Sensed payload.
    pub data: Value,
    /// Producer name.
    pub source: String,
    /// When it was perceived.
    pub timestamp: DateTime<Utc>,
}

impl Perception {
    /// Creates a perception stamped with the current time.
    #[must_use]
    pub fn new(data: Value, source: impl Into<String>) -> Self {
        Self {
            data,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Chosen action plus confidence and rationale. Extra fields serialize alongside the
/// named ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Action name consumed by actuators.
    pub action: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Optional rationale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Additional action parameters.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Decision {
    /// Creates a decision without rationale or extra fields.
    #[must_use]
    pub fn new(action: impl Into<String>, confidence: f64) -> Self {
        Self {
            action: action.into(),
            confidence,
            reason: None,
            extra: Map::new(),
        }
    }

    /// Sets the rationale.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Adds an extra field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// JSON object form, as published on the bus.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Transient view handed to every rule during one `reason` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasoningContext {
    /// Perceptions under consideration.
    pub perceptions: Vec<Perception>,
    /// Recalled memory supplied by the caller.
    pub context: Value,
    /// `perceptions.len()`.
    pub perception_count: usize,
    /// When the context was built.
    pub timestamp: DateTime<Utc>,
}

impl ReasoningContext {
    /// Builds the context for one reasoning pass.
    #[must_use]
    pub fn new(perceptions: Vec<Perception>, context: Value) -> Self {
        Self {
            perception_count: perceptions.len(),
            perceptions,
            context,
            timestamp: Utc::now(),
        }
    }

    /// Most recent perception, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&Perception> {
        self.perceptions.last()
    }
}

/// Condition/action strategy behind a rule.
///
/// Errors and panics raised here are contained by the engine: a failing `evaluate`
/// counts as "not applicable", a failing `execute` yields no decision.
pub trait RuleLogic: Send + Sync {
    /// Whether the rule applies to `context`.
    fn evaluate(&self, context: &ReasoningContext) -> Result<bool>;
    /// Produces the decision once the rule is selected.
    fn execute(&self, context: &ReasoningContext) -> Result<Decision>;
}

/// Rule logic built from a predicate closure and an action closure.
pub struct FnRule<C, A> {
    condition: C,
    action: A,
}

impl<C, A> FnRule<C, A>
where
    C: Fn(&ReasoningContext) -> bool + Send + Sync,
    A: Fn(&ReasoningContext) -> Decision + Send + Sync,
{
    /// Pairs the closures.
    pub const fn new(condition: C, action: A) -> Self {
        Self { condition, action }
    }
}

impl<C, A> RuleLogic for FnRule<C, A>
where
    C: Fn(&ReasoningContext) -> bool + Send + Sync,
    A: Fn(&ReasoningContext) -> Decision + Send + Sync,
{
    fn evaluate(&self, context: &ReasoningContext) -> Result<bool> {
        Ok((self.condition)(context))
    }

    fn execute(&self, context: &ReasoningContext) -> Result<Decision> {
        Ok((self.action)(context))
    }
}

/// Named, prioritized rule with an adaptive weight.
#[derive(Clone)]
pub struct Rule {
    /// Unique key.
    pub name: String,
    /// Higher runs first and scores higher.
    pub priority: i64,
    /// Feedback multiplier in `[MIN_WEIGHT, MAX_WEIGHT]`.
    pub weight: f64,
    /// Successful executions.
    pub execution_count: u64,
    /// Last successful execution.
    pub last_executed: Option<DateTime<Utc>>,
    pub(crate) logic: Arc<dyn RuleLogic>,
}

impl Rule {
    pub(crate) fn new(name: String, logic: Arc<dyn RuleLogic>, priority: i64) -> Self {
        Self {
            name,
            priority,
            weight: 1.0,
            execution_count: 0,
            last_executed: None,
            logic,
        }
    }

    /// Selection score: `priority × weight`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self) -> f64 {
        self.priority as f64 * self.weight
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .field("execution_count", &self.execution_count)
            .field("last_executed", &self.last_executed)
            .finish_non_exhaustive()
    }
}

/// One entry of the reasoning history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRecord {
    /// Rule whose action ran.
    pub rule_used: String,
    /// Every rule whose condition held, in priority order.
    pub applicable_rules: Vec<String>,
    /// Resulting decision; `None` when the action failed.
    pub decision: Option<Decision>,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
}

/// Per-rule statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleStats {
    /// Rule name.
    pub name: String,
    /// Priority.
    pub priority: i64,
    /// Successful executions.
    pub executions: u64,
    /// Current weight.
    pub weight: f64,
    /// Last successful execution.
    pub last_executed: Option<DateTime<Utc>>,
}

impl From<&Rule> for RuleStats {
    fn from(rule: &Rule) -> Self {
        Self {
            name: rule.name.clone(),
            priority: rule.priority,
            executions: rule.execution_count,
            weight: rule.weight,
            last_executed: rule.last_executed,
        }
    }
}

/// Engine-wide statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatistics {
    /// Registered rules.
    pub total_rules: usize,
    /// Retained history records.
    pub reasoning_history_size: usize,
    /// Rules in priority order.
    pub rules: Vec<RuleStats>,
}
