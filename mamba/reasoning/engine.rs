use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared_event_bus::Telemetry;
use shared_logging::LogLevel;
use thiserror::Error;
use tracing::{error, warn};

use crate::module::{
    Decision, EngineStatistics, FnRule, Perception, ReasoningContext, ReasoningRecord, Rule,
    RuleLogic, RuleStats,
};

/// Lower bound of a rule weight.
pub const MIN_WEIGHT: f64 = 0.1;
/// Upper bound of a rule weight.
pub const MAX_WEIGHT: f64 = 2.0;
/// Weight change per unit of score above or below 0.5.
pub const ADAPT_RATE: f64 = 0.1;
/// History is truncated once it grows past this many records...
pub const HISTORY_LIMIT: usize = 1000;
/// ...keeping this many of the most recent ones.
pub const HISTORY_RETAIN: usize = 500;

/// Errors raised when editing the rule set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReasoningError {
    /// A rule with this name is already registered.
    #[error("rule already registered: {0}")]
    DuplicateRule(String),
}

#[derive(Debug, Default)]
struct EngineState {
    rules: Vec<Rule>,
    history: Vec<ReasoningRecord>,
}

/// Rule registry selecting one decision per context.
///
/// The rule set and the history sit behind one mutex, so several control loops can
/// share an engine. Rule logic runs outside that lock.
#[derive(Debug, Default)]
pub struct ReasoningEngine {
    state: Mutex<EngineState>,
    telemetry: Option<Telemetry>,
}

impl ReasoningEngine {
    /// Creates an engine without rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Registers a rule with weight 1.0. Rules stay sorted by descending priority; equal
    /// priorities keep insertion order.
    pub fn add_rule(
        &self,
        name: impl Into<String>,
        logic: impl RuleLogic + 'static,
        priority: i64,
    ) -> Result<(), ReasoningError> {
        let name = name.into();
        let mut state = self.state.lock();
        if state.rules.iter().any(|rule| rule.name == name) {
            return Err(ReasoningError::DuplicateRule(name));
        }
        let position = state
            .rules
            .iter()
            .position(|rule| rule.priority < priority)
            .unwrap_or(state.rules.len());
        state
            .rules
            .insert(position, Rule::new(name, Arc::new(logic), priority));
        Ok(())
    }

    /// Registers a rule from a condition closure and an action closure.
    pub fn add_fn_rule<C, A>(
        &self,
        name: impl Into<String>,
        condition: C,
        action: A,
        priority: i64,
    ) -> Result<(), ReasoningError>
    where
        C: Fn(&ReasoningContext) -> bool + Send + Sync + 'static,
        A: Fn(&ReasoningContext) -> Decision + Send + Sync + 'static,
    {
        self.add_rule(name, FnRule::new(condition, action), priority)
    }

    /// Removes the rule named `name`. Returns whether one was removed.
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        match state.rules.iter().position(|rule| rule.name == name) {
            Some(position) => {
                state.rules.remove(position);
                true
            }
            None => false,
        }
    }

    /// Chooses a decision for the given perceptions and recalled context.
    ///
    /// Every rule is evaluated in priority order. Among those that apply, the one with
    /// the highest `priority × weight` wins; on a tie the earlier rule wins. When no rule
    /// applies a fixed heuristic on the perception count answers instead. Returns `None`
    /// only when the selected rule's action fails.
    pub fn reason(&self, perceptions: &[Perception], context: Value) -> Option<Decision> {
        let ctx = ReasoningContext::new(perceptions.to_vec(), context);
        let rules: Vec<Rule> = self.state.lock().rules.clone();

        let applicable: Vec<&Rule> = rules
            .iter()
            .filter(|rule| evaluate(rule, &ctx))
            .collect();

        let Some(mut best) = applicable.first().copied() else {
            return Some(default_decision(ctx.perception_count));
        };
        for &rule in &applicable[1..] {
            if rule.score() > best.score() {
                best = rule;
            }
        }

        let decision = execute(best, &ctx);
        let record = ReasoningRecord {
            rule_used: best.name.clone(),
            applicable_rules: applicable.iter().map(|rule| rule.name.clone()).collect(),
            decision: decision.clone(),
            timestamp: Utc::now(),
        };
        self.log_selection(best, &record);

        let mut state = self.state.lock();
        if decision.is_some() {
            if let Some(rule) = state.rules.iter_mut().find(|rule| rule.name == best.name) {
                rule.execution_count += 1;
                rule.last_executed = Some(record.timestamp);
            }
        }
        state.history.push(record);
        if state.history.len() > HISTORY_LIMIT {
            let excess = state.history.len() - HISTORY_RETAIN;
            state.history.drain(..excess);
        }
        decision
    }

    /// Nudges a rule's weight by `(score − 0.5) × ADAPT_RATE`, clamped to
    /// `[MIN_WEIGHT, MAX_WEIGHT]`. `score` is clamped to `[0, 1]`. Returns the new weight,
    /// or `None` when the rule is unknown or the score is not a number.
    pub fn adapt(&self, rule_name: &str, performance_score: f64) -> Option<f64> {
        if performance_score.is_nan() {
            return None;
        }
        let score = performance_score.clamp(0.0, 1.0);
        let mut state = self.state.lock();
        let rule = state.rules.iter_mut().find(|rule| rule.name == rule_name)?;
        rule.weight = (rule.weight + (score - 0.5) * ADAPT_RATE).clamp(MIN_WEIGHT, MAX_WEIGHT);
        Some(rule.weight)
    }

    /// Snapshot of the rule set and history size.
    #[must_use]
    pub fn statistics(&self) -> EngineStatistics {
        let state = self.state.lock();
        EngineStatistics {
            total_rules: state.rules.len(),
            reasoning_history_size: state.history.len(),
            rules: state.rules.iter().map(RuleStats::from).collect(),
        }
    }

    /// Statistics of a single rule.
    #[must_use]
    pub fn rule(&self, name: &str) -> Option<RuleStats> {
        self.state
            .lock()
            .rules
            .iter()
            .find(|rule| rule.name == name)
            .map(RuleStats::from)
    }

    /// Rule names in evaluation order.
    #[must_use]
    pub fn rule_names(&self) -> Vec<String> {
        self.state
            .lock()
            .rules
            .iter()
            .map(|rule| rule.name.clone())
            .collect()
    }

    /// The last `limit` history records, oldest first.
    #[must_use]
    pub fn history(&self, limit: usize) -> Vec<ReasoningRecord> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history[skip..].to_vec()
    }

    fn log_selection(&self, rule: &Rule, record: &ReasoningRecord) {
        if let Some(tel) = &self.telemetry {
            let payload = json!({
                "rule": rule.name,
                "score": rule.score(),
                "applicable": record.applicable_rules,
                "action": record.decision.as_ref().map(|d| d.action.clone()),
            });
            let _ = tel.log(LogLevel::Debug, "reasoning.rule_selected", payload.clone());
            let _ = tel.event("reasoning.rule_selected", payload);
        }
    }
}

/// Decision used when no rule applies.
#[must_use]
pub fn default_decision(perception_count: usize) -> Decision {
    match perception_count {
        0 => Decision::new("wait", 0.4).with_reason("no_perceptions"),
        1..=10 => Decision::new("observe", 0.5).with_reason("few_perceptions"),
        _ => Decision::new("process", 0.6).with_reason("many_perceptions"),
    }
}

fn evaluate(rule: &Rule, ctx: &ReasoningContext) -> bool {
    match catch_unwind(AssertUnwindSafe(|| rule.logic.evaluate(ctx))) {
        Ok(Ok(applies)) => applies,
        Ok(Err(err)) => {
            warn!(rule = %rule.name, error = %err, "reasoning.condition_failed");
            false
        }
        Err(_) => {
            error!(rule = %rule.name, "reasoning.condition_panicked");
            false
        }
    }
}

fn execute(rule: &Rule, ctx: &ReasoningContext) -> Option<Decision> {
    match catch_unwind(AssertUnwindSafe(|| rule.logic.execute(ctx))) {
        Ok(Ok(decision)) => Some(decision),
        Ok(Err(err)) => {
            warn!(rule = %rule.name, error = %err, "reasoning.action_failed");
            None
        }
        Err(_) => {
            error!(rule = %rule.name, "reasoning.action_panicked");
            None
        }
    }
}
