//! Analysis engine abstraction and the built-in rule evaluator.
//!
//! The report pipeline treats the engine as an opaque, interruptible,
//! CPU-bound computation: it hands over recording bytes and a predicate and
//! gets back per-rule evaluations. The engine must poll the cancellation
//! token between rules so a best-effort cancel lands at the next rule
//! boundary.

use crate::filter::{RuleCatalog, RulePredicate};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Sentinel score: the rule does not apply to this recording
pub const SCORE_NOT_APPLICABLE: f64 = -1.0;
/// Sentinel score: the recording carries too little data for the rule
pub const SCORE_INSUFFICIENT_DATA: f64 = -2.0;
/// Sentinel score: the rule failed to evaluate
pub const SCORE_RULE_ERROR: f64 = -3.0;

/// Errors produced by an analysis engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("analysis cancelled")]
    Cancelled,

    #[error("rule evaluation failed: {0}")]
    Evaluation(String),
}

/// Evaluation of a single rule against a recording
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RuleEvaluation {
    /// Sentinel (-1/-2/-3) or severity 0..=100
    pub score: f64,
    pub name: String,
    pub topic: String,
    pub explanation: String,
}

/// Full result of evaluating a recording
#[derive(Debug, Clone)]
pub struct EngineReport {
    /// Rule id -> evaluation, for every selected rule
    pub evaluations: BTreeMap<String, RuleEvaluation>,
    /// Number of rules handed to the engine
    pub rules_evaluated: u64,
    /// Number of evaluations with a non-sentinel score
    pub rules_applicable: u64,
}

/// An interruptible, CPU-bound evaluation of a recording against a rule set
pub trait AnalysisEngine: Send + Sync + 'static {
    /// Evaluate the recording against all rules selected by the predicate.
    ///
    /// Runs on a worker thread and may take a long time; implementations
    /// must check `cancel` between rules and bail out with
    /// [`EngineError::Cancelled`] once it fires.
    fn evaluate(
        &self,
        recording: &[u8],
        predicate: &RulePredicate,
        cancel: &CancellationToken,
    ) -> Result<EngineReport, EngineError>;
}

/// Built-in engine evaluating the startup rule catalog.
///
/// Scores are a deterministic digest of rule id and recording content, so a
/// given recording always produces the same report. The scoring itself is a
/// placeholder for a real rule engine; the shape of the result is what the
/// pipeline depends on.
pub struct RuleBasedEngine {
    catalog: &'static RuleCatalog,
}

/// Recordings smaller than this carry too little data for any rule
const MIN_RECORDING_BYTES: usize = 16;

impl RuleBasedEngine {
    pub fn new(catalog: &'static RuleCatalog) -> Self {
        Self { catalog }
    }

    fn score(rule_id: &str, recording: &[u8]) -> (f64, String) {
        if recording.len() < MIN_RECORDING_BYTES {
            return (
                SCORE_INSUFFICIENT_DATA,
                "The recording contains too little data to evaluate this rule.".to_string(),
            );
        }
        let digest = fingerprint(rule_id.as_bytes(), recording);
        if digest % 13 == 0 {
            return (
                SCORE_NOT_APPLICABLE,
                "This rule does not apply to the uploaded recording.".to_string(),
            );
        }
        let score = (digest % 101) as f64;
        let explanation = format!(
            "Rule {} scored {:.0} out of 100 for this recording.",
            rule_id, score
        );
        (score, explanation)
    }
}

impl AnalysisEngine for RuleBasedEngine {
    fn evaluate(
        &self,
        recording: &[u8],
        predicate: &RulePredicate,
        cancel: &CancellationToken,
    ) -> Result<EngineReport, EngineError> {
        let mut evaluations = BTreeMap::new();
        let mut rules_evaluated = 0u64;
        let mut rules_applicable = 0u64;

        for rule in self.catalog.rules() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if !predicate.matches(rule) {
                continue;
            }
            rules_evaluated += 1;
            let (score, explanation) = Self::score(&rule.id, recording);
            if score >= 0.0 {
                rules_applicable += 1;
            }
            evaluations.insert(
                rule.id.clone(),
                RuleEvaluation {
                    score,
                    name: rule.name.clone(),
                    topic: rule.topic.clone(),
                    explanation,
                },
            );
        }

        Ok(EngineReport {
            evaluations,
            rules_evaluated,
            rules_applicable,
        })
    }
}

/// FNV-1a over the rule id and a bounded sample of the recording
fn fingerprint(rule_id: &[u8], recording: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for &b in rule_id {
        hash = (hash ^ u64::from(b)).wrapping_mul(PRIME);
    }
    // Sample at most 64 KiB so huge recordings hash in bounded time
    let step = (recording.len() / 65536).max(1);
    for &b in recording.iter().step_by(step) {
        hash = (hash ^ u64::from(b)).wrapping_mul(PRIME);
    }
    hash ^ recording.len() as u64
}

/// Render an evaluation map as a self-contained HTML report
pub fn render_html(report: &EngineReport) -> String {
    let mut rows = String::new();
    for (id, eval) in &report.evaluations {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{:.1}</td><td>{}</td></tr>\n",
            id, eval.name, eval.topic, eval.score, eval.explanation
        ));
    }
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Automated Analysis Result Overview</title></head>\n\
         <body>\n<h1>Automated Analysis Result Overview</h1>\n\
         <table>\n<tr><th>Rule</th><th>Name</th><th>Topic</th><th>Score</th><th>Explanation</th></tr>\n\
         {rows}</table>\n</body>\n</html>\n"
    )
}
