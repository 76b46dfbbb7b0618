//! Score and confidence helpers shared by all agents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::agent::{AgentOutput, AgentResult};

/// Build a result with the score rounded and both invariants enforced.
pub fn create_result(
    result_type: impl Into<String>,
    raw_value: f64,
    normalized_score: f64,
    confidence_level: f64,
    evidence: Map<String, Value>,
) -> AgentResult {
    AgentResult {
        result_type: result_type.into(),
        raw_value,
        normalized_score: clamp_score(normalized_score),
        confidence_level: clamp_confidence(confidence_level),
        evidence,
    }
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0).round()
}

pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        return 0.0;
    }
    confidence.clamp(0.0, 1.0)
}

/// Min-max normalize `value` onto 0..=100 after winsorizing it to
/// `[p5, p95]`. A degenerate range maps to 50.
pub fn normalize_score(value: f64, min: f64, max: f64, p5: f64, p95: f64) -> f64 {
    let winsorized = value.max(p5).min(p95);
    if max == min {
        return 50.0;
    }
    clamp_score((winsorized - min) / (max - min) * 100.0)
}

/// Weighted blend of data volume, consistency and completeness.
pub fn calculate_confidence(data_points: usize, consistency: f64, completeness: f64) -> f64 {
    let volume = (data_points as f64 / 10.0).min(1.0);
    clamp_confidence(volume * 0.3 + consistency * 0.4 + completeness * 0.3)
}

/// Confidence-weighted roll-up across agent outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateScore {
    pub score: f64,
    pub confidence: f64,
    pub contributing_agents: Vec<String>,
    pub degraded_agents: Vec<String>,
}

/// Aggregate every completed output. Failed and skipped outputs do not
/// contribute; degraded ones do, and are listed.
pub fn aggregate_scores<'a, I>(outputs: I) -> Option<AggregateScore>
where
    I: IntoIterator<Item = &'a AgentOutput>,
{
    let mut weighted = 0.0;
    let mut weights = 0.0;
    let mut confidence_sum = 0.0;
    let mut result_count = 0usize;
    let mut contributing = Vec::new();
    let mut degraded = Vec::new();

    for output in outputs {
        if !output.is_completed() || output.results.is_empty() {
            continue;
        }
        contributing.push(output.agent_name.clone());
        if output.is_degraded() {
            degraded.push(output.agent_name.clone());
        }
        for result in &output.results {
            // Floor keeps zero-confidence placeholders from vanishing entirely
            let weight = result.confidence_level.max(0.05);
            weighted += result.normalized_score * weight;
            weights += weight;
            confidence_sum += result.confidence_level;
            result_count += 1;
        }
    }

    if result_count == 0 {
        return None;
    }

    Some(AggregateScore {
        score: clamp_score(weighted / weights),
        confidence: clamp_confidence(confidence_sum / result_count as f64),
        contributing_agents: contributing,
        degraded_agents: degraded,
    })
}
