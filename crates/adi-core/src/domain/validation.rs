//! Output contract checks applied before an output is accepted.

use super::agent::{AgentConfig, AgentOutput, AgentResult, AgentStatus};
use super::error::ValidationError;

/// Verify `output` against `config` and the result invariants.
///
/// The status enum is closed, so an unknown status can only arrive over the
/// wire, where decoding already rejects it.
pub fn validate_output(config: &AgentConfig, output: &AgentOutput) -> Result<(), ValidationError> {
    if output.agent_name != config.name {
        return Err(ValidationError::NameMismatch {
            expected: config.name.to_string(),
            actual: output.agent_name.clone(),
        });
    }

    if output.status == AgentStatus::Completed && output.results.is_empty() {
        return Err(ValidationError::EmptyCompleted);
    }

    validate_results(&output.results)
}

/// Per-result checks: non-empty type, score in `0..=100`, confidence in
/// `0..=1`. NaN fails both range checks.
pub fn validate_results(results: &[AgentResult]) -> Result<(), ValidationError> {
    for (index, result) in results.iter().enumerate() {
        if result.result_type.trim().is_empty() {
            return Err(ValidationError::EmptyResultType { index });
        }
        let score = result.normalized_score;
        if !(0.0..=100.0).contains(&score) {
            return Err(ValidationError::ScoreOutOfRange {
                index,
                result_type: result.result_type.clone(),
                score,
            });
        }
        let confidence = result.confidence_level;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ValidationError::ConfidenceOutOfRange {
                index,
                result_type: result.result_type.clone(),
                confidence,
            });
        }
    }

    Ok(())
}
