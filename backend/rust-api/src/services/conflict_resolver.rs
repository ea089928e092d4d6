use crate::metrics::CONFLICTS_RESOLVED_TOTAL;
use crate::models::sync::ResolvedConflict;
use crate::models::{AnswerValue, ConflictStrategy};

/// Picks the value a field ends up with after a failed compare-and-swap.
///
/// `None` stands for "no value supplied". `Merge` is presence-based: any local
/// value wins, including an explicit `Null`; content is never inspected.
pub fn resolve(
    _question_id: &str,
    local_value: Option<&AnswerValue>,
    server_value: Option<&AnswerValue>,
    strategy: ConflictStrategy,
) -> Option<AnswerValue> {
    match strategy {
        ConflictStrategy::Local => local_value.cloned(),
        ConflictStrategy::Server => server_value.cloned(),
        ConflictStrategy::Merge => local_value.or(server_value).cloned(),
    }
}

/// Same as [`resolve`], keeping an audit record of the decision.
pub fn resolve_recorded(
    question_id: &str,
    local_value: Option<&AnswerValue>,
    server_value: Option<&AnswerValue>,
    strategy: ConflictStrategy,
) -> ResolvedConflict {
    let resolved_value = resolve(question_id, local_value, server_value, strategy);
    CONFLICTS_RESOLVED_TOTAL
        .with_label_values(&[strategy.as_str()])
        .inc();
    tracing::debug!(
        question_id,
        strategy = strategy.as_str(),
        "conflict resolved"
    );
    ResolvedConflict {
        question_id: question_id.to_string(),
        strategy,
        local_value: local_value.cloned(),
        server_value: server_value.cloned(),
        resolved_value,
    }
}
