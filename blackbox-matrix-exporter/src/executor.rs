//! Probe executor: runs one matrix against all of its targets concurrently.
//!
//! Deadline policy: the overall deadline is `start + budget`. Every target gets
//! the same deadline, `min(start + target_timeout, overall)` when the matrix sets
//! a per-target timeout and the overall deadline otherwise. A target that is
//! still running when the overall deadline passes is always reported as
//! `deadline_exceeded`, whether the module or the executor noticed first, and
//! its task is aborted. A module giving up at an earlier per-target deadline
//! reports `timeout`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, warn};

use crate::prober::{ProbeOutcome, reason};
use crate::registry::Matrix;

/// Outcomes of one matrix execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResultSet {
    /// Matrix name.
    pub matrix: String,
    /// One outcome per target, in target order.
    pub outcomes: Vec<ProbeOutcome>,
    /// Wall-clock time of the whole execution.
    pub duration_seconds: f64,
}

impl ProbeResultSet {
    /// Whether every target succeeded.
    pub fn success(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.success)
    }

    /// Number of failed targets.
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }
}

/// Probe every target of `matrix`, returning within roughly `budget`.
pub async fn execute(matrix: &Matrix, budget: Duration) -> ProbeResultSet {
    let start = Instant::now();
    let deadline = start + budget;
    let target_deadline = match matrix.target_timeout {
        Some(timeout) => (start + timeout).min(deadline),
        None => deadline,
    };

    let mut tasks = JoinSet::new();
    let mut indices = HashMap::with_capacity(matrix.targets.len());
    for (index, target) in matrix.targets.iter().enumerate() {
        let prober = matrix.prober.clone();
        let options = matrix.options.clone();
        let target = target.clone();

        let handle = tasks.spawn(async move {
            let started = Instant::now();
            let probe = prober.probe(&target, &options, target_deadline);

            if target_deadline < deadline {
                // Modules honour their deadline; this only guards against one
                // that does not.
                match timeout_at(target_deadline, probe).await {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::failure(&target, started.elapsed(), reason::TIMEOUT),
                }
            } else {
                let mut outcome = probe.await;
                // The module's deadline is the overall one.
                if outcome.failure_reason.as_deref() == Some(reason::TIMEOUT) {
                    outcome.failure_reason = Some(reason::DEADLINE_EXCEEDED.to_string());
                }
                outcome
            }
        });
        indices.insert(handle.id(), index);
    }

    let mut slots: Vec<Option<ProbeOutcome>> = vec![None; matrix.targets.len()];
    let mut record = |joined: Result<(tokio::task::Id, ProbeOutcome), tokio::task::JoinError>| {
        match joined {
            Ok((id, outcome)) => {
                if let Some(&index) = indices.get(&id) {
                    slots[index] = Some(outcome);
                }
            }
            Err(e) => {
                error!(matrix = %matrix.name, error = %e, "Probe task failed");
                if let Some(&index) = indices.get(&e.id()) {
                    slots[index] = Some(ProbeOutcome::failure(
                        &matrix.targets[index],
                        start.elapsed(),
                        reason::INTERNAL_ERROR,
                    ));
                }
            }
        }
    };

    let completed = timeout_at(deadline, async {
        while let Some(joined) = tasks.join_next_with_id().await {
            record(joined);
        }
    })
    .await
    .is_ok();

    if !completed {
        // Keep what finished right at the deadline.
        while let Some(joined) = tasks.try_join_next_with_id() {
            record(joined);
        }

        warn!(
            matrix = %matrix.name,
            in_flight = tasks.len(),
            budget_ms = budget.as_millis() as u64,
            "Matrix deadline exceeded, abandoning in-flight probes"
        );
        tasks.abort_all();
    }

    let elapsed = start.elapsed();
    let outcomes: Vec<ProbeOutcome> = slots
        .into_iter()
        .zip(&matrix.targets)
        .map(|(slot, target)| {
            slot.unwrap_or_else(|| {
                ProbeOutcome::failure(target, elapsed, reason::DEADLINE_EXCEEDED)
            })
        })
        .collect();

    let result = ProbeResultSet {
        matrix: matrix.name.clone(),
        outcomes,
        duration_seconds: elapsed.as_secs_f64(),
    };

    debug!(
        matrix = %result.matrix,
        targets = result.outcomes.len(),
        failed = result.failed(),
        duration_seconds = result.duration_seconds,
        "Matrix executed"
    );

    result
}
