//! Structured observability hooks for the pipeline lifecycle.
//!
//! - `proposal_span`: span tagging everything logged during a run
//! - `emit_*`: one function per lifecycle event, all with an `event` field
//!
//! Filter with `RUST_LOG`; JSON output via `--json` on the CLI.

use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::result::Phase;

/// Span tagging everything logged while one run of a proposal is processed.
///
/// `run_id` distinguishes repeated runs of the same proposal. Attach it to
/// the run's future with [`tracing::Instrument`]:
///
/// ```ignore
/// async { /* ... */ }.instrument(obs::proposal_span("prop-001", &run_id)).await
/// ```
pub fn proposal_span(proposal_id: &str, run_id: &Uuid) -> tracing::Span {
    tracing::info_span!("codecraft.pipeline", proposal_id = %proposal_id, run_id = %run_id)
}

pub fn emit_task_enqueued(proposal_id: &str, priority: &str, queue_len: usize) {
    info!(
        event = "queue.enqueued",
        proposal_id = %proposal_id,
        priority = %priority,
        queue_len = queue_len,
    );
}

pub fn emit_pipeline_started(proposal_id: &str, run_id: &Uuid) {
    info!(event = "pipeline.started", proposal_id = %proposal_id, run_id = %run_id);
}

pub fn emit_phase_started(proposal_id: &str, phase: Phase) {
    info!(event = "phase.started", proposal_id = %proposal_id, phase = phase.as_str());
}

pub fn emit_phase_finished(proposal_id: &str, phase: Phase, ok: bool, duration_ms: u64) {
    info!(
        event = "phase.finished",
        proposal_id = %proposal_id,
        phase = phase.as_str(),
        ok = ok,
        duration_ms = duration_ms,
    );
}

/// Emit event: generated test and regression suite evaluated by the gate.
pub fn emit_gate_evaluated(proposal_id: &str, status: &str, passed: usize, failed: usize) {
    info!(
        event = "gate.evaluated",
        proposal_id = %proposal_id,
        status = %status,
        passed = passed,
        failed = failed,
    );
}

pub fn emit_committed(proposal_id: &str, branch: &str, commit: &str) {
    info!(event = "git.committed", proposal_id = %proposal_id, branch = %branch, commit = %commit);
}

pub fn emit_pipeline_finished(proposal_id: &str, status: &str, duration_ms: u64) {
    info!(
        event = "pipeline.finished",
        proposal_id = %proposal_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

/// Emit event: backups restored after a failed phase (warning level).
pub fn emit_rolled_back(proposal_id: &str, phase: Phase, error: &dyn std::fmt::Display) {
    warn!(
        event = "pipeline.rolled_back",
        proposal_id = %proposal_id,
        phase = phase.as_str(),
        error = %error,
    );
}

/// Emit event: restoring a backup or abandoning a branch failed (warning level).
pub fn emit_rollback_error(proposal_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "pipeline.rollback_error", proposal_id = %proposal_id, error = %error);
}

/// Emit event: the restricted text fallback produced an edit.
pub fn emit_text_fallback(proposal_id: &str, file: &str) {
    warn!(event = "modifier.text_fallback", proposal_id = %proposal_id, file = %file);
}

pub fn emit_quarantined(key: &str, value: &str, reason: &str) {
    warn!(event = "quarantine.added", key = %key, value = %value, reason = %reason);
}

pub fn emit_quarantine_blocked(proposal_id: &str, key: &str, occurrences: u32) {
    warn!(
        event = "quarantine.blocked",
        proposal_id = %proposal_id,
        key = %key,
        occurrences = occurrences,
    );
}

pub fn emit_quarantine_released(key: &str, removed: usize) {
    info!(event = "quarantine.released", key = %key, removed = removed);
}
