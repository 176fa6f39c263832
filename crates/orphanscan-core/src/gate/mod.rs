//! Execution gate
//!
//! The only code path that issues destructive statements. A session drives
//! one plan through
//!
//! ```text
//! Planned -> DryRun -> BackupVerified -> Confirmed -> Executing -> Completed
//!                                                             \-> Failed
//! (any non-terminal state) -> Aborted
//! ```
//!
//! Every transition and every executed statement is written to the audit
//! sink before the session moves on.

mod audit;
mod backup;

pub use audit::{AuditRecord, AuditSink, JsonlAuditLog, MemoryAuditLog};
pub use backup::{sha256_file, sidecar_path, BackupSignal};

use crate::cleanup::{CleanupAction, CleanupPlan, RiskTier};
use crate::config::GateConfig;
use crate::db::Store;
use crate::error::{OrphanScanError, Result};
use chrono::Utc;
use rusqlite::params_from_iter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Planned,
    DryRun,
    BackupVerified,
    Confirmed,
    Executing,
    Completed,
    Aborted,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Aborted | SessionState::Failed
        )
    }

    /// Edges of the gate's state graph
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (from, Aborted) => !from.is_terminal(),
            (Planned, DryRun) => true,
            (DryRun, BackupVerified) => true,
            (BackupVerified, Confirmed) => true,
            // A plan change withdraws the confirmation
            (Confirmed, BackupVerified) => true,
            (Confirmed, Executing) => true,
            (Executing, Completed) | (Executing, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Planned => "planned",
            SessionState::DryRun => "dry_run",
            SessionState::BackupVerified => "backup_verified",
            SessionState::Confirmed => "confirmed",
            SessionState::Executing => "executing",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reject any state trace that leaves the gate's graph
pub fn validate_trace(states: &[SessionState]) -> Result<()> {
    for pair in states.windows(2) {
        if !pair[0].can_transition_to(pair[1]) {
            return Err(OrphanScanError::InvalidTransition {
                from: pair[0].to_string(),
                to: pair[1].to_string(),
            });
        }
    }
    Ok(())
}

/// Cancellation flag shared with other threads
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why the destructive path was closed
#[derive(Debug, Clone, PartialEq, Eq)]
enum Refusal {
    BackupMissing,
    BackupStale { age_secs: u64, max_age_secs: u64 },
    ChecksumInvalid,
    ConfirmationRejected,
}

impl Refusal {
    fn to_error(&self) -> OrphanScanError {
        match self {
            Refusal::BackupMissing => OrphanScanError::BackupMissing,
            Refusal::BackupStale {
                age_secs,
                max_age_secs,
            } => OrphanScanError::BackupStale {
                age_secs: *age_secs,
                max_age_secs: *max_age_secs,
            },
            Refusal::ChecksumInvalid => OrphanScanError::BackupChecksumInvalid,
            Refusal::ConfirmationRejected => OrphanScanError::ConfirmationRejected,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewLine {
    pub index: usize,
    pub table: String,
    pub risk: RiskTier,
    pub planned_rows: u64,
    /// Rows the predicate matches at preview time
    pub live_rows: u64,
    pub estimated_bytes: u64,
    pub predicate: String,
    pub justification: String,
    pub statements: Vec<String>,
}

/// What execution would do; produced without touching the store
#[derive(Debug, Clone, Serialize)]
pub struct DryRunPreview {
    pub session_id: String,
    pub fingerprint: String,
    pub lines: Vec<PreviewLine>,
    pub total_rows: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionStatus {
    Committed { rows_affected: u64 },
    /// Committed, but the audit record of the commit could not be written
    CommittedUnaudited { rows_affected: u64, reason: String },
    Failed { reason: String },
    NotAttempted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub index: usize,
    pub table: String,
    pub planned_rows: u64,
    #[serde(flatten)]
    pub status: ActionStatus,
}

/// Per-action result of an execution, in plan order
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub session_id: String,
    pub state: SessionState,
    pub outcomes: Vec<ActionOutcome>,
    pub failed_action: Option<usize>,
    /// Set when the audit sink failed once execution had started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_error: Option<String>,
}

impl ExecutionReport {
    pub fn rows_affected(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match o.status {
                ActionStatus::Committed { rows_affected }
                | ActionStatus::CommittedUnaudited { rows_affected, .. } => rows_affected,
                _ => 0,
            })
            .sum()
    }

    /// `ActionExecutionFailed` when an action failed, `AuditWriteFailed`
    /// when only the audit sink did, otherwise the report
    pub fn into_result(self) -> Result<Self> {
        if let Some(index) = self.failed_action {
            let outcome = &self.outcomes[index];
            let reason = match &outcome.status {
                ActionStatus::Failed { reason } => reason.clone(),
                ActionStatus::CommittedUnaudited { reason, .. } => {
                    format!("committed but not audited: {}", reason)
                }
                _ => "unknown".to_string(),
            };
            return Err(OrphanScanError::ActionExecutionFailed {
                index,
                table: outcome.table.clone(),
                reason,
            });
        }
        if let Some(reason) = self.audit_error {
            return Err(OrphanScanError::AuditWriteFailed(reason));
        }
        Ok(self)
    }
}

/// One plan, one pass through the gate
pub struct ExecutionSession {
    id: String,
    plan: CleanupPlan,
    state: SessionState,
    policy: GateConfig,
    audit: Box<dyn AuditSink>,
    trail: Vec<AuditRecord>,
    backup: Option<BackupSignal>,
    confirmed_fingerprint: Option<String>,
    refusal: Option<Refusal>,
    cancel: CancelHandle,
}

impl ExecutionSession {
    /// Session auditing to `<audit_dir>/<session id>.jsonl`
    pub fn open(plan: CleanupPlan, policy: GateConfig) -> Result<Self> {
        let id = generate_session_id();
        let log = JsonlAuditLog::create(&policy.audit_dir(), &id)?;
        Self::with_id(id, plan, policy, Box::new(log))
    }

    /// Session auditing to an arbitrary sink
    pub fn new(plan: CleanupPlan, policy: GateConfig, audit: Box<dyn AuditSink>) -> Result<Self> {
        Self::with_id(generate_session_id(), plan, policy, audit)
    }

    fn with_id(
        id: String,
        plan: CleanupPlan,
        policy: GateConfig,
        audit: Box<dyn AuditSink>,
    ) -> Result<Self> {
        let mut session = Self {
            id,
            plan,
            state: SessionState::Planned,
            policy,
            audit,
            trail: Vec::new(),
            backup: None,
            confirmed_fingerprint: None,
            refusal: None,
            cancel: CancelHandle::default(),
        };
        let note = format!(
            "session created: {} actions, {} rows, plan {}",
            session.plan.len(),
            session.plan.total_rows(),
            &session.plan.fingerprint()[..12]
        );
        session.log(SessionState::Planned, None, None, Some(note))?;
        info!(session = %session.id, actions = session.plan.len(), "execution session created");
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn plan(&self) -> &CleanupPlan {
        &self.plan
    }

    /// Records written so far, in order
    pub fn audit_trail(&self) -> &[AuditRecord] {
        &self.trail
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Token the operator must echo to confirm; tied to the current plan
    pub fn confirmation_challenge(&self) -> String {
        format!("EXECUTE {}", &self.plan.fingerprint()[..12])
    }

    fn log(
        &mut self,
        to: SessionState,
        statement: Option<String>,
        rows_affected: Option<u64>,
        note: Option<String>,
    ) -> Result<()> {
        let record = AuditRecord {
            timestamp: Utc::now(),
            session_id: self.id.clone(),
            from_state: self.state,
            to_state: to,
            statement,
            rows_affected,
            note,
        };
        self.audit.append(&record)?;
        self.trail.push(record);
        Ok(())
    }

    fn transition(&mut self, to: SessionState, note: Option<String>) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(OrphanScanError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.log(to, None, None, note)?;
        info!(session = %self.id, from = %self.state, to = %to, "session transition");
        self.state = to;
        Ok(())
    }

    /// Close the destructive path for the rest of the session
    fn refuse(&mut self, refusal: Refusal) -> OrphanScanError {
        let err = refusal.to_error();
        warn!(session = %self.id, state = %self.state, error = %err, "gate refused");
        if let Err(log_err) = self.log(self.state, None, None, Some(format!("refused: {}", err))) {
            error!(session = %self.id, error = %log_err, "could not audit refusal");
        }
        self.refusal = Some(refusal);
        err
    }

    /// A call made in the wrong state; reported without closing the session
    fn misordered(&self, to: SessionState) -> OrphanScanError {
        warn!(session = %self.id, from = %self.state, to = %to, "call out of order");
        OrphanScanError::InvalidTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(OrphanScanError::SessionTerminal(self.state.to_string()));
        }
        match &self.refusal {
            Some(refusal) => Err(refusal.to_error()),
            None => Ok(()),
        }
    }

    /// Preview the plan against the live store; never mutates it.
    ///
    /// Allowed in every non-terminal state, including after a refusal.
    pub fn dry_run(&mut self, store: &Store) -> Result<DryRunPreview> {
        if self.state.is_terminal() {
            return Err(OrphanScanError::SessionTerminal(self.state.to_string()));
        }

        let mut lines = Vec::with_capacity(self.plan.len());
        for (index, action) in self.plan.actions().iter().enumerate() {
            let statements = action
                .delete_statements()?
                .iter()
                .map(|s| s.inline())
                .collect();
            lines.push(PreviewLine {
                index,
                table: action.table.clone(),
                risk: action.risk,
                planned_rows: action.rows,
                live_rows: action.count_live(store)?,
                estimated_bytes: action.estimated_bytes,
                predicate: action.predicate.describe(),
                justification: action.justification.clone(),
                statements,
            });
        }
        let preview = DryRunPreview {
            session_id: self.id.clone(),
            fingerprint: self.plan.fingerprint(),
            total_rows: self.plan.total_rows(),
            total_bytes: self.plan.total_bytes(),
            lines,
        };

        let note = format!(
            "dry run: {} actions, {} rows",
            preview.lines.len(),
            preview.total_rows
        );
        if self.state == SessionState::Planned {
            self.transition(SessionState::DryRun, Some(note))?;
        } else {
            self.log(self.state, None, None, Some(note))?;
        }
        Ok(preview)
    }

    /// Accept the backup-freshness signal; mandatory before confirmation.
    ///
    /// A confirmed session may be re-attested with a newer signal and stays
    /// confirmed.
    pub fn verify_backup(&mut self, signal: Option<&BackupSignal>) -> Result<()> {
        self.ensure_open()?;
        match self.state {
            SessionState::DryRun | SessionState::BackupVerified | SessionState::Confirmed => {}
            _ => return Err(self.misordered(SessionState::BackupVerified)),
        }

        let signal = match signal {
            Some(s) if s.exists => s,
            _ => return Err(self.refuse(Refusal::BackupMissing)),
        };
        if signal.age_seconds > self.policy.max_backup_age_secs {
            return Err(self.refuse(Refusal::BackupStale {
                age_secs: signal.age_seconds,
                max_age_secs: self.policy.max_backup_age_secs,
            }));
        }
        if self.policy.require_checksum && !signal.checksum_valid {
            return Err(self.refuse(Refusal::ChecksumInvalid));
        }

        let note = format!(
            "backup verified: {}s old, checksum {}",
            signal.age_seconds,
            if signal.checksum_valid { "ok" } else { "unchecked" }
        );
        if self.state == SessionState::DryRun {
            self.transition(SessionState::BackupVerified, Some(note))?;
        } else {
            self.log(self.state, None, None, Some(note))?;
        }
        self.backup = Some(signal.clone());
        Ok(())
    }

    /// Confirm with the exact challenge token
    pub fn confirm(&mut self, token: &str) -> Result<()> {
        self.ensure_open()?;
        match self.state {
            SessionState::BackupVerified => {}
            SessionState::Planned | SessionState::DryRun => {
                return Err(self.refuse(Refusal::BackupMissing))
            }
            _ => return Err(self.misordered(SessionState::Confirmed)),
        }
        if token.trim() != self.confirmation_challenge() {
            return Err(self.refuse(Refusal::ConfirmationRejected));
        }

        self.confirmed_fingerprint = Some(self.plan.fingerprint());
        self.transition(SessionState::Confirmed, Some("operator confirmed".to_string()))
    }

    /// Add an action; withdraws any confirmation
    pub fn add_action(&mut self, action: CleanupAction) -> Result<()> {
        self.ensure_mutable()?;
        let note = format!("plan changed: added action on {}", action.table);
        self.plan.push(action);
        self.after_plan_change(note)
    }

    /// Remove an action by index; withdraws any confirmation
    pub fn remove_action(&mut self, index: usize) -> Result<CleanupAction> {
        self.ensure_mutable()?;
        let action = self.plan.remove(index).ok_or_else(|| {
            OrphanScanError::InvalidInput(format!("no action at index {}", index))
        })?;
        self.after_plan_change(format!("plan changed: removed action on {}", action.table))?;
        Ok(action)
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(OrphanScanError::SessionTerminal(self.state.to_string()));
        }
        Ok(())
    }

    fn after_plan_change(&mut self, note: String) -> Result<()> {
        self.confirmed_fingerprint = None;
        if self.state == SessionState::Confirmed {
            self.transition(
                SessionState::BackupVerified,
                Some(format!("{}; confirmation withdrawn", note)),
            )
        } else {
            self.log(self.state, None, None, Some(note))
        }
    }

    /// Cancel the session; terminal
    pub fn abort(&mut self, reason: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(OrphanScanError::SessionTerminal(self.state.to_string()));
        }
        self.transition(SessionState::Aborted, Some(reason.to_string()))
    }

    /// Run every action in plan order, one transaction per action.
    ///
    /// Takes the store mutably: the executing connection is exclusive. On the
    /// first failing action the session fails and later actions are left
    /// untouched; earlier actions stay committed.
    pub fn execute(&mut self, store: &mut Store) -> Result<ExecutionReport> {
        self.ensure_open()?;
        if self.state != SessionState::Confirmed {
            if self.backup.is_none() {
                return Err(self.refuse(Refusal::BackupMissing));
            }
            return Err(self.misordered(SessionState::Executing));
        }
        if self.backup.is_none() {
            return Err(self.refuse(Refusal::BackupMissing));
        }
        if self.confirmed_fingerprint.as_deref() != Some(self.plan.fingerprint().as_str()) {
            return Err(self.refuse(Refusal::ConfirmationRejected));
        }
        if store.is_read_only() {
            return Err(OrphanScanError::StoreUnavailable(
                "store was opened read-only".to_string(),
            ));
        }

        let actions: Vec<CleanupAction> = self.plan.actions().to_vec();
        let mut outcomes: Vec<ActionOutcome> = actions
            .iter()
            .enumerate()
            .map(|(index, a)| ActionOutcome {
                index,
                table: a.table.clone(),
                planned_rows: a.rows,
                status: ActionStatus::NotAttempted,
            })
            .collect();

        if self.cancel.is_cancelled() {
            self.transition(SessionState::Aborted, Some("cancelled before execution".into()))?;
            return Ok(self.report(outcomes, None, None));
        }
        self.transition(SessionState::Executing, None)?;

        let mut failed_action = None;
        let mut end = (SessionState::Completed, None);
        for (index, action) in actions.iter().enumerate() {
            if self.cancel.is_cancelled() {
                end = (
                    SessionState::Aborted,
                    Some(format!("cancelled before action #{}", index)),
                );
                break;
            }

            match self.run_action(store, index, action) {
                Ok(rows) => {
                    outcomes[index].status = ActionStatus::Committed {
                        rows_affected: rows,
                    };
                    if let Err(err) = self.log(
                        SessionState::Executing,
                        None,
                        Some(rows),
                        Some(format!("action #{} committed", index)),
                    ) {
                        error!(session = %self.id, index, error = %err, "audit log failed after commit");
                        outcomes[index].status = ActionStatus::CommittedUnaudited {
                            rows_affected: rows,
                            reason: err.to_string(),
                        };
                        failed_action = Some(index);
                        end = (
                            SessionState::Failed,
                            Some(format!("action #{} committed but not audited: {}", index, err)),
                        );
                        break;
                    }
                }
                Err(err) => {
                    error!(session = %self.id, index, table = %action.table, error = %err, "action failed");
                    outcomes[index].status = ActionStatus::Failed {
                        reason: err.to_string(),
                    };
                    failed_action = Some(index);
                    end = (
                        SessionState::Failed,
                        Some(format!("action #{} failed: {}", index, err)),
                    );
                    break;
                }
            }
        }

        // Rows may already be gone; the report is returned whatever the sink does
        let (to, note) = end;
        let mut audit_error = None;
        if let Err(err) = self.transition(to, note) {
            error!(session = %self.id, error = %err, "could not audit end of execution");
            self.state = SessionState::Failed;
            audit_error = Some(err.to_string());
        }
        Ok(self.report(outcomes, failed_action, audit_error))
    }

    fn run_action(&mut self, store: &mut Store, index: usize, action: &CleanupAction) -> Result<u64> {
        let statements = action.delete_statements()?;
        for stmt in &statements {
            self.log(
                SessionState::Executing,
                Some(stmt.inline()),
                None,
                Some(format!("action #{} on {}", index, action.table)),
            )?;
        }

        let tx = store
            .conn
            .transaction()
            .map_err(OrphanScanError::from_store)?;
        let mut rows = 0u64;
        for stmt in &statements {
            rows += tx
                .execute(&stmt.sql, params_from_iter(stmt.params.iter()))
                .map_err(OrphanScanError::from_store)? as u64;
        }
        tx.commit().map_err(OrphanScanError::from_store)?;
        info!(session = %self.id, index, table = %action.table, rows, "action committed");
        Ok(rows)
    }

    fn report(
        &self,
        outcomes: Vec<ActionOutcome>,
        failed_action: Option<usize>,
        audit_error: Option<String>,
    ) -> ExecutionReport {
        ExecutionReport {
            session_id: self.id.clone(),
            state: self.state,
            outcomes,
            failed_action,
            audit_error,
        }
    }
}

fn generate_session_id() -> String {
    use std::sync::atomic::AtomicU64;
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = (nanos as u64) ^ ((pid as u64) << 40) ^ seq.wrapping_mul(0x9E37_79B9_7F4A_7C15);

    format!("{}-{:016x}", Utc::now().format("%Y%m%dT%H%M%SZ"), mixed)
}
