//! Provisioning saga state.
//!
//! The saga record is the single source of truth for which side effects of a
//! completed verification have happened. The runner (in `kyc-engine`) records
//! the intent to run a step before running it, and appends the step to an
//! append-only log together with the data needed to undo it once it commits.
//! Rollback walks that log strictly backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{
  Error,
  Result,
  document::DocumentSide,
  provisioning::KycProfile,
  session::VerificationSession,
};

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SagaStatus {
  Started,
  InProgress,
  Completed,
  /// A step failed; rollback has not begun yet.
  Failed,
  RollingBack,
  RolledBack,
  /// A compensation failed. Needs an operator; never retried automatically.
  PartiallyRolledBack,
}

impl SagaStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Completed | Self::RolledBack | Self::PartiallyRolledBack)
  }
}

/// A planned unit of provisioning work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", content = "side", rename_all = "snake_case")]
pub enum SagaStep {
  UpsertProfile,
  AttachDocument(DocumentSide),
  RecordAudit,
}

impl SagaStep {
  /// Steps for a completed session: profile, one document per captured side,
  /// then the audit entry.
  pub fn plan_for(session: &VerificationSession) -> Vec<Self> {
    let mut steps = vec![Self::UpsertProfile, Self::AttachDocument(DocumentSide::Front)];
    if session.document.back_image_ref.is_some() {
      steps.push(Self::AttachDocument(DocumentSide::Back));
    }
    steps.push(Self::RecordAudit);
    steps
  }
}

/// How to undo a committed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Compensation {
  DeleteProfile { profile_id: Uuid },
  RestoreProfile { previous: KycProfile },
  DetachDocument { document_id: Uuid },
  VoidAudit { audit_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
  pub index:        usize,
  pub step:         SagaStep,
  pub compensation: Compensation,
  pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningSagaState {
  pub correlation_id:      Uuid,
  pub session_id:          Uuid,
  pub user_id:             Uuid,
  status:                  SagaStatus,
  steps:                   Vec<SagaStep>,
  current_step:            usize,
  /// Step whose side effect may be under way; recorded before it runs.
  pending:                 Option<SagaStep>,
  completed:               Vec<CompletedStep>,
  /// How many log entries (from the end) have been compensated.
  compensated:             usize,
  failed_step:             Option<usize>,
  failed_compensation:     Option<usize>,
  error:                   Option<String>,
  pub created_at:          DateTime<Utc>,
  pub updated_at:          DateTime<Utc>,
  pub version:             u64,
}

impl ProvisioningSagaState {
  pub fn new(
    session_id: Uuid,
    user_id: Uuid,
    steps: Vec<SagaStep>,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      correlation_id: Uuid::new_v4(),
      session_id,
      user_id,
      status: SagaStatus::Started,
      steps,
      current_step: 0,
      pending: None,
      completed: Vec::new(),
      compensated: 0,
      failed_step: None,
      failed_compensation: None,
      error: None,
      created_at: now,
      updated_at: now,
      version: 0,
    }
  }

  pub fn status(&self) -> SagaStatus { self.status }

  pub fn steps(&self) -> &[SagaStep] { &self.steps }

  pub fn total_steps(&self) -> usize { self.steps.len() }

  pub fn current_step(&self) -> usize { self.current_step }

  pub fn pending(&self) -> Option<SagaStep> { self.pending }

  pub fn completed(&self) -> &[CompletedStep] { &self.completed }

  pub fn failed_step(&self) -> Option<usize> { self.failed_step }

  pub fn failed_compensation(&self) -> Option<usize> { self.failed_compensation }

  pub fn error(&self) -> Option<&str> { self.error.as_deref() }

  /// A fresh saga may be started; anything else is owned by a runner or an
  /// operator.
  pub fn ensure_runnable(&self) -> Result<()> {
    match self.status {
      SagaStatus::Started => Ok(()),
      other => Err(Error::SagaNotRunnable(self.correlation_id, other)),
    }
  }

  /// Record the intent to run the next step and return it, or `None` when
  /// every step has committed.
  pub fn begin_step(&mut self, now: DateTime<Utc>) -> Result<Option<SagaStep>> {
    if !matches!(self.status, SagaStatus::Started | SagaStatus::InProgress) {
      return Err(Error::SagaNotRunnable(self.correlation_id, self.status));
    }
    let Some(step) = self.steps.get(self.current_step).copied() else {
      self.status = SagaStatus::Completed;
      self.updated_at = now;
      return Ok(None);
    };
    self.status = SagaStatus::InProgress;
    self.pending = Some(step);
    self.updated_at = now;
    Ok(Some(step))
  }

  /// The pending step committed; log how to undo it.
  pub fn commit_step(&mut self, compensation: Compensation, now: DateTime<Utc>) -> Result<()> {
    let step = self.pending.take().ok_or(Error::NoPendingStep(self.correlation_id))?;
    self.completed.push(CompletedStep {
      index: self.current_step,
      step,
      compensation,
      completed_at: now,
    });
    self.current_step += 1;
    if self.current_step == self.steps.len() {
      self.status = SagaStatus::Completed;
    }
    self.updated_at = now;
    Ok(())
  }

  /// Stop the saga: the pending step failed, or progress could not be
  /// recorded. A pending step's effects are not logged; committed steps stay
  /// in the log for rollback.
  pub fn fail_step(&mut self, error: String, now: DateTime<Utc>) -> Result<()> {
    if !matches!(self.status, SagaStatus::Started | SagaStatus::InProgress) {
      return Err(Error::SagaNotRunnable(self.correlation_id, self.status));
    }
    self.pending = None;
    self.status = SagaStatus::Failed;
    self.failed_step = Some(self.current_step);
    self.error = Some(error);
    self.updated_at = now;
    Ok(())
  }

  pub fn begin_rollback(&mut self, now: DateTime<Utc>) -> Result<()> {
    if self.status != SagaStatus::Failed {
      return Err(Error::SagaNotRunnable(self.correlation_id, self.status));
    }
    self.status = if self.completed.is_empty() {
      SagaStatus::RolledBack
    } else {
      SagaStatus::RollingBack
    };
    self.updated_at = now;
    Ok(())
  }

  /// The next log entry to compensate, walking backwards from the newest.
  pub fn next_compensation(&self) -> Option<&CompletedStep> {
    if self.status != SagaStatus::RollingBack {
      return None;
    }
    let remaining = self.completed.len().checked_sub(self.compensated + 1)?;
    self.completed.get(remaining)
  }

  pub fn record_compensated(&mut self, now: DateTime<Utc>) {
    self.compensated += 1;
    if self.compensated == self.completed.len() {
      self.status = SagaStatus::RolledBack;
    }
    self.updated_at = now;
  }

  /// Stop rolling back; the operator takes over from here.
  pub fn record_compensation_failed(&mut self, error: String, now: DateTime<Utc>) {
    let failing = self.completed.len() - self.compensated - 1;
    self.status = SagaStatus::PartiallyRolledBack;
    self.failed_compensation = self.completed.get(failing).map(|c| c.index);
    let original = self.error.take().unwrap_or_default();
    self.error = Some(format!("{original}; compensation failed: {error}"));
    self.updated_at = now;
  }
}
