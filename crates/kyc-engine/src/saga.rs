//! Runs a provisioning saga to completion or rollback.
//!
//! The runner persists the saga after every state change: the intent before
//! a step runs, the committed step with its compensation, and each
//! compensation as it is undone. A crash therefore leaves a record that says
//! exactly which side effects may exist. When the record itself cannot be
//! written, the runner stops going forward and still compensates whatever it
//! knows has committed.

use std::sync::Arc;

use kyc_core::{
  clock::Clock,
  document::DocumentSide,
  provisioning::{AuditEntry, DocumentRecord, ProfileDraft, ProfileProvisioner},
  saga::{Compensation, ProvisioningSagaState, SagaStatus, SagaStep},
  session::VerificationSession,
  store::{SagaStore, SessionStore, WriteOutcome},
};
use uuid::Uuid;

use crate::{
  Error,
  Result,
  error::store_err,
};

type StepError = Box<dyn std::error::Error + Send + Sync>;

/// Audit action recorded for a completed verification.
pub const VERIFIED_ACTION: &str = "kyc_verified";

pub struct SagaRunner<S, P> {
  store:       Arc<S>,
  provisioner: Arc<P>,
  clock:       Arc<dyn Clock>,
}

impl<S, P> SagaRunner<S, P>
where
  S: SessionStore + SagaStore,
  P: ProfileProvisioner,
{
  pub fn new(store: Arc<S>, provisioner: Arc<P>, clock: Arc<dyn Clock>) -> Self {
    Self { store, provisioner, clock }
  }

  /// Run the saga `correlation_id` from its first step.
  ///
  /// Only a saga in `Started` is run. Anything else belongs to another
  /// runner or, when partially rolled back, to an operator.
  pub async fn run(&self, correlation_id: Uuid) -> Result<ProvisioningSagaState> {
    let mut saga = self
      .store
      .get_saga(correlation_id)
      .await
      .map_err(store_err)?
      .ok_or(Error::SagaNotFound(correlation_id))?;
    saga.ensure_runnable()?;

    let session = self
      .store
      .get_session(saga.session_id)
      .await
      .map_err(store_err)?
      .ok_or(Error::SessionNotFound(saga.session_id))?;

    tracing::info!(
      correlation_id = %saga.correlation_id,
      session_id = %saga.session_id,
      steps = saga.total_steps(),
      "provisioning started"
    );

    let reason = match self.advance(&mut saga, &session).await {
      Ok(()) => {
        tracing::info!(correlation_id = %saga.correlation_id, "provisioning completed");
        return Ok(saga);
      }
      Err(reason) => reason,
    };

    if saga.status() == SagaStatus::Completed {
      // Every step ran; only the last write of the record is missing.
      tracing::error!(
        target: "kyc::operator",
        correlation_id = %saga.correlation_id,
        session_id = %saga.session_id,
        error = %reason,
        "provisioning completed but the saga record could not be saved"
      );
      return Err(into_error(reason));
    }

    tracing::warn!(
      correlation_id = %saga.correlation_id,
      step = saga.current_step(),
      error = %reason,
      "provisioning stopped; rolling back"
    );
    saga.fail_step(reason.to_string(), self.clock.now())?;
    if let Some(e) = self.rollback(&mut saga).await {
      tracing::error!(
        target: "kyc::operator",
        correlation_id = %saga.correlation_id,
        session_id = %saga.session_id,
        status = %saga.status(),
        error = %e,
        "saga record is stale after rollback; manual remediation required"
      );
      return Err(e);
    }
    Ok(saga)
  }

  /// Run the remaining steps, stopping at the first step or saga write that
  /// fails.
  async fn advance(
    &self,
    saga: &mut ProvisioningSagaState,
    session: &VerificationSession,
  ) -> Result<(), StepError> {
    loop {
      let Some(step) = saga.begin_step(self.clock.now())? else {
        // Nothing was planned.
        return Ok(self.persist(saga).await?);
      };
      self.persist(saga).await?;

      let compensation = self.execute(step, saga, session).await?;
      saga.commit_step(compensation, self.clock.now())?;
      self.persist(saga).await?;
      if saga.status() == SagaStatus::Completed {
        return Ok(());
      }
    }
  }

  /// Undo every committed step, newest first.
  ///
  /// A failed saga write does not stop the compensations. Returns the write
  /// error if the final state never reached the store.
  async fn rollback(&self, saga: &mut ProvisioningSagaState) -> Option<Error> {
    if let Err(e) = saga.begin_rollback(self.clock.now()) {
      return Some(e.into());
    }
    let mut unsaved = None;
    self.record(saga, &mut unsaved).await;

    while let Some(entry) = saga.next_compensation().cloned() {
      match self.compensate(entry.compensation).await {
        Ok(()) => {
          saga.record_compensated(self.clock.now());
          self.record(saga, &mut unsaved).await;
        }
        Err(e) => {
          saga.record_compensation_failed(e.to_string(), self.clock.now());
          self.record(saga, &mut unsaved).await;
          tracing::error!(
            target: "kyc::operator",
            correlation_id = %saga.correlation_id,
            session_id = %saga.session_id,
            user_id = %saga.user_id,
            failed_step = entry.index,
            error = %e,
            "provisioning partially rolled back; manual remediation required"
          );
          return unsaved;
        }
      }
    }

    tracing::info!(correlation_id = %saga.correlation_id, "provisioning rolled back");
    unsaved
  }

  /// Persist during rollback. A failed write is remembered until a later one
  /// succeeds.
  async fn record(&self, saga: &mut ProvisioningSagaState, unsaved: &mut Option<Error>) {
    match self.persist(saga).await {
      Ok(()) => *unsaved = None,
      Err(e) => {
        tracing::warn!(
          correlation_id = %saga.correlation_id,
          status = %saga.status(),
          error = %e,
          "saga record not saved; rollback continues"
        );
        *unsaved = Some(e);
      }
    }
  }

  async fn execute(
    &self,
    step: SagaStep,
    saga: &ProvisioningSagaState,
    session: &VerificationSession,
  ) -> Result<Compensation, StepError> {
    let p = self.provisioner.as_ref();
    match step {
      SagaStep::UpsertProfile => {
        let verified_at = session.completed_at.unwrap_or_else(|| self.clock.now());
        let draft = ProfileDraft::from_session(session, verified_at);
        match p.find_profile(session.user_id).await? {
          Some(existing) => {
            let previous = p.update_profile(existing.profile_id, draft).await?;
            Ok(Compensation::RestoreProfile { previous })
          }
          None => {
            let created = p.create_profile(draft).await?;
            Ok(Compensation::DeleteProfile { profile_id: created.profile_id })
          }
        }
      }
      SagaStep::AttachDocument(side) => {
        let image_ref = match side {
          DocumentSide::Front => session.document.front_image_ref.clone(),
          DocumentSide::Back => session.document.back_image_ref.clone(),
        }
        .ok_or_else(|| format!("no {side} image captured"))?;
        let record = DocumentRecord {
          profile_id: profile_id(saga)?,
          session_id: session.session_id,
          document_type: session.document.document_type,
          side,
          document_number: session.ocr.fields.document_number.clone(),
          expiry_date: session.ocr.fields.expiry_date,
          image_ref,
        };
        let document_id = p.attach_document(record).await?;
        Ok(Compensation::DetachDocument { document_id })
      }
      SagaStep::RecordAudit => {
        let entry = AuditEntry {
          user_id:        session.user_id,
          profile_id:     profile_id(saga)?,
          session_id:     session.session_id,
          correlation_id: saga.correlation_id,
          action:         VERIFIED_ACTION.to_owned(),
          overall_score:  session.overall_score,
          recorded_at:    self.clock.now(),
        };
        let audit_id = p.record_audit(entry).await?;
        Ok(Compensation::VoidAudit { audit_id })
      }
    }
  }

  async fn compensate(&self, compensation: Compensation) -> Result<(), StepError> {
    let p = self.provisioner.as_ref();
    match compensation {
      Compensation::DeleteProfile { profile_id } => p.delete_profile(profile_id).await?,
      Compensation::RestoreProfile { previous } => p.restore_profile(previous).await?,
      Compensation::DetachDocument { document_id } => p.detach_document(document_id).await?,
      Compensation::VoidAudit { audit_id } => p.void_audit(audit_id).await?,
    }
    Ok(())
  }

  /// Version-checked save; the version moves only if the write applied.
  async fn persist(&self, saga: &mut ProvisioningSagaState) -> Result<()> {
    let expected = saga.version;
    saga.version += 1;
    let outcome = self.store.save_saga(saga.clone(), expected).await.map_err(store_err);
    match outcome {
      Ok(WriteOutcome::Applied) => Ok(()),
      Ok(WriteOutcome::VersionConflict) => {
        saga.version = expected;
        Err(Error::ConcurrentModification(saga.correlation_id))
      }
      Err(e) => {
        saga.version = expected;
        Err(e)
      }
    }
  }
}

fn into_error(reason: StepError) -> Error {
  match reason.downcast::<Error>() {
    Ok(e) => *e,
    Err(other) => Error::Store(other),
  }
}

/// The profile the saga's first step created or updated.
fn profile_id(saga: &ProvisioningSagaState) -> Result<Uuid, StepError> {
  saga
    .completed()
    .iter()
    .find_map(|c| match &c.compensation {
      Compensation::DeleteProfile { profile_id } => Some(*profile_id),
      Compensation::RestoreProfile { previous } => Some(previous.profile_id),
      _ => None,
    })
    .ok_or_else(|| "profile step has not committed".into())
}
