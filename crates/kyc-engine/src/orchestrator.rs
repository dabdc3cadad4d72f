//! The session orchestrator.
//!
//! Every stage submission follows the same shape: take the per-session lock,
//! load and check the session, record the capture, and persist the entry into
//! the processing state. The lock is released for the provider call, which is
//! bounded by the stage timeout (never past the session's expiry) and races
//! the session's cancel signal. The result is applied under the lock again,
//! after checking that nobody else moved the session meanwhile, and written
//! back in one version-checked save.

use std::{future::Future, sync::Arc, time::Duration as StdDuration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use kyc_core::{
  capture::{DocumentImages, ImageFormat, SelfieCapture},
  clock::Clock,
  config::VerificationConfig,
  document::{self, DocumentType},
  gateway::{
    BiometricGateway, FaceMatchResult, LivenessChallenge, LivenessResult, OcrResult,
    ProviderError, ProviderStage, assign_challenges,
  },
  provisioning::ProfileProvisioner,
  saga::{ProvisioningSagaState, SagaStep},
  score::ScoreCalculator,
  session::{FailureReason, NewSession, SessionStatus, VerificationSession},
  store::{ImageSlot, SagaStore, SessionStore, StoredImage, WriteOutcome},
};
use rand_core::OsRng;
use serde::Serialize;
use tokio::{sync::OwnedMutexGuard, task::JoinHandle};
use uuid::Uuid;

use crate::{
  Error,
  Result,
  error::store_err,
  maintenance,
  registry::{CancelRegistry, CancelSignal, SessionLocks},
  saga::SagaRunner,
};

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// What a stage submission did.
#[derive(Debug)]
pub enum StageOutcome {
  /// The capture was recorded; the session waits for the next one.
  Advanced(VerificationSession),
  /// The stage is already being processed. No provider call was made.
  InFlight(VerificationSession),
  /// The attempt failed; the reason is on the session.
  Failed(VerificationSession),
  /// All gates passed. Provisioning runs in the background.
  Completed {
    session:      VerificationSession,
    provisioning: ProvisioningHandle,
  },
}

impl StageOutcome {
  pub fn session(&self) -> &VerificationSession {
    match self {
      Self::Advanced(s) | Self::InFlight(s) | Self::Failed(s) => s,
      Self::Completed { session, .. } => session,
    }
  }
}

/// Tracks the provisioning saga started for a completed session.
#[derive(Debug)]
pub struct ProvisioningHandle {
  pub correlation_id: Uuid,
  task:               JoinHandle<Result<ProvisioningSagaState>>,
}

impl ProvisioningHandle {
  /// Wait for the saga to finish and return its final state.
  pub async fn wait(self) -> Result<ProvisioningSagaState> { self.task.await? }
}

#[derive(Debug)]
pub enum CancelOutcome {
  /// A provider call was in flight; its stage will fail the attempt.
  Signalled,
  /// Nothing was in flight; the attempt was failed directly.
  Cancelled(VerificationSession),
}

/// A session as a reader should see it at a given instant.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
  pub status:         SessionStatus,
  pub failure_reason: Option<FailureReason>,
  pub guidance:       Option<&'static str>,
  pub can_retry:      bool,
  pub session:        VerificationSession,
}

impl SessionView {
  pub fn at(session: VerificationSession, now: DateTime<Utc>) -> Self {
    let status = session.effective_status(now);
    let failure_reason = if status == SessionStatus::Expired {
      Some(FailureReason::SessionExpired)
    } else {
      session.failure_reason()
    };
    Self {
      status,
      failure_reason,
      guidance: failure_reason.map(FailureReason::guidance),
      can_retry: status == SessionStatus::Failed && session.can_retry(),
      session,
    }
  }
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

pub struct Orchestrator<S, G, P> {
  store:       Arc<S>,
  gateway:     Arc<G>,
  provisioner: Arc<P>,
  clock:       Arc<dyn Clock>,
  config:      VerificationConfig,
  scorer:      ScoreCalculator,
  locks:       SessionLocks,
  cancels:     CancelRegistry,
}

impl<S, G, P> Orchestrator<S, G, P>
where
  S: SessionStore + SagaStore + 'static,
  G: BiometricGateway,
  P: ProfileProvisioner + 'static,
{
  pub fn new(
    store: Arc<S>,
    gateway: Arc<G>,
    provisioner: Arc<P>,
    clock: Arc<dyn Clock>,
    config: VerificationConfig,
  ) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      store,
      gateway,
      provisioner,
      clock,
      scorer: ScoreCalculator::new(config.score_weights),
      config,
      locks: SessionLocks::default(),
      cancels: CancelRegistry::default(),
    })
  }

  pub fn config(&self) -> &VerificationConfig { &self.config }

  // ── Sessions ──────────────────────────────────────────────────────────────

  pub async fn start_session(&self, new: NewSession) -> Result<VerificationSession> {
    let now = self.clock.now();
    self.ensure_no_cooldown(new.user_id, now).await?;
    if !self.config.accepts(new.document_type) {
      return Err(kyc_core::Error::UnsupportedDocumentType(new.document_type).into());
    }

    let session = VerificationSession::start(new, &self.config, self.challenges(), now);
    self
      .store
      .insert_session(session.clone())
      .await
      .map_err(store_err)?;
    tracing::info!(
      session_id = %session.session_id,
      user_id = %session.user_id,
      document_type = %session.document.document_type,
      "verification session started"
    );
    Ok(session)
  }

  pub async fn get_session(&self, session_id: Uuid) -> Result<SessionView> {
    let session = self.load(session_id).await?;
    Ok(SessionView::at(session, self.clock.now()))
  }

  /// Recompute the overall score from the sub-scores stored on the session.
  pub async fn rescore(&self, session_id: Uuid) -> Result<f64> {
    let session = self.load(session_id).await?;
    Ok(self.scorer.score_session(&session))
  }

  pub async fn saga_status(&self, correlation_id: Uuid) -> Result<ProvisioningSagaState> {
    self
      .store
      .get_saga(correlation_id)
      .await
      .map_err(store_err)?
      .ok_or(Error::SagaNotFound(correlation_id))
  }

  pub async fn saga_for_session(&self, session_id: Uuid) -> Result<Option<ProvisioningSagaState>> {
    self.store.saga_for_session(session_id).await.map_err(store_err)
  }

  // ── Document stage ────────────────────────────────────────────────────────

  pub async fn submit_document_front(
    &self,
    session_id: Uuid,
    image: Bytes,
  ) -> Result<StageOutcome> {
    let guard = self.locks.lock(session_id).await;
    let now = self.clock.now();
    let mut session = self.load(session_id).await?;
    session.ensure_active(now)?;
    if session.status() == SessionStatus::DocumentProcessing {
      return Ok(StageOutcome::InFlight(session));
    }

    let format = self.config.images.check(&image).map_err(kyc_core::Error::from)?;
    let reference = image_reference(session_id, ImageSlot::DocumentFront);
    session.record_front(reference.clone(), now)?;
    self
      .put_image(&session, ImageSlot::DocumentFront, reference, format, image, now)
      .await?;

    if session.requires_back() {
      self.persist(&mut session).await?;
      tracing::info!(session_id = %session_id, "document front captured");
      return Ok(StageOutcome::Advanced(session));
    }
    session.begin_document_processing()?;
    self.process_document(session, guard).await
  }

  pub async fn submit_document_back(
    &self,
    session_id: Uuid,
    image: Bytes,
  ) -> Result<StageOutcome> {
    let guard = self.locks.lock(session_id).await;
    let now = self.clock.now();
    let mut session = self.load(session_id).await?;
    session.ensure_active(now)?;
    if session.status() == SessionStatus::DocumentProcessing {
      return Ok(StageOutcome::InFlight(session));
    }

    let format = self.config.images.check(&image).map_err(kyc_core::Error::from)?;
    let reference = image_reference(session_id, ImageSlot::DocumentBack);
    session.record_back(reference.clone(), now)?;
    self
      .put_image(&session, ImageSlot::DocumentBack, reference, format, image, now)
      .await?;
    session.begin_document_processing()?;
    self.process_document(session, guard).await
  }

  async fn process_document(
    &self,
    mut session: VerificationSession,
    guard: OwnedMutexGuard<()>,
  ) -> Result<StageOutcome> {
    let session_id = session.session_id;
    let images = self.document_images(&session).await?;
    self.persist(&mut session).await?;
    let signal = self.cancels.register(session_id);
    drop(guard);
    tracing::info!(session_id = %session_id, "document processing started");

    let mut result = self.run_ocr(&session, images, &signal).await;

    let guard = self.locks.lock(session_id).await;
    self.cancels.remove(session_id);
    if signal.is_cancelled() {
      result = Err(ProviderError::Cancelled);
    }
    let mut session = self
      .reload(session_id, session.version, SessionStatus::DocumentProcessing)
      .await?;
    let now = self.clock.now();
    self.resolve_document(&mut session, result, now)?;
    self.persist(&mut session).await?;
    drop(guard);

    if session.status() == SessionStatus::Failed {
      self.after_failure(&session, now).await?;
      return Ok(StageOutcome::Failed(session));
    }
    tracing::info!(session_id = %session_id, "document accepted; awaiting selfie");
    Ok(StageOutcome::Advanced(session))
  }

  /// OCR with transient-error retries; a low-confidence read is re-run from
  /// the same budget.
  async fn run_ocr(
    &self,
    session: &VerificationSession,
    images: DocumentImages,
    signal: &CancelSignal,
  ) -> Result<OcrResult, ProviderError> {
    let document_type = session.document.document_type;
    let mut budget = self.config.provider_retries;
    loop {
      let result = self
        .call_provider(
          session,
          ProviderStage::Ocr,
          self.config.timeouts.ocr(),
          signal,
          &mut budget,
          || self.gateway.extract_document(images.clone(), document_type),
        )
        .await;
      match result {
        Ok(ocr) if self.is_low_confidence(&ocr) && budget > 0 => {
          budget -= 1;
          tracing::warn!(
            session_id = %session.session_id,
            confidence = ocr.confidence,
            "OCR confidence below threshold; re-running"
          );
        }
        other => return other,
      }
    }
  }

  fn is_low_confidence(&self, ocr: &OcrResult) -> bool {
    ocr.success
      && !ocr.tamper_suspected
      && ocr.quality_issue.is_none()
      && ocr.fields.is_usable()
      && kyc_core::score::clamp_score(ocr.confidence) < self.config.ocr_confidence_threshold
  }

  fn resolve_document(
    &self,
    session: &mut VerificationSession,
    result: Result<OcrResult, ProviderError>,
    now: DateTime<Utc>,
  ) -> Result<()> {
    let ocr = match result {
      Ok(ocr) => ocr,
      Err(ProviderError::Cancelled) => {
        return self.fail(session, FailureReason::Cancelled, None, now);
      }
      Err(e) => {
        let reason = ProviderStage::Ocr.failure_reason();
        return self.fail(session, reason, Some(e.to_string()), now);
      }
    };

    session.apply_ocr(&ocr, self.gateway.provider_name(), now);
    if ocr.tamper_suspected {
      return self.fail(session, FailureReason::FakeDocument, None, now);
    }
    if let Some(issue) = ocr.quality_issue {
      return self.fail(session, issue.failure_reason(), None, now);
    }
    if !ocr.success || !ocr.fields.is_usable() {
      let detail = (!ocr.errors.is_empty()).then(|| ocr.errors.join("; "));
      return self.fail(session, FailureReason::OcrFailed, detail, now);
    }

    let validation = {
      let fields = &session.ocr.fields;
      document::validate(
        session.document.document_type,
        fields.document_number.as_deref(),
        fields.expiry_date,
        fields.date_of_birth,
        &self.config.jurisdiction,
        now.date_naive(),
      )
    };
    session.apply_validation(&validation);
    if session.ocr.confidence < self.config.ocr_confidence_threshold {
      session.flag_low_confidence();
    }

    if session.validation.passed {
      session.accept_document()?;
      Ok(())
    } else {
      let reason = FailureReason::from_validation(&session.validation.errors);
      let detail = format!("{:?}", session.validation.errors);
      self.fail(session, reason, Some(detail), now)
    }
  }

  // ── Biometric stage ───────────────────────────────────────────────────────

  pub async fn submit_selfie(
    &self,
    session_id: Uuid,
    selfie: SelfieCapture,
  ) -> Result<StageOutcome> {
    let guard = self.locks.lock(session_id).await;
    let now = self.clock.now();
    let mut session = self.load(session_id).await?;
    session.ensure_active(now)?;
    if session.status() == SessionStatus::ProcessingBiometrics {
      return Ok(StageOutcome::InFlight(session));
    }

    let format = self
      .config
      .images
      .check(&selfie.image)
      .map_err(kyc_core::Error::from)?;
    session.record_selfie(now)?;
    session.begin_biometrics()?;
    let document_image = self.load_image(session.document.front_image_ref.clone()).await?;
    let reference = image_reference(session_id, ImageSlot::Selfie);
    self
      .put_image(&session, ImageSlot::Selfie, reference, format, selfie.image.clone(), now)
      .await?;
    self.persist(&mut session).await?;
    let signal = self.cancels.register(session_id);
    drop(guard);
    tracing::info!(session_id = %session_id, "biometric processing started");

    let challenges = session.liveness.challenges.clone();
    let mut liveness_budget = self.config.provider_retries;
    let mut face_budget = self.config.provider_retries;
    let (mut liveness, mut face) = tokio::join!(
      self.call_provider(
        &session,
        ProviderStage::Liveness,
        self.config.timeouts.liveness(),
        &signal,
        &mut liveness_budget,
        || self.gateway.evaluate_liveness(selfie.clone(), challenges.clone()),
      ),
      self.call_provider(
        &session,
        ProviderStage::FaceMatch,
        self.config.timeouts.face_match(),
        &signal,
        &mut face_budget,
        || self.gateway.compare_faces(document_image.clone(), selfie.image.clone()),
      ),
    );

    let guard = self.locks.lock(session_id).await;
    self.cancels.remove(session_id);
    if signal.is_cancelled() {
      liveness = Err(ProviderError::Cancelled);
      face = Err(ProviderError::Cancelled);
    }
    let mut session = self
      .reload(session_id, session.version, SessionStatus::ProcessingBiometrics)
      .await?;
    let now = self.clock.now();
    self.resolve_biometrics(&mut session, liveness, face, now)?;

    if session.status() == SessionStatus::Failed {
      self.persist(&mut session).await?;
      drop(guard);
      self.after_failure(&session, now).await?;
      return Ok(StageOutcome::Failed(session));
    }

    let provisioning = self.start_provisioning(&mut session, now).await?;
    drop(guard);
    tracing::info!(
      session_id = %session_id,
      user_id = %session.user_id,
      overall_score = session.overall_score,
      correlation_id = %provisioning.correlation_id,
      "verification completed"
    );
    Ok(StageOutcome::Completed { session, provisioning })
  }

  fn resolve_biometrics(
    &self,
    session: &mut VerificationSession,
    liveness: Result<LivenessResult, ProviderError>,
    face: Result<FaceMatchResult, ProviderError>,
    now: DateTime<Utc>,
  ) -> Result<()> {
    let provider = self.gateway.provider_name();
    match (liveness, face) {
      (Err(ProviderError::Cancelled), _) | (_, Err(ProviderError::Cancelled)) => {
        self.fail(session, FailureReason::Cancelled, None, now)
      }
      (Err(e), _) => {
        let reason = ProviderStage::Liveness.failure_reason();
        self.fail(session, reason, Some(e.to_string()), now)
      }
      (Ok(live), Err(e)) => {
        session.apply_liveness(&live, self.config.liveness_min_score, provider);
        let reason = if session.liveness.passed {
          ProviderStage::FaceMatch.failure_reason()
        } else {
          FailureReason::LivenessFailed
        };
        self.fail(session, reason, Some(e.to_string()), now)
      }
      (Ok(live), Ok(face)) => {
        session.apply_liveness(&live, self.config.liveness_min_score, provider);
        session.apply_face_match(&face, self.config.face_match_high_confidence, provider);
        if let Some(reason) = session.biometric_failure(&face) {
          return self.fail(session, reason, None, now);
        }
        let score = self.scorer.score_session(session);
        session.complete(score, now)?;
        Ok(())
      }
    }
  }

  /// Save the completed session and its saga together, then run the saga in
  /// the background. If the write fails the session stays where it was and
  /// no saga exists.
  async fn start_provisioning(
    &self,
    session: &mut VerificationSession,
    now: DateTime<Utc>,
  ) -> Result<ProvisioningHandle> {
    let saga = ProvisioningSagaState::new(
      session.session_id,
      session.user_id,
      SagaStep::plan_for(session),
      now,
    );
    let correlation_id = saga.correlation_id;
    self
      .write_versioned(session, |s, expected| {
        self.store.complete_with_saga(s, expected, saga)
      })
      .await?;

    let runner =
      SagaRunner::new(self.store.clone(), self.provisioner.clone(), self.clock.clone());
    let task = tokio::spawn(async move {
      let result = runner.run(correlation_id).await;
      if let Err(e) = &result {
        tracing::error!(
          target: "kyc::operator",
          correlation_id = %correlation_id,
          error = %e,
          "provisioning saga did not finish cleanly"
        );
      }
      result
    });
    Ok(ProvisioningHandle { correlation_id, task })
  }

  // ── Retry, cancel, expiry ─────────────────────────────────────────────────

  /// Start the next attempt after a failure.
  ///
  /// A recoverable failure reuses the session (same id, same expiry). A
  /// non-recoverable one spawns a fresh session linked to this one, using
  /// `document_type` when the user switches documents.
  pub async fn retry(
    &self,
    session_id: Uuid,
    document_type: Option<DocumentType>,
  ) -> Result<VerificationSession> {
    let _guard = self.locks.lock(session_id).await;
    let now = self.clock.now();
    let mut session = self.load(session_id).await?;
    self.ensure_no_cooldown(session.user_id, now).await?;

    if session.failure_reason().is_some_and(FailureReason::is_recoverable) {
      session.reset_for_retry(self.challenges(), now)?;
      self.persist(&mut session).await?;
      let dropped = self
        .store
        .delete_images(session_id)
        .await
        .map_err(store_err)?;
      tracing::info!(
        session_id = %session_id,
        attempt = session.attempt_number(),
        images_dropped = dropped,
        "attempt restarted on the same session"
      );
      return Ok(session);
    }

    let document_type = document_type.unwrap_or(session.document.document_type);
    if !self.config.accepts(document_type) {
      return Err(kyc_core::Error::UnsupportedDocumentType(document_type).into());
    }
    let next =
      VerificationSession::spawn_retry(&session, document_type, &self.config, self.challenges(), now)?;
    let siblings = self
      .store
      .list_sessions_for_user(session.user_id)
      .await
      .map_err(store_err)?;
    if siblings.iter().any(|s| s.previous_session_id == Some(session_id)) {
      return Err(Error::AlreadyRetried(session_id));
    }
    self.store.insert_session(next.clone()).await.map_err(store_err)?;
    tracing::info!(
      session_id = %next.session_id,
      previous_session_id = %session_id,
      attempt = next.attempt_number(),
      "attempt restarted on a fresh session"
    );
    Ok(next)
  }

  /// Cancel whatever the session is doing and fail the attempt.
  pub async fn cancel(&self, session_id: Uuid) -> Result<CancelOutcome> {
    let _guard = self.locks.lock(session_id).await;
    let now = self.clock.now();
    let mut session = self.load(session_id).await?;
    session.ensure_active(now)?;

    if let Some(signal) = self.cancels.get(session_id) {
      signal.cancel();
      tracing::info!(session_id = %session_id, "cancel signalled to in-flight stage");
      return Ok(CancelOutcome::Signalled);
    }

    self.fail(&mut session, FailureReason::Cancelled, None, now)?;
    self.persist(&mut session).await?;
    self.after_failure(&session, now).await?;
    Ok(CancelOutcome::Cancelled(session))
  }

  /// Persist `Expired` for every stale non-terminal session; returns how many
  /// were expired. In-flight provider calls of those sessions are cancelled.
  pub async fn sweep_expired(&self) -> Result<usize> {
    let now = self.clock.now();
    let stale = self
      .store
      .list_stale_sessions(now)
      .await
      .map_err(store_err)?;

    let mut expired = 0;
    for candidate in stale {
      let session_id = candidate.session_id;
      let _guard = self.locks.lock(session_id).await;
      if let Some(signal) = self.cancels.get(session_id) {
        signal.cancel();
      }
      if maintenance::expire_session(&*self.store, session_id, now).await? {
        expired += 1;
      }
    }
    Ok(expired)
  }

  /// Drop captured images of finished sessions past the retention period.
  pub async fn purge_images(&self) -> Result<u64> {
    maintenance::purge_images(&*self.store, &self.config, self.clock.now()).await
  }

  // ── Helpers ───────────────────────────────────────────────────────────────

  /// One provider call at a time, bounded by the stage timeout and the
  /// session's remaining lifetime, retried while the error is transient and
  /// `budget` lasts.
  async fn call_provider<T, F, Fut>(
    &self,
    session: &VerificationSession,
    stage: ProviderStage,
    stage_timeout: StdDuration,
    signal: &CancelSignal,
    budget: &mut u32,
    mut call: F,
  ) -> Result<T, ProviderError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
  {
    loop {
      let deadline = self.deadline(session.expires_at, stage_timeout);
      let result = tokio::select! {
        r = tokio::time::timeout(deadline, call()) => r.unwrap_or(Err(ProviderError::Timeout)),
        () = signal.cancelled() => Err(ProviderError::Cancelled),
      };
      match result {
        Err(e) if e.is_transient() && *budget > 0 => {
          *budget -= 1;
          tracing::warn!(
            session_id = %session.session_id,
            stage = %stage,
            error = %e,
            retries_left = *budget,
            "provider call failed; retrying"
          );
        }
        other => return other,
      }
    }
  }

  fn deadline(&self, expires_at: DateTime<Utc>, stage_timeout: StdDuration) -> StdDuration {
    let remaining = (expires_at - self.clock.now())
      .to_std()
      .unwrap_or(StdDuration::ZERO);
    stage_timeout.min(remaining)
  }

  fn fail(
    &self,
    session: &mut VerificationSession,
    reason: FailureReason,
    detail: Option<String>,
    now: DateTime<Utc>,
  ) -> Result<()> {
    session.fail(reason, detail, now)?;
    tracing::warn!(
      session_id = %session.session_id,
      user_id = %session.user_id,
      attempt = session.attempt_number(),
      reason = %reason,
      "verification attempt failed"
    );
    Ok(())
  }

  /// Start the user's cooldown once their last attempt has failed.
  async fn after_failure(&self, session: &VerificationSession, now: DateTime<Utc>) -> Result<()> {
    if !session.attempts_exhausted() {
      return Ok(());
    }
    let until = now + self.config.cooldown();
    self
      .store
      .set_cooldown(session.user_id, until)
      .await
      .map_err(store_err)?;
    tracing::warn!(user_id = %session.user_id, %until, "attempts exhausted; cooldown started");
    Ok(())
  }

  async fn ensure_no_cooldown(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<()> {
    let until = self.store.get_cooldown(user_id).await.map_err(store_err)?;
    match until {
      Some(until) if until > now => Err(Error::CooldownActive { until }),
      _ => Ok(()),
    }
  }

  fn challenges(&self) -> Vec<LivenessChallenge> {
    assign_challenges(self.config.liveness_challenge_count, &mut OsRng)
  }

  async fn load(&self, session_id: Uuid) -> Result<VerificationSession> {
    self
      .store
      .get_session(session_id)
      .await
      .map_err(store_err)?
      .ok_or(Error::SessionNotFound(session_id))
  }

  /// Load a session after a provider call and check it is still the one the
  /// call was made for.
  async fn reload(
    &self,
    session_id: Uuid,
    version: u64,
    status: SessionStatus,
  ) -> Result<VerificationSession> {
    let session = self.load(session_id).await?;
    if session.is_expired(self.clock.now()) {
      return Err(kyc_core::Error::SessionExpired(session_id).into());
    }
    if session.version != version || session.status() != status {
      return Err(Error::ConcurrentModification(session_id));
    }
    Ok(session)
  }

  /// Version-checked save; bumps `session.version` on success.
  async fn persist(&self, session: &mut VerificationSession) -> Result<()> {
    self
      .write_versioned(session, |s, expected| self.store.save_session(s, expected))
      .await
  }

  /// Hand `session` at the next version to `write`, which must apply it only
  /// at `expected`. The version moves only if the write applied.
  async fn write_versioned<F, Fut, E>(
    &self,
    session: &mut VerificationSession,
    write: F,
  ) -> Result<()>
  where
    F: FnOnce(VerificationSession, u64) -> Fut,
    Fut: Future<Output = Result<WriteOutcome, E>>,
    E: std::error::Error + Send + Sync + 'static,
  {
    let expected = session.version;
    session.version += 1;
    let outcome = write(session.clone(), expected).await.map_err(store_err);
    match outcome {
      Ok(WriteOutcome::Applied) => Ok(()),
      Ok(WriteOutcome::VersionConflict) => {
        session.version = expected;
        Err(Error::ConcurrentModification(session.session_id))
      }
      Err(e) => {
        session.version = expected;
        Err(e)
      }
    }
  }

  async fn put_image(
    &self,
    session: &VerificationSession,
    slot: ImageSlot,
    reference: String,
    format: ImageFormat,
    bytes: Bytes,
    now: DateTime<Utc>,
  ) -> Result<()> {
    let image = StoredImage {
      reference,
      session_id: session.session_id,
      slot,
      format,
      bytes,
      captured_at: now,
    };
    self.store.put_image(image).await.map_err(store_err)
  }

  async fn load_image(&self, reference: Option<String>) -> Result<Bytes> {
    let reference = reference.ok_or_else(|| Error::ImageNotFound("document front".into()))?;
    self
      .store
      .get_image(reference.clone())
      .await
      .map_err(store_err)?
      .ok_or(Error::ImageNotFound(reference))
  }

  async fn document_images(&self, session: &VerificationSession) -> Result<DocumentImages> {
    let front = self.load_image(session.document.front_image_ref.clone()).await?;
    let back = match &session.document.back_image_ref {
      Some(reference) => Some(self.load_image(Some(reference.clone())).await?),
      None => None,
    };
    Ok(DocumentImages { front, back })
  }
}

fn image_reference(session_id: Uuid, slot: ImageSlot) -> String {
  format!("{session_id}/{slot}/{}", Uuid::new_v4().simple())
}
