//! Error type for `kyc-engine`.

use chrono::{DateTime, Utc};
use kyc_core::session::{FailureReason, SessionStatus};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] kyc_core::Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("session not found: {0}")]
  SessionNotFound(Uuid),

  #[error("saga not found: {0}")]
  SagaNotFound(Uuid),

  #[error("stored image not found: {0}")]
  ImageNotFound(String),

  /// Another writer changed the record between load and save.
  #[error("{0} was modified concurrently")]
  ConcurrentModification(Uuid),

  #[error("too many failed attempts; cooldown active until {until}")]
  CooldownActive { until: DateTime<Utc> },

  #[error("session {0} has already been retried")]
  AlreadyRetried(Uuid),

  #[error("an identical request is still in progress; retry later")]
  RetryLater,

  #[error("idempotency key reused with a different request body")]
  IdempotencyKeyReused,

  #[error("rate limit exceeded; retry after {retry_after}s")]
  RateLimited { retry_after: u64 },

  #[error("provisioning task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) fn store_err<E>(e: E) -> Error
where
  E: std::error::Error + Send + Sync + 'static,
{
  Error::Store(Box::new(e))
}

impl Error {
  /// Stable machine-readable code for callers to switch on.
  pub fn code(&self) -> &'static str {
    use kyc_core::Error as Core;
    match self {
      Self::Core(core) => match core {
        Core::SessionExpired(_) => "session_expired",
        Core::SessionTerminal(..) => "session_terminal",
        Core::IllegalTransition { .. } => "illegal_transition",
        Core::RetryNotAllowed { .. } => "retry_not_allowed",
        Core::GateNotPassed(_) => "gate_not_passed",
        Core::UnsupportedDocumentType(_) => "unsupported_document_type",
        Core::NoBackSide(_) => "no_back_side",
        Core::InvalidImage(_) => "invalid_image",
        Core::SagaNotRunnable(..) => "saga_not_runnable",
        Core::NoPendingStep(_) => "no_pending_step",
        Core::InvalidConfig(_) => "invalid_config",
      },
      Self::Store(_) => "store_error",
      Self::SessionNotFound(_) => "session_not_found",
      Self::SagaNotFound(_) => "saga_not_found",
      Self::ImageNotFound(_) => "image_not_found",
      Self::ConcurrentModification(_) => "concurrent_modification",
      Self::CooldownActive { .. } => "cooldown_active",
      Self::AlreadyRetried(_) => "already_retried",
      Self::RetryLater => "retry_later",
      Self::IdempotencyKeyReused => "idempotency_key_reused",
      Self::RateLimited { .. } => "rate_limited",
      Self::Join(_) => "provisioning_task_failed",
    }
  }

  /// The failure reason a UI should show for this error, if it has one.
  pub fn reason(&self) -> Option<FailureReason> {
    match self {
      Self::Core(kyc_core::Error::SessionExpired(_)) => Some(FailureReason::SessionExpired),
      Self::Core(kyc_core::Error::RetryNotAllowed { attempt, max, status })
        if *status == SessionStatus::Failed && attempt >= max =>
      {
        Some(FailureReason::MultipleAttemptsFailed)
      }
      Self::CooldownActive { .. } => Some(FailureReason::MultipleAttemptsFailed),
      _ => None,
    }
  }

  /// Input errors leave every record untouched.
  pub fn is_input_error(&self) -> bool {
    matches!(
      self,
      Self::Core(
        kyc_core::Error::InvalidImage(_)
          | kyc_core::Error::UnsupportedDocumentType(_)
          | kyc_core::Error::NoBackSide(_)
          | kyc_core::Error::IllegalTransition { .. }
      )
    )
  }
}
