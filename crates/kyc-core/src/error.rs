//! Error types for `kyc-core`.

use thiserror::Error;
use uuid::Uuid;

use crate::{
  capture::ImageError,
  document::DocumentType,
  saga::SagaStatus,
  session::SessionStatus,
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("session {0} has expired")]
  SessionExpired(Uuid),

  #[error("session {0} is {1} and accepts no further stages")]
  SessionTerminal(Uuid, SessionStatus),

  #[error("illegal transition from {from} to {to}")]
  IllegalTransition { from: SessionStatus, to: SessionStatus },

  #[error("retry not allowed: attempt {attempt} of {max}, status {status}")]
  RetryNotAllowed {
    attempt: u32,
    max:     u32,
    status:  SessionStatus,
  },

  #[error("{0} gate has not passed")]
  GateNotPassed(&'static str),

  #[error("document type {0} is not accepted")]
  UnsupportedDocumentType(DocumentType),

  #[error("document type {0} has no back side")]
  NoBackSide(DocumentType),

  #[error("invalid image: {0}")]
  InvalidImage(#[from] ImageError),

  #[error("saga {0} is {1} and cannot be run")]
  SagaNotRunnable(Uuid, SagaStatus),

  #[error("saga {0} has no step in progress")]
  NoPendingStep(Uuid),

  #[error("invalid configuration: {0}")]
  InvalidConfig(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
