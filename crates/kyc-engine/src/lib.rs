//! Orchestration for the verification core.
//!
//! [`Orchestrator`] is the only component that moves a
//! [`kyc_core::session::VerificationSession`] through its stages. It drives
//! the provider gateway, persists every transition through the store traits,
//! and hands completed sessions to the provisioning [`SagaRunner`].
//! [`IdempotencyGuard`] and [`RateLimiter`] sit in front of it for callers
//! that accept client requests.

#![allow(async_fn_in_trait)]

pub mod error;
pub mod guard;
pub mod maintenance;
pub mod orchestrator;
mod registry;
pub mod saga;

pub use error::{Error, Result};
pub use guard::{IdempotencyGuard, RateLimiter, fingerprint};
pub use orchestrator::{
  CancelOutcome, Orchestrator, ProvisioningHandle, SessionView, StageOutcome,
};
pub use saga::SagaRunner;
