//! Core types and trait definitions for the KYC verification core.
//!
//! This crate holds the verification session state machine, the scoring and
//! document-validation rules, and the traits through which the engine talks
//! to biometric providers, profile provisioning and storage. It has no
//! runtime, network or database dependencies.

// Implementors write the trait methods as plain `async fn`.
#![allow(async_fn_in_trait)]

pub mod capture;
pub mod clock;
pub mod config;
pub mod document;
pub mod error;
pub mod gateway;
pub mod provisioning;
pub mod request;
pub mod saga;
pub mod score;
pub mod session;
pub mod store;

pub use error::{Error, Result};
