//! Durable side effects of a completed verification.
//!
//! The KYC profile service, document registry and audit log live outside this
//! core. [`ProfileProvisioner`] is the seam the provisioning saga drives them
//! through; every forward operation has an inverse used for compensation.

use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  document::{DocumentSide, DocumentType},
  session::VerificationSession,
};

/// A user's KYC profile as held by the profile service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KycProfile {
  pub profile_id:      Uuid,
  pub user_id:         Uuid,
  pub full_name:       Option<String>,
  pub date_of_birth:   Option<NaiveDate>,
  pub nationality:     Option<String>,
  pub address:         Option<String>,
  pub gender:          Option<String>,
  pub verified_at:     Option<DateTime<Utc>>,
  pub last_session_id: Option<Uuid>,
  pub overall_score:   f64,
}

/// Profile fields derived from a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDraft {
  pub user_id:       Uuid,
  pub session_id:    Uuid,
  pub full_name:     Option<String>,
  pub date_of_birth: Option<NaiveDate>,
  pub nationality:   Option<String>,
  pub address:       Option<String>,
  pub gender:        Option<String>,
  pub verified_at:   DateTime<Utc>,
  pub overall_score: f64,
}

impl ProfileDraft {
  pub fn from_session(session: &VerificationSession, verified_at: DateTime<Utc>) -> Self {
    let fields = &session.ocr.fields;
    Self {
      user_id: session.user_id,
      session_id: session.session_id,
      full_name: fields.full_name.clone(),
      date_of_birth: fields.date_of_birth,
      nationality: fields.nationality.clone(),
      address: fields.address.clone(),
      gender: fields.gender.clone(),
      verified_at,
      overall_score: session.overall_score,
    }
  }
}

/// A verified document linked to a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
  pub profile_id:      Uuid,
  pub session_id:      Uuid,
  pub document_type:   DocumentType,
  pub side:            DocumentSide,
  pub document_number: Option<String>,
  pub expiry_date:     Option<NaiveDate>,
  pub image_ref:       String,
}

/// An entry in the compliance audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
  pub user_id:        Uuid,
  pub profile_id:     Uuid,
  pub session_id:     Uuid,
  pub correlation_id: Uuid,
  pub action:         String,
  pub overall_score:  f64,
  pub recorded_at:    DateTime<Utc>,
}

/// External collaborator applying (and undoing) provisioning side effects.
pub trait ProfileProvisioner: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn find_profile(
    &self,
    user_id: Uuid,
  ) -> impl Future<Output = Result<Option<KycProfile>, Self::Error>> + Send + '_;

  fn create_profile(
    &self,
    draft: ProfileDraft,
  ) -> impl Future<Output = Result<KycProfile, Self::Error>> + Send + '_;

  /// Overwrite a profile with `draft`; returns the profile as it was before.
  fn update_profile(
    &self,
    profile_id: Uuid,
    draft: ProfileDraft,
  ) -> impl Future<Output = Result<KycProfile, Self::Error>> + Send + '_;

  /// Put back a profile captured by [`Self::update_profile`].
  fn restore_profile(
    &self,
    previous: KycProfile,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn delete_profile(
    &self,
    profile_id: Uuid,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Returns the id of the linked document.
  fn attach_document(
    &self,
    record: DocumentRecord,
  ) -> impl Future<Output = Result<Uuid, Self::Error>> + Send + '_;

  fn detach_document(
    &self,
    document_id: Uuid,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Returns the id of the audit entry.
  fn record_audit(
    &self,
    entry: AuditEntry,
  ) -> impl Future<Output = Result<Uuid, Self::Error>> + Send + '_;

  fn void_audit(
    &self,
    audit_id: Uuid,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
