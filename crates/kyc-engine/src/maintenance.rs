//! Housekeeping shared by the orchestrator and the `kyc` binary.
//!
//! These functions take only a store, so they run the same way in-process
//! and offline. The orchestrator wraps [`expire_session`] with its session
//! lock and cancels in-flight provider calls first.

use chrono::{DateTime, Utc};
use kyc_core::{
  config::VerificationConfig,
  store::{SessionStore, WriteOutcome},
};
use uuid::Uuid;

use crate::{Result, error::store_err};

/// Persist `Expired` for a session that is still live but past its expiry.
///
/// Returns whether the session was expired. A session another writer moved
/// meanwhile is left for the next sweep.
pub async fn expire_session<S: SessionStore>(
  store: &S,
  session_id: Uuid,
  now: DateTime<Utc>,
) -> Result<bool> {
  let Some(mut session) = store.get_session(session_id).await.map_err(store_err)? else {
    return Ok(false);
  };
  if session.status().is_terminal() || !session.is_expired(now) {
    return Ok(false);
  }

  let expected = session.version;
  session.expire(now)?;
  session.version += 1;
  match store.save_session(session, expected).await.map_err(store_err)? {
    WriteOutcome::Applied => {
      tracing::info!(session_id = %session_id, "session expired");
      Ok(true)
    }
    WriteOutcome::VersionConflict => {
      tracing::warn!(session_id = %session_id, "session changed during sweep; skipped");
      Ok(false)
    }
  }
}

/// Expire every stale session; returns how many were expired.
pub async fn sweep_expired<S: SessionStore>(store: &S, now: DateTime<Utc>) -> Result<usize> {
  let stale = store.list_stale_sessions(now).await.map_err(store_err)?;
  let mut expired = 0;
  for session in stale {
    if expire_session(store, session.session_id, now).await? {
      expired += 1;
    }
  }
  Ok(expired)
}

/// Drop captured images of finished sessions older than
/// `config.image_retention_hours`.
pub async fn purge_images<S: SessionStore>(
  store: &S,
  config: &VerificationConfig,
  now: DateTime<Utc>,
) -> Result<u64> {
  let removed = store
    .purge_images(now - config.image_retention())
    .await
    .map_err(store_err)?;
  tracing::info!(removed, "captured images purged");
  Ok(removed)
}
