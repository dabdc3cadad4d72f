//! Request guards: idempotent replay and per-endpoint rate limiting.

use std::{future::Future, sync::Arc, time::Duration};

use kyc_core::{
  clock::Clock,
  config::{IdempotencyPolicy, RateLimitPolicy},
  request::{
    BeginOutcome, IdempotencyKey, IdempotencyRecord, RateLimitKey, RateLimitWindow,
    StoredResponse,
  },
  store::{IdempotencyStore, RateLimitStore},
};
use sha2::{Digest, Sha256};

use crate::{
  Error,
  Result,
  error::store_err,
};

/// Hex SHA-256 of a request body.
pub fn fingerprint(body: &[u8]) -> String { hex::encode(Sha256::digest(body)) }

// ─── Idempotency ─────────────────────────────────────────────────────────────

/// Runs a handler at most once per idempotency key.
///
/// The first request claims the key with a `Processing` marker and runs the
/// handler. Duplicates that arrive while it runs poll until the stored
/// response appears, giving up with [`Error::RetryLater`] after the
/// configured wait. A handler error releases the marker so the client can
/// try again. A marker whose owner never finishes lapses after the
/// processing lease; only a completed response is kept for the full TTL.
pub struct IdempotencyGuard<S> {
  store:  Arc<S>,
  clock:  Arc<dyn Clock>,
  policy: IdempotencyPolicy,
}

impl<S: IdempotencyStore> IdempotencyGuard<S> {
  pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, policy: IdempotencyPolicy) -> Self {
    Self { store, clock, policy }
  }

  pub async fn run<F, Fut>(
    &self,
    key: IdempotencyKey,
    body: &[u8],
    handler: F,
  ) -> Result<StoredResponse>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse>>,
  {
    let fingerprint = fingerprint(body);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(self.policy.wait_ms);
    let poll = Duration::from_millis(self.policy.poll_interval_ms.max(1));

    loop {
      let record = IdempotencyRecord::processing(
        key.clone(),
        fingerprint.clone(),
        self.clock.now(),
        self.policy.processing_lease(),
      );
      match self.store.try_begin(record).await.map_err(store_err)? {
        BeginOutcome::Claimed => return self.claimed(key, handler).await,
        BeginOutcome::Existing(existing) => {
          if existing.fingerprint != fingerprint {
            return Err(Error::IdempotencyKeyReused);
          }
          if let Some(response) = self.wait_for(&key, existing, deadline, poll).await? {
            return Ok(response);
          }
          // Marker released or expired: claim it ourselves.
        }
      }
    }
  }

  async fn claimed<F, Fut>(&self, key: IdempotencyKey, handler: F) -> Result<StoredResponse>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse>>,
  {
    match handler().await {
      Ok(response) => {
        let expires_at = self.clock.now() + self.policy.ttl();
        self
          .store
          .complete(key, response.clone(), expires_at)
          .await
          .map_err(store_err)?;
        Ok(response)
      }
      Err(e) => {
        self.store.release(key).await.map_err(store_err)?;
        Err(e)
      }
    }
  }

  /// Poll until `existing` carries a response. `None` means the key is free
  /// again.
  async fn wait_for(
    &self,
    key: &IdempotencyKey,
    mut existing: IdempotencyRecord,
    deadline: tokio::time::Instant,
    poll: Duration,
  ) -> Result<Option<StoredResponse>> {
    loop {
      if !existing.is_processing() {
        if let Some(response) = existing.response.take() {
          return Ok(Some(response));
        }
      }
      if existing.is_expired(self.clock.now()) {
        return Ok(None);
      }
      if tokio::time::Instant::now() + poll > deadline {
        return Err(Error::RetryLater);
      }
      tokio::time::sleep(poll).await;
      match self.store.get_record(key.clone()).await.map_err(store_err)? {
        Some(record) => existing = record,
        None => return Ok(None),
      }
    }
  }
}

// ─── Rate limiting ───────────────────────────────────────────────────────────

/// Fixed-window request quota per (subject, endpoint).
pub struct RateLimiter<S> {
  store:  Arc<S>,
  clock:  Arc<dyn Clock>,
  policy: RateLimitPolicy,
}

impl<S: RateLimitStore> RateLimiter<S> {
  pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, policy: RateLimitPolicy) -> Self {
    Self { store, clock, policy }
  }

  /// Count one request; fails with [`Error::RateLimited`] once the window's
  /// quota is used up.
  pub async fn check(&self, subject: &str, endpoint: &str) -> Result<RateLimitWindow> {
    let now = self.clock.now();
    let key = RateLimitKey { subject: subject.to_owned(), endpoint: endpoint.to_owned() };
    let window = self
      .store
      .hit(key, now, self.policy.window())
      .await
      .map_err(store_err)?;
    if window.exceeds(self.policy.max_requests) {
      tracing::warn!(subject, endpoint, count = window.count, "rate limit exceeded");
      return Err(Error::RateLimited { retry_after: window.retry_after(now) });
    }
    Ok(window)
  }
}
