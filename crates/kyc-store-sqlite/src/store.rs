//! [`SqliteStore`], the SQLite implementation of the `kyc_core::store` traits.

use std::path::Path;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension as _, params};
use uuid::Uuid;

use kyc_core::{
  request::{
    BeginOutcome, IdempotencyKey, IdempotencyRecord, IdempotencyState, RateLimitKey,
    RateLimitWindow, StoredResponse,
  },
  saga::{ProvisioningSagaState, SagaStatus},
  session::VerificationSession,
  store::{
    IdempotencyStore, RateLimitStore, SagaStore, SessionStore, StoredImage, WriteOutcome,
  },
};

use crate::{
  Error,
  Result,
  encode::{
    RawIdempotency, RawWindow, decode_dt, decode_saga, decode_session, encode_dt,
    encode_saga, encode_session, encode_uuid, encode_version,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A verification store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. All
/// statements run on the connection's own thread, one at a time, which is
/// what makes the read-modify-write sequences below atomic.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn query_bodies(&self, sql: &'static str, arg: Option<String>) -> Result<Vec<String>> {
    let bodies = self
      .conn
      .call(move |conn| {
        let body = |r: &rusqlite::Row<'_>| r.get::<_, String>(0);
        let mut stmt = conn.prepare(sql)?;
        let rows = match arg {
          Some(a) => stmt.query_map(params![a], body)?.collect::<rusqlite::Result<Vec<_>>>()?,
          None => stmt.query_map([], body)?.collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
      })
      .await?;
    Ok(bodies)
  }
}

/// The filter columns written alongside a session body.
struct SessionRow {
  session_id:     String,
  user_id:        String,
  status:         String,
  failure_reason: Option<String>,
  attempt_number: i64,
  created_at:     String,
  expires_at:     String,
  version:        i64,
  body:           String,
}

impl SessionRow {
  fn from_session(session: &VerificationSession) -> Result<Self> {
    Ok(Self {
      session_id:     encode_uuid(session.session_id),
      user_id:        encode_uuid(session.user_id),
      status:         session.status().to_string(),
      failure_reason: session.failure_reason().map(|r| r.to_string()),
      attempt_number: i64::from(session.attempt_number()),
      created_at:     encode_dt(session.created_at),
      expires_at:     encode_dt(session.expires_at),
      version:        encode_version(session.version),
      body:           encode_session(session)?,
    })
  }

  /// Version-checked update. Returns the rows changed and whether the
  /// session exists at all.
  fn update(
    &self,
    conn: &rusqlite::Connection,
    expected: i64,
  ) -> rusqlite::Result<(usize, bool)> {
    let changed = conn.execute(
      "UPDATE sessions
          SET status = ?2, failure_reason = ?3, attempt_number = ?4,
              expires_at = ?5, version = ?6, body = ?7
        WHERE session_id = ?1 AND version = ?8",
      params![
        self.session_id,
        self.status,
        self.failure_reason,
        self.attempt_number,
        self.expires_at,
        self.version,
        self.body,
        expected,
      ],
    )?;
    let exists = changed > 0
      || conn
        .query_row(
          "SELECT 1 FROM sessions WHERE session_id = ?1",
          params![self.session_id],
          |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok((changed, exists))
  }
}

/// The filter columns written alongside a saga body.
struct SagaRow {
  correlation_id: String,
  session_id:     String,
  user_id:        String,
  status:         String,
  created_at:     String,
  updated_at:     String,
  version:        i64,
  body:           String,
}

impl SagaRow {
  fn from_saga(saga: &ProvisioningSagaState) -> Result<Self> {
    Ok(Self {
      correlation_id: encode_uuid(saga.correlation_id),
      session_id:     encode_uuid(saga.session_id),
      user_id:        encode_uuid(saga.user_id),
      status:         saga.status().to_string(),
      created_at:     encode_dt(saga.created_at),
      updated_at:     encode_dt(saga.updated_at),
      version:        encode_version(saga.version),
      body:           encode_saga(saga)?,
    })
  }

  fn insert(&self, conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute(
      "INSERT INTO provisioning_sagas
         (correlation_id, session_id, user_id, status, created_at,
          updated_at, version, body)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
      params![
        self.correlation_id,
        self.session_id,
        self.user_id,
        self.status,
        self.created_at,
        self.updated_at,
        self.version,
        self.body,
      ],
    )?;
    Ok(())
  }
}

// ─── SessionStore ────────────────────────────────────────────────────────────

impl SessionStore for SqliteStore {
  type Error = Error;

  async fn insert_session(&self, session: VerificationSession) -> Result<()> {
    let row = SessionRow::from_session(&session)?;
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO sessions
             (session_id, user_id, status, failure_reason, attempt_number,
              created_at, expires_at, version, body)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          params![
            row.session_id,
            row.user_id,
            row.status,
            row.failure_reason,
            row.attempt_number,
            row.created_at,
            row.expires_at,
            row.version,
            row.body,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_session(&self, session_id: Uuid) -> Result<Option<VerificationSession>> {
    let id = encode_uuid(session_id);
    let body: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT body FROM sessions WHERE session_id = ?1",
              params![id],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    body.as_deref().map(decode_session).transpose()
  }

  async fn save_session(
    &self,
    session: VerificationSession,
    expected_version: u64,
  ) -> Result<WriteOutcome> {
    let row = SessionRow::from_session(&session)?;
    let expected = encode_version(expected_version);
    let (changed, exists) = self
      .conn
      .call(move |conn| Ok(row.update(conn, expected)?))
      .await?;

    match (changed, exists) {
      (0, false) => Err(Error::SessionNotFound(session.session_id)),
      (0, true) => Ok(WriteOutcome::VersionConflict),
      _ => Ok(WriteOutcome::Applied),
    }
  }

  async fn list_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<VerificationSession>> {
    let bodies = self
      .query_bodies(
        "SELECT body FROM sessions WHERE user_id = ?1 ORDER BY created_at, attempt_number",
        Some(encode_uuid(user_id)),
      )
      .await?;
    bodies.iter().map(|b| decode_session(b)).collect()
  }

  async fn list_stale_sessions(&self, now: DateTime<Utc>) -> Result<Vec<VerificationSession>> {
    let bodies = self
      .query_bodies(
        "SELECT body FROM sessions
          WHERE status NOT IN ('completed', 'failed', 'expired')
            AND expires_at < ?1
          ORDER BY expires_at",
        Some(encode_dt(now)),
      )
      .await?;
    bodies.iter().map(|b| decode_session(b)).collect()
  }

  async fn put_image(&self, image: StoredImage) -> Result<()> {
    let reference = image.reference;
    let session_id = encode_uuid(image.session_id);
    let slot = image.slot.to_string();
    let format = image.format.to_string();
    let bytes = image.bytes.to_vec();
    let captured_at = encode_dt(image.captured_at);
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO captured_images
             (reference, session_id, slot, format, bytes, captured_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          params![reference, session_id, slot, format, bytes, captured_at],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_image(&self, reference: String) -> Result<Option<Bytes>> {
    let bytes: Option<Vec<u8>> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT bytes FROM captured_images WHERE reference = ?1",
              params![reference],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    Ok(bytes.map(Bytes::from))
  }

  async fn delete_images(&self, session_id: Uuid) -> Result<u64> {
    let id = encode_uuid(session_id);
    let removed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute("DELETE FROM captured_images WHERE session_id = ?1", params![id])?)
      })
      .await?;
    Ok(removed as u64)
  }

  async fn purge_images(&self, captured_before: DateTime<Utc>) -> Result<u64> {
    let before = encode_dt(captured_before);
    let removed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM captured_images
            WHERE captured_at < ?1
              AND session_id IN (
                SELECT session_id FROM sessions
                 WHERE status IN ('completed', 'failed', 'expired'))",
          params![before],
        )?)
      })
      .await?;
    Ok(removed as u64)
  }

  async fn get_cooldown(&self, user_id: Uuid) -> Result<Option<DateTime<Utc>>> {
    let id = encode_uuid(user_id);
    let until: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT until FROM user_cooldowns WHERE user_id = ?1",
              params![id],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    until.as_deref().map(decode_dt).transpose()
  }

  async fn set_cooldown(&self, user_id: Uuid, until: DateTime<Utc>) -> Result<()> {
    let id = encode_uuid(user_id);
    let until = encode_dt(until);
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO user_cooldowns (user_id, until) VALUES (?1, ?2)
           ON CONFLICT (user_id) DO UPDATE SET until = excluded.until",
          params![id, until],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── SagaStore ───────────────────────────────────────────────────────────────

impl SagaStore for SqliteStore {
  type Error = Error;

  async fn insert_saga(&self, saga: ProvisioningSagaState) -> Result<()> {
    let row = SagaRow::from_saga(&saga)?;
    self.conn.call(move |conn| Ok(row.insert(conn)?)).await?;
    Ok(())
  }

  async fn complete_with_saga(
    &self,
    session: VerificationSession,
    expected_version: u64,
    saga: ProvisioningSagaState,
  ) -> Result<WriteOutcome> {
    let session_row = SessionRow::from_session(&session)?;
    let saga_row = SagaRow::from_saga(&saga)?;
    let expected = encode_version(expected_version);
    let (changed, exists) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let (changed, exists) = session_row.update(&tx, expected)?;
        if changed == 0 {
          // Dropping the transaction rolls it back.
          return Ok((changed, exists));
        }
        saga_row.insert(&tx)?;
        tx.commit()?;
        Ok((changed, exists))
      })
      .await?;

    match (changed, exists) {
      (0, false) => Err(Error::SessionNotFound(session.session_id)),
      (0, true) => Ok(WriteOutcome::VersionConflict),
      _ => Ok(WriteOutcome::Applied),
    }
  }

  async fn get_saga(&self, correlation_id: Uuid) -> Result<Option<ProvisioningSagaState>> {
    let id = encode_uuid(correlation_id);
    let body: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT body FROM provisioning_sagas WHERE correlation_id = ?1",
              params![id],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    body.as_deref().map(decode_saga).transpose()
  }

  async fn save_saga(
    &self,
    saga: ProvisioningSagaState,
    expected_version: u64,
  ) -> Result<WriteOutcome> {
    let row = SagaRow::from_saga(&saga)?;
    let expected = encode_version(expected_version);
    let (changed, exists) = self
      .conn
      .call(move |conn| {
        let changed = conn.execute(
          "UPDATE provisioning_sagas
              SET status = ?2, updated_at = ?3, version = ?4, body = ?5
            WHERE correlation_id = ?1 AND version = ?6",
          params![
            row.correlation_id,
            row.status,
            row.updated_at,
            row.version,
            row.body,
            expected,
          ],
        )?;
        let exists = changed > 0
          || conn
            .query_row(
              "SELECT 1 FROM provisioning_sagas WHERE correlation_id = ?1",
              params![row.correlation_id],
              |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok((changed, exists))
      })
      .await?;

    match (changed, exists) {
      (0, false) => Err(Error::SagaNotFound(saga.correlation_id)),
      (0, true) => Ok(WriteOutcome::VersionConflict),
      _ => Ok(WriteOutcome::Applied),
    }
  }

  async fn saga_for_session(&self, session_id: Uuid) -> Result<Option<ProvisioningSagaState>> {
    let id = encode_uuid(session_id);
    let body: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT body FROM provisioning_sagas WHERE session_id = ?1",
              params![id],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    body.as_deref().map(decode_saga).transpose()
  }

  async fn list_sagas(&self, status: Option<SagaStatus>) -> Result<Vec<ProvisioningSagaState>> {
    let bodies = match status {
      Some(s) => {
        self
          .query_bodies(
            "SELECT body FROM provisioning_sagas WHERE status = ?1 ORDER BY created_at",
            Some(s.to_string()),
          )
          .await?
      }
      None => {
        self
          .query_bodies("SELECT body FROM provisioning_sagas ORDER BY created_at", None)
          .await?
      }
    };
    bodies.iter().map(|b| decode_saga(b)).collect()
  }
}

// ─── IdempotencyStore ────────────────────────────────────────────────────────

const KEY_MATCH: &str = "idem_key = ?1 AND user_id = ?2 AND method = ?3 AND path = ?4";

struct KeyParams {
  key:     String,
  user_id: String,
  method:  String,
  path:    String,
}

impl KeyParams {
  fn new(key: IdempotencyKey) -> Self {
    Self {
      key:     key.key,
      user_id: encode_uuid(key.user_id),
      method:  key.method,
      path:    key.path,
    }
  }
}

impl IdempotencyStore for SqliteStore {
  type Error = Error;

  async fn try_begin(&self, record: IdempotencyRecord) -> Result<BeginOutcome> {
    let k = KeyParams::new(record.key);
    let fingerprint = record.fingerprint;
    let state = record.state.to_string();
    let created_at = encode_dt(record.created_at);
    let expires_at = encode_dt(record.expires_at);

    let existing: Option<RawIdempotency> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          &format!("DELETE FROM idempotency_records WHERE {KEY_MATCH} AND expires_at <= ?5"),
          params![k.key, k.user_id, k.method, k.path, created_at],
        )?;
        let inserted = tx.execute(
          "INSERT INTO idempotency_records
             (idem_key, user_id, method, path, fingerprint, state, created_at, expires_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
           ON CONFLICT DO NOTHING",
          params![k.key, k.user_id, k.method, k.path, fingerprint, state, created_at, expires_at],
        )?;
        let existing = if inserted == 0 {
          Some(tx.query_row(
            &format!(
              "SELECT {} FROM idempotency_records WHERE {KEY_MATCH}",
              RawIdempotency::COLUMNS
            ),
            params![k.key, k.user_id, k.method, k.path],
            RawIdempotency::from_row,
          )?)
        } else {
          None
        };
        tx.commit()?;
        Ok(existing)
      })
      .await?;

    match existing {
      Some(raw) => Ok(BeginOutcome::Existing(raw.into_record()?)),
      None => Ok(BeginOutcome::Claimed),
    }
  }

  async fn get_record(&self, key: IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
    let k = KeyParams::new(key);
    let raw: Option<RawIdempotency> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {} FROM idempotency_records WHERE {KEY_MATCH}",
                RawIdempotency::COLUMNS
              ),
              params![k.key, k.user_id, k.method, k.path],
              RawIdempotency::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawIdempotency::into_record).transpose()
  }

  async fn complete(
    &self,
    key: IdempotencyKey,
    response: StoredResponse,
    expires_at: DateTime<Utc>,
  ) -> Result<()> {
    let k = KeyParams::new(key);
    let missing = k.key.clone();
    let state = IdempotencyState::Completed.to_string();
    let status_code = i64::from(response.status_code);
    let body = serde_json::to_string(&response.body)?;
    let expires_at = encode_dt(expires_at);
    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          &format!(
            "UPDATE idempotency_records
                SET state = ?5, status_code = ?6, response_body = ?7, expires_at = ?8
              WHERE {KEY_MATCH}"
          ),
          params![k.key, k.user_id, k.method, k.path, state, status_code, body, expires_at],
        )?)
      })
      .await?;
    if changed == 0 {
      return Err(Error::IdempotencyKeyNotFound(missing));
    }
    Ok(())
  }

  async fn release(&self, key: IdempotencyKey) -> Result<()> {
    let k = KeyParams::new(key);
    let state = IdempotencyState::Processing.to_string();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          &format!("DELETE FROM idempotency_records WHERE {KEY_MATCH} AND state = ?5"),
          params![k.key, k.user_id, k.method, k.path, state],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
    let now = encode_dt(now);
    let removed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM idempotency_records WHERE expires_at <= ?1",
          params![now],
        )?)
      })
      .await?;
    Ok(removed as u64)
  }
}

// ─── RateLimitStore ──────────────────────────────────────────────────────────

impl RateLimitStore for SqliteStore {
  type Error = Error;

  async fn hit(
    &self,
    key: RateLimitKey,
    now: DateTime<Utc>,
    window: Duration,
  ) -> Result<RateLimitWindow> {
    let subject = key.subject.clone();
    let endpoint = key.endpoint.clone();
    let start = encode_dt(now);
    let end = encode_dt(now + window);
    let raw = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "INSERT INTO rate_limit_windows (subject, endpoint, count, window_start, window_end)
           VALUES (?1, ?2, 1, ?3, ?4)
           ON CONFLICT (subject, endpoint) DO UPDATE SET
             count        = CASE WHEN window_end <= ?3 THEN 1  ELSE count + 1  END,
             window_start = CASE WHEN window_end <= ?3 THEN ?3 ELSE window_start END,
             window_end   = CASE WHEN window_end <= ?3 THEN ?4 ELSE window_end   END
           RETURNING count, window_start, window_end",
          params![subject, endpoint, start, end],
          |r| {
            Ok(RawWindow {
              count:        r.get(0)?,
              window_start: r.get(1)?,
              window_end:   r.get(2)?,
            })
          },
        )?)
      })
      .await?;
    raw.into_window(key)
  }
}
