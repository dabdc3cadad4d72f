//! SQL schema for the verification SQLite store.
//!
//! Sessions and sagas are stored as a JSON body plus the handful of columns
//! the store filters on. Timestamps in filter columns use a fixed-width
//! RFC 3339 form, so text comparison orders them chronologically.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS sessions (
    session_id     TEXT PRIMARY KEY,
    user_id        TEXT NOT NULL,
    status         TEXT NOT NULL,   -- snake_case SessionStatus
    failure_reason TEXT,
    attempt_number INTEGER NOT NULL,
    created_at     TEXT NOT NULL,
    expires_at     TEXT NOT NULL,
    version        INTEGER NOT NULL,
    body           TEXT NOT NULL    -- full VerificationSession as JSON
);

CREATE INDEX IF NOT EXISTS sessions_user_idx   ON sessions(user_id, created_at);
CREATE INDEX IF NOT EXISTS sessions_expiry_idx ON sessions(status, expires_at);

CREATE TABLE IF NOT EXISTS captured_images (
    reference   TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL REFERENCES sessions(session_id),
    slot        TEXT NOT NULL,      -- 'document_front' | 'document_back' | 'selfie'
    format      TEXT NOT NULL,
    bytes       BLOB NOT NULL,
    captured_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_cooldowns (
    user_id TEXT PRIMARY KEY,
    until   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS provisioning_sagas (
    correlation_id TEXT PRIMARY KEY,
    session_id     TEXT NOT NULL UNIQUE,
    user_id        TEXT NOT NULL,
    status         TEXT NOT NULL,   -- snake_case SagaStatus
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    version        INTEGER NOT NULL,
    body           TEXT NOT NULL    -- full ProvisioningSagaState as JSON
);

CREATE INDEX IF NOT EXISTS sagas_status_idx ON provisioning_sagas(status);

CREATE TABLE IF NOT EXISTS idempotency_records (
    idem_key      TEXT NOT NULL,
    user_id       TEXT NOT NULL,
    method        TEXT NOT NULL,
    path          TEXT NOT NULL,
    fingerprint   TEXT NOT NULL,
    state         TEXT NOT NULL,    -- 'processing' | 'completed'
    status_code   INTEGER,
    response_body TEXT,
    created_at    TEXT NOT NULL,
    expires_at    TEXT NOT NULL,
    PRIMARY KEY (idem_key, user_id, method, path)
);

CREATE INDEX IF NOT EXISTS idempotency_expiry_idx ON idempotency_records(expires_at);

CREATE TABLE IF NOT EXISTS rate_limit_windows (
    subject      TEXT NOT NULL,
    endpoint     TEXT NOT NULL,
    count        INTEGER NOT NULL,
    window_start TEXT NOT NULL,
    window_end   TEXT NOT NULL,
    PRIMARY KEY (subject, endpoint)
);
";
