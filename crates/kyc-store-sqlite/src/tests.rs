//! Integration tests for `SqliteStore` against an in-memory database.

use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use kyc_core::{
  capture::ImageFormat,
  config::VerificationConfig,
  document::DocumentType,
  request::{BeginOutcome, IdempotencyKey, IdempotencyRecord, RateLimitKey, StoredResponse},
  saga::{Compensation, ProvisioningSagaState, SagaStatus, SagaStep},
  session::{DeviceContext, FailureReason, NewSession, SessionStatus, VerificationSession},
  store::{
    IdempotencyStore, ImageSlot, RateLimitStore, SagaStore, SessionStore, StoredImage,
    WriteOutcome,
  },
};
use serde_json::json;
use uuid::Uuid;

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap() }

fn session_for(user_id: Uuid, now: DateTime<Utc>) -> VerificationSession {
  VerificationSession::start(
    NewSession {
      user_id,
      profile_id: None,
      document_type: DocumentType::Passport,
      device: DeviceContext::default(),
    },
    &VerificationConfig::default(),
    Vec::new(),
    now,
  )
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn insert_and_get_session() {
  let s = store().await;
  let session = session_for(Uuid::new_v4(), t0());
  s.insert_session(session.clone()).await.unwrap();

  let fetched = s.get_session(session.session_id).await.unwrap().unwrap();
  assert_eq!(fetched, session);
}

#[tokio::test]
async fn get_session_missing_returns_none() {
  let s = store().await;
  assert!(s.get_session(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn save_applies_only_at_expected_version() {
  let s = store().await;
  let mut session = session_for(Uuid::new_v4(), t0());
  s.insert_session(session.clone()).await.unwrap();

  session.record_front("front-1".into(), t0()).unwrap();
  session.version = 1;
  let outcome = s.save_session(session.clone(), 0).await.unwrap();
  assert_eq!(outcome, WriteOutcome::Applied);

  // A writer still holding version 0 loses.
  let mut stale = session.clone();
  stale.version = 1;
  let outcome = s.save_session(stale, 0).await.unwrap();
  assert_eq!(outcome, WriteOutcome::VersionConflict);

  let fetched = s.get_session(session.session_id).await.unwrap().unwrap();
  assert_eq!(fetched.status(), SessionStatus::DocumentFrontCaptured);
  assert_eq!(fetched.version, 1);
}

#[tokio::test]
async fn save_unknown_session_is_not_found() {
  let s = store().await;
  let session = session_for(Uuid::new_v4(), t0());
  let err = s.save_session(session, 0).await.unwrap_err();
  assert!(matches!(err, Error::SessionNotFound(_)));
}

#[tokio::test]
async fn sessions_listed_per_user_in_creation_order() {
  let s = store().await;
  let user = Uuid::new_v4();
  let first = session_for(user, t0());
  let second = session_for(user, t0() + Duration::minutes(5));
  s.insert_session(second.clone()).await.unwrap();
  s.insert_session(first.clone()).await.unwrap();
  s.insert_session(session_for(Uuid::new_v4(), t0())).await.unwrap();

  let listed = s.list_sessions_for_user(user).await.unwrap();
  let ids: Vec<Uuid> = listed.iter().map(|x| x.session_id).collect();
  assert_eq!(ids, vec![first.session_id, second.session_id]);
}

#[tokio::test]
async fn stale_sessions_exclude_terminal_and_live_ones() {
  let s = store().await;
  let stale = session_for(Uuid::new_v4(), t0());
  let live = session_for(Uuid::new_v4(), t0() + Duration::minutes(20));
  let mut failed = session_for(Uuid::new_v4(), t0());
  failed.fail(FailureReason::FakeDocument, None, t0()).unwrap();
  for x in [&stale, &live, &failed] {
    s.insert_session(x.clone()).await.unwrap();
  }

  let now = t0() + Duration::minutes(31);
  let found = s.list_stale_sessions(now).await.unwrap();
  assert_eq!(found.len(), 1);
  assert_eq!(found[0].session_id, stale.session_id);
}

#[tokio::test]
async fn image_bytes_round_trip() {
  let s = store().await;
  let session = session_for(Uuid::new_v4(), t0());
  s.insert_session(session.clone()).await.unwrap();

  let bytes = Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]);
  s.put_image(StoredImage {
    reference:   "img-1".into(),
    session_id:  session.session_id,
    slot:        ImageSlot::DocumentFront,
    format:      ImageFormat::Jpeg,
    bytes:       bytes.clone(),
    captured_at: t0(),
  })
  .await
  .unwrap();

  assert_eq!(s.get_image("img-1".into()).await.unwrap(), Some(bytes));
  assert_eq!(s.get_image("img-2".into()).await.unwrap(), None);
}

fn image(reference: &str, session_id: Uuid, captured_at: DateTime<Utc>) -> StoredImage {
  StoredImage {
    reference: reference.into(),
    session_id,
    slot: ImageSlot::DocumentFront,
    format: ImageFormat::Jpeg,
    bytes: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0]),
    captured_at,
  }
}

#[tokio::test]
async fn deleting_images_is_scoped_to_one_session() {
  let s = store().await;
  let a = session_for(Uuid::new_v4(), t0());
  let b = session_for(Uuid::new_v4(), t0());
  s.insert_session(a.clone()).await.unwrap();
  s.insert_session(b.clone()).await.unwrap();
  s.put_image(image("a-front", a.session_id, t0())).await.unwrap();
  s.put_image(image("a-selfie", a.session_id, t0())).await.unwrap();
  s.put_image(image("b-front", b.session_id, t0())).await.unwrap();

  assert_eq!(s.delete_images(a.session_id).await.unwrap(), 2);
  assert!(s.get_image("a-front".into()).await.unwrap().is_none());
  assert!(s.get_image("b-front".into()).await.unwrap().is_some());
}

#[tokio::test]
async fn purge_keeps_recent_and_in_progress_images() {
  let s = store().await;
  let live = session_for(Uuid::new_v4(), t0());
  let mut done = session_for(Uuid::new_v4(), t0());
  done.fail(FailureReason::FakeDocument, None, t0()).unwrap();
  s.insert_session(live.clone()).await.unwrap();
  s.insert_session(done.clone()).await.unwrap();
  s.put_image(image("live-old", live.session_id, t0())).await.unwrap();
  s.put_image(image("done-old", done.session_id, t0())).await.unwrap();
  s.put_image(image("done-new", done.session_id, t0() + Duration::hours(5))).await.unwrap();

  let removed = s.purge_images(t0() + Duration::hours(1)).await.unwrap();
  assert_eq!(removed, 1);
  assert!(s.get_image("done-old".into()).await.unwrap().is_none());
  assert!(s.get_image("done-new".into()).await.unwrap().is_some());
  assert!(s.get_image("live-old".into()).await.unwrap().is_some());
}

#[tokio::test]
async fn cooldown_is_replaced_not_duplicated() {
  let s = store().await;
  let user = Uuid::new_v4();
  assert!(s.get_cooldown(user).await.unwrap().is_none());

  s.set_cooldown(user, t0()).await.unwrap();
  s.set_cooldown(user, t0() + Duration::hours(24)).await.unwrap();
  assert_eq!(s.get_cooldown(user).await.unwrap(), Some(t0() + Duration::hours(24)));
}

// ─── Sagas ───────────────────────────────────────────────────────────────────

fn saga() -> ProvisioningSagaState {
  ProvisioningSagaState::new(
    Uuid::new_v4(),
    Uuid::new_v4(),
    vec![SagaStep::UpsertProfile, SagaStep::RecordAudit],
    t0(),
  )
}

#[tokio::test]
async fn saga_round_trip_and_lookup_by_session() {
  let s = store().await;
  let saga = saga();
  s.insert_saga(saga.clone()).await.unwrap();

  assert_eq!(s.get_saga(saga.correlation_id).await.unwrap(), Some(saga.clone()));
  assert_eq!(s.saga_for_session(saga.session_id).await.unwrap(), Some(saga));
  assert!(s.saga_for_session(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn saga_save_is_version_checked() {
  let s = store().await;
  let mut saga = saga();
  s.insert_saga(saga.clone()).await.unwrap();

  saga.begin_step(t0()).unwrap();
  saga
    .commit_step(Compensation::DeleteProfile { profile_id: Uuid::new_v4() }, t0())
    .unwrap();
  saga.version = 1;
  assert_eq!(s.save_saga(saga.clone(), 0).await.unwrap(), WriteOutcome::Applied);
  assert_eq!(s.save_saga(saga.clone(), 0).await.unwrap(), WriteOutcome::VersionConflict);

  let fetched = s.get_saga(saga.correlation_id).await.unwrap().unwrap();
  assert_eq!(fetched.completed().len(), 1);
}

#[tokio::test]
async fn completed_session_and_saga_are_written_together() {
  let s = store().await;
  let mut session = session_for(Uuid::new_v4(), t0());
  s.insert_session(session.clone()).await.unwrap();
  session.record_front("front-1".into(), t0()).unwrap();
  session.version = 1;
  let saga = ProvisioningSagaState::new(
    session.session_id,
    session.user_id,
    vec![SagaStep::UpsertProfile],
    t0(),
  );

  let outcome = s.complete_with_saga(session.clone(), 0, saga.clone()).await.unwrap();
  assert_eq!(outcome, WriteOutcome::Applied);
  assert_eq!(s.get_session(session.session_id).await.unwrap().unwrap().version, 1);
  assert_eq!(s.saga_for_session(session.session_id).await.unwrap(), Some(saga));
}

#[tokio::test]
async fn conflicting_completion_inserts_no_saga() {
  let s = store().await;
  let mut session = session_for(Uuid::new_v4(), t0());
  s.insert_session(session.clone()).await.unwrap();
  session.record_front("front-1".into(), t0()).unwrap();
  session.version = 1;
  let saga = ProvisioningSagaState::new(
    session.session_id,
    session.user_id,
    vec![SagaStep::UpsertProfile],
    t0(),
  );

  let outcome = s.complete_with_saga(session.clone(), 7, saga).await.unwrap();
  assert_eq!(outcome, WriteOutcome::VersionConflict);
  assert_eq!(s.get_session(session.session_id).await.unwrap().unwrap().version, 0);
  assert!(s.saga_for_session(session.session_id).await.unwrap().is_none());
}

#[tokio::test]
async fn completion_of_unknown_session_is_not_found() {
  let s = store().await;
  let session = session_for(Uuid::new_v4(), t0());
  let saga = ProvisioningSagaState::new(
    session.session_id,
    session.user_id,
    vec![SagaStep::UpsertProfile],
    t0(),
  );
  let err = s.complete_with_saga(session.clone(), 0, saga).await.unwrap_err();
  assert!(matches!(err, Error::SessionNotFound(_)));
  assert!(s.saga_for_session(session.session_id).await.unwrap().is_none());
}

#[tokio::test]
async fn sagas_filtered_by_status() {
  let s = store().await;
  let started = saga();
  let mut failed = saga();
  failed.begin_step(t0()).unwrap();
  failed.fail_step("profile service down".into(), t0()).unwrap();
  failed.begin_rollback(t0()).unwrap();
  s.insert_saga(started.clone()).await.unwrap();
  s.insert_saga(failed.clone()).await.unwrap();

  assert_eq!(s.list_sagas(None).await.unwrap().len(), 2);
  let rolled = s.list_sagas(Some(SagaStatus::RolledBack)).await.unwrap();
  assert_eq!(rolled.len(), 1);
  assert_eq!(rolled[0].correlation_id, failed.correlation_id);
  assert!(s.list_sagas(Some(SagaStatus::PartiallyRolledBack)).await.unwrap().is_empty());
}

// ─── Idempotency ─────────────────────────────────────────────────────────────

fn key(user_id: Uuid) -> IdempotencyKey {
  IdempotencyKey {
    key: "req-1".into(),
    user_id,
    method: "POST".into(),
    path: "/sessions".into(),
  }
}

fn marker(user_id: Uuid, now: DateTime<Utc>) -> IdempotencyRecord {
  IdempotencyRecord::processing(key(user_id), "abc".into(), now, Duration::minutes(2))
}

#[tokio::test]
async fn first_claim_wins_and_second_sees_marker() {
  let s = store().await;
  let user = Uuid::new_v4();
  assert_eq!(s.try_begin(marker(user, t0())).await.unwrap(), BeginOutcome::Claimed);

  match s.try_begin(marker(user, t0())).await.unwrap() {
    BeginOutcome::Existing(record) => {
      assert!(record.is_processing());
      assert_eq!(record.fingerprint, "abc");
    }
    BeginOutcome::Claimed => panic!("key claimed twice"),
  }
}

#[tokio::test]
async fn completed_response_is_returned_to_later_claims() {
  let s = store().await;
  let user = Uuid::new_v4();
  s.try_begin(marker(user, t0())).await.unwrap();
  let response = StoredResponse { status_code: 201, body: json!({ "session_id": "x" }) };
  s.complete(key(user), response.clone(), t0() + Duration::hours(24)).await.unwrap();

  // Well past the processing lease, the response is still replayed.
  let later = t0() + Duration::hours(1);
  let BeginOutcome::Existing(record) = s.try_begin(marker(user, later)).await.unwrap() else {
    panic!("expected existing record");
  };
  assert!(!record.is_processing());
  assert_eq!(record.response, Some(response));
  assert_eq!(record.expires_at, t0() + Duration::hours(24));
}

#[tokio::test]
async fn abandoned_marker_lapses_after_its_lease() {
  let s = store().await;
  let user = Uuid::new_v4();
  s.try_begin(marker(user, t0())).await.unwrap();

  let soon = t0() + Duration::minutes(1);
  assert!(matches!(s.try_begin(marker(user, soon)).await.unwrap(), BeginOutcome::Existing(_)));

  let after_lease = t0() + Duration::minutes(2);
  assert_eq!(s.try_begin(marker(user, after_lease)).await.unwrap(), BeginOutcome::Claimed);
}

#[tokio::test]
async fn expired_record_is_replaced_on_claim() {
  let s = store().await;
  let user = Uuid::new_v4();
  s.try_begin(marker(user, t0())).await.unwrap();

  let later = t0() + Duration::hours(25);
  assert_eq!(s.try_begin(marker(user, later)).await.unwrap(), BeginOutcome::Claimed);
  let record = s.get_record(key(user)).await.unwrap().unwrap();
  assert_eq!(record.created_at, later);
}

#[tokio::test]
async fn release_frees_processing_marker_only() {
  let s = store().await;
  let user = Uuid::new_v4();
  s.try_begin(marker(user, t0())).await.unwrap();
  s.release(key(user)).await.unwrap();
  assert!(s.get_record(key(user)).await.unwrap().is_none());

  s.try_begin(marker(user, t0())).await.unwrap();
  s.complete(
    key(user),
    StoredResponse { status_code: 200, body: json!(null) },
    t0() + Duration::hours(24),
  )
  .await
    .unwrap();
  s.release(key(user)).await.unwrap();
  assert!(s.get_record(key(user)).await.unwrap().is_some());
}

#[tokio::test]
async fn complete_without_claim_is_an_error() {
  let s = store().await;
  let err = s
    .complete(
      key(Uuid::new_v4()),
      StoredResponse { status_code: 200, body: json!({}) },
      t0() + Duration::hours(24),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, Error::IdempotencyKeyNotFound(_)));
}

#[tokio::test]
async fn purge_removes_only_expired_records() {
  let s = store().await;
  s.try_begin(marker(Uuid::new_v4(), t0())).await.unwrap();
  s.try_begin(marker(Uuid::new_v4(), t0() + Duration::hours(2))).await.unwrap();

  let removed = s.purge_expired(t0() + Duration::hours(1)).await.unwrap();
  assert_eq!(removed, 1);
}

// ─── Rate limiting ───────────────────────────────────────────────────────────

#[tokio::test]
async fn hits_accumulate_within_window_then_reset() {
  let s = store().await;
  let key = RateLimitKey { subject: "user-1".into(), endpoint: "start".into() };
  let window = Duration::seconds(60);

  for expected in 1..=3 {
    let w = s.hit(key.clone(), t0() + Duration::seconds(expected), window).await.unwrap();
    assert_eq!(w.count, expected as u64);
    assert_eq!(w.window_start, t0() + Duration::seconds(1));
  }

  let later = t0() + Duration::seconds(61);
  let w = s.hit(key.clone(), later, window).await.unwrap();
  assert_eq!(w.count, 1);
  assert_eq!(w.window_start, later);
  assert_eq!(w.window_end, later + window);
}

#[tokio::test]
async fn windows_are_per_endpoint() {
  let s = store().await;
  let a = RateLimitKey { subject: "user-1".into(), endpoint: "start".into() };
  let b = RateLimitKey { subject: "user-1".into(), endpoint: "selfie".into() };
  s.hit(a.clone(), t0(), Duration::seconds(60)).await.unwrap();
  s.hit(a, t0(), Duration::seconds(60)).await.unwrap();
  let w = s.hit(b, t0(), Duration::seconds(60)).await.unwrap();
  assert_eq!(w.count, 1);
}
