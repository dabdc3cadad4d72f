//! In-process coordination: per-session locks and cancel signals.

use std::{
  collections::HashMap,
  sync::{
    Arc,
    Mutex,
    atomic::{AtomicBool, Ordering},
  },
};

use tokio::sync::{Notify, OwnedMutexGuard};
use uuid::Uuid;

/// Serializes stage submissions per session id.
#[derive(Default)]
pub(crate) struct SessionLocks {
  inner: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
  pub(crate) async fn lock(&self, session_id: Uuid) -> OwnedMutexGuard<()> {
    let lock = {
      let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
      // Drop locks that nobody holds or waits on.
      map.retain(|id, l| *id == session_id || Arc::strong_count(l) > 1);
      map.entry(session_id).or_default().clone()
    };
    lock.lock_owned().await
  }
}

/// A one-shot cancel flag that provider calls race against.
#[derive(Default)]
pub(crate) struct CancelSignal {
  cancelled: AtomicBool,
  notify:    Notify,
}

impl CancelSignal {
  pub(crate) fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
    self.notify.notify_waiters();
  }

  pub(crate) fn is_cancelled(&self) -> bool { self.cancelled.load(Ordering::SeqCst) }

  /// Resolves once [`Self::cancel`] has been called.
  pub(crate) async fn cancelled(&self) {
    loop {
      let notified = self.notify.notified();
      if self.cancelled.load(Ordering::SeqCst) {
        return;
      }
      notified.await;
    }
  }
}

/// Cancel signals for sessions with a provider call in flight.
#[derive(Default)]
pub(crate) struct CancelRegistry {
  inner: Mutex<HashMap<Uuid, Arc<CancelSignal>>>,
}

impl CancelRegistry {
  pub(crate) fn register(&self, session_id: Uuid) -> Arc<CancelSignal> {
    let signal = Arc::new(CancelSignal::default());
    let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
    map.insert(session_id, signal.clone());
    signal
  }

  pub(crate) fn get(&self, session_id: Uuid) -> Option<Arc<CancelSignal>> {
    let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
    map.get(&session_id).cloned()
  }

  pub(crate) fn remove(&self, session_id: Uuid) {
    let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
    map.remove(&session_id);
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  #[tokio::test]
  async fn cancel_before_wait_is_not_lost() {
    let signal = CancelSignal::default();
    signal.cancel();
    tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
      .await
      .expect("signal already cancelled");
  }

  #[tokio::test]
  async fn cancel_wakes_every_waiter() {
    let signal = Arc::new(CancelSignal::default());
    let a = tokio::spawn({
      let s = signal.clone();
      async move { s.cancelled().await }
    });
    let b = tokio::spawn({
      let s = signal.clone();
      async move { s.cancelled().await }
    });
    tokio::task::yield_now().await;
    signal.cancel();
    tokio::time::timeout(Duration::from_secs(1), async {
      a.await.unwrap();
      b.await.unwrap();
    })
    .await
    .expect("both waiters woke");
  }

  #[tokio::test]
  async fn second_locker_waits_for_the_first() {
    let locks = SessionLocks::default();
    let id = Uuid::new_v4();
    let guard = locks.lock(id).await;
    let pending = tokio::time::timeout(Duration::from_millis(20), locks.lock(id)).await;
    assert!(pending.is_err());
    drop(guard);
    tokio::time::timeout(Duration::from_millis(100), locks.lock(id))
      .await
      .expect("lock released");
  }
}
