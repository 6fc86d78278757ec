//! The two independent critical sections guarding session state.
//!
//! *Notification mutex* (`NotificationQueue`) and *state mutex*
//! (`StateCell`) are deliberately separate types so nothing in this crate
//! can accidentally nest them. Both pair a `tokio::sync::Mutex` with a
//! `tokio::sync::Notify`, the async equivalent of a raw mutex/condvar pair.

use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, timeout};

use crate::error::{CoreError, Result};
use crate::model::{Notification, NotificationKind, State};

/// Per-waiter bookkeeping: which notification ids this
/// waiter has already matched-and-consumed. Unlike a single monotonic
/// high-water mark, this lets a wait call skip past notifications it has
/// already claimed without hiding *unmatched* ones from whatever the same
/// waiter asks for next — e.g. a DATA-channel OFFER delivered alongside (or
/// before) the CTRL-channel ACCEPT that an earlier wait consumed must still
/// be visible to the later `punch_hole(DATA)` call.
pub type Cursor = HashSet<u64>;

/// Append-only notification log with a stable per-entry id (an arena + index
/// in place of a linked list). Notifications are never physically removed —
/// `clear` tombstones an id instead of shifting the vector — so `id` always
/// equals its position and stays stable across clears.
#[derive(Default)]
pub struct NotificationQueue {
    items: Mutex<Vec<Notification>>,
    cleared: Mutex<HashSet<u64>>,
    notify: Notify,
}

impl NotificationQueue {
    pub fn new() -> Self {
        NotificationQueue {
            items: Mutex::new(Vec::new()),
            cleared: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    /// Push worker side: insert a new notification and wake all waiters.
    pub async fn push(&self, kind: NotificationKind, json: serde_json::Value, raw: Vec<u8>) -> u64 {
        let mut items = self.items.lock().await;
        let id = items.len() as u64;
        items.push(Notification { id, kind, json, raw });
        drop(items);
        self.notify.notify_waiters();
        id
    }

    /// Remove a specific notification by id. Tombstones the id rather than
    /// shifting the backing vector, so `id`s already handed to callers (and
    /// used as scan positions) stay valid.
    pub async fn clear(&self, id: u64) {
        self.cleared.lock().await.insert(id);
    }

    /// Every live (non-cleared) notification, oldest first.
    async fn visible(&self) -> Vec<Notification> {
        let items = self.items.lock().await;
        let cleared = self.cleared.lock().await;
        items.iter().filter(|n| !cleared.contains(&n.id)).cloned().collect()
    }

    /// Wait until `check` returns `Some` for some notification this `cursor`
    /// hasn't already claimed. The matched notification's id is recorded in
    /// `cursor` so it won't satisfy a later wait on the same cursor again;
    /// every other notification — matched by `check` or not — remains
    /// visible to later calls, so out-of-order delivery of unrelated
    /// notifications is tolerated.
    ///
    /// Registers interest in `notify` *before* scanning so a `push()` that
    /// lands between the scan and the subsequent wait is never missed —
    /// `Notify::notified()`'s returned future only starts listening once
    /// `enable()`/first poll runs, so that call must happen up front, not
    /// after we've already decided there's nothing new.
    pub async fn wait_for<T>(
        &self,
        cursor: &mut Cursor,
        bound: Duration,
        what: &str,
        mut check: impl FnMut(&Notification) -> Option<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + bound;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            for n in self.visible().await {
                if cursor.contains(&n.id) {
                    continue;
                }
                if let Some(v) = check(&n) {
                    cursor.insert(n.id);
                    return Ok(v);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::Timeout(what.to_owned()));
            }
            let _ = timeout(remaining, notified).await;
        }
    }

    /// Wait until *both* `check_a` and `check_b` have matched some
    /// notification each (not necessarily the same one) — used by
    /// `create_session`/`start_session`, which each need two independent
    /// conditions satisfied under one bound. Same claim-on-match semantics
    /// as `wait_for`.
    pub async fn wait_for_pair<A, B>(
        &self,
        cursor: &mut Cursor,
        bound: Duration,
        what: &str,
        mut check_a: impl FnMut(&Notification) -> Option<A>,
        mut check_b: impl FnMut(&Notification) -> Option<B>,
    ) -> Result<(A, B)> {
        let deadline = Instant::now() + bound;
        let mut a: Option<(u64, A)> = None;
        let mut b: Option<(u64, B)> = None;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            for n in self.visible().await {
                if cursor.contains(&n.id) {
                    continue;
                }
                let already_a = a.as_ref().is_some_and(|(id, _)| *id == n.id);
                if a.is_none() {
                    if let Some(v) = check_a(&n) {
                        a = Some((n.id, v));
                    }
                }
                if b.is_none() && !already_a {
                    if let Some(v) = check_b(&n) {
                        b = Some((n.id, v));
                    }
                }
            }
            if a.is_some() && b.is_some() {
                let (aid, av) = a.take().unwrap();
                let (bid, bv) = b.take().unwrap();
                cursor.insert(aid);
                cursor.insert(bid);
                return Ok((av, bv));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::Timeout(what.to_owned()));
            }
            let _ = timeout(remaining, notified).await;
        }
    }
}

/// Progress-bit state. The lock is held only for the duration of a
/// read/modify/signal, never across I/O.
#[derive(Default)]
pub struct StateCell {
    bits: Mutex<State>,
    notify: Notify,
}

impl StateCell {
    pub fn new() -> Self {
        StateCell {
            bits: Mutex::new(State::INIT),
            notify: Notify::new(),
        }
    }

    /// OR the given bits into the state (bits accumulate, never clear)
    /// and wake waiters.
    pub async fn set(&self, bit: State) {
        let mut bits = self.bits.lock().await;
        *bits |= bit;
        drop(bits);
        self.notify.notify_waiters();
    }

    pub async fn get(&self) -> State {
        *self.bits.lock().await
    }

    pub async fn contains(&self, bit: State) -> bool {
        self.bits.lock().await.contains(bit)
    }

    /// Wait until `bit` is set, bounded by `bound`. Same enable-before-check
    /// ordering as `NotificationQueue::wait_for`, for the same reason.
    pub async fn wait_for(&self, bit: State, bound: Duration, what: &str) -> Result<()> {
        let deadline = Instant::now() + bound;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.contains(bit).await {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::Timeout(what.to_owned()));
            }
            let _ = timeout(remaining, notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unmatched_notifications_stay_visible_to_a_later_differently_predicated_wait() {
        // Regression test: a batch that mixes a non-matching notification
        // with the one a wait is looking for must not hide the non-matching
        // one from a later wait on the same cursor.
        let q = NotificationQueue::new();
        q.push(NotificationKind::MemberCreated, json!({"tag": "data-offer"}), vec![]).await;
        q.push(NotificationKind::MemberCreated, json!({"tag": "ctrl-accept"}), vec![]).await;

        let mut cursor = Cursor::new();
        let got = q
            .wait_for(&mut cursor, Duration::from_secs(1), "ctrl accept", |n| {
                (n.json["tag"] == "ctrl-accept").then_some(())
            })
            .await;
        assert!(got.is_ok());

        // The data-offer notification, scanned-but-unmatched during the wait
        // above, must still be visible now.
        let got2 = q
            .wait_for(&mut cursor, Duration::from_secs(1), "data offer", |n| {
                (n.json["tag"] == "data-offer").then_some(())
            })
            .await;
        assert!(got2.is_ok());
    }

    #[tokio::test]
    async fn wait_for_does_not_rematch_an_already_claimed_notification() {
        let q = NotificationQueue::new();
        q.push(NotificationKind::SessionCreated, json!({}), vec![]).await;
        let mut cursor = Cursor::new();
        q.wait_for(&mut cursor, Duration::from_secs(1), "first", |n| {
            (n.kind == NotificationKind::SessionCreated).then_some(())
        })
        .await
        .unwrap();

        let got = q
            .wait_for(&mut cursor, Duration::from_millis(20), "second", |n| {
                (n.kind == NotificationKind::SessionCreated).then_some(())
            })
            .await;
        assert!(matches!(got, Err(CoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn clear_removes_only_the_named_notification() {
        let q = NotificationQueue::new();
        let id0 = q.push(NotificationKind::SessionCreated, json!({}), vec![]).await;
        let id1 = q.push(NotificationKind::MemberCreated, json!({}), vec![]).await;

        q.clear(id0).await;
        let remaining = q.visible().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, id1);
    }

    #[tokio::test]
    async fn clear_does_not_shift_surviving_ids() {
        // Regression test: clearing an earlier id must not change the id (or
        // position) of notifications pushed after it.
        let q = NotificationQueue::new();
        let id0 = q.push(NotificationKind::SessionCreated, json!({}), vec![]).await;
        let id1 = q.push(NotificationKind::MemberCreated, json!({}), vec![]).await;
        q.clear(id0).await;
        let id2 = q.push(NotificationKind::MemberDeleted, json!({}), vec![]).await;

        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        let remaining = q.visible().await;
        assert_eq!(remaining.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn wait_for_returns_already_present_match_immediately() {
        let q = NotificationQueue::new();
        q.push(NotificationKind::SessionCreated, json!({}), vec![]).await;
        let mut cursor = Cursor::new();
        let got = q
            .wait_for(&mut cursor, Duration::from_secs(1), "session created", |n| {
                (n.kind == NotificationKind::SessionCreated).then_some(())
            })
            .await;
        assert!(got.is_ok());
    }

    #[tokio::test]
    async fn wait_for_times_out_when_nothing_matches() {
        let q = NotificationQueue::new();
        let mut cursor = Cursor::new();
        let got = q
            .wait_for(&mut cursor, Duration::from_millis(20), "never happens", |_| None::<()>)
            .await;
        assert!(matches!(got, Err(CoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn wait_for_pair_requires_both_conditions() {
        let q = std::sync::Arc::new(NotificationQueue::new());
        q.push(NotificationKind::SessionCreated, json!({}), vec![]).await;

        let q2 = q.clone();
        let handle = tokio::spawn(async move {
            let mut cursor = Cursor::new();
            q2.wait_for_pair(
                &mut cursor,
                Duration::from_secs(1),
                "pair",
                |n| (n.kind == NotificationKind::SessionCreated).then_some(()),
                |n| (n.kind == NotificationKind::MemberCreated).then_some(()),
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(NotificationKind::MemberCreated, json!({}), vec![]).await;

        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn state_cell_set_is_monotonic_and_observable() {
        let cell = StateCell::new();
        assert!(cell.contains(State::INIT).await);
        cell.set(State::WS_OPEN).await;
        assert!(cell.contains(State::INIT).await);
        assert!(cell.contains(State::WS_OPEN).await);
        assert!(!cell.contains(State::CREATED).await);
    }

    #[tokio::test]
    async fn state_cell_wait_for_unblocks_once_bit_is_set() {
        let cell = std::sync::Arc::new(StateCell::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_for(State::CREATED, Duration::from_secs(1), "created").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cell.set(State::CREATED).await;
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn state_cell_wait_for_times_out() {
        let cell = StateCell::new();
        let got = cell.wait_for(State::STARTED, Duration::from_millis(20), "started").await;
        assert!(matches!(got, Err(CoreError::Timeout(_))));
    }
}
