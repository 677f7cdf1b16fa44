//! RFC 3261 timers owned by a dialog.
//!
//! Every armed timer is a spawned sleep that posts a
//! [`TimerKind`] event into the owning dialog's mailbox. The dialog
//! holds the abort handles, cancelling is aborting the sleep. Stale
//! events that were already queued when a timer got cancelled are
//! dropped by the state machine (the `(state, timer)` pair no longer
//! has an edge).

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub(crate) mod consts {
    use std::time::Duration;

    /// Round-trip time estimate
    pub(crate) const T1: Duration = Duration::from_millis(500);
    /// Maximum retransmit interval for non-INVITE requests
    pub(crate) const T2: Duration = Duration::from_secs(4);
    /// Maximum duration a message can stay in the network
    pub(crate) const T4: Duration = Duration::from_secs(5);

    /// Absorb window for duplicate 2xx/ACK
    pub(crate) const TIMER_D: Duration = Duration::from_secs(32);
    /// UAS ACK absorb
    pub(crate) const TIMER_I: Duration = T4;
    /// Non-INVITE client absorb
    pub(crate) const TIMER_K: Duration = T4;

    pub(crate) const RFC3261_BRANCH_PREFIX: &str = "z9hG4bK";
}

/// Identity of an armed timer inside a dialog.
///
/// One timer per kind; re-arming a kind replaces the previous sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// INVITE retransmit (UDP only), doubling interval
    A,
    /// INVITE client timeout
    B,
    /// Duplicate 2xx/ACK absorb at the UAC
    D,
    /// Non-INVITE retransmit (UDP only), doubling interval, capped at T2
    E,
    /// Non-INVITE timeout
    F,
    /// UAS INVITE response retransmit (UDP only)
    G,
    /// ACK wait at the UAS
    H,
    /// UAS ACK absorb
    I,
    /// Non-INVITE UAS absorb
    J,
    /// Non-INVITE client absorb
    K,
    /// REFER subscription lifetime, keyed by subscription id
    ReferExpiry(u32),
    /// Randomised re-INVITE retry after a 491
    GlareRetry,
}

pub(crate) struct Timers<E> {
    armed: HashMap<TimerKind, AbortHandle>,
    make_event: fn(TimerKind) -> E,
}

impl<E: Send + 'static> Timers<E> {
    pub(crate) fn new(make_event: fn(TimerKind) -> E) -> Self {
        Self {
            armed: HashMap::new(),
            make_event,
        }
    }

    /// Arm `kind` to fire after `duration`. An already armed timer of
    /// the same kind is cancelled first.
    pub(crate) fn arm(
        &mut self,
        kind: TimerKind,
        duration: Duration,
        mailbox: &mpsc::UnboundedSender<E>,
    ) {
        self.cancel(kind);

        let mailbox = mailbox.clone();
        let make_event = self.make_event;

        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = mailbox.send(make_event(kind));
        });

        self.armed.insert(kind, task.abort_handle());
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        if let Some(handle) = self.armed.remove(&kind) {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Cancel every live timer, part of the terminal-state contract
    pub(crate) fn cancel_all(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.abort();
        }
    }

    /// Abort handles of all armed refer expiry timers
    pub(crate) fn cancel_refer(&mut self, subscription_id: u32) {
        self.cancel(TimerKind::ReferExpiry(subscription_id));
    }
}

impl<E> Drop for Timers<E> {
    fn drop(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn fires_into_mailbox() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(std::convert::identity);

        timers.arm(TimerKind::B, Duration::from_secs(32), &tx);

        tokio::time::advance(Duration::from_secs(33)).await;

        assert_eq!(rx.recv().await, Some(TimerKind::B));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(std::convert::identity);

        timers.arm(TimerKind::A, Duration::from_millis(500), &tx);
        timers.cancel(TimerKind::A);

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        assert!(rx.try_recv().is_err());
        assert!(!timers.is_armed(TimerKind::A));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(std::convert::identity);

        timers.arm(TimerKind::A, Duration::from_millis(500), &tx);
        timers.arm(TimerKind::A, Duration::from_millis(1000), &tx);

        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(rx.recv().await, Some(TimerKind::A));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_silences_everything() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(std::convert::identity);

        timers.arm(TimerKind::A, Duration::from_millis(500), &tx);
        timers.arm(TimerKind::B, Duration::from_secs(32), &tx);
        timers.arm(TimerKind::ReferExpiry(3), Duration::from_secs(60), &tx);

        timers.cancel_all();

        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;

        assert!(rx.try_recv().is_err());
    }
}
