//! Per-dialog observer registrations.
//!
//! Observers live in slot maps behind short-lived locks. Dispatch
//! snapshots the registered callbacks under the lock and invokes them
//! after releasing it, each behind a panic boundary: a panicking
//! observer is logged and never poisons the dialog.

use crate::dialog::state::DialogState;
use bytes::Bytes;
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_types::Method;
use slotmap::{DefaultKey, SlotMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Why a dialog reached `Terminated`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// We sent BYE
    LocalBye,
    /// The peer sent BYE
    PeerBye,
    /// The INVITE was rejected with this status
    Rejected(u16),
    /// Timer B, F or H fired
    Timeout,
    /// CANCEL, ours or the peer's
    Cancelled,
    /// Supplanted through an INVITE with Replaces
    Replaced,
    /// The peer answered 481, it no longer knows the dialog
    PeerGone,
    /// The transport adapter failed
    TransportFailed,
    /// Local close or stack shutdown
    Closed,
}

/// A message body delivered inside the dialog
#[derive(Debug, Clone)]
pub struct BodyEvent {
    pub method: Method,
    pub content_type: Option<BytesStr>,
    pub body: Bytes,
}

/// Transfer progress reported by a NOTIFY of an outgoing REFER
pub use crate::refer::ReferProgress;

type StateFn = dyn Fn(DialogState, DialogState) + Send + Sync;
type BodyFn = dyn Fn(&BodyEvent) + Send + Sync;
type TerminateFn = dyn Fn(TerminateReason) + Send + Sync;
type ReferProgressFn = dyn Fn(ReferProgress) + Send + Sync;

/// Handle to a registered observer, pass to
/// [`Observers::remove`] to unregister
#[derive(Debug, Clone, Copy)]
pub struct ObserverKey {
    kind: ObserverKind,
    key: DefaultKey,
}

#[derive(Debug, Clone, Copy)]
enum ObserverKind {
    State,
    Body,
    Terminate,
    ReferProgress,
}

#[derive(Default)]
pub(crate) struct Observers {
    state: Mutex<SlotMap<DefaultKey, Arc<StateFn>>>,
    body: Mutex<SlotMap<DefaultKey, Arc<BodyFn>>>,
    terminate: Mutex<SlotMap<DefaultKey, Arc<TerminateFn>>>,
    refer_progress: Mutex<SlotMap<DefaultKey, Arc<ReferProgressFn>>>,
}

impl Observers {
    pub(crate) fn add_state<F>(&self, f: F) -> ObserverKey
    where
        F: Fn(DialogState, DialogState) + Send + Sync + 'static,
    {
        ObserverKey {
            kind: ObserverKind::State,
            key: self.state.lock().insert(Arc::new(f)),
        }
    }

    pub(crate) fn add_body<F>(&self, f: F) -> ObserverKey
    where
        F: Fn(&BodyEvent) + Send + Sync + 'static,
    {
        ObserverKey {
            kind: ObserverKind::Body,
            key: self.body.lock().insert(Arc::new(f)),
        }
    }

    pub(crate) fn add_terminate<F>(&self, f: F) -> ObserverKey
    where
        F: Fn(TerminateReason) + Send + Sync + 'static,
    {
        ObserverKey {
            kind: ObserverKind::Terminate,
            key: self.terminate.lock().insert(Arc::new(f)),
        }
    }

    pub(crate) fn add_refer_progress<F>(&self, f: F) -> ObserverKey
    where
        F: Fn(ReferProgress) + Send + Sync + 'static,
    {
        ObserverKey {
            kind: ObserverKind::ReferProgress,
            key: self.refer_progress.lock().insert(Arc::new(f)),
        }
    }

    pub(crate) fn remove(&self, key: ObserverKey) {
        match key.kind {
            ObserverKind::State => {
                self.state.lock().remove(key.key);
            }
            ObserverKind::Body => {
                self.body.lock().remove(key.key);
            }
            ObserverKind::Terminate => {
                self.terminate.lock().remove(key.key);
            }
            ObserverKind::ReferProgress => {
                self.refer_progress.lock().remove(key.key);
            }
        }
    }

    pub(crate) fn fire_state(&self, old: DialogState, new: DialogState) {
        let snapshot: Vec<_> = self.state.lock().values().cloned().collect();

        for observer in snapshot {
            guarded("state", || observer(old, new));
        }
    }

    pub(crate) fn fire_body(&self, event: &BodyEvent) {
        let snapshot: Vec<_> = self.body.lock().values().cloned().collect();

        for observer in snapshot {
            guarded("body", || observer(event));
        }
    }

    pub(crate) fn fire_terminate(&self, reason: TerminateReason) {
        let snapshot: Vec<_> = self.terminate.lock().values().cloned().collect();

        for observer in snapshot {
            guarded("terminate", || observer(reason));
        }
    }

    pub(crate) fn fire_refer_progress(&self, progress: ReferProgress) {
        let snapshot: Vec<_> = self.refer_progress.lock().values().cloned().collect();

        for observer in snapshot {
            guarded("refer-progress", || observer(progress));
        }
    }
}

fn guarded<F: FnOnce()>(kind: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("{kind} observer panicked, dialog continues");
    }
}
