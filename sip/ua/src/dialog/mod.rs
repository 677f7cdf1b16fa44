//! Dialogs and their public handle.
//!
//! A dialog runs as a single task consuming a mailbox; everything the
//! handle does is posted as a command into that mailbox, so all events
//! of one dialog are observed in a total order. Handles are cheap to
//! clone and stay valid after termination (operations then fail with
//! [`Error::DialogTerminated`]).

use crate::error::{Error, Result};
use crate::timer::TimerKind;
use bytes::Bytes;
use bytesstr::BytesStr;
use parking_lot::{Mutex, RwLock};
use sip_types::StatusCode;
use sip_types::header::typed::Replaces;
use sip_types::uri::NameAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32};
use tokio::sync::{mpsc, oneshot, watch};

pub mod key;
pub(crate) mod machine;
pub(crate) mod observer;
pub(crate) mod state;

pub use key::DialogKey;
pub use observer::{BodyEvent, ObserverKey, TerminateReason};
pub use state::DialogState;

use crate::refer::ReferProgress;
use crate::transport::IncomingMessage;
use observer::Observers;

/// Which side of the initial INVITE this dialog is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Uac,
    Uas,
}

/// A message body with its content type
#[derive(Debug, Clone)]
pub struct Body {
    pub content_type: BytesStr,
    pub data: Bytes,
}

impl Body {
    pub fn new<C: Into<BytesStr>, D: Into<Bytes>>(content_type: C, data: D) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

/// What failed, kept for late waiters after the dialog left the happy
/// path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureKind {
    Timeout,
    Cancelled,
    Transport,
    Rejected(u16),
    PeerGone,
}

impl FailureKind {
    pub(crate) fn to_error(self) -> Error {
        match self {
            Self::Timeout => Error::TransactionTimeout,
            Self::Cancelled => Error::Cancelled,
            Self::Transport => {
                Error::Transport(std::io::Error::other("transport adapter reported failure"))
            }
            // the peer declined; the dialog is gone, details are on the
            // terminate observer
            Self::Rejected(_) | Self::PeerGone => Error::DialogTerminated,
        }
    }
}

/// Events consumed by the dialog task
pub(crate) enum DialogEvent {
    Message(Box<IncomingMessage>),
    Timer(TimerKind),
    Command(Command),
    TransportError,
}

pub(crate) type Waiter = oneshot::Sender<Result<()>>;

pub(crate) enum Command {
    SendInvite {
        body: Option<Body>,
        /// RFC 3891: this INVITE supplants an existing dialog at the
        /// peer
        replaces: Option<Replaces>,
    },
    Ring,
    Accept {
        body: Option<Body>,
        done: Waiter,
    },
    Reject {
        code: StatusCode,
        done: Waiter,
    },
    Cancel {
        done: Waiter,
    },
    Bye {
        done: Waiter,
    },
    ReInvite {
        body: Option<Body>,
        done: Waiter,
    },
    Refer {
        target: NameAddr,
        replaces: Option<Replaces>,
        done: Waiter,
    },
    AcceptRefer {
        id: u32,
    },
    ReferProgress {
        id: u32,
        status: StatusCode,
    },
    /// This dialog is being supplanted (RFC 3891); send BYE and die
    Replaced,
    Close,
}

/// State shared between the dialog task, its handle and the registry
pub(crate) struct DialogShared {
    pub(crate) key: RwLock<DialogKey>,
    pub(crate) role: Role,
    pub(crate) local_seq: AtomicU32,
    pub(crate) mailbox: mpsc::UnboundedSender<DialogEvent>,
    pub(crate) state_tx: watch::Sender<DialogState>,
    pub(crate) failure: Mutex<Option<FailureKind>>,
    pub(crate) observers: Observers,
    pub(crate) closed: AtomicBool,
}

impl DialogShared {
    pub(crate) fn post(&self, event: DialogEvent) {
        // the task may already be gone, termination races are fine
        let _ = self.mailbox.send(event);
    }
}

/// Cheap-to-clone handle to a live dialog
#[derive(Clone)]
pub struct DialogHandle {
    pub(crate) shared: Arc<DialogShared>,
}

impl std::fmt::Debug for DialogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogHandle")
            .field("key", &*self.shared.key.read())
            .field("state", &self.state())
            .finish()
    }
}

impl DialogHandle {
    /// The dialog key; the remote tag appears once the first tagged
    /// response arrived
    pub fn key(&self) -> DialogKey {
        self.shared.key.read().clone()
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> DialogState {
        *self.shared.state_tx.borrow()
    }

    /// Wait until the dialog is established.
    ///
    /// Resolves with an error once the dialog fails or terminates
    /// instead. Dropping the future detaches the wait without touching
    /// the dialog; to abandon the call itself use [`cancel`].
    ///
    /// [`cancel`]: DialogHandle::cancel
    pub async fn wait_established(&self) -> Result<()> {
        let mut rx = self.shared.state_tx.subscribe();

        loop {
            let state = *rx.borrow_and_update();

            if state.is_established() {
                return Ok(());
            }

            if matches!(state, DialogState::Failed | DialogState::Terminated) {
                return Err(self.stored_error());
            }

            if rx.changed().await.is_err() {
                return Err(self.stored_error());
            }
        }
    }

    /// Wait for the dialog to reach `Terminated`
    pub async fn wait_terminated(&self) {
        let mut rx = self.shared.state_tx.subscribe();

        loop {
            if rx.borrow_and_update().is_terminal() {
                return;
            }

            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn stored_error(&self) -> Error {
        self.shared
            .failure
            .lock()
            .map(FailureKind::to_error)
            .unwrap_or(Error::DialogTerminated)
    }

    async fn command(&self, make: impl FnOnce(Waiter) -> Command) -> Result<()> {
        let (done, rx) = oneshot::channel();

        self.shared.post(DialogEvent::Command(make(done)));

        rx.await.unwrap_or(Err(Error::DialogTerminated))
    }

    /// Send a 180 Ringing for the pending incoming INVITE
    pub fn ring(&self) {
        self.shared.post(DialogEvent::Command(Command::Ring));
    }

    /// Accept the pending incoming INVITE with a 2xx
    pub async fn accept(&self, body: Option<Body>) -> Result<()> {
        self.command(|done| Command::Accept { body, done }).await
    }

    /// Reject the pending incoming INVITE
    pub async fn reject(&self, code: StatusCode) -> Result<()> {
        self.command(|done| Command::Reject { code, done }).await
    }

    /// Abandon an outgoing INVITE that has not been answered yet
    pub async fn cancel(&self) -> Result<()> {
        self.command(|done| Command::Cancel { done }).await
    }

    /// Terminate an established dialog, resolves when the BYE
    /// transaction finished
    pub async fn bye(&self) -> Result<()> {
        self.command(|done| Command::Bye { done }).await
    }

    /// Send a re-INVITE (session refresh / target update). A 491 glare
    /// answer is retried automatically with the RFC 3261 §14.1
    /// back-off.
    pub async fn reinvite(&self, body: Option<Body>) -> Result<()> {
        self.command(|done| Command::ReInvite { body, done }).await
    }

    /// Blind transfer: ask the peer to call `target` (RFC 3515).
    /// Resolves once the REFER was accepted with a 202; transfer
    /// progress arrives via [`on_refer_progress`].
    ///
    /// [`on_refer_progress`]: DialogHandle::on_refer_progress
    pub async fn refer(&self, target: NameAddr) -> Result<()> {
        self.command(|done| Command::Refer {
            target,
            replaces: None,
            done,
        })
        .await
    }

    /// Attended transfer: like [`refer`](DialogHandle::refer) but the
    /// target INVITE will carry a Replaces header for the given dialog
    pub async fn refer_with_replaces(
        &self,
        target: NameAddr,
        replaces: Replaces,
    ) -> Result<()> {
        self.command(|done| Command::Refer {
            target,
            replaces: Some(replaces),
            done,
        })
        .await
    }

    /// Report that the transfer requested by the peer is being
    /// attempted (sends no NOTIFY by itself)
    pub fn accept_refer(&self, id: u32) {
        self.shared
            .post(DialogEvent::Command(Command::AcceptRefer { id }));
    }

    /// Report transfer progress to the REFER sender with a NOTIFY; a
    /// final status closes the subscription
    pub fn refer_progress(&self, id: u32, status: StatusCode) {
        self.shared
            .post(DialogEvent::Command(Command::ReferProgress { id, status }));
    }

    /// Hard, idempotent teardown: cancel all timers, complete waiters,
    /// deregister and fire the terminate observer
    pub fn close(&self) {
        self.shared.post(DialogEvent::Command(Command::Close));
    }

    pub fn on_state_change<F>(&self, f: F) -> ObserverKey
    where
        F: Fn(DialogState, DialogState) + Send + Sync + 'static,
    {
        self.shared.observers.add_state(f)
    }

    pub fn on_body<F>(&self, f: F) -> ObserverKey
    where
        F: Fn(&BodyEvent) + Send + Sync + 'static,
    {
        self.shared.observers.add_body(f)
    }

    pub fn on_terminated<F>(&self, f: F) -> ObserverKey
    where
        F: Fn(TerminateReason) + Send + Sync + 'static,
    {
        self.shared.observers.add_terminate(f)
    }

    pub fn on_refer_progress<F>(&self, f: F) -> ObserverKey
    where
        F: Fn(ReferProgress) + Send + Sync + 'static,
    {
        self.shared.observers.add_refer_progress(f)
    }

    pub fn remove_observer(&self, key: ObserverKey) {
        self.shared.observers.remove(key);
    }
}
