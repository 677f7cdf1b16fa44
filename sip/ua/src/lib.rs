//! # softsip user agent core
//!
//! The dialog and transaction machinery of a SIP (RFC 3261) user
//! agent: INVITE-initiated sessions, in-dialog requests (BYE,
//! re-INVITE, ACK), call transfer via REFER (RFC 3515) and call
//! replacement via Replaces (RFC 3891).
//!
//! Notable types:
//!
//! - [`Stack`] the coordinator, owns the dialog registry and routes
//!   every message delivered by the transport adapter
//! - [`DialogHandle`] a live dialog: accept/reject, bye, transfer
//! - [`Transport`] the seam to the byte-level transport, implemented
//!   outside this crate
//!
//! Each dialog is one automaton: dialog-level and transaction-level
//! state are fused, so a transition and its timer bookkeeping happen
//! atomically. Dialog events are serialised through a per-dialog
//! mailbox; dialogs run in parallel with each other.
//!
//! Byte-level transports, SDP negotiation and registration are out of
//! scope; bodies pass through opaquely.

pub mod config;
pub mod dialog;
pub mod refer;
pub mod select;
pub mod transport;

mod error;
mod ident;
mod metrics;
mod registry;
mod stack;
mod timer;

pub use config::{Config, EndpointConfig, TimerDefaults, TransportConfig};
pub use dialog::{
    Body, BodyEvent, DialogHandle, DialogKey, DialogState, ObserverKey, Role, TerminateReason,
};
pub use error::{Error, Result};
pub use ident::IdentifierService;
pub use metrics::MetricsSnapshot;
pub use refer::{ReferDirection, ReferProgress, ReferSubscription};
pub use stack::{
    IncomingDialogHandler, IncomingInvite, IncomingRefer, IncomingReferHandler, InviteOptions,
    Stack,
};
pub use timer::TimerKind;
pub use transport::{ReceivedMessage, Transport, TransportType};
