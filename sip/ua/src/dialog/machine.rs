//! The dialog task: single consumer of the dialog mailbox.
//!
//! Classifies every incoming message into an automaton event, runs the
//! transition and interprets the resulting actions with the context it
//! exclusively owns: pending transactions, armed timers, stored
//! responses, refer subscriptions. Nothing here is shared; the handle
//! talks to this task exclusively through the mailbox.

use super::key::DialogKey;
use super::observer::TerminateReason;
use super::state::{Action, DialogState, Event, Outcome, transition};
use super::{Body, Command, DialogEvent, DialogHandle, DialogShared, FailureKind, Role, Waiter};
use crate::config::TimerDefaults;
use crate::error::Error;
use crate::refer::{
    ReferDirection, ReferProgress, ReferSubscription, SIPFRAG_CONTENT_TYPE, is_sipfrag,
    parse_sipfrag, sipfrag_body,
};
use crate::stack::StackInner;
use crate::timer::{TimerKind, Timers, consts};
use crate::transport::IncomingMessage;
use bytes::Bytes;
use bytesstr::BytesStr;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use sip_types::StatusCode as Code;
use sip_types::header::typed::{
    CSeq, CallId, Contact, Event as EventHeader, From, RecordRoute, ReferTo, Replaces, Route,
    SubState, SubscriptionState, To, Via,
};
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{
    CodeKind, Headers, MessageLine, Method, Name, Request, RequestLine, Response, StatusCode,
    StatusLine,
};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

/// Everything needed to bring a dialog task to life
pub(crate) struct DialogSeed {
    pub(crate) stack: std::sync::Weak<StackInner>,
    pub(crate) role: Role,
    pub(crate) call_id: BytesStr,
    pub(crate) local: NameAddr,
    pub(crate) local_tag: BytesStr,
    pub(crate) remote: NameAddr,
    pub(crate) remote_tag: Option<BytesStr>,
    pub(crate) remote_target: SipUri,
    pub(crate) destination: SocketAddr,
    pub(crate) timers: TimerDefaults,
    pub(crate) refer_expiry: Duration,
    pub(crate) reliable: bool,
    pub(crate) user_agent: String,
    pub(crate) branch: BytesStr,
}

/// Client INVITE transaction folded into the dialog
struct PendingInvite {
    request: Request,
    cseq: u32,
    interval: Duration,
    initial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Bye,
    Refer,
}

/// Client non-INVITE transaction (BYE / REFER)
struct PendingRequest {
    request: Request,
    cseq: u32,
    kind: RequestKind,
    interval: Duration,
}

impl PendingRequest {
    fn method(&self) -> Method {
        match self.kind {
            RequestKind::Bye => Method::BYE,
            RequestKind::Refer => Method::REFER,
        }
    }
}

/// Server INVITE context: the stored initial (or re-) INVITE and the
/// last response for retransmission
struct ServerInvite {
    invite: IncomingMessage,
    last_response: Option<Response>,
    retransmit: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ReferCtx {
    id: u32,
    status: Option<StatusCode>,
}

pub(crate) fn spawn(seed: DialogSeed) -> (DialogHandle, Arc<DialogShared>) {
    let (mailbox, rx) = mpsc::unbounded_channel();
    let (state_tx, _) = watch::channel(DialogState::Idle);

    let key = DialogKey::new(
        seed.call_id.clone(),
        seed.local_tag.clone(),
        seed.remote_tag.clone(),
    );

    let shared = Arc::new(DialogShared {
        key: RwLock::new(key.clone()),
        role: seed.role,
        local_seq: AtomicU32::new(rand::rng().random_range(1..(u32::MAX >> 1))),
        mailbox,
        state_tx,
        failure: Mutex::new(None),
        observers: Default::default(),
        closed: AtomicBool::new(false),
    });

    let machine = DialogMachine {
        stack: seed.stack,
        shared: shared.clone(),
        rx,
        state: DialogState::Idle,
        role: seed.role,
        call_id: seed.call_id,
        local: seed.local,
        local_tag: seed.local_tag,
        remote: seed.remote,
        remote_tag: seed.remote_tag,
        remote_target: seed.remote_target,
        destination: seed.destination,
        route_set: Vec::new(),
        remote_seq: None,
        backlog: BTreeMap::new(),
        timers: Timers::new(DialogEvent::Timer),
        timer_cfg: seed.timers,
        refer_expiry: seed.refer_expiry,
        reliable: seed.reliable,
        user_agent: seed.user_agent,
        initial_branch: seed.branch,
        pending_invite: None,
        last_invite: None,
        pending_request: None,
        server_invite: None,
        last_ack: None,
        reinvite_body: None,
        refer_subs: HashMap::new(),
        refer_ctx: None,
        incoming_refer: None,
        current_msg: None,
        invite_body: None,
        invite_replaces: None,
        cmd_waiter: None,
        cancelled: false,
        terminate_reason: TerminateReason::Closed,
    };

    let span = tracing::info_span!("dialog", key = %key);
    tokio::spawn(machine.run().instrument(span));

    (
        DialogHandle {
            shared: shared.clone(),
        },
        shared,
    )
}

struct DialogMachine {
    stack: std::sync::Weak<StackInner>,
    shared: Arc<DialogShared>,
    rx: mpsc::UnboundedReceiver<DialogEvent>,

    state: DialogState,
    role: Role,

    call_id: BytesStr,
    local: NameAddr,
    local_tag: BytesStr,
    remote: NameAddr,
    remote_tag: Option<BytesStr>,
    /// Request-URI for in-dialog requests, updated by re-INVITE 2xx
    remote_target: SipUri,
    destination: SocketAddr,
    /// Frozen at dialog establishment (RFC 3261 §12.1)
    route_set: Vec<Route>,

    /// Highest processed peer CSeq; `None` until the first request
    remote_seq: Option<u32>,
    /// Requests that arrived with a CSeq gap, replayed in order
    backlog: BTreeMap<u32, IncomingMessage>,

    timers: Timers<DialogEvent>,
    timer_cfg: TimerDefaults,
    refer_expiry: Duration,
    reliable: bool,
    user_agent: String,
    initial_branch: BytesStr,

    pending_invite: Option<PendingInvite>,
    /// Last INVITE after its transaction completed, kept so
    /// retransmitted final responses can still be ACKed
    last_invite: Option<(u32, Request)>,
    pending_request: Option<PendingRequest>,
    server_invite: Option<ServerInvite>,
    /// ACK of the last 2xx, kept for the Timer D window
    last_ack: Option<Request>,
    /// Body of an outgoing re-INVITE, kept for the glare retry
    reinvite_body: Option<Body>,

    refer_subs: HashMap<u32, ReferSubscription>,
    /// Subscription the current event refers to
    refer_ctx: Option<ReferCtx>,
    /// Parsed Refer-To of the REFER being processed (or the target of
    /// an outgoing one)
    incoming_refer: Option<(NameAddr, Option<Replaces>)>,

    /// Message currently being processed, target of `RespondToCurrent`
    /// and source of ACK context
    current_msg: Option<IncomingMessage>,
    /// Body staged for SendInvite / Accept
    invite_body: Option<Body>,
    /// Replaces header staged for the initial INVITE
    invite_replaces: Option<Replaces>,

    /// Waiter of the in-flight command (bye / refer / re-INVITE)
    cmd_waiter: Option<Waiter>,
    cancelled: bool,
    terminate_reason: TerminateReason,
}

impl DialogMachine {
    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;

            if self.state.is_terminal() {
                break;
            }
        }

        // the stack dropped the mailbox or we reached Terminated
        self.teardown(self.terminate_reason);
    }

    async fn handle(&mut self, event: DialogEvent) {
        match event {
            DialogEvent::Message(msg) => self.handle_message(*msg).await,
            DialogEvent::Timer(kind) => {
                self.step(Event::Timer(kind)).await;
            }
            DialogEvent::Command(command) => self.handle_command(command).await,
            DialogEvent::TransportError => {
                self.step(Event::TransactionError).await;
            }
        }
    }

    // ==== commands ====

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendInvite { body, replaces } => {
                self.invite_body = body;
                self.invite_replaces = replaces;
                self.step(Event::SendInvite).await;
            }
            Command::Ring => {
                self.step(Event::Send1xx(180)).await;
            }
            Command::Accept { body, done } => {
                self.invite_body = body;
                self.run_op(done, Event::Accept).await;
            }
            Command::Reject { code, done } => {
                self.run_op(done, Event::Reject(code.into_u16())).await;
            }
            Command::Cancel { done } => {
                self.cancelled = true;
                self.run_op(done, Event::SendCancel).await;
            }
            Command::Bye { done } => {
                if self.take_cmd_slot(done) && !self.step(Event::SendBye).await {
                    self.fail_cmd_slot();
                }
            }
            Command::ReInvite { body, done } => {
                if self.take_cmd_slot(done) {
                    self.reinvite_body = body;

                    if !self.step(Event::SendReInvite).await {
                        self.fail_cmd_slot();
                    }
                }
            }
            Command::Refer {
                target,
                replaces,
                done,
            } => {
                if self.take_cmd_slot(done) {
                    self.incoming_refer = Some((target, replaces));

                    if !self.step(Event::SendRefer).await {
                        self.fail_cmd_slot();
                    }
                }
            }
            Command::AcceptRefer { id } => {
                self.refer_ctx = Some(ReferCtx { id, status: None });
                self.step(Event::ReferAccepted).await;
            }
            Command::ReferProgress { id, status } => {
                self.handle_refer_progress_cmd(id, status).await;
            }
            Command::Replaced => {
                self.terminate_reason = TerminateReason::Replaced;
                self.step(Event::ReplaceSuccess).await;
            }
            Command::Close => {
                self.step(Event::Close).await;
            }
        }
    }

    /// Commands that resolve through `CompleteRequest*` claim the
    /// single in-flight slot first
    fn take_cmd_slot(&mut self, done: Waiter) -> bool {
        if !self.state.is_established() {
            let _ = done.send(Err(Error::DialogTerminated));
            return false;
        }

        if self.cmd_waiter.is_some() {
            let _ = done.send(Err(Error::protocol(anyhow::anyhow!(
                "another in-dialog request is still in flight"
            ))));
            return false;
        }

        self.cmd_waiter = Some(done);
        true
    }

    fn fail_cmd_slot(&mut self) {
        if let Some(done) = self.cmd_waiter.take() {
            let _ = done.send(Err(Error::protocol(anyhow::anyhow!(
                "request not allowed in state {}",
                self.state
            ))));
        }
    }

    /// Commands whose outcome is known as soon as the transition ran
    async fn run_op(&mut self, done: Waiter, event: Event) {
        let applied = self.step(event).await;

        let _ = done.send(if applied {
            Ok(())
        } else {
            Err(Error::DialogTerminated)
        });
    }

    async fn handle_refer_progress_cmd(&mut self, id: u32, status: StatusCode) {
        if !self.refer_subs.contains_key(&id) {
            log::warn!("refer progress for unknown subscription {id}");
            return;
        }

        if status.is_final() {
            self.refer_ctx = Some(ReferCtx {
                id,
                status: Some(status),
            });

            // a declined transfer in Referred is a ReferFailed, a
            // finished attempt anywhere else is ReferCompleted
            let event = if self.state == DialogState::Referred
                && status.kind() != CodeKind::Success
            {
                Event::ReferFailed
            } else {
                Event::ReferCompleted
            };

            self.step(event).await;
        } else {
            // interim progress, no state involved
            self.send_refer_notify(id, status, false).await;
        }
    }

    // ==== incoming messages ====

    async fn handle_message(&mut self, msg: IncomingMessage) {
        if !msg.body.is_empty() {
            self.shared.observers.fire_body(&super::BodyEvent {
                method: msg.base.cseq.method.clone(),
                content_type: msg.headers.get(&Name::CONTENT_TYPE).cloned(),
                body: msg.body.clone(),
            });
        }

        match &msg.line {
            MessageLine::Response(_) => self.handle_response(msg).await,
            MessageLine::Request(_) => self.handle_request(msg).await,
        }
    }

    async fn handle_response(&mut self, msg: IncomingMessage) {
        let code = match &msg.line {
            MessageLine::Response(line) => line.code,
            MessageLine::Request(_) => unreachable!(),
        };
        let cseq = msg.base.cseq.cseq;
        let method = msg.base.cseq.method.clone();

        // responses to the pending INVITE (initial or re-INVITE)
        let invite_match = self
            .pending_invite
            .as_ref()
            .filter(|i| i.cseq == cseq && method == Method::INVITE)
            .map(|i| i.initial);

        if let Some(initial) = invite_match {
            let event = match code.kind() {
                CodeKind::Provisional => {
                    if code != Code::TRYING {
                        self.absorb_early(&msg);
                    }

                    Event::Receive1xx(code.into_u16())
                }
                CodeKind::Success => {
                    self.absorb_response(&msg);

                    if initial {
                        Event::Receive2xx
                    } else {
                        Event::ReInviteAccepted
                    }
                }
                _ if code == Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST && !initial => {
                    Event::PeerGone
                }
                _ if initial => Event::ReceiveFailure(code.into_u16()),
                _ => Event::ReInviteFailed(code.into_u16()),
            };

            if !matches!(event, Event::Receive1xx(_)) {
                // transaction complete; keep the request around for
                // ACKing retransmitted finals
                if let Some(invite) = self.pending_invite.take() {
                    self.last_invite = Some((invite.cseq, invite.request));
                }
            }

            self.current_msg = Some(msg);
            self.step(event).await;
            self.current_msg = None;
            return;
        }

        // responses to the pending non-INVITE request
        let request_match = self
            .pending_request
            .as_ref()
            .filter(|r| r.cseq == cseq && method == r.method())
            .map(|r| r.kind);

        if let Some(kind) = request_match {
            if code.kind() == CodeKind::Provisional {
                return;
            }

            self.pending_request = None;

            let event = if code == Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST {
                Event::PeerGone
            } else {
                match (kind, code.kind()) {
                    (RequestKind::Bye, _) => Event::ByeCompleted,
                    (RequestKind::Refer, CodeKind::Success) => {
                        self.refer_ctx = Some(ReferCtx {
                            id: cseq,
                            status: None,
                        });
                        Event::ReferAccepted
                    }
                    (RequestKind::Refer, _) => Event::ReferFailed,
                }
            };

            self.current_msg = Some(msg);
            self.step(event).await;
            self.current_msg = None;
            return;
        }

        // responses to a completed INVITE transaction: retransmitted
        // finals, or the late 2xx after CANCEL / Timer B
        let last_match = self
            .last_invite
            .as_ref()
            .is_some_and(|(last_cseq, _)| *last_cseq == cseq && method == Method::INVITE);

        if last_match {
            let event = match code.kind() {
                CodeKind::Provisional => return,
                CodeKind::Success if self.last_ack.is_some() => Event::Duplicate2xx,
                CodeKind::Success => {
                    // late 2xx to a cancelled or timed out INVITE
                    self.absorb_response(&msg);
                    Event::Receive2xx
                }
                _ => Event::ReceiveFailure(code.into_u16()),
            };

            self.current_msg = Some(msg);
            self.step(event).await;
            self.current_msg = None;
            return;
        }

        log::debug!("dropping stale response {} to {}", code.into_u16(), method);
    }

    async fn handle_request(&mut self, msg: IncomingMessage) {
        let method = match &msg.line {
            MessageLine::Request(line) => line.method.clone(),
            MessageLine::Response(_) => unreachable!(),
        };
        let cseq = msg.base.cseq.cseq;

        // ACK and CANCEL share the INVITE's CSeq and bypass ordering
        if method == Method::ACK {
            let expected = self
                .server_invite
                .as_ref()
                .map(|si| si.invite.base.cseq.cseq);

            if expected == Some(cseq) {
                self.step(Event::ReceiveAck).await;
            }
            return;
        }

        if method == Method::CANCEL {
            self.current_msg = Some(msg);
            self.step(Event::ReceiveCancel).await;
            self.current_msg = None;
            return;
        }

        match self.remote_seq {
            Some(seen) if cseq <= seen => {
                if method == Method::INVITE {
                    self.step(Event::ReceiveInviteRetransmit).await;
                } else {
                    log::debug!("absorbing retransmitted {method} (cseq {cseq})");
                }
                return;
            }
            Some(seen) if cseq > seen + 1 => {
                log::debug!("backlogging {method} with cseq gap ({cseq} > {})", seen + 1);
                self.backlog.insert(cseq, msg);
                return;
            }
            _ => {}
        }

        self.remote_seq = Some(cseq);
        self.process_request(method, msg).await;

        // replay directly following backlog entries in order
        while let Some(seen) = self.remote_seq {
            let Some(next) = self.backlog.remove(&(seen + 1)) else {
                break;
            };

            self.remote_seq = Some(seen + 1);
            let method = next.base.cseq.method.clone();
            self.process_request(method, next).await;
        }
    }

    async fn process_request(&mut self, method: Method, msg: IncomingMessage) {
        match method {
            Method::INVITE => self.process_invite(msg).await,
            Method::BYE => {
                self.current_msg = Some(msg);
                self.step(Event::ReceiveBye).await;
                self.current_msg = None;
            }
            Method::REFER => self.process_refer(msg).await,
            Method::NOTIFY => self.process_notify(msg).await,
            other => {
                log::debug!("responding 405 to in-dialog {other}");
                let response = self.create_response(&msg, Code::METHOD_NOT_ALLOWED);
                self.send_response(response, msg.source).await;
            }
        }
    }

    async fn process_invite(&mut self, msg: IncomingMessage) {
        let event = if self.state == DialogState::Idle {
            // initial INVITE: the dialog-level routing state comes from
            // the request itself
            self.learn_route_set_from_request(&msg);

            if let Ok(contact) = msg.headers.get_named::<Contact>() {
                self.remote_target = contact.addr.uri.clone();
            }

            let has_replaces = msg.headers.contains(&Name::REPLACES);

            if has_replaces {
                Event::ReceiveReplaces
            } else {
                Event::ReceiveInvite
            }
        } else {
            Event::ReceiveReInvite {
                glare: self.pending_invite.is_some(),
            }
        };

        self.server_invite = Some(ServerInvite {
            invite: msg,
            last_response: None,
            retransmit: self.timer_cfg.t1,
        });

        let is_replaces = matches!(event, Event::ReceiveReplaces);

        self.step(event).await;

        if is_replaces {
            self.resolve_replaces().await;
        }
    }

    /// RFC 3891: find the dialog named by the Replaces header, tear it
    /// down and establish this one, or fail with 481
    async fn resolve_replaces(&mut self) {
        let replaces = self
            .server_invite
            .as_ref()
            .and_then(|si| si.invite.headers.get_named::<Replaces>().ok());

        let Some(replaces) = replaces else {
            self.step(Event::ReplaceFailed(Code::BAD_REQUEST.into_u16()))
                .await;
            return;
        };

        let Some(stack) = self.stack.upgrade() else {
            return;
        };

        match stack.lookup_replaces_target(&replaces) {
            Some(target) => {
                stack.count_replace_operation();
                target.post(DialogEvent::Command(Command::Replaced));
                self.step(Event::ReplaceSuccess).await;
            }
            None => {
                self.step(Event::ReplaceFailed(
                    Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST.into_u16(),
                ))
                .await;
            }
        }
    }

    async fn process_refer(&mut self, msg: IncomingMessage) {
        let refer_to = match msg.headers.get_named::<ReferTo>() {
            Ok(refer_to) => refer_to,
            Err(e) => {
                log::warn!("REFER without usable Refer-To: {e}");
                let response = self.create_response(&msg, Code::BAD_REQUEST);
                self.send_response(response, msg.source).await;
                return;
            }
        };

        let replaces = match refer_to.replaces() {
            Some(Ok(replaces)) => Some(replaces),
            Some(Err(e)) => {
                log::warn!("REFER with malformed embedded Replaces: {e}");
                let response = self.create_response(&msg, Code::BAD_REQUEST);
                self.send_response(response, msg.source).await;
                return;
            }
            None => None,
        };

        self.refer_ctx = Some(ReferCtx {
            id: msg.base.cseq.cseq,
            status: None,
        });
        self.incoming_refer = Some((refer_to.addr, replaces));
        self.current_msg = Some(msg);

        self.step(Event::ReceiveRefer).await;

        self.current_msg = None;
    }

    /// NOTIFY carrying transfer progress for one of our outgoing
    /// subscriptions; only a final result enters the automaton (to
    /// close the subscription)
    async fn process_notify(&mut self, msg: IncomingMessage) {
        let sub_id = msg
            .headers
            .get_named::<EventHeader>()
            .ok()
            .filter(|event| {
                event
                    .0
                    .split(';')
                    .next()
                    .is_some_and(|pkg| pkg.trim().eq_ignore_ascii_case("refer"))
            })
            .and_then(|event| {
                event.0.split(';').find_map(|param| {
                    let (name, value) = param.trim().split_once('=')?;
                    if name == "id" {
                        value.parse::<u32>().ok()
                    } else {
                        None
                    }
                })
            })
            .or_else(|| {
                // no id parameter: unambiguous only with a single
                // outgoing subscription
                let mut outgoing = self
                    .refer_subs
                    .values()
                    .filter(|sub| sub.direction == ReferDirection::Outgoing);

                match (outgoing.next(), outgoing.next()) {
                    (Some(sub), None) => Some(sub.id),
                    _ => None,
                }
            });

        let Some(sub_id) = sub_id.filter(|id| self.refer_subs.contains_key(id)) else {
            log::debug!("NOTIFY without matching refer subscription");
            let response = self.create_response(&msg, Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST);
            self.send_response(response, msg.source).await;
            return;
        };

        let sipfrag = msg
            .headers
            .get(&Name::CONTENT_TYPE)
            .is_some_and(is_sipfrag)
            .then(|| parse_sipfrag(&msg.body))
            .flatten();

        let terminated = msg
            .headers
            .get_named::<SubscriptionState>()
            .is_ok_and(|state| state.state == SubState::Terminated);

        let response = self.create_response(&msg, Code::OK);
        self.send_response(response, msg.source).await;

        let is_final = match sipfrag {
            Some(status) => {
                let progress = ReferProgress {
                    subscription_id: sub_id,
                    status,
                };

                self.shared.observers.fire_refer_progress(progress);

                progress.is_final() || terminated
            }
            None => terminated,
        };

        if is_final {
            self.refer_ctx = Some(ReferCtx {
                id: sub_id,
                status: sipfrag,
            });
            self.step(Event::ReferCompleted).await;
        }
    }

    // ==== dialog-level routing state ====

    /// Remote tag, route set and remote target learned from a 2xx
    fn absorb_response(&mut self, msg: &IncomingMessage) {
        // the route set freezes at establishment, a re-INVITE response
        // never changes it
        if self.remote_tag.is_none() {
            self.learn_route_set_from_response(msg);
        }

        self.learn_remote_tag(msg);

        if let Ok(contact) = msg.headers.get_named::<Contact>() {
            self.remote_target = contact.addr.uri.clone();
        }
    }

    /// Early dialog: a tagged provisional already completes the key
    fn absorb_early(&mut self, msg: &IncomingMessage) {
        self.learn_remote_tag(msg);
    }

    fn learn_remote_tag(&mut self, msg: &IncomingMessage) {
        if self.remote_tag.is_some() {
            return;
        }

        let Some(tag) = msg.base.to.tag.clone() else {
            return;
        };

        self.remote_tag = Some(tag.clone());

        let old_key = self.shared.key.read().clone();
        let new_key = old_key.completed(tag);

        *self.shared.key.write() = new_key.clone();

        if let Some(stack) = self.stack.upgrade() {
            stack.complete_dialog_key(&old_key, new_key);
        }
    }

    /// UAC: the route set is the Record-Route of the response,
    /// reversed (RFC 3261 §12.1.2); frozen afterwards
    fn learn_route_set_from_response(&mut self, msg: &IncomingMessage) {
        if !self.route_set.is_empty() {
            return;
        }

        if let Ok(record_routes) = msg.headers.get_all_named::<RecordRoute>() {
            self.route_set = record_routes
                .into_iter()
                .rev()
                .map(|rr| Route {
                    addr: rr.addr,
                    params: rr.params,
                })
                .collect();
        }
    }

    /// UAS: Record-Route of the initial INVITE in received order
    fn learn_route_set_from_request(&mut self, msg: &IncomingMessage) {
        if let Ok(record_routes) = msg.headers.get_all_named::<RecordRoute>() {
            self.route_set = record_routes
                .into_iter()
                .map(|rr| Route {
                    addr: rr.addr,
                    params: rr.params,
                })
                .collect();
        }
    }

    // ==== the automaton ====

    /// Returns true when the event had a declared edge
    async fn step(&mut self, event: Event) -> bool {
        match transition(self.state, &event) {
            Outcome::Apply(transition) => {
                let old = self.state;
                self.state = transition.next;

                if old != transition.next {
                    self.shared.state_tx.send_replace(transition.next);
                }

                for action in transition.actions {
                    self.perform(action, &event).await;
                }

                if old != transition.next {
                    log::debug!("dialog {} -> {}", old, transition.next);
                    self.shared.observers.fire_state(old, transition.next);
                }

                true
            }
            Outcome::Ignore => {
                log::trace!("ignoring {event:?} in {}", self.state);
                false
            }
            Outcome::Violation => {
                log::warn!("protocol violation: {event:?} in state {}", self.state);
                false
            }
        }
    }

    async fn perform(&mut self, action: Action, event: &Event) {
        match action {
            Action::Arm(kind) => self.arm(kind),
            Action::Cancel(kind) => self.timers.cancel(kind),
            Action::CancelAllTimers => self.timers.cancel_all(),

            Action::RetransmitInvite => {
                if let Some(invite) = &mut self.pending_invite {
                    invite.interval = (invite.interval * 2).min(self.timer_cfg.t1 * 64);
                    let mut request = invite.request.clone();
                    self.send_request(&mut request).await;
                }
            }
            Action::RetransmitRequest => {
                if let Some(pending) = &mut self.pending_request {
                    pending.interval = (pending.interval * 2).min(consts::T2);
                    let mut request = pending.request.clone();
                    self.send_request(&mut request).await;
                }
            }
            Action::RetransmitResponse => {
                if let Some(server) = &mut self.server_invite {
                    server.retransmit = (server.retransmit * 2).min(consts::T2);

                    if let Some(response) = server.last_response.clone() {
                        let destination = server.invite.source;
                        self.send_response(response, destination).await;
                    }
                }
            }

            Action::SendAck => self.send_ack(event).await,
            Action::ResendAck => {
                if let Some(mut ack) = self.last_ack.clone() {
                    self.send_request(&mut ack).await;
                }
            }
            Action::ForgetAck => {
                self.last_ack = None;
            }

            Action::SendInvite => self.send_initial_invite().await,
            Action::SendReInvite | Action::RetryReInvite => self.send_reinvite().await,
            Action::SendBye => self.send_bye().await,
            Action::SendCancel => self.send_cancel().await,
            Action::SendRefer => self.send_refer().await,

            Action::SendProvisional(code) => {
                self.respond_invite(StatusCode::from(code), None).await;
            }
            Action::RespondReInvite(code) => {
                self.respond_invite(StatusCode::from(code), None).await;
            }
            Action::SendFinal(code) => {
                let body = self.invite_body.take();
                let code = StatusCode::from(code);

                self.respond_invite(code, body).await;

                if code.kind() == CodeKind::Success {
                    self.with_stack(|stack| stack.count_successful_call());
                } else {
                    *self.shared.failure.lock() = Some(FailureKind::Rejected(code.into_u16()));
                    self.terminate_reason = TerminateReason::Rejected(code.into_u16());
                    self.with_stack(|stack| stack.count_failed_call());
                }
            }
            Action::RespondToCurrent(code) => {
                if let Some(msg) = self.current_msg.take() {
                    let response = self.create_response(&msg, StatusCode::from(code));
                    self.send_response(response, msg.source).await;
                    self.current_msg = Some(msg);
                } else {
                    log::warn!("no current request to respond {code} to");
                }
            }
            Action::Respond487ToInvite => {
                self.respond_invite(Code::REQUEST_TERMINATED, None).await;
                self.terminate_reason = TerminateReason::Cancelled;
            }

            Action::OpenReferSubscription => self.open_refer_subscription(),
            Action::CloseReferSubscription => self.close_refer_subscription(event).await,
            Action::NotifyReferTrying => {
                if let Some(ctx) = self.refer_ctx {
                    self.send_refer_notify(ctx.id, Code::TRYING, false).await;
                }
            }
            Action::NotifyReferResult => {
                if let Some(ctx) = self.refer_ctx {
                    let status = ctx.status.unwrap_or(Code::SERVICE_UNAVAILABLE);
                    self.send_refer_notify(ctx.id, status, true).await;
                }
            }
            Action::DispatchRefer => self.dispatch_refer(),

            Action::ScheduleGlareRetry => {
                // RFC 3261 §14.1: the Call-ID owner backs off longer
                let delay = match self.role {
                    Role::Uac => Duration::from_millis(rand::rng().random_range(2100..=4000)),
                    Role::Uas => Duration::from_millis(rand::rng().random_range(0..=2000)),
                };

                self.timers
                    .arm(TimerKind::GlareRetry, delay, &self.shared.mailbox);
            }
            Action::UpdateRemoteTarget => {
                if let Some(msg) = &self.current_msg {
                    if let Ok(contact) = msg.headers.get_named::<Contact>() {
                        self.remote_target = contact.addr.uri.clone();
                    }
                }
                self.reinvite_body = None;
            }

            Action::CompleteInviteOk => {
                self.with_stack(|stack| stack.count_successful_call());
            }
            Action::CompleteInviteErr => {
                let failure = if self.cancelled {
                    FailureKind::Cancelled
                } else {
                    match event {
                        Event::ReceiveFailure(code) => FailureKind::Rejected(*code),
                        Event::Timer(_) => FailureKind::Timeout,
                        Event::TransactionError => FailureKind::Transport,
                        _ => FailureKind::Cancelled,
                    }
                };

                *self.shared.failure.lock() = Some(failure);
                self.terminate_reason = match failure {
                    FailureKind::Timeout => TerminateReason::Timeout,
                    FailureKind::Cancelled => TerminateReason::Cancelled,
                    FailureKind::Transport => TerminateReason::TransportFailed,
                    FailureKind::Rejected(code) => TerminateReason::Rejected(code),
                    FailureKind::PeerGone => TerminateReason::PeerGone,
                };

                self.with_stack(|stack| stack.count_failed_call());
            }
            Action::CompleteRequestOk => {
                if let Some(done) = self.cmd_waiter.take() {
                    let _ = done.send(Ok(()));
                }
            }
            Action::CompleteRequestErr => {
                let error = match event {
                    Event::Timer(_) => Error::TransactionTimeout,
                    Event::TransactionError => Error::Transport(std::io::Error::other(
                        "transport adapter reported failure",
                    )),
                    _ => Error::protocol(anyhow::anyhow!("request rejected by peer")),
                };

                if let Some(done) = self.cmd_waiter.take() {
                    let _ = done.send(Err(error));
                }
            }

            Action::Teardown => {
                let reason = self.teardown_reason(event);
                self.teardown(reason);
            }
        }
    }

    fn teardown_reason(&self, event: &Event) -> TerminateReason {
        match event {
            Event::ReceiveBye => TerminateReason::PeerBye,
            Event::ByeCompleted => match self.terminate_reason {
                TerminateReason::Replaced => TerminateReason::Replaced,
                _ => TerminateReason::LocalBye,
            },
            Event::ReceiveCancel => TerminateReason::Cancelled,
            Event::PeerGone => TerminateReason::PeerGone,
            Event::Close => TerminateReason::Closed,
            Event::TransactionError => TerminateReason::TransportFailed,
            Event::Timer(TimerKind::F | TimerKind::H) => TerminateReason::Timeout,
            _ => self.terminate_reason,
        }
    }

    // ==== timers ====

    fn arm(&mut self, kind: TimerKind) {
        let duration = match kind {
            // retransmission timers are suppressed on reliable
            // transports
            TimerKind::A | TimerKind::E | TimerKind::G if self.reliable => return,

            TimerKind::A => self
                .pending_invite
                .as_ref()
                .map(|i| i.interval)
                .unwrap_or(self.timer_cfg.t1),
            TimerKind::E => self
                .pending_request
                .as_ref()
                .map(|r| r.interval)
                .unwrap_or(self.timer_cfg.t1),
            TimerKind::G => self
                .server_invite
                .as_ref()
                .map(|s| s.retransmit)
                .unwrap_or(self.timer_cfg.t1),

            TimerKind::B => self.timer_cfg.timer_b,
            TimerKind::D => self.timer_cfg.timer_d,
            TimerKind::F | TimerKind::H | TimerKind::J => self.timer_cfg.t1 * 64,
            TimerKind::I => consts::TIMER_I,
            TimerKind::K => consts::TIMER_K,
            TimerKind::ReferExpiry(_) => self.refer_expiry,
            TimerKind::GlareRetry => unreachable!("armed via ScheduleGlareRetry"),
        };

        self.timers.arm(kind, duration, &self.shared.mailbox);
    }

    // ==== building & sending ====

    fn next_cseq(&self, method: Method) -> CSeq {
        loop {
            let cseq = self
                .shared
                .local_seq
                .fetch_add(1, Ordering::SeqCst)
                .wrapping_add(1);

            // a wrapped counter must not collide with an open
            // transaction
            let collides = self.pending_invite.as_ref().is_some_and(|i| i.cseq == cseq)
                || self.pending_request.as_ref().is_some_and(|r| r.cseq == cseq);

            if !collides {
                return CSeq::new(cseq, method);
            }
        }
    }

    fn create_request(&self, method: Method) -> (u32, Request) {
        let mut request = Request::new(method.clone(), self.remote_target.clone());

        let cseq = self.next_cseq(method.clone());
        let number = cseq.cseq;

        request
            .headers
            .insert_named(&From::new(self.local.clone(), Some(self.local_tag.clone())));
        request
            .headers
            .insert_named(&To::new(self.remote.clone(), self.remote_tag.clone()));
        request.headers.insert_named(&CallId(self.call_id.clone()));
        request.headers.insert_named(&cseq);

        for route in &self.route_set {
            request.headers.insert_named(route);
        }

        request.headers.insert(Name::MAX_FORWARDS, "70");
        request
            .headers
            .insert(Name::USER_AGENT, self.user_agent.as_str());

        if matches!(method, Method::INVITE | Method::REFER) {
            request.headers.insert_named(&self.local_contact());
        }

        (number, request)
    }

    fn local_contact(&self) -> Contact {
        let mut uri = self.local.uri.clone();

        if let Some(stack) = self.stack.upgrade() {
            let addr = stack.local_addr();
            uri.host = addr.ip().to_string().into();
            uri.port = Some(addr.port());
        }

        Contact::new(NameAddr::new(uri))
    }

    fn create_response(&self, msg: &IncomingMessage, code: StatusCode) -> Response {
        let mut headers = Headers::with_capacity(8);

        msg.headers.clone_into(&mut headers, Name::VIA);
        headers.insert_named(&msg.base.from);

        let mut to = msg.base.to.clone();
        if to.tag.is_none() && code != Code::TRYING {
            to.tag = Some(self.local_tag.clone());
        }
        headers.insert_named(&to);

        headers.insert_named(&msg.base.call_id);
        headers.insert_named(&msg.base.cseq);

        if msg.base.cseq.method == Method::INVITE {
            let code = code.into_u16();

            if let 101..=399 | 485 = code {
                headers.insert_named(&self.local_contact());
            }

            if let 180..=189 | 200..=299 | 405 = code {
                headers.insert(Name::ALLOW, "INVITE, ACK, CANCEL, BYE, REFER, NOTIFY");
            }

            if let 200..=299 = code {
                headers.insert(Name::SUPPORTED, "replaces");
            }
        }

        Response {
            line: StatusLine::new(code),
            headers,
            body: Bytes::new(),
        }
    }

    async fn send_initial_invite(&mut self) {
        let (cseq, mut request) = self.create_request(Method::INVITE);

        if let Some(replaces) = self.invite_replaces.take() {
            request.headers.insert_named(&replaces);
        }

        if let Some(body) = self.invite_body.take() {
            request
                .headers
                .insert(Name::CONTENT_TYPE, body.content_type.clone());
            request.body = body.data;
        }

        let branch = self.initial_branch.clone();
        request.headers.insert_named_front(&self.create_via(&branch));

        self.pending_invite = Some(PendingInvite {
            request: request.clone(),
            cseq,
            interval: self.timer_cfg.t1,
            initial: true,
        });

        self.with_stack(|stack| stack.count_invite());
        self.send_request(&mut request).await;
    }

    async fn send_reinvite(&mut self) {
        let (cseq, mut request) = self.create_request(Method::INVITE);

        if let Some(body) = self.reinvite_body.clone() {
            request
                .headers
                .insert(Name::CONTENT_TYPE, body.content_type.clone());
            request.body = body.data;
        }

        let branch = self.new_branch();
        request.headers.insert_named_front(&self.create_via(&branch));

        self.pending_invite = Some(PendingInvite {
            request: request.clone(),
            cseq,
            interval: self.timer_cfg.t1,
            initial: false,
        });

        self.with_stack(|stack| stack.count_invite());
        self.send_request(&mut request).await;
    }

    async fn send_bye(&mut self) {
        let (cseq, mut request) = self.create_request(Method::BYE);

        let branch = self.new_branch();
        request.headers.insert_named_front(&self.create_via(&branch));

        self.pending_request = Some(PendingRequest {
            request: request.clone(),
            cseq,
            kind: RequestKind::Bye,
            interval: self.timer_cfg.t1,
        });

        self.with_stack(|stack| stack.count_bye());
        self.send_request(&mut request).await;
    }

    /// CANCEL mirrors the INVITE: same CSeq number, same Via branch
    async fn send_cancel(&mut self) {
        let Some(invite) = &self.pending_invite else {
            return;
        };

        let mut request = Request::new(Method::CANCEL, invite.request.line.uri.clone());

        let invite_headers = &invite.request.headers;
        invite_headers.clone_into(&mut request.headers, Name::VIA);
        invite_headers.clone_into(&mut request.headers, Name::FROM);
        invite_headers.clone_into(&mut request.headers, Name::TO);
        invite_headers.clone_into(&mut request.headers, Name::CALL_ID);
        request
            .headers
            .insert_named(&CSeq::new(invite.cseq, Method::CANCEL));
        request.headers.insert(Name::MAX_FORWARDS, "70");

        let cseq = invite.cseq;
        let invite_request = invite.request.clone();

        // the INVITE transaction stays around to absorb the 487
        self.last_invite = Some((cseq, invite_request));
        self.pending_invite = None;

        self.send_request(&mut request).await;
    }

    async fn send_refer(&mut self) {
        let Some((target, replaces)) = self.incoming_refer.take() else {
            return;
        };

        let (cseq, mut request) = self.create_request(Method::REFER);

        let mut refer_to = ReferTo::new(target.clone());
        if let Some(replaces) = &replaces {
            refer_to = refer_to.with_replaces(replaces);
        }
        request.headers.insert_named(&refer_to);

        let branch = self.new_branch();
        request.headers.insert_named_front(&self.create_via(&branch));

        self.pending_request = Some(PendingRequest {
            request: request.clone(),
            cseq,
            kind: RequestKind::Refer,
            interval: self.timer_cfg.t1,
        });

        // prospective subscription, activated by the 202
        let mut sub = ReferSubscription::new(cseq, ReferDirection::Outgoing, target, replaces);
        sub.active = false;
        self.refer_subs.insert(cseq, sub);

        self.with_stack(|stack| stack.count_refer());
        self.send_request(&mut request).await;
    }

    /// ACK differs by response class: non-2xx ACKs belong to the
    /// INVITE transaction (same Via), 2xx ACKs are a standalone
    /// in-dialog request
    async fn send_ack(&mut self, event: &Event) {
        let success = matches!(
            event,
            Event::Receive2xx | Event::ReInviteAccepted | Event::Duplicate2xx
        );

        let Some(acked_cseq) = self.current_msg.as_ref().map(|m| m.base.cseq.cseq) else {
            return;
        };

        if success {
            // the 2xx ACK reuses the INVITE's CSeq number, it must not
            // consume a fresh one
            let mut ack = Request::new(Method::ACK, self.remote_target.clone());

            ack.headers
                .insert_named(&From::new(self.local.clone(), Some(self.local_tag.clone())));
            ack.headers
                .insert_named(&To::new(self.remote.clone(), self.remote_tag.clone()));
            ack.headers.insert_named(&CallId(self.call_id.clone()));
            ack.headers
                .insert_named(&CSeq::new(acked_cseq, Method::ACK));

            for route in &self.route_set {
                ack.headers.insert_named(route);
            }

            ack.headers.insert(Name::MAX_FORWARDS, "70");
            ack.headers
                .insert(Name::USER_AGENT, self.user_agent.as_str());

            let branch = self.new_branch();
            ack.headers.insert_named_front(&self.create_via(&branch));

            self.last_ack = Some(ack.clone());
            self.send_request(&mut ack).await;
        } else {
            // hop-by-hop ACK for a failure response, built from the
            // original INVITE
            let Some((_, invite)) = self
                .last_invite
                .as_ref()
                .filter(|(cseq, _)| *cseq == acked_cseq)
            else {
                return;
            };

            let to = self.current_msg.as_ref().map(|m| m.base.to.clone());
            let Some(to) = to else { return };

            let mut headers = Headers::with_capacity(5);
            invite.headers.clone_into(&mut headers, Name::VIA);
            invite.headers.clone_into(&mut headers, Name::FROM);
            headers.insert_named(&to);
            invite.headers.clone_into(&mut headers, Name::CALL_ID);
            headers.insert_named(&CSeq::new(acked_cseq, Method::ACK));

            let mut ack = Request {
                line: RequestLine {
                    method: Method::ACK,
                    uri: invite.line.uri.clone(),
                },
                headers,
                body: Bytes::new(),
            };

            self.send_request(&mut ack).await;
        }
    }

    /// Respond to the stored server INVITE and keep the response for
    /// retransmissions
    async fn respond_invite(&mut self, code: StatusCode, body: Option<Body>) {
        let Some(server) = self.server_invite.take() else {
            log::warn!("no pending INVITE to respond {} to", code.into_u16());
            return;
        };

        let mut response = self.create_response(&server.invite, code);

        if let Some(body) = body {
            response
                .headers
                .insert(Name::CONTENT_TYPE, body.content_type.clone());
            response.body = body.data;
        }

        let destination = server.invite.source;

        self.server_invite = Some(ServerInvite {
            last_response: Some(response.clone()),
            ..server
        });

        self.send_response(response, destination).await;
    }

    async fn send_refer_notify(&mut self, id: u32, status: StatusCode, terminating: bool) {
        let Some(sub) = self.refer_subs.get_mut(&id) else {
            return;
        };

        sub.notify_count += 1;

        let (_, mut request) = self.create_request(Method::NOTIFY);

        request
            .headers
            .insert_named(&EventHeader(format!("refer;id={id}").into()));

        let sub_state = if terminating {
            SubscriptionState::terminated()
        } else {
            SubscriptionState::active(self.refer_expiry.as_secs() as u32)
        };
        request.headers.insert_named(&sub_state);

        request
            .headers
            .insert(Name::CONTENT_TYPE, SIPFRAG_CONTENT_TYPE);
        request.body = sipfrag_body(status);

        let branch = self.new_branch();
        request.headers.insert_named_front(&self.create_via(&branch));

        // NOTIFYs are fire-and-forget, their 200s are dropped during
        // classification
        self.send_request(&mut request).await;
    }

    fn open_refer_subscription(&mut self) {
        let Some(ctx) = self.refer_ctx else {
            return;
        };

        match self.refer_subs.get_mut(&ctx.id) {
            // outgoing: pre-created when the REFER was sent
            Some(sub) => sub.active = true,
            // incoming: created from the parsed Refer-To
            None => {
                let Some((target, replaces)) = self.incoming_refer.clone() else {
                    return;
                };

                self.refer_subs.insert(
                    ctx.id,
                    ReferSubscription::new(ctx.id, ReferDirection::Incoming, target, replaces),
                );

                self.with_stack(|stack| stack.count_refer());
            }
        }

        self.timers.arm(
            TimerKind::ReferExpiry(ctx.id),
            self.refer_expiry,
            &self.shared.mailbox,
        );
    }

    async fn close_refer_subscription(&mut self, event: &Event) {
        let expired = matches!(event, Event::Timer(TimerKind::ReferExpiry(_)));

        let id = match event {
            Event::Timer(TimerKind::ReferExpiry(id)) => Some(*id),
            _ => self.refer_ctx.map(|ctx| ctx.id),
        };

        let Some(id) = id else { return };

        self.timers.cancel_refer(id);

        let direction = self.refer_subs.get(&id).map(|sub| sub.direction);

        // an expired incoming subscription still owes the peer a final
        // NOTIFY; NotifyReferResult already sent one on the other paths
        if expired && direction == Some(ReferDirection::Incoming) {
            self.send_refer_notify(id, Code::REQUEST_TIMEOUT, true).await;
        }

        self.refer_subs.remove(&id);
        self.refer_ctx = None;
        self.incoming_refer = None;
    }

    fn dispatch_refer(&mut self) {
        let Some(ctx) = self.refer_ctx else { return };
        let Some((target, replaces)) = self.incoming_refer.clone() else {
            return;
        };

        if let Some(stack) = self.stack.upgrade() {
            stack.dispatch_refer(
                DialogHandle {
                    shared: self.shared.clone(),
                },
                crate::stack::IncomingRefer {
                    subscription_id: ctx.id,
                    target,
                    replaces,
                },
            );
        }
    }

    fn create_via(&self, branch: &BytesStr) -> Via {
        let (transport, sent_by) = match self.stack.upgrade() {
            Some(stack) => (stack.transport_name(), stack.local_host_port()),
            None => ("UDP", "0.0.0.0:0".into()),
        };

        Via::new(transport, sent_by, branch.clone())
    }

    fn new_branch(&self) -> BytesStr {
        match self.stack.upgrade() {
            Some(stack) => stack.new_branch(),
            None => BytesStr::from_static("z9hG4bKdetached"),
        }
    }

    async fn send_request(&mut self, request: &mut Request) {
        let Some(stack) = self.stack.upgrade() else {
            return;
        };

        let line = MessageLine::Request(request.line.clone());

        if let Err(e) = stack
            .send_frame(&line, &mut request.headers, &request.body, self.destination)
            .await
        {
            log::warn!("failed to send {}: {e}", request.line.method);
            self.shared.post(DialogEvent::TransportError);
        }
    }

    async fn send_response(&mut self, mut response: Response, destination: SocketAddr) {
        let Some(stack) = self.stack.upgrade() else {
            return;
        };

        let line = MessageLine::Response(response.line.clone());

        if let Err(e) = stack
            .send_frame(&line, &mut response.headers, &response.body, destination)
            .await
        {
            log::warn!(
                "failed to send response {}: {e}",
                response.line.code.into_u16()
            );
            self.shared.post(DialogEvent::TransportError);
        }
    }

    fn with_stack(&self, f: impl FnOnce(&Arc<StackInner>)) {
        if let Some(stack) = self.stack.upgrade() {
            f(&stack);
        }
    }

    // ==== teardown ====

    /// Exactly-once: cancel every timer, complete outstanding waiters,
    /// deregister, fire the terminate observer last
    fn teardown(&mut self, reason: TerminateReason) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.state = DialogState::Terminated;
        self.timers.cancel_all();

        if let Some(done) = self.cmd_waiter.take() {
            let _ = done.send(Err(Error::DialogTerminated));
        }

        self.shared.state_tx.send_replace(DialogState::Terminated);

        if let Some(stack) = self.stack.upgrade() {
            stack.dialog_terminated(&self.shared.key.read());
        }

        self.shared.observers.fire_terminate(reason);
    }
}
