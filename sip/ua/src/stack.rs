//! The coordinator: owns the registry, the transport handle, the
//! identifier service and the endpoint set; routes every received
//! message to the dialog that owns it.
//!
//! Inbound dispatch is non-blocking for the transport thread: routing
//! is a registry lookup plus a mailbox send. Only paths that create
//! dialogs or answer out-of-dialog requests spawn a task.

use crate::config::Config;
use crate::dialog::key::DialogKey;
use crate::dialog::machine::{self, DialogSeed};
use crate::dialog::{Body, Command, DialogEvent, DialogHandle, DialogShared, Role};
use crate::error::{Error, Result};
use crate::ident::IdentifierService;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::registry::Registry;
use crate::select::EndpointSet;
use crate::transport::{
    BaseHeaders, IncomingMessage, ReceivedMessage, Transport, serialize_message,
};
use bytes::Bytes;
use bytesstr::BytesStr;
use parking_lot::RwLock;
use sip_types::header::typed::Replaces;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Headers, MessageLine, Method, Name, Response, StatusCode, StatusLine};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;

const LIFECYCLE_IDLE: u8 = 0;
const LIFECYCLE_RUNNING: u8 = 1;
const LIFECYCLE_DOWN: u8 = 2;

/// A new UAS dialog handed to [`IncomingDialogHandler`]
#[derive(Debug)]
pub struct IncomingInvite {
    pub from: NameAddr,
    pub to: NameAddr,
    pub body: Option<Body>,
}

/// A REFER received inside an established dialog, handed to
/// [`IncomingReferHandler`]
#[derive(Debug)]
pub struct IncomingRefer {
    /// Pass back into [`DialogHandle::refer_progress`]
    pub subscription_id: u32,
    pub target: NameAddr,
    pub replaces: Option<Replaces>,
}

/// Application decision point for new incoming dialogs
#[async_trait::async_trait]
pub trait IncomingDialogHandler: Send + Sync + 'static {
    async fn on_incoming_dialog(&self, dialog: DialogHandle, invite: IncomingInvite);
}

/// Application notification for transfer requests
#[async_trait::async_trait]
pub trait IncomingReferHandler: Send + Sync + 'static {
    async fn on_incoming_refer(&self, dialog: DialogHandle, refer: IncomingRefer);
}

/// Options for [`Stack::invite`]
#[derive(Default)]
pub struct InviteOptions {
    /// Local identity; defaults to `sip:softsip@<local addr>`
    pub from: Option<NameAddr>,
    /// Initial offer carried in the INVITE
    pub body: Option<Body>,
    /// Overrides endpoint selection
    pub destination: Option<SocketAddr>,
    /// RFC 3891: ask the peer to supplant the named dialog with this
    /// call
    pub replaces: Option<Replaces>,
}

/// The SIP user agent core.
///
/// Cheap to clone; all clones drive the same stack.
#[derive(Clone)]
pub struct Stack {
    inner: Arc<StackInner>,
}

pub(crate) struct StackInner {
    config: Config,
    transport: Arc<dyn Transport>,
    pub(crate) registry: Registry<Arc<DialogShared>>,
    ids: IdentifierService,
    endpoints: EndpointSet,
    pub(crate) metrics: Metrics,

    lifecycle: AtomicU8,
    housekeeping: RwLock<Option<AbortHandle>>,

    dialog_handler: RwLock<Option<Arc<dyn IncomingDialogHandler>>>,
    refer_handler: RwLock<Option<Arc<dyn IncomingReferHandler>>>,
}

impl Stack {
    /// Validates the configuration and builds the stack around the
    /// given transport adapter
    pub fn new(mut config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let endpoints = EndpointSet::from_configs(&config.endpoints)?;
        let ids = IdentifierService::new(config.test_mode);
        let registry = Registry::new(config.registry_shards);

        Ok(Self {
            inner: Arc::new(StackInner {
                config,
                transport,
                registry,
                ids,
                endpoints,
                metrics: Metrics::default(),
                lifecycle: AtomicU8::new(LIFECYCLE_IDLE),
                housekeeping: RwLock::new(None),
                dialog_handler: RwLock::new(None),
                refer_handler: RwLock::new(None),
            }),
        })
    }

    /// Begin accepting traffic. Idempotent until [`shutdown`] is
    /// called.
    ///
    /// [`shutdown`]: Stack::shutdown
    pub fn start(&self) -> Result<()> {
        match self.inner.lifecycle.compare_exchange(
            LIFECYCLE_IDLE,
            LIFECYCLE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(LIFECYCLE_RUNNING) => return Ok(()),
            Err(_) => {
                return Err(Error::Configuration(
                    "stack was already shut down".into(),
                ));
            }
        }

        // keep the identifier pools topped up off the hot path
        let ids = self.inner.ids.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;
                ids.refill();
            }
        });

        *self.inner.housekeeping.write() = Some(task.abort_handle());

        log::info!(
            "stack started on {} ({})",
            self.inner.transport.local_addr(),
            self.inner.transport.transport_type()
        );

        Ok(())
    }

    /// Stop accepting, BYE every established dialog, wait up to
    /// `deadline` for the registry to drain, then drop whatever is
    /// left. Idempotent.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        if self
            .inner
            .lifecycle
            .swap(LIFECYCLE_DOWN, Ordering::SeqCst)
            == LIFECYCLE_DOWN
        {
            return Ok(());
        }

        if let Some(task) = self.inner.housekeeping.write().take() {
            task.abort();
        }

        self.inner.registry.for_each(|_, shared| {
            let state = *shared.state_tx.borrow();

            let command = if state.is_established() {
                let (done, _) = tokio::sync::oneshot::channel();
                Command::Bye { done }
            } else {
                Command::Close
            };

            shared.post(DialogEvent::Command(command));
        });

        let drain_until = tokio::time::Instant::now() + deadline;

        while self.inner.registry.count() > 0 {
            if tokio::time::Instant::now() >= drain_until {
                log::warn!(
                    "shutdown deadline reached with {} dialogs left, closing them",
                    self.inner.registry.count()
                );

                for (_, shared) in self.inner.registry.clear() {
                    shared.post(DialogEvent::Command(Command::Close));
                }

                break;
            }

            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        log::info!("stack shut down");
        Ok(())
    }

    /// Create a UAC dialog and send the INVITE. The returned handle is
    /// already registered; await
    /// [`wait_established`](DialogHandle::wait_established) for the
    /// outcome.
    pub async fn invite(&self, target: SipUri, options: InviteOptions) -> Result<DialogHandle> {
        if self.inner.lifecycle.load(Ordering::SeqCst) != LIFECYCLE_RUNNING {
            return Err(Error::Configuration("stack is not running".into()));
        }

        if self.inner.registry.count() >= self.inner.config.max_dialogs {
            return Err(Error::ResourceExhausted);
        }

        let destination = match options.destination {
            Some(destination) => destination,
            None => self.inner.select_destination(&target)?,
        };

        let local = options.from.unwrap_or_else(|| {
            let addr = self.inner.transport.local_addr();
            NameAddr::new(
                SipUri::new(addr.ip().to_string())
                    .user("softsip")
                    .port(addr.port()),
            )
        });

        let seed = DialogSeed {
            stack: Arc::downgrade(&self.inner),
            role: Role::Uac,
            call_id: self.inner.ids.call_id(),
            local,
            local_tag: self.inner.ids.tag(),
            remote: NameAddr::new(target.clone()),
            remote_tag: None,
            remote_target: target,
            destination,
            timers: self.inner.config.timers,
            refer_expiry: self.inner.config.refer_subscribe_expiry,
            reliable: self.inner.transport.transport_type().reliable(),
            user_agent: self.inner.config.user_agent.clone(),
            branch: self.inner.ids.branch(),
        };

        let (handle, shared) = machine::spawn(seed);

        let key = shared.key.read().clone();
        if !self.inner.registry.insert(key, shared.clone()) {
            shared.post(DialogEvent::Command(Command::Close));
            return Err(Error::protocol(anyhow::anyhow!(
                "generated dialog key collided"
            )));
        }

        Metrics::incr(&self.inner.metrics.active_dialogs);

        shared.post(DialogEvent::Command(Command::SendInvite {
            body: options.body,
            replaces: options.replaces,
        }));

        Ok(handle)
    }

    /// Register the decision callback for new UAS dialogs. Expected to
    /// be registered once, before [`start`](Stack::start).
    pub fn on_incoming_dialog<H: IncomingDialogHandler>(&self, handler: H) {
        let mut slot = self.inner.dialog_handler.write();

        if slot.is_some() {
            log::warn!("replacing previously registered incoming dialog handler");
        }

        *slot = Some(Arc::new(handler));
    }

    /// Register the transfer callback, invoked when a REFER arrives in
    /// an established dialog
    pub fn on_incoming_refer<H: IncomingReferHandler>(&self, handler: H) {
        let mut slot = self.inner.refer_handler.write();

        if slot.is_some() {
            log::warn!("replacing previously registered incoming refer handler");
        }

        *slot = Some(Arc::new(handler));
    }

    /// Entry point for the transport adapter: one parsed message per
    /// call. Returns quickly, the owning dialog processes the message
    /// on its own task.
    pub fn receive(&self, message: ReceivedMessage) {
        // during shutdown in-flight transactions still complete, only
        // dialog-creating requests are turned away
        if self.inner.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_IDLE {
            log::debug!("dropping message received before start");
            return;
        }

        let base = match BaseHeaders::extract_from(&message.headers) {
            Ok(base) => base,
            Err(e) => {
                log::warn!("failed to extract base headers from incoming message: {e}");
                return;
            }
        };

        let incoming = IncomingMessage {
            source: message.source,
            line: message.line,
            base,
            headers: message.headers,
            body: message.body,
        };

        match &incoming.line {
            MessageLine::Request(_) => self.inner.clone().route_request(incoming),
            MessageLine::Response(_) => self.inner.route_response(incoming),
        }
    }

    /// Observable outputs of the stack
    pub fn metrics(&self) -> MetricsSnapshot {
        let (hits, misses, _) = self.inner.ids.counters();

        self.inner
            .metrics
            .snapshot(hits, misses, self.inner.registry.shard_counts())
    }

    /// Remote endpoints with their health state
    pub fn endpoints(&self) -> &EndpointSet {
        &self.inner.endpoints
    }

    /// Number of live dialogs
    pub fn active_dialogs(&self) -> usize {
        self.inner.registry.count()
    }
}

impl StackInner {
    fn select_destination(&self, target: &SipUri) -> Result<SocketAddr> {
        if let Some(endpoint) = self.endpoints.select() {
            return Ok(endpoint.addr());
        }

        // no endpoint set: the target host must be a literal address,
        // name resolution belongs to the transport layer
        let ip = target.host.parse().map_err(|_| {
            Error::Configuration(format!(
                "no healthy endpoint and target host {:?} is not an IP literal",
                &*target.host
            ))
        })?;

        Ok(SocketAddr::new(ip, target.port.unwrap_or(5060)))
    }

    // ==== inbound routing ====

    fn route_response(&self, msg: IncomingMessage) {
        // for a response, From is ours
        let Some(local_tag) = msg.base.from.tag.clone() else {
            log::debug!("dropping response without From tag");
            return;
        };

        let call_id = msg.base.call_id.0.clone();

        let dialog = msg
            .base
            .to
            .tag
            .clone()
            .and_then(|remote_tag| {
                self.registry.lookup(&DialogKey::new(
                    call_id.clone(),
                    local_tag.clone(),
                    Some(remote_tag),
                ))
            })
            .or_else(|| self.registry.lookup_early(&(call_id, local_tag)));

        match dialog {
            Some(dialog) => dialog.post(DialogEvent::Message(Box::new(msg))),
            None => log::debug!("orphaned response, no matching dialog"),
        }
    }

    fn route_request(self: Arc<Self>, msg: IncomingMessage) {
        let method = match &msg.line {
            MessageLine::Request(line) => line.method.clone(),
            MessageLine::Response(_) => unreachable!(),
        };

        let call_id = msg.base.call_id.0.clone();
        let remote_tag = msg.base.from.tag.clone();

        // for a request, To is ours
        if let Some(local_tag) = msg.base.to.tag.clone() {
            let full = remote_tag.clone().and_then(|remote_tag| {
                self.registry.lookup(&DialogKey::new(
                    call_id.clone(),
                    local_tag.clone(),
                    Some(remote_tag),
                ))
            });

            let dialog = full.or_else(|| self.registry.lookup_early(&(call_id, local_tag)));

            match dialog {
                Some(dialog) => dialog.post(DialogEvent::Message(Box::new(msg))),
                // unanswerable: ACK has no response
                None if method == Method::ACK => {
                    log::debug!("dropping ACK for unknown dialog");
                }
                None => {
                    log::debug!("in-dialog {method} for unknown dialog");
                    self.respond_out_of_dialog(
                        msg,
                        StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
                    );
                }
            }

            return;
        }

        // no To tag: a dialog-creating request
        if method == Method::INVITE {
            // a retransmission belongs to the dialog its first copy
            // created
            let retransmit = remote_tag.clone().and_then(|from_tag| {
                self.registry
                    .lookup_incoming_invite(&(call_id, from_tag))
            });

            match retransmit {
                Some(dialog) => dialog.post(DialogEvent::Message(Box::new(msg))),
                None => self.accept_new_dialog(msg),
            }
        } else if method != Method::ACK {
            self.respond_out_of_dialog(msg, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST);
        }
    }

    fn accept_new_dialog(self: &Arc<Self>, msg: IncomingMessage) {
        if self.lifecycle.load(Ordering::SeqCst) != LIFECYCLE_RUNNING {
            self.respond_out_of_dialog(msg, StatusCode::SERVICE_UNAVAILABLE);
            return;
        }

        if msg.base.from.tag.is_none() {
            self.respond_out_of_dialog(msg, StatusCode::BAD_REQUEST);
            return;
        }

        if self.registry.count() >= self.config.max_dialogs {
            log::warn!("dialog limit reached, rejecting INVITE with 503");
            self.respond_out_of_dialog(msg, StatusCode::SERVICE_UNAVAILABLE);
            return;
        }

        let local = msg.base.to.addr.clone();
        let remote = msg.base.from.addr.clone();
        let remote_tag = msg.base.from.tag.clone();

        let seed = DialogSeed {
            stack: Arc::downgrade(self),
            role: Role::Uas,
            call_id: msg.base.call_id.0.clone(),
            local,
            local_tag: self.ids.tag(),
            remote: remote.clone(),
            remote_tag,
            // refined from the Contact when the INVITE is processed
            remote_target: remote.uri.clone(),
            destination: msg.source,
            timers: self.config.timers,
            refer_expiry: self.config.refer_subscribe_expiry,
            reliable: self.transport.transport_type().reliable(),
            user_agent: self.config.user_agent.clone(),
            branch: self.ids.branch(),
        };

        let (handle, shared) = machine::spawn(seed);

        let key = shared.key.read().clone();
        if !self.registry.insert(key.clone(), shared.clone()) {
            // duplicate INVITE raced its own retransmission
            shared.post(DialogEvent::Command(Command::Close));
            return;
        }

        if let Some(remote_tag) = &key.remote_tag {
            self.registry
                .index_incoming_invite((key.call_id.clone(), remote_tag.clone()), key);
        }

        Metrics::incr(&self.metrics.active_dialogs);
        Metrics::incr(&self.metrics.total_invites);

        let invite = IncomingInvite {
            from: msg.base.from.addr.clone(),
            to: msg.base.to.addr.clone(),
            body: (!msg.body.is_empty()).then(|| {
                Body::new(
                    msg.headers
                        .get(&Name::CONTENT_TYPE)
                        .cloned()
                        .unwrap_or_else(|| BytesStr::from_static("application/octet-stream")),
                    msg.body.clone(),
                )
            }),
        };

        let replaces = msg.headers.contains(&Name::REPLACES);

        shared.post(DialogEvent::Message(Box::new(msg)));

        // Replaces dialogs are accepted by the stack itself (RFC
        // 3891), everything else is the application's decision
        if !replaces {
            let handler = self.dialog_handler.read().clone();

            match handler {
                Some(handler) => {
                    tokio::spawn(
                        async move { handler.on_incoming_dialog(handle, invite).await },
                    );
                }
                None => {
                    log::warn!("no incoming dialog handler registered, rejecting with 503");
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        let _ = handle.reject(StatusCode::SERVICE_UNAVAILABLE).await;
                    });
                }
            }
        }
    }

    /// Minimal response for requests that never reached a dialog
    fn respond_out_of_dialog(self: &Arc<Self>, msg: IncomingMessage, code: StatusCode) {
        let mut headers = Headers::with_capacity(5);

        msg.headers.clone_into(&mut headers, Name::VIA);
        headers.insert_named(&msg.base.from);
        headers.insert_named(&msg.base.to);
        headers.insert_named(&msg.base.call_id);
        headers.insert_named(&msg.base.cseq);

        let mut response = Response {
            line: StatusLine::new(code),
            headers,
            body: Bytes::new(),
        };

        let this = self.clone();
        tokio::spawn(async move {
            let line = MessageLine::Response(response.line.clone());

            if let Err(e) = this
                .send_frame(&line, &mut response.headers, &response.body, msg.source)
                .await
            {
                log::warn!("failed to answer out-of-dialog request: {e}");
            }
        });
    }

    // ==== services for dialog tasks ====

    pub(crate) async fn send_frame(
        &self,
        line: &MessageLine,
        headers: &mut Headers,
        body: &Bytes,
        destination: SocketAddr,
    ) -> io::Result<()> {
        let buffer = serialize_message(line, headers, body);

        log::trace!("sending {} bytes to {destination}", buffer.len());

        self.transport.send(&buffer, destination).await
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub(crate) fn local_host_port(&self) -> String {
        self.transport.local_addr().to_string()
    }

    pub(crate) fn transport_name(&self) -> &'static str {
        self.transport.transport_type().name()
    }

    pub(crate) fn new_branch(&self) -> BytesStr {
        self.ids.branch()
    }

    pub(crate) fn complete_dialog_key(&self, old: &DialogKey, new: DialogKey) {
        if !self.registry.complete_key(old, new) {
            log::warn!("failed to complete dialog key for {old}");
        }
    }

    pub(crate) fn dialog_terminated(&self, key: &DialogKey) {
        if self.registry.remove(key) {
            Metrics::decr(&self.metrics.active_dialogs);
        }
    }

    /// RFC 3891: the Replaces triple names the dialog from the
    /// recipient's point of view, to-tag is our tag
    pub(crate) fn lookup_replaces_target(
        &self,
        replaces: &Replaces,
    ) -> Option<Arc<DialogShared>> {
        let key = DialogKey::new(
            replaces.call_id.clone(),
            replaces.to_tag.clone(),
            Some(replaces.from_tag.clone()),
        );

        let shared = self.registry.lookup(&key)?;

        let state = *shared.state_tx.borrow();

        if replaces.early_only && state.is_established() {
            return None;
        }

        state.is_established().then_some(shared)
    }

    pub(crate) fn dispatch_refer(self: &Arc<Self>, dialog: DialogHandle, refer: IncomingRefer) {
        Metrics::incr(&self.metrics.total_refers);

        let handler = self.refer_handler.read().clone();

        match handler {
            Some(handler) => {
                tokio::spawn(async move { handler.on_incoming_refer(dialog, refer).await });
            }
            None => {
                // nobody will drive the transfer, close it out
                log::warn!("REFER accepted but no refer handler registered");
                let id = refer.subscription_id;
                tokio::spawn(async move {
                    dialog.refer_progress(id, StatusCode::NOT_IMPLEMENTED);
                });
            }
        }
    }

    pub(crate) fn count_invite(&self) {
        Metrics::incr(&self.metrics.total_invites);
    }

    pub(crate) fn count_bye(&self) {
        Metrics::incr(&self.metrics.total_byes);
    }

    pub(crate) fn count_refer(&self) {
        Metrics::incr(&self.metrics.total_refers);
    }

    pub(crate) fn count_successful_call(&self) {
        Metrics::incr(&self.metrics.successful_calls);
    }

    pub(crate) fn count_failed_call(&self) {
        Metrics::incr(&self.metrics.failed_calls);
    }

    pub(crate) fn count_replace_operation(&self) {
        Metrics::incr(&self.metrics.replace_operations);
    }
}
