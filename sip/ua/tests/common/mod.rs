//! In-process test network: every stack gets a mock transport, frames
//! are parsed back into messages and delivered synchronously to the
//! destination stack.

// not every test binary uses every helper
#![allow(dead_code)]

use bytes::Bytes;
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_types::uri::SipUri;
use sip_types::{Headers, MessageLine, Method, Name, RequestLine, StatusLine};
use softsip_ua::{Config, ReceivedMessage, Stack, Transport, TransportType};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Default)]
pub struct TestNet {
    stacks: Mutex<HashMap<SocketAddr, Stack>>,
    sent: Mutex<Vec<Frame>>,
}

#[derive(Clone)]
pub struct Frame {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn first_line(&self) -> String {
        let text = String::from_utf8_lossy(&self.data);
        text.lines().next().unwrap_or_default().to_string()
    }
}

impl TestNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, addr: SocketAddr, stack: Stack) {
        self.stacks.lock().insert(addr, stack);
    }

    /// Stop delivering to `addr`, simulating an unreachable peer
    pub fn unplug(&self, addr: SocketAddr) {
        self.stacks.lock().remove(&addr);
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    pub fn frames_from(&self, addr: SocketAddr) -> Vec<Frame> {
        self.sent
            .lock()
            .iter()
            .filter(|f| f.from == addr)
            .cloned()
            .collect()
    }
}

pub struct MockTransport {
    addr: SocketAddr,
    net: Arc<TestNet>,
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, buffer: &[u8], destination: SocketAddr) -> std::io::Result<()> {
        self.net.sent.lock().push(Frame {
            from: self.addr,
            to: destination,
            data: buffer.to_vec(),
        });

        let stack = self.net.stacks.lock().get(&destination).cloned();

        if let Some(stack) = stack {
            stack.receive(parse_wire(buffer, self.addr));
        }

        // datagram semantics: an unreachable peer is not an error
        Ok(())
    }
}

/// Minimal wire parser for the loopback path; real parsing lives in
/// the transport adapter outside the core
pub fn parse_wire(buffer: &[u8], source: SocketAddr) -> ReceivedMessage {
    let text = std::str::from_utf8(buffer).expect("test frames are utf-8");

    let (head, body) = text
        .split_once("\r\n\r\n")
        .expect("missing header/body separator");

    let mut lines = head.split("\r\n");
    let first = lines.next().expect("missing first line");

    let line = if let Some(rest) = first.strip_prefix("SIP/2.0 ") {
        let mut parts = rest.splitn(2, ' ');
        let code: u16 = parts.next().unwrap().parse().expect("status code");

        MessageLine::Response(StatusLine {
            code: code.into(),
            reason: parts.next().map(BytesStr::from),
        })
    } else {
        let mut parts = first.split(' ');
        let method = Method::from(parts.next().unwrap());
        let uri: SipUri = parts.next().unwrap().parse().expect("request uri");

        MessageLine::Request(RequestLine { method, uri })
    };

    let mut headers = Headers::new();

    for header in lines {
        let (name, value) = header.split_once(':').expect("malformed header");
        headers.insert(Name::from(name.trim()), value.trim());
    }

    ReceivedMessage {
        source,
        line,
        headers,
        body: Bytes::copy_from_slice(body.as_bytes()),
    }
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn make_stack(net: &Arc<TestNet>, port: u16) -> (Stack, SocketAddr) {
    make_stack_with(net, port, Config::default())
}

pub fn make_stack_with(net: &Arc<TestNet>, port: u16, config: Config) -> (Stack, SocketAddr) {
    let address = addr(port);

    let transport = Arc::new(MockTransport {
        addr: address,
        net: net.clone(),
    });

    let stack = Stack::new(config, transport).expect("valid config");
    stack.start().expect("start");
    net.register(address, stack.clone());

    (stack, address)
}

pub fn target(user: &str, destination: SocketAddr) -> SipUri {
    SipUri::new(destination.ip().to_string())
        .user(user)
        .port(destination.port())
}
