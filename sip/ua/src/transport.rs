//! The seam between the dialog core and the byte-level SIP transport.
//!
//! The adapter on the other side owns sockets, framing and message
//! parsing. It hands parsed messages to [`Stack::receive`] and accepts
//! serialized messages through [`Transport::send`].
//!
//! [`Stack::receive`]: crate::Stack::receive

use bytes::{Bytes, BytesMut};
use sip_types::header::typed::{CSeq, CallId, From, To, Via};
use sip_types::{HeaderError, Headers, MessageLine, Name};
use std::fmt;
use std::fmt::Write;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

/// Transport protocol used to reach a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportType {
    /// Via transport token
    pub fn name(self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
            Self::Tls => "TLS",
            Self::Ws => "WS",
            Self::Wss => "WSS",
        }
    }

    /// Connection oriented transports retransmit on their own, SIP level
    /// retransmission timers are suppressed for them
    pub fn reliable(self) -> bool {
        !matches!(self, Self::Udp)
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransportType {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            s if s.eq_ignore_ascii_case("udp") => Ok(Self::Udp),
            s if s.eq_ignore_ascii_case("tcp") => Ok(Self::Tcp),
            s if s.eq_ignore_ascii_case("tls") => Ok(Self::Tls),
            s if s.eq_ignore_ascii_case("ws") => Ok(Self::Ws),
            s if s.eq_ignore_ascii_case("wss") => Ok(Self::Wss),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown transport {s:?}"),
            )),
        }
    }
}

/// Implemented by the transport adapter outside the core.
///
/// `send` is fire-and-forget for datagram transports and reports
/// success/failure of the write for connection oriented ones.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    fn transport_type(&self) -> TransportType;

    /// Local address for Via/Contact construction
    fn local_addr(&self) -> SocketAddr;

    async fn send(&self, buffer: &[u8], destination: SocketAddr) -> io::Result<()>;
}

/// A parsed SIP message delivered by the transport adapter
#[derive(Debug)]
pub struct ReceivedMessage {
    pub source: SocketAddr,
    pub line: MessageLine,
    pub headers: Headers,
    pub body: Bytes,
}

/// A received message after routing: base headers extracted once by
/// the stack, then handed to the owning dialog
#[derive(Debug)]
pub(crate) struct IncomingMessage {
    pub(crate) source: SocketAddr,
    pub(crate) line: MessageLine,
    pub(crate) base: BaseHeaders,
    pub(crate) headers: Headers,
    pub(crate) body: Bytes,
}

/// Headers that are part of every message and drive routing
#[derive(Debug, Clone)]
pub struct BaseHeaders {
    pub via: Via,
    pub from: From,
    pub to: To,
    pub call_id: CallId,
    pub cseq: CSeq,
}

impl BaseHeaders {
    pub(crate) fn extract_from(headers: &Headers) -> Result<Self, HeaderError> {
        Ok(BaseHeaders {
            via: headers.get_named()?,
            from: headers.get_named()?,
            to: headers.get_named()?,
            call_id: headers.get_named()?,
            cseq: headers.get_named()?,
        })
    }
}

/// Print `line`, `headers` and `body` into a wire buffer.
///
/// Sets Content-Length from the body, the transport adapter must not
/// alter the framing.
pub(crate) fn serialize_message(line: &MessageLine, headers: &mut Headers, body: &Bytes) -> Bytes {
    headers.set(Name::CONTENT_LENGTH, body.len().to_string());

    let mut buffer = BytesMut::new();

    // infallible, BytesMut grows as needed
    let _ = write!(buffer, "{}\r\n{}\r\n", line, headers);

    buffer.extend_from_slice(body);

    buffer.freeze()
}

#[cfg(test)]
mod test {
    use super::*;
    use sip_types::{Method, RequestLine};

    #[test]
    fn transport_reliability() {
        assert!(!TransportType::Udp.reliable());
        assert!(TransportType::Tcp.reliable());
        assert!(TransportType::Wss.reliable());
    }

    #[test]
    fn serialize_sets_content_length() {
        let mut headers = Headers::new();
        headers.insert(Name::CALL_ID, "abc@softphone");

        let line = MessageLine::Request(RequestLine {
            method: Method::ACK,
            uri: "sip:bob@example.com".parse().unwrap(),
        });

        let body = Bytes::from_static(b"v=0");
        let buffer = serialize_message(&line, &mut headers, &body);

        let text = std::str::from_utf8(&buffer).unwrap();
        assert!(text.starts_with("ACK sip:bob@example.com SIP/2.0\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.ends_with("\r\n\r\nv=0"));
    }
}
