use crate::header::Headers;
use crate::method::Method;
use crate::status::StatusCode;
use crate::uri::SipUri;
use bytes::Bytes;
use bytesstr::BytesStr;
use std::fmt;

/// Request line of a SIP request
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0", self.method, self.uri)
    }
}

/// Status line of a SIP response
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub code: StatusCode,
    pub reason: Option<BytesStr>,
}

impl StatusLine {
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            reason: code.text().map(BytesStr::from_static),
        }
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {}", self.code.into_u16())?;

        if let Some(reason) = &self.reason {
            write!(f, " {}", reason)?;
        }

        Ok(())
    }
}

/// First line of any SIP message
#[derive(Debug, Clone)]
pub enum MessageLine {
    Request(RequestLine),
    Response(StatusLine),
}

impl MessageLine {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

impl fmt::Display for MessageLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(line) => line.fmt(f),
            Self::Response(line) => line.fmt(f),
        }
    }
}

/// Basic request
#[derive(Debug, Clone)]
pub struct Request {
    pub line: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    /// Create an empty request
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            line: RequestLine { method, uri },
            headers: Default::default(),
            body: Bytes::new(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

/// Basic response
#[derive(Debug, Clone)]
pub struct Response {
    pub line: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(code: StatusCode) -> Self {
        Self {
            line: StatusLine::new(code),
            headers: Default::default(),
            body: Bytes::new(),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_line_print() {
        let line = RequestLine {
            method: Method::INVITE,
            uri: "sip:bob@example.com:5060".parse().unwrap(),
        };

        assert_eq!(line.to_string(), "INVITE sip:bob@example.com:5060 SIP/2.0");
    }

    #[test]
    fn status_line_print() {
        assert_eq!(
            StatusLine::new(StatusCode::RINGING).to_string(),
            "SIP/2.0 180 Ringing"
        );

        let no_reason = StatusLine {
            code: StatusCode::from(299),
            reason: None,
        };
        assert_eq!(no_reason.to_string(), "SIP/2.0 299");
    }
}
