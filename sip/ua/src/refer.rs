//! REFER subscriptions (RFC 3515) and the `message/sipfrag` bodies
//! their NOTIFYs carry.

use bytes::Bytes;
use bytesstr::BytesStr;
use sip_types::StatusCode;
use sip_types::header::typed::Replaces;
use sip_types::uri::NameAddr;
use std::str::FromStr;

/// Which side of the REFER this subscription belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferDirection {
    /// We sent the REFER and receive NOTIFYs about its progress
    Outgoing,
    /// We accepted a REFER and send NOTIFYs about our progress
    Incoming,
}

/// State created by sending or accepting a REFER.
///
/// The id is the CSeq number of the REFER request, it doubles as the
/// `id` parameter of the `Event: refer` header so multiple transfers
/// inside one dialog stay distinguishable.
#[derive(Debug)]
pub struct ReferSubscription {
    pub id: u32,
    pub direction: ReferDirection,
    pub target: NameAddr,
    pub replaces: Option<Replaces>,
    pub active: bool,
    pub notify_count: u32,
}

impl ReferSubscription {
    pub(crate) fn new(
        id: u32,
        direction: ReferDirection,
        target: NameAddr,
        replaces: Option<Replaces>,
    ) -> Self {
        Self {
            id,
            direction,
            target,
            replaces,
            active: true,
            notify_count: 0,
        }
    }
}

/// Transfer progress carried by a NOTIFY, parsed from its sipfrag body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferProgress {
    pub subscription_id: u32,
    pub status: StatusCode,
}

impl ReferProgress {
    /// Final here means the subscription is over
    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

/// `SIP/2.0 180 Ringing\r\n` style body for a NOTIFY
pub(crate) fn sipfrag_body(status: StatusCode) -> Bytes {
    let reason = status.text().unwrap_or("");

    if reason.is_empty() {
        format!("SIP/2.0 {}\r\n", status.into_u16()).into()
    } else {
        format!("SIP/2.0 {} {}\r\n", status.into_u16(), reason).into()
    }
}

/// Parse the status line out of a `message/sipfrag` body
pub(crate) fn parse_sipfrag(body: &[u8]) -> Option<StatusCode> {
    let body = std::str::from_utf8(body).ok()?;
    let line = body.lines().next()?;

    let rest = line.strip_prefix("SIP/2.0")?.trim_start();

    let digits = rest.split(' ').next()?;

    StatusCode::from_str(digits).ok()
}

pub(crate) const SIPFRAG_CONTENT_TYPE: &str = "message/sipfrag;version=2.0";

/// Is `value` a sipfrag content type (parameters ignored)
pub(crate) fn is_sipfrag(value: &BytesStr) -> bool {
    value
        .split(';')
        .next()
        .is_some_and(|main| main.trim().eq_ignore_ascii_case("message/sipfrag"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sipfrag_roundtrip() {
        let body = sipfrag_body(StatusCode::RINGING);
        assert_eq!(&body[..], b"SIP/2.0 180 Ringing\r\n");

        assert_eq!(parse_sipfrag(&body), Some(StatusCode::RINGING));
    }

    #[test]
    fn sipfrag_without_reason() {
        let body = sipfrag_body(StatusCode::from(299));
        assert_eq!(&body[..], b"SIP/2.0 299\r\n");
        assert_eq!(parse_sipfrag(&body), Some(StatusCode::from(299)));
    }

    #[test]
    fn sipfrag_rejects_garbage() {
        assert_eq!(parse_sipfrag(b"INVITE sip:a@b SIP/2.0\r\n"), None);
        assert_eq!(parse_sipfrag(b""), None);
        assert_eq!(parse_sipfrag(&[0xff, 0xfe]), None);
    }

    #[test]
    fn content_type_check() {
        assert!(is_sipfrag(&BytesStr::from_static(
            "message/sipfrag;version=2.0"
        )));
        assert!(is_sipfrag(&BytesStr::from_static("Message/Sipfrag")));
        assert!(!is_sipfrag(&BytesStr::from_static("application/sdp")));
    }
}
