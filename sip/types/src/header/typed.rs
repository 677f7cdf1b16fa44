//! Typed representations of the headers the dialog core manipulates.
//!
//! Decoding is lenient where RFC 3261 allows it; encoding always produces
//! the canonical form.

use super::{HeaderError, Name, TypedHeader};
use crate::method::Method;
use crate::uri::{NameAddr, Params};
use anyhow::{Context, anyhow};
use bytesstr::BytesStr;
use std::fmt;
use std::str::FromStr;

macro_rules! value_header {
    ($(#[$comments:meta])* $ident:ident, $name:expr) => {
        $(#[$comments])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $ident(pub BytesStr);

        impl TypedHeader for $ident {
            const NAME: Name = $name;

            fn decode(value: &BytesStr) -> Result<Self, HeaderError> {
                Ok(Self(BytesStr::from(value.trim())))
            }

            fn encode(&self) -> BytesStr {
                self.0.clone()
            }
        }
    };
}

value_header!(
    /// `Call-ID` header
    CallId,
    Name::CALL_ID
);

value_header!(
    /// `Event` header (RFC 3515 uses the `refer` event package)
    Event,
    Name::EVENT
);

value_header!(
    /// A single `Supported` option tag
    Supported,
    Name::SUPPORTED
);

impl CallId {
    pub fn new<V: Into<BytesStr>>(value: V) -> Self {
        Self(value.into())
    }
}

/// `CSeq` header, sequence number plus method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub cseq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(cseq: u32, method: Method) -> Self {
        Self { cseq, method }
    }
}

impl TypedHeader for CSeq {
    const NAME: Name = Name::CSEQ;

    fn decode(value: &BytesStr) -> Result<Self, HeaderError> {
        let mut split = value.trim().split_ascii_whitespace();

        let cseq = split
            .next()
            .and_then(|cseq| u32::from_str(cseq).ok())
            .ok_or_else(|| HeaderError::malformed(Name::CSEQ, anyhow!("invalid sequence number")))?;

        let method = split
            .next()
            .map(Method::from)
            .ok_or_else(|| HeaderError::malformed(Name::CSEQ, anyhow!("missing method")))?;

        Ok(Self { cseq, method })
    }

    fn encode(&self) -> BytesStr {
        format!("{} {}", self.cseq, self.method).into()
    }
}

/// The shared shape of `From` and `To`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromTo {
    pub addr: NameAddr,
    pub tag: Option<BytesStr>,
    pub params: Params,
}

impl FromTo {
    pub fn new(addr: NameAddr, tag: Option<BytesStr>) -> Self {
        Self {
            addr,
            tag,
            params: Params::new(),
        }
    }

    fn decode_value(name: Name, value: &BytesStr) -> Result<Self, HeaderError> {
        let (rem, addr) = NameAddr::parse(value.trim())
            .map_err(|e| HeaderError::malformed(name.clone(), anyhow!("{e}")))?;

        let (_, mut params) = Params::parse_str(rem)
            .map_err(|e| HeaderError::malformed(name, anyhow!("{e}")))?;

        let tag = params.take("tag");

        Ok(Self { addr, tag, params })
    }

    fn encode_value(&self) -> BytesStr {
        let mut out = self.addr.to_string();

        if let Some(tag) = &self.tag {
            out.push_str(";tag=");
            out.push_str(tag);
        }

        out.push_str(&self.params.to_string());
        out.into()
    }
}

macro_rules! from_to_header {
    ($(#[$comments:meta])* $ident:ident, $name:expr) => {
        $(#[$comments])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $ident(pub FromTo);

        impl $ident {
            pub fn new(addr: NameAddr, tag: Option<BytesStr>) -> Self {
                Self(FromTo::new(addr, tag))
            }
        }

        impl TypedHeader for $ident {
            const NAME: Name = $name;

            fn decode(value: &BytesStr) -> Result<Self, HeaderError> {
                FromTo::decode_value($name, value).map(Self)
            }

            fn encode(&self) -> BytesStr {
                self.0.encode_value()
            }
        }

        impl std::ops::Deref for $ident {
            type Target = FromTo;

            fn deref(&self) -> &FromTo {
                &self.0
            }
        }

        impl std::ops::DerefMut for $ident {
            fn deref_mut(&mut self) -> &mut FromTo {
                &mut self.0
            }
        }
    };
}

from_to_header!(
    /// `From` header. Wraps [`FromTo`]
    From,
    Name::FROM
);

from_to_header!(
    /// `To` header. Wraps [`FromTo`]
    To,
    Name::TO
);

macro_rules! name_addr_header {
    ($(#[$comments:meta])* $ident:ident, $name:expr) => {
        $(#[$comments])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $ident {
            pub addr: NameAddr,
            pub params: Params,
        }

        impl $ident {
            pub fn new(addr: NameAddr) -> Self {
                Self {
                    addr,
                    params: Params::new(),
                }
            }
        }

        impl TypedHeader for $ident {
            const NAME: Name = $name;

            fn decode(value: &BytesStr) -> Result<Self, HeaderError> {
                let (rem, addr) = NameAddr::parse(value.trim())
                    .map_err(|e| HeaderError::malformed($name, anyhow!("{e}")))?;

                let (_, params) = Params::parse_str(rem)
                    .map_err(|e| HeaderError::malformed($name, anyhow!("{e}")))?;

                Ok(Self { addr, params })
            }

            fn encode(&self) -> BytesStr {
                format!("{}{}", self.addr, self.params).into()
            }
        }
    };
}

name_addr_header!(
    /// `Contact` header, only the name-addr form is supported
    Contact,
    Name::CONTACT
);

name_addr_header!(
    /// A single `Route` entry
    Route,
    Name::ROUTE
);

name_addr_header!(
    /// A single `Record-Route` entry
    RecordRoute,
    Name::RECORD_ROUTE
);

name_addr_header!(
    /// `Refer-To` header (RFC 3515 §2.1)
    ReferTo,
    Name::REFER_TO
);

impl ReferTo {
    /// Extract the `Replaces` URI header embedded in the refer target,
    /// if present (RFC 3891 attended transfer)
    pub fn replaces(&self) -> Option<Result<Replaces, HeaderError>> {
        let raw = self.addr.uri.header_val("Replaces")?;

        Some(Replaces::decode(raw))
    }

    /// Embed `replaces` into the refer target URI
    pub fn with_replaces(mut self, replaces: &Replaces) -> Self {
        self.addr.uri.push_header("Replaces", replaces.encode());
        self
    }
}

/// `Replaces` header (RFC 3891)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replaces {
    pub call_id: BytesStr,
    pub to_tag: BytesStr,
    pub from_tag: BytesStr,
    pub early_only: bool,
}

impl TypedHeader for Replaces {
    const NAME: Name = Name::REPLACES;

    fn decode(value: &BytesStr) -> Result<Self, HeaderError> {
        let value = value.trim();

        let (call_id, rem) = value.split_once(';').unwrap_or((value, ""));

        if call_id.is_empty() {
            return Err(HeaderError::malformed(
                Name::REPLACES,
                anyhow!("missing call-id"),
            ));
        }

        let mut params = if rem.is_empty() {
            Params::new()
        } else {
            Params::parse_str_bare(rem)
                .map_err(|e| HeaderError::malformed(Name::REPLACES, anyhow!("{e}")))?
                .1
        };

        let decoded = (|| -> anyhow::Result<Self> {
            Ok(Self {
                call_id: BytesStr::from(call_id),
                to_tag: params.take("to-tag").context("missing to-tag")?,
                from_tag: params.take("from-tag").context("missing from-tag")?,
                early_only: params.get("early-only").is_some(),
            })
        })();

        decoded.map_err(|e| HeaderError::malformed(Name::REPLACES, e))
    }

    fn encode(&self) -> BytesStr {
        let mut out = format!(
            "{};to-tag={};from-tag={}",
            self.call_id, self.to_tag, self.from_tag
        );

        if self.early_only {
            out.push_str(";early-only");
        }

        out.into()
    }
}

/// `Via` header, kept mostly opaque: the core only constructs new
/// values and inspects the branch parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: BytesStr,
    pub sent_by: BytesStr,
    pub params: Params,
}

impl Via {
    pub fn new<T, S, B>(transport: T, sent_by: S, branch: B) -> Self
    where
        T: Into<BytesStr>,
        S: Into<BytesStr>,
        B: Into<BytesStr>,
    {
        let mut params = Params::new();
        params.push_or_edit("branch", branch);

        Self {
            transport: transport.into(),
            sent_by: sent_by.into(),
            params,
        }
    }

    pub fn branch(&self) -> Option<&BytesStr> {
        self.params.get_val("branch")
    }
}

impl TypedHeader for Via {
    const NAME: Name = Name::VIA;

    fn decode(value: &BytesStr) -> Result<Self, HeaderError> {
        let value = value.trim();

        let rest = value
            .strip_prefix("SIP/2.0/")
            .ok_or_else(|| HeaderError::malformed(Name::VIA, anyhow!("missing protocol")))?;

        let (transport, rest) = rest
            .split_once(' ')
            .ok_or_else(|| HeaderError::malformed(Name::VIA, anyhow!("missing sent-by")))?;

        let (sent_by, rem) = match rest.find(';') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };

        let (_, params) = Params::parse_str(rem)
            .map_err(|e| HeaderError::malformed(Name::VIA, anyhow!("{e}")))?;

        Ok(Self {
            transport: BytesStr::from(transport),
            sent_by: BytesStr::from(sent_by.trim()),
            params,
        })
    }

    fn encode(&self) -> BytesStr {
        format!("SIP/2.0/{} {}{}", self.transport, self.sent_by, self.params).into()
    }
}

/// `Expires` header in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expires(pub u32);

impl TypedHeader for Expires {
    const NAME: Name = Name::EXPIRES;

    fn decode(value: &BytesStr) -> Result<Self, HeaderError> {
        u32::from_str(value.trim())
            .map(Self)
            .map_err(|e| HeaderError::malformed(Name::EXPIRES, e))
    }

    fn encode(&self) -> BytesStr {
        self.0.to_string().into()
    }
}

/// Value of the `Subscription-State` header (RFC 3515 §2.4.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Active,
    Pending,
    Terminated,
}

impl fmt::Display for SubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Pending => f.write_str("pending"),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

/// `Subscription-State` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub state: SubState,
    pub expires: Option<u32>,
}

impl SubscriptionState {
    pub fn active(expires: u32) -> Self {
        Self {
            state: SubState::Active,
            expires: Some(expires),
        }
    }

    pub fn terminated() -> Self {
        Self {
            state: SubState::Terminated,
            expires: None,
        }
    }
}

impl TypedHeader for SubscriptionState {
    const NAME: Name = Name::SUBSCRIPTION_STATE;

    fn decode(value: &BytesStr) -> Result<Self, HeaderError> {
        let value = value.trim();

        let (state, rem) = match value.find(';') {
            Some(pos) => (&value[..pos], &value[pos..]),
            None => (value, ""),
        };

        let state = match state.trim() {
            s if s.eq_ignore_ascii_case("active") => SubState::Active,
            s if s.eq_ignore_ascii_case("pending") => SubState::Pending,
            s if s.eq_ignore_ascii_case("terminated") => SubState::Terminated,
            s => {
                return Err(HeaderError::malformed(
                    Name::SUBSCRIPTION_STATE,
                    anyhow!("unknown state {s:?}"),
                ));
            }
        };

        let (_, mut params) = Params::parse_str(rem)
            .map_err(|e| HeaderError::malformed(Name::SUBSCRIPTION_STATE, anyhow!("{e}")))?;

        let expires = params
            .take("expires")
            .and_then(|expires| u32::from_str(&expires).ok());

        Ok(Self { state, expires })
    }

    fn encode(&self) -> BytesStr {
        match self.expires {
            Some(expires) => format!("{};expires={}", self.state, expires).into(),
            None => self.state.to_string().into(),
        }
    }
}

/// A single `Allow` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allow(pub Method);

impl TypedHeader for Allow {
    const NAME: Name = Name::ALLOW;

    fn decode(value: &BytesStr) -> Result<Self, HeaderError> {
        Ok(Self(Method::from(value.trim())))
    }

    fn encode(&self) -> BytesStr {
        self.0.to_string().into()
    }
}
