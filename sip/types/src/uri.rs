use bytesstr::BytesStr;
use nom::IResult;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::combinator::{map, opt};
use nom::multi::many0;
use nom::sequence::{preceded, tuple};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, percent_encode};
use std::fmt;
use std::str::FromStr;

/// Characters that have to be escaped inside a URI header value
const URI_HEADER_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b';')
    .add(b'=')
    .add(b'?')
    .add(b'&')
    .add(b'#')
    .add(b'%');

/// A single `;name` or `;name=value` parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: BytesStr,
    pub value: Option<BytesStr>,
}

impl Param {
    pub fn value<N, V>(name: N, value: V) -> Self
    where
        N: Into<BytesStr>,
        V: Into<BytesStr>,
    {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;

        if let Some(value) = &self.value {
            write!(f, "={}", value)?;
        }

        Ok(())
    }
}

/// An ordered list of `;`-delimited parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    params: Vec<Param>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    #[inline]
    pub fn push(&mut self, param: Param) {
        self.params.push(param);
    }

    #[inline]
    pub fn get<N: AsRef<str>>(&self, name: N) -> Option<&Param> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.as_ref()))
    }

    #[inline]
    pub fn get_val<N: AsRef<str>>(&self, name: N) -> Option<&BytesStr> {
        self.get(name).and_then(|p| p.value.as_ref())
    }

    #[inline]
    pub fn take<N: AsRef<str>>(&mut self, name: N) -> Option<BytesStr> {
        let pos = self
            .params
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name.as_ref()))?;

        self.params.remove(pos).value
    }

    #[inline]
    pub fn push_or_edit<N, V>(&mut self, name: N, value: V)
    where
        N: Into<BytesStr> + AsRef<str>,
        V: Into<BytesStr>,
    {
        if let Some(param) = self
            .params
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name.as_ref()))
        {
            param.value = Some(value.into());
        } else {
            self.push(Param::value(name, value));
        }
    }

    /// Parse zero or more `;name=value` pairs
    pub fn parse_str(i: &str) -> IResult<&str, Self> {
        map(
            many0(preceded(tag(";"), Param::parse)),
            |params| Params { params },
        )(i)
    }

    /// Parse `name=value;name=value` where the leading delimiter is
    /// already consumed, as inside a `Replaces` value
    pub fn parse_str_bare(i: &str) -> IResult<&str, Self> {
        map(
            tuple((Param::parse, Self::parse_str)),
            |(first, mut params)| {
                params.params.insert(0, first);
                params
            },
        )(i)
    }
}

impl Param {
    fn parse(i: &str) -> IResult<&str, Self> {
        map(
            tuple((
                take_while1(is_param_char),
                opt(preceded(tag("="), take_while1(is_param_char))),
            )),
            |(name, value): (&str, Option<&str>)| Param {
                name: BytesStr::from(name),
                value: value.map(BytesStr::from),
            },
        )(i)
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for param in &self.params {
            write!(f, ";{}", param)?;
        }

        Ok(())
    }
}

fn is_param_char(c: char) -> bool {
    !matches!(c, ';' | '=' | '?' | '&' | '>' | ',' | ' ' | '\t' | '\r' | '\n')
}

fn is_header_char(c: char) -> bool {
    !matches!(c, '=' | '?' | '&' | '>' | ' ' | '\t' | '\r' | '\n')
}

/// A `sip:` / `sips:` URI.
///
/// Carries the URI parameters and URI headers separately; header values are
/// stored percent-decoded and re-encoded when printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<BytesStr>,
    pub host: BytesStr,
    pub port: Option<u16>,
    pub params: Params,
    pub headers: Vec<(BytesStr, BytesStr)>,
}

impl SipUri {
    pub fn new<H: Into<BytesStr>>(host: H) -> Self {
        Self {
            sips: false,
            user: None,
            host: host.into(),
            port: None,
            params: Params::new(),
            headers: Vec::new(),
        }
    }

    pub fn user<U: Into<BytesStr>>(mut self, user: U) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Look up a URI header (the part after `?`), percent-decoded
    pub fn header_val(&self, name: &str) -> Option<&BytesStr> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn push_header<N, V>(&mut self, name: N, value: V)
    where
        N: Into<BytesStr>,
        V: Into<BytesStr>,
    {
        self.headers.push((name.into(), value.into()));
    }

    /// URI comparison for routing purposes, ignores params and headers
    pub fn compare(&self, other: &Self) -> bool {
        self.sips == other.sips
            && self.user == other.user
            && self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
    }

    pub fn parse(i: &str) -> IResult<&str, Self> {
        let (i, mut uri) = Self::parse_no_params(i)?;

        let (i, params) = Params::parse_str(i)?;

        let (i, headers) = opt(preceded(tag("?"), parse_uri_headers))(i)?;

        uri.params = params;
        uri.headers = headers.unwrap_or_default();

        Ok((i, uri))
    }

    /// Parse only scheme, user-part and host-port. Used for the bare
    /// (no angle bracket) From/To form where trailing parameters belong
    /// to the header, not the URI.
    pub fn parse_no_params(i: &str) -> IResult<&str, Self> {
        let (i, sips) = map(
            nom::branch::alt((tag("sips:"), tag("sip:"))),
            |scheme: &str| scheme.len() == 5,
        )(i)?;

        let (i, user) = opt(nom::sequence::terminated(
            take_while1(|c: char| !matches!(c, '@' | ';' | '?' | '>' | ' ')),
            tag("@"),
        ))(i)?;

        let (i, host) = take_while1(|c: char| !matches!(c, ':' | ';' | '?' | '>' | ' ' | ','))(i)?;

        let (i, port) = opt(preceded(tag(":"), take_while1(|c: char| c.is_ascii_digit())))(i)?;

        let port = match port {
            Some(port) => match u16::from_str(port) {
                Ok(port) => Some(port),
                Err(_) => {
                    return Err(nom::Err::Failure(nom::error::Error::new(
                        i,
                        nom::error::ErrorKind::Digit,
                    )));
                }
            },
            None => None,
        };

        Ok((
            i,
            SipUri {
                sips,
                user: user.map(BytesStr::from),
                host: BytesStr::from(host),
                port,
                params: Params::new(),
                headers: Vec::new(),
            },
        ))
    }
}

fn parse_uri_headers(i: &str) -> IResult<&str, Vec<(BytesStr, BytesStr)>> {
    nom::multi::separated_list1(
        tag("&"),
        map(
            tuple((
                take_while1(is_header_char),
                tag("="),
                take_while(is_header_char),
            )),
            |(name, _, value): (&str, &str, &str)| {
                let value = percent_decode_str(value)
                    .decode_utf8()
                    .map(|decoded| BytesStr::from(decoded.as_ref()))
                    .unwrap_or_else(|_| BytesStr::from(value));

                (BytesStr::from(name), value)
            },
        ),
    )(i)
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sips {
            write!(f, "sips:")?;
        } else {
            write!(f, "sip:")?;
        }

        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }

        f.write_str(&self.host)?;

        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }

        write!(f, "{}", self.params)?;

        for (idx, (name, value)) in self.headers.iter().enumerate() {
            let delim = if idx == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", delim, name, percent_encode(value.as_bytes(), URI_HEADER_ESCAPE))?;
        }

        Ok(())
    }
}

impl FromStr for SipUri {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rem, uri) =
            Self::parse(s.trim()).map_err(|e| anyhow::anyhow!("invalid sip uri: {}", e))?;

        if !rem.is_empty() {
            anyhow::bail!("trailing input after sip uri: {:?}", rem);
        }

        Ok(uri)
    }
}

/// `display <uri>` form used by From/To/Contact/Refer-To
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display: Option<BytesStr>,
    pub uri: SipUri,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        Self { display: None, uri }
    }

    pub fn display<D: Into<BytesStr>>(mut self, display: D) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn parse(i: &str) -> IResult<&str, Self> {
        let i = i.trim_start();

        let (i, display) = opt(nom::branch::alt((
            nom::sequence::delimited(
                tag("\""),
                take_while(|c: char| c != '"'),
                tag("\""),
            ),
            nom::sequence::terminated(
                take_while1(|c: char| !matches!(c, '<' | '"' | ';' | ',')),
                nom::combinator::peek(tag("<")),
            ),
        )))(i)?;

        let i = i.trim_start();

        let (i, uri) = if let Some(i) = i.strip_prefix('<') {
            let (i, uri) = SipUri::parse(i)?;
            let (i, _) = tag(">")(i)?;
            (i, uri)
        } else {
            // Bare form: everything after the host-port belongs to the
            // surrounding header, not the URI
            SipUri::parse_no_params(i)?
        };

        let display = display
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(BytesStr::from);

        Ok((i, NameAddr { display, uri }))
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{}\" ", display)?;
        }

        write!(f, "<{}>", self.uri)
    }
}
