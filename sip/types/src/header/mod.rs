use bytesstr::BytesStr;
use std::fmt;

pub mod typed;

/// Represents a SIP-Header's name.
///
/// Names compare case-insensitively but keep their canonical
/// spelling for printing.
#[derive(Debug, Clone)]
pub struct Name(Repr);

macro_rules! header_names {
    ($($print:literal, $ident:ident, $konst:ident;)+) => {
        #[derive(Debug, Clone)]
        enum Repr {
            $($ident,)+
            Other(BytesStr),
        }

        impl Name {
            $(pub const $konst: Name = Name(Repr::$ident);)+

            /// Returns the canonical spelling of the name
            pub fn as_print_str(&self) -> &str {
                match &self.0 {
                    $(Repr::$ident => $print,)+
                    Repr::Other(name) => name,
                }
            }

            /// Map a header name to its constant, keeping unknown
            /// names verbatim
            pub fn from_str_value(value: &str) -> Self {
                $(
                    if value.eq_ignore_ascii_case($print) {
                        return Name(Repr::$ident);
                    }
                )+

                Name(Repr::Other(BytesStr::from(value)))
            }
        }
    };
}

header_names! {
    "Via", Via, VIA;
    "From", From, FROM;
    "To", To, TO;
    "Call-ID", CallId, CALL_ID;
    "CSeq", CSeq, CSEQ;
    "Contact", Contact, CONTACT;
    "Route", Route, ROUTE;
    "Record-Route", RecordRoute, RECORD_ROUTE;
    "Max-Forwards", MaxForwards, MAX_FORWARDS;
    "Content-Length", ContentLength, CONTENT_LENGTH;
    "Content-Type", ContentType, CONTENT_TYPE;
    "User-Agent", UserAgent, USER_AGENT;
    "Allow", Allow, ALLOW;
    "Supported", Supported, SUPPORTED;
    "Refer-To", ReferTo, REFER_TO;
    "Referred-By", ReferredBy, REFERRED_BY;
    "Replaces", Replaces, REPLACES;
    "Event", Event, EVENT;
    "Subscription-State", SubscriptionState, SUBSCRIPTION_STATE;
    "Expires", Expires, EXPIRES;
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.as_print_str()
            .eq_ignore_ascii_case(other.as_print_str())
    }
}

impl Eq for Name {}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        self.as_print_str().eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_print_str())
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::from_str_value(value)
    }
}

/// Error returned when decoding a typed header from its raw value
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("missing header {0}")]
    Missing(Name),
    #[error("malformed header {name}: {error}")]
    Malformed {
        name: Name,
        #[source]
        error: anyhow::Error,
    },
}

impl HeaderError {
    pub fn malformed<E>(name: Name, error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Malformed {
            name,
            error: error.into(),
        }
    }

    /// The header the error refers to
    pub fn name(&self) -> &Name {
        match self {
            Self::Missing(name) => name,
            Self::Malformed { name, .. } => name,
        }
    }
}

/// A header which has a canonical name and can be decoded from /
/// encoded into a raw header value
pub trait TypedHeader: Sized {
    const NAME: Name;

    fn decode(value: &BytesStr) -> Result<Self, HeaderError>;
    fn encode(&self) -> BytesStr;
}

/// Ordered collection of SIP headers.
///
/// Values keep the exact case they were inserted with; names compare
/// case-insensitively.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    entries: Vec<(Name, BytesStr)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert<V: Into<BytesStr>>(&mut self, name: Name, value: V) {
        self.entries.push((name, value.into()));
    }

    /// Insert a header in front of all others, used for Via
    pub fn insert_front<V: Into<BytesStr>>(&mut self, name: Name, value: V) {
        self.entries.insert(0, (name, value.into()));
    }

    /// Replace every occurrence of `name` with a single new value
    pub fn set<V: Into<BytesStr>>(&mut self, name: Name, value: V) {
        self.entries.retain(|(n, _)| *n != name);
        self.entries.push((name, value.into()));
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &Name) -> Option<&BytesStr> {
        self.entries
            .iter()
            .find_map(|(n, v)| (n == name).then_some(v))
    }

    pub fn get_all<'h>(&'h self, name: &'h Name) -> impl Iterator<Item = &'h BytesStr> + 'h {
        self.entries
            .iter()
            .filter_map(move |(n, v)| (n == name).then_some(v))
    }

    pub fn remove(&mut self, name: &Name) -> Option<BytesStr> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(pos).1)
    }

    /// Clone all values of `name` into `dst`, preserving order
    pub fn clone_into(&self, dst: &mut Headers, name: Name) {
        for value in self.get_all(&name) {
            dst.insert(name.clone(), value.clone());
        }
    }

    /// Decode the typed header `T` from the first value of its name
    pub fn get_named<T: TypedHeader>(&self) -> Result<T, HeaderError> {
        let value = self
            .get(&T::NAME)
            .ok_or_else(|| HeaderError::Missing(T::NAME))?;

        T::decode(value)
    }

    /// Decode every value of `T`'s name
    pub fn get_all_named<T: TypedHeader>(&self) -> Result<Vec<T>, HeaderError> {
        self.get_all(&T::NAME).map(|v| T::decode(v)).collect()
    }

    pub fn insert_named<T: TypedHeader>(&mut self, header: &T) {
        self.insert(T::NAME, header.encode());
    }

    pub fn insert_named_front<T: TypedHeader>(&mut self, header: &T) {
        self.insert_front(T::NAME, header.encode());
    }

    /// Decode, modify and re-encode the typed header `T` in place
    pub fn edit_named<T, F>(&mut self, edit: F) -> Result<(), HeaderError>
    where
        T: TypedHeader,
        F: FnOnce(&mut T),
    {
        let entry = self
            .entries
            .iter_mut()
            .find(|(n, _)| *n == T::NAME)
            .ok_or_else(|| HeaderError::Missing(T::NAME))?;

        let mut typed = T::decode(&entry.1)?;
        edit(&mut typed);
        entry.1 = typed.encode();

        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &BytesStr)> {
        self.entries.iter().map(|(n, v)| (n, v))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{}: {}\r\n", name, value)?;
        }

        Ok(())
    }
}
