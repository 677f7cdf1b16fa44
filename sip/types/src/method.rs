use bytesstr::BytesStr;
use std::fmt;

/// Represents a SIP-Method.
///
/// Well known methods are implemented as constants, everything
/// else is carried verbatim.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Method(Repr);

macro_rules! methods {
    ($($print:literal, $ident:ident;)+) => {
        #[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[allow(clippy::upper_case_acronyms)]
        enum Repr {
            $($ident,)+
            Other(BytesStr),
        }

        impl Method {
            $(pub const $ident: Self = Self(Repr::$ident);)+

            /// Map a method name to its constant, falling back to [`Repr::Other`]
            /// for methods this library does not know about.
            pub fn from_str_value(value: &str) -> Self {
                $(
                    if value.eq_ignore_ascii_case($print) {
                        return Self(Repr::$ident);
                    }
                )+

                Self(Repr::Other(BytesStr::from(value)))
            }
        }

        impl fmt::Display for Method {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match &self.0 {
                    $(Repr::$ident => f.write_str($print),)+
                    Repr::Other(other) => f.write_str(other),
                }
            }
        }
    };
}

methods! {
    "INVITE",    INVITE;
    "ACK",       ACK;
    "CANCEL",    CANCEL;
    "BYE",       BYE;
    "OPTIONS",   OPTIONS;
    "UPDATE",    UPDATE;
    "SUBSCRIBE", SUBSCRIBE;
    "NOTIFY",    NOTIFY;
    "REFER",     REFER;
}

impl From<&str> for Method {
    fn from(value: &str) -> Self {
        Self::from_str_value(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn well_known() {
        assert_eq!(Method::from("invite"), Method::INVITE);
        assert_eq!(Method::from("REFER"), Method::REFER);
        assert_eq!(Method::INVITE.to_string(), "INVITE");
    }

    #[test]
    fn other() {
        let method = Method::from("PUBLISH");
        assert_eq!(method.to_string(), "PUBLISH");
        assert_ne!(method, Method::NOTIFY);
    }
}
