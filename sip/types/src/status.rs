use std::fmt;
use std::str::FromStr;

type Repr = u16;

/// A SIP status code encoded in an u16
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StatusCode(Repr);

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tuple = f.debug_tuple("StatusCode");
        tuple.field(&self.0);
        if let Some(text) = self.text() {
            tuple.field(&text);
        }
        tuple.finish()
    }
}

/// The kind of a [`StatusCode`], for broader code handling
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CodeKind {
    /// Represents code 100..=199
    Provisional,

    /// Represents code 200..=299
    Success,

    /// Represents code 300..=399
    Redirection,

    /// Represents code 400..=499
    RequestFailure,

    /// Represents code 500..=599
    ServerFailure,

    /// Represents code 600..=699
    GlobalFailure,

    /// Represents all other codes
    Custom,
}

impl StatusCode {
    /// Returns the [`CodeKind`] of the code
    #[inline]
    pub fn kind(self) -> CodeKind {
        match self.0 {
            100..=199 => CodeKind::Provisional,
            200..=299 => CodeKind::Success,
            300..=399 => CodeKind::Redirection,
            400..=499 => CodeKind::RequestFailure,
            500..=599 => CodeKind::ServerFailure,
            600..=699 => CodeKind::GlobalFailure,
            _ => CodeKind::Custom,
        }
    }

    /// Final here means any non-provisional code
    #[inline]
    pub fn is_final(self) -> bool {
        self.0 >= 200
    }

    /// Returns the number that the code represents
    #[inline]
    pub fn into_u16(self) -> Repr {
        self.0
    }
}

impl FromStr for StatusCode {
    type Err = <Repr as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(StatusCode(Repr::from_str(s)?))
    }
}

impl From<Repr> for StatusCode {
    fn from(r: Repr) -> StatusCode {
        StatusCode(r)
    }
}

macro_rules! codes {
    ($($code:literal, $konst:ident, $text:literal;)+) => {
        impl StatusCode {
            $(pub const $konst: StatusCode = StatusCode($code);)+

            /// Returns the default reason phrase of well known codes
            pub fn text(self) -> Option<&'static str> {
                match self.0 {
                    $($code => Some($text),)+
                    _ => None,
                }
            }
        }
    };
}

codes! {
    100, TRYING, "Trying";
    180, RINGING, "Ringing";
    181, CALL_IS_BEING_FORWARDED, "Call Is Being Forwarded";
    182, QUEUED, "Queued";
    183, SESSION_PROGRESS, "Session Progress";

    200, OK, "OK";
    202, ACCEPTED, "Accepted";

    300, MULTIPLE_CHOICES, "Multiple Choices";
    301, MOVED_PERMANENTLY, "Moved Permanently";
    302, MOVED_TEMPORARILY, "Moved Temporarily";

    400, BAD_REQUEST, "Bad Request";
    401, UNAUTHORIZED, "Unauthorized";
    403, FORBIDDEN, "Forbidden";
    404, NOT_FOUND, "Not Found";
    405, METHOD_NOT_ALLOWED, "Method Not Allowed";
    408, REQUEST_TIMEOUT, "Request Timeout";
    410, GONE, "Gone";
    481, CALL_OR_TRANSACTION_DOES_NOT_EXIST, "Call/Transaction Does Not Exist";
    486, BUSY_HERE, "Busy Here";
    487, REQUEST_TERMINATED, "Request Terminated";
    488, NOT_ACCEPTABLE_HERE, "Not Acceptable Here";
    489, BAD_EVENT, "Bad Event";
    491, REQUEST_PENDING, "Request Pending";

    500, SERVER_INTERNAL_ERROR, "Server Internal Error";
    501, NOT_IMPLEMENTED, "Not Implemented";
    503, SERVICE_UNAVAILABLE, "Service Unavailable";

    600, BUSY_EVERYWHERE, "Busy Everywhere";
    603, DECLINE, "Decline";
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(StatusCode::TRYING.kind(), CodeKind::Provisional);
        assert_eq!(StatusCode::OK.kind(), CodeKind::Success);
        assert_eq!(StatusCode::BUSY_HERE.kind(), CodeKind::RequestFailure);
        assert_eq!(StatusCode::from(606).kind(), CodeKind::GlobalFailure);
        assert!(!StatusCode::RINGING.is_final());
        assert!(StatusCode::REQUEST_TERMINATED.is_final());
    }

    #[test]
    fn text() {
        assert_eq!(StatusCode::ACCEPTED.text(), Some("Accepted"));
        assert_eq!(StatusCode::from(599).text(), None);
    }
}
