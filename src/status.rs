//! Gemini response status codes.
//!
//! Status codes are two digits. The first digit is the category, the second
//! refines it. The protocol core itself only emits [`Status::BAD_REQUEST`]
//! and [`Status::CGI_ERROR`]; everything else is chosen by applications.

use std::fmt;

/// A Gemini status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Status(u8);

impl Status {
    pub const INPUT: Status = Status(10);
    pub const SENSITIVE_INPUT: Status = Status(11);

    pub const SUCCESS: Status = Status(20);

    pub const REDIRECT_TEMPORARY: Status = Status(30);
    pub const REDIRECT_PERMANENT: Status = Status(31);

    pub const TEMPORARY_FAILURE: Status = Status(40);
    pub const SERVER_UNAVAILABLE: Status = Status(41);
    pub const CGI_ERROR: Status = Status(42);
    pub const PROXY_ERROR: Status = Status(43);
    pub const SLOW_DOWN: Status = Status(44);

    pub const PERMANENT_FAILURE: Status = Status(50);
    pub const NOT_FOUND: Status = Status(51);
    pub const GONE: Status = Status(52);
    pub const PROXY_REQUEST_REFUSED: Status = Status(53);
    pub const BAD_REQUEST: Status = Status(59);

    pub const CLIENT_CERTIFICATE_REQUIRED: Status = Status(60);
    pub const CERTIFICATE_NOT_AUTHORISED: Status = Status(61);
    pub const CERTIFICATE_NOT_VALID: Status = Status(62);

    /// Wrap an arbitrary numeric code.
    ///
    /// Applications proxying another server (or running CGI scripts) may
    /// need to pass through codes that have no named constant here.
    pub const fn from_code(code: u8) -> Self {
        Status(code)
    }

    /// The numeric code as sent on the wire.
    pub const fn code(self) -> u8 {
        self.0
    }

    /// The first digit of the code.
    pub const fn category(self) -> u8 {
        self.0 / 10
    }

    pub const fn is_success(self) -> bool {
        self.category() == 2
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        status.0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
