//! Close status codes as defined in [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
//!
//! A Close frame payload is either empty or starts with a big-endian `u16` status
//! code, optionally followed by a UTF-8 reason.

/// Status code carried by a Close frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000, the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001, an endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002, the peer violated the protocol.
    Protocol,
    /// 1003, the peer sent a data type the endpoint cannot accept.
    Unsupported,
    /// 1005, no status code was present. Never sent on the wire.
    Status,
    /// 1006, the connection dropped without a Close frame. Never sent on the wire.
    Abnormal,
    /// 1007, message data was inconsistent with its type (e.g. non UTF-8 text).
    Invalid,
    /// 1008, a message violated the endpoint's policy.
    Policy,
    /// 1009, a message was too big to process.
    Size,
    /// 1010, the client expected an extension the server did not negotiate.
    Extension,
    /// 1011, the server hit an unexpected condition.
    Error,
    /// 1012, the service is restarting.
    Restart,
    /// 1013, the service is overloaded, try again later.
    Again,
    /// 1015, TLS handshake failure. Never sent on the wire.
    Tls,
    /// Codes in 1016..=2999 reserved for future protocol revisions.
    Reserved(u16),
    /// Codes in 3000..=3999 registered with IANA for libraries and frameworks.
    Iana(u16),
    /// Codes in 4000..=4999 for private use between applications.
    Library(u16),
    /// Anything outside the ranges above.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if a peer is allowed to send this code in a Close frame.
    ///
    /// The pseudo codes 1005, 1006 and 1015, the reserved range and anything
    /// outside `1000..=4999` must be rejected when received.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Status
                | CloseCode::Abnormal
                | CloseCode::Tls
                | CloseCode::Reserved(_)
                | CloseCode::Bad(_)
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1004 | 1014 | 1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}
