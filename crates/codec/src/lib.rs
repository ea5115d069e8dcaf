//! ## Licklider Transmission Protocol (LTP) segment codec
//!
//! [RFC5326]: https://tools.ietf.org/html/rfc5326
//! [RFC6256]: https://tools.ietf.org/html/rfc6256
//!
//! LTP provides retransmission-based reliability over links characterized
//! by extremely long round-trip times and frequent interruptions, such as
//! deep-space radio links. Communication is session oriented: each block
//! of application data is transferred in its own session, with a reliable
//! "red" prefix acknowledged through reception reports and a best-effort
//! "green" suffix. This crate implements the wire format of [RFC5326]:
//! the SDNV variable-length integers of [RFC6256], the typed segments,
//! their serializers, and a streaming resumable parser suitable for
//! feeding raw datagram bytes.

pub mod parser;
pub mod sdnv;
pub mod segment;

use std::fmt;

/// Parse and codec errors.
///
/// Any of these causes the parser to drop the segment being parsed and
/// reset; none of them carries session state with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    UnsupportedVersion(u8),
    UndefinedSegmentType(u8),
    UnknownCancelReason(u8),
    SdnvTooLong,
    SdnvTruncated,
    SdnvOverflow,
    ZeroDataLength,
    ZeroClaimCount,
    ZeroClaimLength,
    InvalidInput,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Identifies one session: the originating engine and a number unique
/// within that engine.
///
/// # Test
///
/// ```
/// use ltp_server_codec::SessionId;
///
/// let id = SessionId::new(100, 0x0123);
///
/// assert_eq!(id.originator, 100);
/// assert_eq!(id.number, 0x0123);
/// assert_eq!(id.to_string(), "100.291");
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub originator: u64,
    pub number: u64,
}

impl SessionId {
    pub const fn new(originator: u64, number: u64) -> Self {
        Self { originator, number }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.originator, self.number)
    }
}
