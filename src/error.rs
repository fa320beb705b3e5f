//! Error kinds shared by the network data parsers, the DHCPv6 client and
//! the indirect transmission engine.

use core::fmt;

/// Errors surfaced by the crate's protocol cores.
///
/// Parsers never panic on malformed input. They either skip the offending
/// record and continue, or report [`Error::Parse`] / [`Error::NotFound`] at
/// a record boundary. The radio related variants mirror the transmission
/// outcomes reported by the MAC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The requested record does not exist, or iteration is exhausted.
    NotFound,
    /// A fixed capacity buffer or table cannot hold the data.
    NoBufs,
    /// Malformed bytes at a record boundary.
    Parse,
    /// The message was discarded before it could be processed.
    Drop,
    /// The operation is not valid in the current state.
    InvalidState,
    /// The operation ran to completion but did not succeed.
    Failed,
    /// The operation was aborted before completion.
    Abort,
    /// No acknowledgment was received for a transmitted frame.
    NoAck,
    /// The radio could not access the channel.
    ChannelAccessFailure,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::NotFound => "not found",
            Error::NoBufs => "insufficient buffer space",
            Error::Parse => "malformed bytes",
            Error::Drop => "message dropped",
            Error::InvalidState => "invalid state for operation",
            Error::Failed => "operation failed",
            Error::Abort => "operation aborted",
            Error::NoAck => "no acknowledgment received",
            Error::ChannelAccessFailure => "channel access failure",
        })
    }
}

impl std::error::Error for Error {}
