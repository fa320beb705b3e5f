//! MAC layer types shared with the indirect transmission engine.
//!
//! The engine never talks to a radio directly. It stages frames into
//! [`TxFrame`] buffers owned by the caller and asks the MAC to purge or
//! replace already staged frames through the [`FrameScheduler`] seam. The
//! radio's pending-address filter is programmed through [`SourceMatcher`].

use bytes::Bytes;

use crate::Error;

/// An IEEE 802.15.4 MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// A 16 bit short address.
    Short(u16),
    /// A 64 bit extended address.
    Extended([u8; 8]),
}

/// A frame staged for transmission.
#[derive(Debug, Clone, Default)]
pub struct TxFrame {
    /// Destination address, if any.
    pub destination: Option<Address>,
    /// The frame payload.
    pub payload: Bytes,
    /// Whether an acknowledgment is requested.
    pub ack_request: bool,
    /// Whether more data is pending for the destination.
    pub frame_pending: bool,
}

impl TxFrame {
    /// Whether the frame carries no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Context handed back with the transmit-done callback for a staged frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameContext {
    /// Offset into the message after this frame, zero for frames not
    /// carrying message bytes.
    pub message_next_offset: u16,
}

/// The kind of change requested for an already staged frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameChange {
    /// Discard the staged frame.
    Purge,
    /// Rebuild the staged frame from the child's new current message.
    Replace,
}

/// Seam to the data poll handler. The engine requests a change to a staged
/// frame and the MAC answers, possibly immediately, through
/// `IndirectSender::handle_frame_change_done`.
pub trait FrameScheduler {
    /// Ask the MAC to purge or replace the frame staged for a child.
    fn request_frame_change(&mut self, change: FrameChange, child_index: usize);
}

/// Radio source match table operations, used to answer data polls with the
/// correct frame pending bit.
pub trait SourceMatcher {
    /// Add a short address entry.
    fn add_short_entry(&mut self, rloc16: u16) -> Result<(), Error>;
    /// Add an extended address entry.
    fn add_extended_entry(&mut self, ext_address: [u8; 8]) -> Result<(), Error>;
    /// Remove a short address entry.
    fn clear_short_entry(&mut self, rloc16: u16);
    /// Remove an extended address entry.
    fn clear_extended_entry(&mut self, ext_address: [u8; 8]);
}
