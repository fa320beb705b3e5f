//! Tracks pending message counts per child and programs the radio source
//! match table accordingly.
//!
//! The radio answers a sleepy child's data poll with the frame pending bit
//! taken from its source match table. An entry for a child therefore
//! exists exactly while at least one message is queued for it.

use tracing::{trace, warn};

use crate::child::Child;
use crate::mac::SourceMatcher;

/// Controller keeping the radio's pending-address filter in sync with the
/// per-child message counts.
#[derive(Debug, Default)]
pub struct SourceMatchController;

impl SourceMatchController {
    /// Create a new `SourceMatchController`.
    pub fn new() -> Self {
        Self
    }

    /// Account for a newly queued message for `child`.
    pub fn increment_message_count<R: SourceMatcher>(&mut self, child: &mut Child, radio: &mut R) {
        if child.indirect_message_count == 0 {
            self.add_entry(child, radio);
        }
        child.indirect_message_count += 1;
        trace!(
            rloc16 = %child.rloc16,
            count = child.indirect_message_count,
            "Indirect message count incremented"
        );
    }

    /// Account for a message no longer queued for `child`.
    pub fn decrement_message_count<R: SourceMatcher>(&mut self, child: &mut Child, radio: &mut R) {
        if child.indirect_message_count == 0 {
            warn!(rloc16 = %child.rloc16, "Indirect message count underflow");
            return;
        }
        child.indirect_message_count -= 1;
        if child.indirect_message_count == 0 {
            self.clear_entry(child, radio);
        }
    }

    /// Drop all accounting for `child`.
    pub fn reset_message_count<R: SourceMatcher>(&mut self, child: &mut Child, radio: &mut R) {
        if child.indirect_message_count > 0 {
            self.clear_entry(child, radio);
        }
        child.indirect_message_count = 0;
    }

    /// Switch the child's source match entry between short and extended
    /// addressing.
    pub fn set_src_match_as_short<R: SourceMatcher>(
        &mut self,
        child: &mut Child,
        short: bool,
        radio: &mut R,
    ) {
        if child.use_short_address == short {
            return;
        }

        if child.indirect_message_count > 0 {
            self.clear_entry(child, radio);
            child.use_short_address = short;
            self.add_entry(child, radio);
        } else {
            child.use_short_address = short;
        }
    }

    fn add_entry<R: SourceMatcher>(&mut self, child: &Child, radio: &mut R) {
        let result = if child.use_short_address {
            radio.add_short_entry(child.rloc16.value())
        } else {
            radio.add_extended_entry(child.ext_address)
        };
        if let Err(error) = result {
            warn!(rloc16 = %child.rloc16, %error, "Failed to add source match entry");
        }
    }

    fn clear_entry<R: SourceMatcher>(&mut self, child: &Child, radio: &mut R) {
        if child.use_short_address {
            radio.clear_short_entry(child.rloc16.value());
        } else {
            radio.clear_extended_entry(child.ext_address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rloc::Rloc16;
    use crate::Error;

    #[derive(Debug, Default, PartialEq)]
    struct RecordingRadio {
        short_entries: Vec<u16>,
        extended_entries: Vec<[u8; 8]>,
    }

    impl SourceMatcher for RecordingRadio {
        fn add_short_entry(&mut self, rloc16: u16) -> Result<(), Error> {
            self.short_entries.push(rloc16);
            Ok(())
        }

        fn add_extended_entry(&mut self, ext_address: [u8; 8]) -> Result<(), Error> {
            self.extended_entries.push(ext_address);
            Ok(())
        }

        fn clear_short_entry(&mut self, rloc16: u16) {
            self.short_entries.retain(|e| *e != rloc16);
        }

        fn clear_extended_entry(&mut self, ext_address: [u8; 8]) {
            self.extended_entries.retain(|e| *e != ext_address);
        }
    }

    #[test]
    fn entry_tracks_message_count() {
        let mut controller = SourceMatchController::new();
        let mut radio = RecordingRadio::default();
        let mut child = Child::new(Rloc16::new(0x0401), [7; 8]);

        controller.increment_message_count(&mut child, &mut radio);
        controller.increment_message_count(&mut child, &mut radio);
        assert_eq!(child.indirect_message_count, 2);
        // One extended entry, added on the 0 -> 1 transition only.
        assert_eq!(radio.extended_entries, vec![[7; 8]]);

        controller.decrement_message_count(&mut child, &mut radio);
        assert_eq!(radio.extended_entries, vec![[7; 8]]);
        controller.decrement_message_count(&mut child, &mut radio);
        assert!(radio.extended_entries.is_empty());

        // Underflow is reported, not wrapped.
        controller.decrement_message_count(&mut child, &mut radio);
        assert_eq!(child.indirect_message_count, 0);
    }

    #[test]
    fn switching_to_short_replaces_live_entry() {
        let mut controller = SourceMatchController::new();
        let mut radio = RecordingRadio::default();
        let mut child = Child::new(Rloc16::new(0x0401), [7; 8]);

        controller.increment_message_count(&mut child, &mut radio);
        controller.set_src_match_as_short(&mut child, true, &mut radio);

        assert!(radio.extended_entries.is_empty());
        assert_eq!(radio.short_entries, vec![0x0401]);
        assert!(child.use_short_address);

        // Switching again is a no-op.
        controller.set_src_match_as_short(&mut child, true, &mut radio);
        assert_eq!(radio.short_entries, vec![0x0401]);
    }

    #[test]
    fn switching_without_pending_messages_only_flips_the_mode() {
        let mut controller = SourceMatchController::new();
        let mut radio = RecordingRadio::default();
        let mut child = Child::new(Rloc16::new(0x0401), [7; 8]);

        controller.set_src_match_as_short(&mut child, true, &mut radio);
        assert!(child.use_short_address);
        assert!(radio.short_entries.is_empty());

        controller.reset_message_count(&mut child, &mut radio);
        assert_eq!(radio, RecordingRadio::default());
    }
}
