//! Child table bookkeeping for the indirect sender.

use std::time::{Duration, Instant};

use crate::mac::Address;
use crate::message::MessageId;
use crate::rloc::Rloc16;

/// Index of a child in the [`ChildTable`].
pub type ChildIndex = usize;

/// Capacity of the child table.
pub const MAX_CHILD_TABLE_SIZE: usize = crate::message::MAX_CHILDREN;

/// Attachment state of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Fully attached.
    Valid,
    /// Being restored after a parent reset.
    Restoring,
    /// Detached or timed out; queued state is reclaimed.
    Invalid,
}

/// A child of this router and its indirect transmission state.
#[derive(Debug, Clone)]
pub struct Child {
    /// The child's routing locator.
    pub rloc16: Rloc16,
    /// The child's extended MAC address.
    pub ext_address: [u8; 8],
    /// Whether the child keeps its receiver on when idle. Children with
    /// the receiver off are sleepy and reached through indirect
    /// transmission.
    pub rx_on_when_idle: bool,
    /// Attachment state.
    pub state: ChildState,

    /// CSL period, when the child synchronized a CSL schedule with us.
    pub csl_period: Option<Duration>,
    /// Offset of the child's sample window within its CSL period.
    pub csl_phase: Duration,
    /// When the CSL schedule was last synchronized.
    pub csl_synchronized_at: Option<Instant>,

    pub(crate) indirect_message: Option<MessageId>,
    pub(crate) indirect_fragment_offset: u16,
    pub(crate) indirect_tx_success: bool,
    pub(crate) indirect_message_count: u16,
    pub(crate) waiting_for_message_update: bool,
    pub(crate) use_short_address: bool,
}

impl Child {
    /// Create a new child in the `Valid` state with its receiver on.
    pub fn new(rloc16: Rloc16, ext_address: [u8; 8]) -> Self {
        Self {
            rloc16,
            ext_address,
            rx_on_when_idle: true,
            state: ChildState::Valid,
            csl_period: None,
            csl_phase: Duration::ZERO,
            csl_synchronized_at: None,
            indirect_message: None,
            indirect_fragment_offset: 0,
            indirect_tx_success: true,
            indirect_message_count: 0,
            waiting_for_message_update: false,
            use_short_address: false,
        }
    }

    /// Whether the child is sleepy.
    pub fn is_sleepy(&self) -> bool {
        !self.rx_on_when_idle
    }

    /// The MAC address frames for this child are sent to, short or
    /// extended depending on the source match mode.
    pub fn mac_address(&self) -> Address {
        if self.use_short_address {
            Address::Short(self.rloc16.value())
        } else {
            Address::Extended(self.ext_address)
        }
    }

    /// Number of queued messages destined to this child.
    pub fn indirect_message_count(&self) -> u16 {
        self.indirect_message_count
    }

    /// The message currently being delivered indirectly, if any.
    pub fn indirect_message(&self) -> Option<MessageId> {
        self.indirect_message
    }

    pub(crate) fn reset_indirect(&mut self) {
        self.indirect_message = None;
        self.indirect_fragment_offset = 0;
        self.indirect_tx_success = true;
        self.waiting_for_message_update = false;
    }
}

/// The table of attached children.
#[derive(Debug, Default)]
pub struct ChildTable {
    children: Vec<Option<Child>>,
}

impl ChildTable {
    /// Create a new, empty `ChildTable`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a child, returning its index.
    pub fn add(&mut self, child: Child) -> Result<ChildIndex, crate::Error> {
        if let Some(index) = self.children.iter().position(Option::is_none) {
            self.children[index] = Some(child);
            return Ok(index);
        }
        if self.children.len() >= MAX_CHILD_TABLE_SIZE {
            return Err(crate::Error::NoBufs);
        }
        self.children.push(Some(child));
        Ok(self.children.len() - 1)
    }

    /// Remove a child, returning it.
    pub fn remove(&mut self, index: ChildIndex) -> Option<Child> {
        self.children.get_mut(index)?.take()
    }

    /// Look up a child.
    pub fn get(&self, index: ChildIndex) -> Option<&Child> {
        self.children.get(index)?.as_ref()
    }

    /// Look up a child, mutably.
    pub fn get_mut(&mut self, index: ChildIndex) -> Option<&mut Child> {
        self.children.get_mut(index)?.as_mut()
    }

    /// Iterate the attached children with their indexes.
    pub fn iter(&self) -> impl Iterator<Item = (ChildIndex, &Child)> {
        self.children
            .iter()
            .enumerate()
            .filter_map(|(index, child)| Some((index, child.as_ref()?)))
    }

    /// Indexes of all attached children.
    pub fn indexes(&self) -> Vec<ChildIndex> {
        self.iter().map(|(index, _)| index).collect()
    }
}
