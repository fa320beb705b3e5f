//! The outbound message queue shared by the direct and indirect senders.
//!
//! Every queued message carries a bitmask naming the sleepy children which
//! still need it. A message stays queued until its mask is empty and no
//! direct transmission references it, at which point it is dropped from
//! the queue.

use std::time::Instant;

use bytes::Bytes;

/// Maximum number of children a message mask can address.
pub const MAX_CHILDREN: usize = 32;

/// Which sleepy children still need a queued message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildMask(u32);

impl ChildMask {
    /// Whether the bit for a child index is set.
    pub fn has(self, child_index: usize) -> bool {
        child_index < MAX_CHILDREN && self.0 & (1 << child_index) != 0
    }

    /// Set the bit for a child index.
    pub fn add(&mut self, child_index: usize) {
        debug_assert!(child_index < MAX_CHILDREN);
        self.0 |= 1 << child_index;
    }

    /// Clear the bit for a child index.
    pub fn remove(&mut self, child_index: usize) {
        debug_assert!(child_index < MAX_CHILDREN);
        self.0 &= !(1 << child_index);
    }

    /// Whether no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Identifier of a message in the send queue, stable across queue
/// mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(u64);

/// The kind of payload a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// An IPv6 datagram.
    Ip6,
    /// A supervision placeholder keeping a sleepy child's poll schedule
    /// alive. Carries the one byte supervision header as payload.
    Supervision,
}

/// Transmission priority of a queued message. Higher priorities are served
/// first, queue order breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessagePriority {
    /// Background traffic, including supervision placeholders.
    Low,
    /// Regular datagrams.
    Normal,
    /// Latency sensitive datagrams.
    High,
    /// Mesh management traffic.
    Net,
}

/// An outbound message.
#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    /// The kind of payload.
    pub message_type: MessageType,
    payload: Bytes,
    /// Transmission priority.
    pub priority: MessagePriority,
    /// Children which still need this message.
    pub child_mask: ChildMask,
    /// Whether the message is (also) queued for direct transmission.
    pub direct: bool,
    /// When the message entered the queue, refreshed when it is promoted
    /// to direct transmission.
    pub queued_at: Instant,
}

impl Message {
    /// The queue identifier.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// The payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// The shared send queue.
#[derive(Debug, Default)]
pub struct SendQueue {
    next_id: u64,
    messages: Vec<Message>,
}

impl SendQueue {
    /// Create a new, empty `SendQueue`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the queue.
    pub fn push(
        &mut self,
        message_type: MessageType,
        payload: Bytes,
        priority: MessagePriority,
        direct: bool,
        now: Instant,
    ) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        self.messages.push(Message {
            id,
            message_type,
            payload,
            priority,
            child_mask: ChildMask::default(),
            direct,
            queued_at: now,
        });
        id
    }

    /// Look up a message by id.
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Look up a message by id, mutably.
    pub fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Iterate the queued messages in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Iterate the queued messages in queue order, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Message> {
        self.messages.iter_mut()
    }

    /// The id of the first message in queue order matching the predicate.
    pub fn find(&self, predicate: impl Fn(&Message) -> bool) -> Option<MessageId> {
        self.messages.iter().find(|m| predicate(m)).map(|m| m.id)
    }

    /// Drop the message when neither the direct sender nor any child still
    /// references it. Returns `true` when the message was removed.
    pub fn remove_if_unreferenced(&mut self, id: MessageId) -> bool {
        let Some(position) = self.messages.iter().position(|m| m.id == id) else {
            return false;
        };
        if self.messages[position].direct || !self.messages[position].child_mask.is_empty() {
            return false;
        }
        self.messages.remove(position);
        true
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_mask_bits() {
        let mut mask = ChildMask::default();
        assert!(mask.is_empty());

        mask.add(0);
        mask.add(7);
        assert!(mask.has(0));
        assert!(mask.has(7));
        assert!(!mask.has(1));
        assert!(!mask.has(MAX_CHILDREN));

        mask.remove(0);
        assert!(!mask.has(0));
        assert!(mask.has(7));
        mask.remove(7);
        assert!(mask.is_empty());
    }

    #[test]
    fn queue_retains_referenced_messages() {
        let now = Instant::now();
        let mut queue = SendQueue::new();
        let id = queue.push(
            MessageType::Ip6,
            Bytes::from_static(b"datagram"),
            MessagePriority::Normal,
            false,
            now,
        );

        queue.get_mut(id).unwrap().child_mask.add(3);
        assert!(!queue.remove_if_unreferenced(id));
        assert_eq!(queue.len(), 1);

        queue.get_mut(id).unwrap().child_mask.remove(3);
        assert!(queue.remove_if_unreferenced(id));
        assert!(queue.is_empty());
        assert!(!queue.remove_if_unreferenced(id));
    }

    #[test]
    fn direct_flag_keeps_message_alive() {
        let now = Instant::now();
        let mut queue = SendQueue::new();
        let id = queue.push(
            MessageType::Ip6,
            Bytes::from_static(b"datagram"),
            MessagePriority::Normal,
            true,
            now,
        );

        assert!(!queue.remove_if_unreferenced(id));
        queue.get_mut(id).unwrap().direct = false;
        assert!(queue.remove_if_unreferenced(id));
    }

    #[test]
    fn find_respects_queue_order() {
        let now = Instant::now();
        let mut queue = SendQueue::new();
        let first = queue.push(
            MessageType::Supervision,
            Bytes::from_static(b"\x00"),
            MessagePriority::Low,
            false,
            now,
        );
        let second = queue.push(
            MessageType::Ip6,
            Bytes::from_static(b"x"),
            MessagePriority::Normal,
            false,
            now,
        );

        assert_eq!(queue.find(|_| true), Some(first));
        assert_eq!(
            queue.find(|m| m.message_type == MessageType::Ip6),
            Some(second)
        );
        assert_eq!(queue.find(|m| m.len() > 1), None);
    }
}
