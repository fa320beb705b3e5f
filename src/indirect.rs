//! Indirect transmission to sleepy children.
//!
//! Sleepy children keep their radio off and only listen right after
//! sending a MAC data poll, so the parent must have the correct frame
//! staged before the poll arrives. The engine tracks, per child, the
//! message currently being delivered and the fragment offset into it.
//! Changing a staged frame is a two step protocol: the engine asks the MAC
//! for a purge or replace through [`FrameScheduler`] and only commits the
//! new message once the MAC confirms via
//! [`handle_frame_change_done`](IndirectSender::handle_frame_change_done).

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::child::{Child, ChildIndex, ChildState, ChildTable};
use crate::mac::{FrameChange, FrameContext, FrameScheduler, SourceMatcher, TxFrame};
use crate::message::{Message, MessageId, MessageType, SendQueue};
use crate::metrics::Metrics;
use crate::Error;

pub mod csl;
pub mod source_match;

pub use self::csl::CslTxScheduler;
pub use self::source_match::SourceMatchController;

/// Number of message payload bytes carried per staged frame.
pub const FRAME_FRAGMENT_SIZE: usize = 96;

/// Outcome of a finished indirect delivery, handed to the owner so it can
/// run the message's completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDone {
    /// The delivered message.
    pub message: MessageId,
    /// Cumulative delivery outcome over all fragments.
    pub result: Result<(), Error>,
    /// Whether the message was dropped from the send queue because no
    /// reference to it remains.
    pub removed_from_queue: bool,
}

/// The indirect transmission engine.
pub struct IndirectSender<M> {
    enabled: bool,
    source_match: SourceMatchController,
    csl: CslTxScheduler,
    drop_fragments_on_failure: bool,
    metrics: M,
}

impl<M> IndirectSender<M>
where
    M: Metrics,
{
    /// Create a new, disabled `IndirectSender`.
    ///
    /// With `drop_fragments_on_failure` set, a failed fragment finishes
    /// the message instead of still transmitting its remaining fragments.
    pub fn new(drop_fragments_on_failure: bool, metrics: M) -> Self {
        Self {
            enabled: false,
            source_match: SourceMatchController::new(),
            csl: CslTxScheduler::new(),
            drop_fragments_on_failure,
            metrics,
        }
    }

    /// Enable the engine.
    pub fn start(&mut self) {
        self.enabled = true;
    }

    /// Whether the engine is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disable the engine, resetting all per child delivery state.
    pub fn stop<T: SourceMatcher>(&mut self, children: &mut ChildTable, mac: &mut T) {
        if !self.enabled {
            return;
        }
        for index in children.indexes() {
            if let Some(child) = children.get_mut(index) {
                child.reset_indirect();
                self.source_match.reset_message_count(child, mac);
            }
        }
        self.csl.clear();
        self.enabled = false;
    }

    /// Queue `message` for indirect delivery to a sleepy child.
    ///
    /// When the new message is not a supervision placeholder and the child
    /// already holds other pending messages, any queued supervision
    /// placeholder for the child is dropped, the real traffic covers for
    /// it.
    pub fn add_message_for_sleepy_child<T: SourceMatcher + FrameScheduler>(
        &mut self,
        message_id: MessageId,
        queue: &mut SendQueue,
        children: &mut ChildTable,
        index: ChildIndex,
        mac: &mut T,
        now: Instant,
    ) {
        let Some(child) = children.get(index) else {
            return;
        };
        debug_assert!(child.is_sleepy());

        let Some(message) = queue.get_mut(message_id) else {
            return;
        };
        if message.child_mask.has(index) {
            return;
        }
        message.child_mask.add(index);
        let is_supervision = message.message_type == MessageType::Supervision;

        if let Some(child) = children.get_mut(index) {
            self.source_match.increment_message_count(child, mac);
        }

        let pending = children.get(index).map_or(0, |c| c.indirect_message_count);
        if !is_supervision && pending > 1 {
            let supervision = queue.find(|m| {
                m.message_type == MessageType::Supervision && m.child_mask.has(index)
            });
            if let Some(supervision_id) = supervision {
                trace!(child = index, "Dropping supervision placeholder");
                let _ = self.remove_message_from_sleepy_child(
                    supervision_id,
                    queue,
                    children,
                    index,
                    mac,
                    now,
                );
                queue.remove_if_unreferenced(supervision_id);
            }
        }

        self.request_message_update(queue, children, index, mac, now);
    }

    /// Drop a queued message from a child's pending set.
    pub fn remove_message_from_sleepy_child<T: SourceMatcher + FrameScheduler>(
        &mut self,
        message_id: MessageId,
        queue: &mut SendQueue,
        children: &mut ChildTable,
        index: ChildIndex,
        mac: &mut T,
        now: Instant,
    ) -> Result<(), Error> {
        let Some(message) = queue.get_mut(message_id) else {
            return Err(Error::NotFound);
        };
        if !message.child_mask.has(index) {
            return Err(Error::NotFound);
        }
        message.child_mask.remove(index);

        if let Some(child) = children.get_mut(index) {
            self.source_match.decrement_message_count(child, mac);
        }

        self.request_message_update(queue, children, index, mac, now);
        Ok(())
    }

    /// Drop everything queued for a child, purge its staged frame and
    /// reset its source match accounting.
    pub fn clear_all_messages_for_sleepy_child<T: SourceMatcher + FrameScheduler>(
        &mut self,
        queue: &mut SendQueue,
        children: &mut ChildTable,
        index: ChildIndex,
        mac: &mut T,
        now: Instant,
    ) {
        let Some(child) = children.get(index) else {
            return;
        };
        if child.indirect_message_count == 0 {
            return;
        }

        let ids: Vec<MessageId> = queue.iter().map(Message::id).collect();
        for id in ids {
            if let Some(message) = queue.get_mut(id) {
                message.child_mask.remove(index);
            }
            queue.remove_if_unreferenced(id);
        }

        if let Some(child) = children.get_mut(index) {
            child.reset_indirect();
            self.source_match.reset_message_count(child, mac);
        }
        mac.request_frame_change(FrameChange::Purge, index);
        self.csl.update(children, now);
    }

    /// Force the source match mode for a child.
    pub fn set_child_use_short_address<T: SourceMatcher>(
        &mut self,
        children: &mut ChildTable,
        index: ChildIndex,
        use_short_address: bool,
        mac: &mut T,
    ) {
        if let Some(child) = children.get_mut(index) {
            self.source_match
                .set_src_match_as_short(child, use_short_address, mac);
        }
    }

    /// React to a change of a child's receiver mode.
    ///
    /// On a sleepy to non-sleepy transition, pending indirect messages are
    /// promoted to direct transmission with a fresh queue timestamp and
    /// the staged frame is purged. The opposite transition leaves already
    /// queued direct messages alone, direct queueing delays are small
    /// compared to indirect ones.
    pub fn handle_child_mode_change<T: SourceMatcher + FrameScheduler>(
        &mut self,
        queue: &mut SendQueue,
        children: &mut ChildTable,
        index: ChildIndex,
        old_rx_on_when_idle: bool,
        mac: &mut T,
        now: Instant,
    ) {
        let Some(child) = children.get_mut(index) else {
            return;
        };
        if child.is_sleepy() && child.state == ChildState::Valid {
            self.source_match.set_src_match_as_short(child, true, mac);
        }

        let promote = !old_rx_on_when_idle
            && child.rx_on_when_idle
            && child.indirect_message_count > 0;
        if !promote {
            return;
        }

        for message in queue.iter_mut() {
            if message.child_mask.has(index) {
                message.child_mask.remove(index);
                message.direct = true;
                message.queued_at = now;
            }
        }
        debug!(child = index, "Promoted indirect messages to direct transmission");

        if let Some(child) = children.get_mut(index) {
            child.reset_indirect();
            self.source_match.reset_message_count(child, mac);
        }
        mac.request_frame_change(FrameChange::Purge, index);
        self.csl.update(children, now);
    }

    /// The MAC finished a previously requested frame change, commit the
    /// child's new current message.
    pub fn handle_frame_change_done(
        &mut self,
        queue: &SendQueue,
        children: &mut ChildTable,
        index: ChildIndex,
        now: Instant,
    ) {
        let Some(child) = children.get(index) else {
            return;
        };
        if !child.waiting_for_message_update {
            return;
        }
        self.update_indirect_message(queue, children, index, now);
    }

    /// Stage the next frame for a child's data poll: the next fragment of
    /// its current message, or an empty frame with an acknowledgment
    /// request when nothing is pending. The frame pending bit is set when
    /// further messages wait behind the current one.
    pub fn prepare_frame_for_child(
        &mut self,
        frame: &mut TxFrame,
        context: &mut FrameContext,
        queue: &SendQueue,
        children: &ChildTable,
        index: ChildIndex,
    ) -> Result<(), Error> {
        if !self.enabled {
            return Err(Error::Abort);
        }
        let child = children.get(index).ok_or(Error::Abort)?;

        let Some(message_id) = child.indirect_message else {
            Self::prepare_empty_frame(frame, child, true);
            context.message_next_offset = 0;
            self.metrics.indirect_frame_prepared();
            return Ok(());
        };
        let message = queue.get(message_id).ok_or(Error::Abort)?;

        match message.message_type {
            MessageType::Ip6 => {
                context.message_next_offset = Self::prepare_data_frame(frame, child, message);
            }
            MessageType::Supervision => {
                Self::prepare_empty_frame(frame, child, true);
                context.message_next_offset = message.len() as u16;
            }
        }

        debug_assert!(context.message_next_offset > 0);
        self.metrics.indirect_frame_prepared();
        Ok(())
    }

    fn prepare_data_frame(frame: &mut TxFrame, child: &Child, message: &Message) -> u16 {
        let offset = (child.indirect_fragment_offset as usize).min(message.len());
        let end = message.len().min(offset + FRAME_FRAGMENT_SIZE);

        frame.destination = Some(child.mac_address());
        frame.payload = message.payload().slice(offset..end);
        frame.ack_request = true;
        frame.frame_pending = child.indirect_message_count > 1;

        end as u16
    }

    fn prepare_empty_frame(frame: &mut TxFrame, child: &Child, ack_request: bool) {
        frame.destination = Some(child.mac_address());
        frame.payload = Bytes::new();
        frame.ack_request = ack_request;
        frame.frame_pending = false;
    }

    /// The MAC finished transmitting a staged frame.
    ///
    /// Advances the fragment offset, or finishes the message: clears the
    /// child's bit, possibly drops the message from the queue, and stages
    /// the next one. A zero next-offset marks the frame as the empty frame
    /// staged when nothing was pending, in which case any message queued
    /// since is left untouched.
    pub fn handle_sent_frame_to_child<T: SourceMatcher + FrameScheduler>(
        &mut self,
        context: &FrameContext,
        result: Result<(), Error>,
        queue: &mut SendQueue,
        children: &mut ChildTable,
        index: ChildIndex,
        mac: &mut T,
        now: Instant,
    ) -> Option<TxDone> {
        if !self.enabled {
            return None;
        }
        let message_id = children.get(index)?.indirect_message;

        if context.message_next_offset == 0 {
            self.clear_messages_for_removed_children(queue, children, mac, now);
            return None;
        }

        let mut next_offset = context.message_next_offset;
        match result {
            Ok(()) => {}
            Err(Error::NoAck | Error::ChannelAccessFailure | Error::Abort) => {
                if let Some(child) = children.get_mut(index) {
                    child.indirect_tx_success = false;
                }
                if self.drop_fragments_on_failure {
                    if let Some(message) = message_id.and_then(|id| queue.get(id)) {
                        next_offset = message.len() as u16;
                    }
                }
            }
            Err(error) => debug_assert!(false, "unexpected transmit error {error}"),
        }

        // More fragments of the current message remain.
        if let Some(message) = message_id.and_then(|id| queue.get(id)) {
            if usize::from(next_offset) < message.len() {
                if let Some(child) = children.get_mut(index) {
                    child.indirect_fragment_offset = next_offset;
                }
                self.csl.update(children, now);
                self.clear_messages_for_removed_children(queue, children, mac, now);
                return None;
            }
        }

        let mut done = None;
        if let Some(id) = message_id {
            let success = children.get(index).is_some_and(|c| c.indirect_tx_success);
            // `result` is only the status of the last fragment, the
            // cumulative flag covers the whole message.
            let tx_result = match result {
                Ok(()) if !success => Err(Error::Failed),
                other => other,
            };

            if let Some(child) = children.get_mut(index) {
                child.indirect_message = None;
                // Switch to short address matching after the first full
                // delivery attempt, successful or not. A child missing our
                // acknowledgment re-registers and flips this back to
                // extended matching.
                self.source_match.set_src_match_as_short(child, true, mac);
            }

            let mut removed = false;
            if let Some(message) = queue.get_mut(id) {
                if message.child_mask.has(index) {
                    message.child_mask.remove(index);
                    if let Some(child) = children.get_mut(index) {
                        self.source_match.decrement_message_count(child, mac);
                    }
                }
                removed = queue.remove_if_unreferenced(id);
            }

            self.metrics.indirect_tx_done(success);
            debug!(child = index, success, "Indirect transmission finished");
            done = Some(TxDone {
                message: id,
                result: tx_result,
                removed_from_queue: removed,
            });
        }

        self.update_indirect_message(queue, children, index, now);
        self.clear_messages_for_removed_children(queue, children, mac, now);
        done
    }

    /// Reclaim queued state of children which left the valid states.
    pub fn clear_messages_for_removed_children<T: SourceMatcher + FrameScheduler>(
        &mut self,
        queue: &mut SendQueue,
        children: &mut ChildTable,
        mac: &mut T,
        now: Instant,
    ) {
        for index in children.indexes() {
            let Some(child) = children.get(index) else {
                continue;
            };
            if matches!(child.state, ChildState::Valid | ChildState::Restoring) {
                continue;
            }
            if child.indirect_message_count == 0 {
                continue;
            }
            self.clear_all_messages_for_sleepy_child(queue, children, index, mac, now);
        }
    }

    /// Recompute the CSL transmit schedule, after a child's CSL parameters
    /// changed.
    pub fn update_csl(&mut self, children: &ChildTable, now: Instant) {
        self.csl.update(children, now);
    }

    /// The next CSL transmit slot, if any child holds an indirect message
    /// and synchronized a CSL schedule.
    pub fn next_csl_tx(&self) -> Option<(ChildIndex, Instant)> {
        self.csl.next_tx()
    }

    /// Reevaluate which message is staged for a child, driving the purge /
    /// replace protocol with the MAC.
    fn request_message_update<T: FrameScheduler>(
        &mut self,
        queue: &SendQueue,
        children: &mut ChildTable,
        index: ChildIndex,
        mac: &mut T,
        now: Instant,
    ) {
        let Some(child) = children.get(index) else {
            return;
        };
        let current = child.indirect_message;
        let waiting = child.waiting_for_message_update;
        let fragment_offset = child.indirect_fragment_offset;

        // Purge first when the staged message is no longer destined for
        // the child. This also covers a pending replace request whose
        // message was removed while waiting for the MAC callback.
        if let Some(id) = current {
            if !queue.get(id).is_some_and(|m| m.child_mask.has(index)) {
                if let Some(child) = children.get_mut(index) {
                    child.indirect_message = None;
                    child.waiting_for_message_update = true;
                }
                mac.request_frame_change(FrameChange::Purge, index);
                self.csl.update(children, now);
                return;
            }
        }

        if waiting {
            return;
        }

        let next = find_queued_message_for_sleepy_child(queue, index, |_| true);
        if current == next {
            return;
        }

        if current.is_none() {
            // Nothing staged yet, commit directly.
            self.update_indirect_message(queue, children, index, now);
            return;
        }

        // Both staged and next message exist and differ. The staged frame
        // can only be replaced while it still is the first fragment, else
        // the current message is delivered to completion first.
        if fragment_offset != 0 {
            return;
        }

        if let Some(child) = children.get_mut(index) {
            child.waiting_for_message_update = true;
        }
        mac.request_frame_change(FrameChange::Replace, index);
        self.csl.update(children, now);
    }

    fn update_indirect_message(
        &mut self,
        queue: &SendQueue,
        children: &mut ChildTable,
        index: ChildIndex,
        now: Instant,
    ) {
        let next = find_queued_message_for_sleepy_child(queue, index, |_| true);
        if let Some(child) = children.get_mut(index) {
            child.waiting_for_message_update = false;
            child.indirect_message = next;
            child.indirect_fragment_offset = 0;
            child.indirect_tx_success = true;
        }
        self.csl.update(children, now);
        if next.is_some() {
            trace!(child = index, "Staged next indirect message");
        }
    }
}

/// The best queued message for a child: highest priority first, queue
/// order breaking ties.
fn find_queued_message_for_sleepy_child(
    queue: &SendQueue,
    index: ChildIndex,
    accept: impl Fn(&Message) -> bool,
) -> Option<MessageId> {
    let mut best: Option<&Message> = None;
    for message in queue.iter() {
        if !message.child_mask.has(index) || !accept(message) {
            continue;
        }
        match best {
            Some(current) if current.priority >= message.priority => {}
            _ => best = Some(message),
        }
    }
    best.map(Message::id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePriority;
    use crate::metrics::NoMetrics;
    use crate::rloc::Rloc16;

    #[derive(Default)]
    struct RecordingMac {
        short_entries: Vec<u16>,
        extended_entries: Vec<[u8; 8]>,
        requests: Vec<(FrameChange, ChildIndex)>,
    }

    impl SourceMatcher for RecordingMac {
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

    impl FrameScheduler for RecordingMac {
        fn request_frame_change(&mut self, change: FrameChange, child_index: ChildIndex) {
            self.requests.push((change, child_index));
        }
    }

    struct Fixture {
        sender: IndirectSender<NoMetrics>,
        queue: SendQueue,
        children: ChildTable,
        mac: RecordingMac,
        child: ChildIndex,
        now: Instant,
    }

    fn fixture() -> Fixture {
        let mut sender = IndirectSender::new(false, NoMetrics);
        sender.start();

        let mut children = ChildTable::new();
        let mut child = Child::new(Rloc16::new(0x0401), [7; 8]);
        child.rx_on_when_idle = false;
        let child = children.add(child).unwrap();

        Fixture {
            sender,
            queue: SendQueue::new(),
            children,
            mac: RecordingMac::default(),
            child,
            now: Instant::now(),
        }
    }

    impl Fixture {
        fn enqueue(&mut self, message_type: MessageType, payload: &'static [u8]) -> MessageId {
            self.enqueue_with_priority(
                message_type,
                payload,
                match message_type {
                    MessageType::Supervision => MessagePriority::Low,
                    MessageType::Ip6 => MessagePriority::Normal,
                },
            )
        }

        fn enqueue_with_priority(
            &mut self,
            message_type: MessageType,
            payload: &'static [u8],
            priority: MessagePriority,
        ) -> MessageId {
            let id = self.queue.push(
                message_type,
                Bytes::from_static(payload),
                priority,
                false,
                self.now,
            );
            self.sender.add_message_for_sleepy_child(
                id,
                &mut self.queue,
                &mut self.children,
                self.child,
                &mut self.mac,
                self.now,
            );
            id
        }

        fn prepare(&mut self) -> (TxFrame, FrameContext) {
            let mut frame = TxFrame::default();
            let mut context = FrameContext::default();
            self.sender
                .prepare_frame_for_child(
                    &mut frame,
                    &mut context,
                    &self.queue,
                    &self.children,
                    self.child,
                )
                .unwrap();
            (frame, context)
        }

        fn sent(&mut self, context: &FrameContext, result: Result<(), Error>) -> Option<TxDone> {
            self.sender.handle_sent_frame_to_child(
                context,
                result,
                &mut self.queue,
                &mut self.children,
                self.child,
                &mut self.mac,
                self.now,
            )
        }

        fn child(&self) -> &Child {
            self.children.get(self.child).unwrap()
        }

        /// Count of queued messages whose mask names the child.
        fn mask_population(&self) -> u16 {
            self.queue
                .iter()
                .filter(|m| m.child_mask.has(self.child))
                .count() as u16
        }
    }

    #[test]
    fn single_message_delivery() {
        let mut f = fixture();
        let message = f.enqueue(MessageType::Ip6, b"datagram");

        // Committed immediately, nothing was staged before.
        assert_eq!(f.child().indirect_message(), Some(message));
        assert_eq!(f.child().indirect_message_count(), 1);
        assert!(f.mac.requests.is_empty());

        let (frame, context) = f.prepare();
        assert_eq!(&frame.payload[..], b"datagram");
        assert!(frame.ack_request);
        assert!(!frame.frame_pending);
        assert_eq!(context.message_next_offset, 8);

        let done = f.sent(&context, Ok(())).unwrap();
        assert_eq!(done.message, message);
        assert_eq!(done.result, Ok(()));
        assert!(done.removed_from_queue);

        assert!(f.queue.is_empty());
        assert_eq!(f.child().indirect_message(), None);
        assert_eq!(f.child().indirect_message_count(), 0);
        // Short address matching after the first delivery attempt.
        assert!(f.child().use_short_address);
    }

    #[test]
    fn fragmentation_advances_offset() {
        let mut f = fixture();
        static PAYLOAD: [u8; 200] = [0xab; 200];
        let message = f.enqueue(MessageType::Ip6, &PAYLOAD);

        let (frame, context) = f.prepare();
        assert_eq!(frame.payload.len(), FRAME_FRAGMENT_SIZE);
        assert_eq!(context.message_next_offset, 96);
        assert!(f.sent(&context, Ok(())).is_none());
        assert_eq!(f.child().indirect_fragment_offset, 96);

        let (frame, context) = f.prepare();
        assert_eq!(frame.payload.len(), FRAME_FRAGMENT_SIZE);
        assert_eq!(context.message_next_offset, 192);
        assert!(f.sent(&context, Ok(())).is_none());

        let (frame, context) = f.prepare();
        assert_eq!(frame.payload.len(), 8);
        assert_eq!(context.message_next_offset, 200);
        let done = f.sent(&context, Ok(())).unwrap();
        assert_eq!(done.message, message);
        assert_eq!(done.result, Ok(()));
    }

    #[test]
    fn empty_frame_when_nothing_is_pending() {
        let mut f = fixture();

        let (frame, context) = f.prepare();
        assert!(frame.is_empty());
        assert!(frame.ack_request);
        assert!(!frame.frame_pending);
        assert_eq!(context.message_next_offset, 0);

        // A message queued between prepare and sent must stay untouched.
        let message = f.enqueue(MessageType::Ip6, b"late");
        assert!(f.sent(&context, Ok(())).is_none());
        assert_eq!(f.child().indirect_message(), Some(message));
        assert_eq!(f.mask_population(), 1);
    }

    #[test]
    fn frame_pending_set_with_multiple_messages() {
        let mut f = fixture();
        f.enqueue(MessageType::Ip6, b"first");
        f.enqueue(MessageType::Ip6, b"second");

        let (frame, _) = f.prepare();
        assert!(frame.frame_pending);
        assert_eq!(f.child().indirect_message_count(), 2);
    }

    #[test]
    fn replace_waits_for_frame_change_confirmation() {
        let mut f = fixture();
        let first = f.enqueue(MessageType::Ip6, b"first");
        let (_, _context) = f.prepare();

        // A higher priority message arrives while the first fragment is
        // still staged: the engine asks the MAC to replace the frame.
        let second =
            f.enqueue_with_priority(MessageType::Ip6, b"second", MessagePriority::High);
        assert_eq!(f.mac.requests, vec![(FrameChange::Replace, f.child)]);
        // Not committed yet.
        assert_eq!(f.child().indirect_message(), Some(first));
        assert!(f.child().waiting_for_message_update);

        f.sender
            .handle_frame_change_done(&f.queue, &mut f.children, f.child, f.now);
        assert_eq!(f.child().indirect_message(), Some(second));
        assert_eq!(f.child().indirect_fragment_offset, 0);
        assert!(!f.child().waiting_for_message_update);
    }

    #[test]
    fn replace_is_deferred_past_the_first_fragment() {
        let mut f = fixture();
        static PAYLOAD: [u8; 200] = [0xcd; 200];
        let first = f.enqueue(MessageType::Ip6, &PAYLOAD);

        // Deliver the first fragment so the offset is nonzero.
        let (_, context) = f.prepare();
        f.sent(&context, Ok(()));
        assert_eq!(f.child().indirect_fragment_offset, 96);

        let second =
            f.enqueue_with_priority(MessageType::Ip6, b"second", MessagePriority::High);
        // No replace request, the current message finishes first.
        assert!(f.mac.requests.is_empty());
        assert_eq!(f.child().indirect_message(), Some(first));

        // Finish the remaining fragments.
        let (_, context) = f.prepare();
        f.sent(&context, Ok(()));
        let (_, context) = f.prepare();
        let done = f.sent(&context, Ok(())).unwrap();
        assert_eq!(done.message, first);

        // Now the high priority message is staged.
        assert_eq!(f.child().indirect_message(), Some(second));
    }

    #[test]
    fn removing_the_staged_message_purges_the_frame() {
        let mut f = fixture();
        let message = f.enqueue(MessageType::Ip6, b"datagram");

        f.sender
            .remove_message_from_sleepy_child(
                message,
                &mut f.queue,
                &mut f.children,
                f.child,
                &mut f.mac,
                f.now,
            )
            .unwrap();

        assert_eq!(f.mac.requests, vec![(FrameChange::Purge, f.child)]);
        assert_eq!(f.child().indirect_message(), None);
        assert!(f.child().waiting_for_message_update);
        assert_eq!(f.child().indirect_message_count(), 0);

        f.sender
            .handle_frame_change_done(&f.queue, &mut f.children, f.child, f.now);
        assert!(!f.child().waiting_for_message_update);
        assert_eq!(f.child().indirect_message(), None);
    }

    #[test]
    fn real_traffic_displaces_supervision_placeholder() {
        let mut f = fixture();
        let supervision = f.enqueue(MessageType::Supervision, b"\x00");
        assert_eq!(f.child().indirect_message(), Some(supervision));

        let first = f.enqueue(MessageType::Ip6, b"first");

        // The supervision placeholder was dropped from queue and mask. As
        // it was the staged message, the engine first asks the MAC to
        // purge its frame.
        assert!(f.queue.get(supervision).is_none());
        assert_eq!(f.child().indirect_message_count(), 1);
        assert_eq!(f.mask_population(), 1);
        assert_eq!(f.mac.requests, vec![(FrameChange::Purge, f.child)]);
        assert!(f.child().waiting_for_message_update);

        f.sender
            .handle_frame_change_done(&f.queue, &mut f.children, f.child, f.now);
        assert_eq!(f.child().indirect_message(), Some(first));
    }

    #[test]
    fn count_matches_mask_population() {
        let mut f = fixture();
        let first = f.enqueue(MessageType::Ip6, b"first");
        f.enqueue(MessageType::Ip6, b"second");
        f.enqueue(MessageType::Supervision, b"\x00");

        assert_eq!(f.child().indirect_message_count(), f.mask_population());

        f.sender
            .remove_message_from_sleepy_child(
                first,
                &mut f.queue,
                &mut f.children,
                f.child,
                &mut f.mac,
                f.now,
            )
            .unwrap();
        assert_eq!(f.child().indirect_message_count(), f.mask_population());

        f.sender.clear_all_messages_for_sleepy_child(
            &mut f.queue,
            &mut f.children,
            f.child,
            &mut f.mac,
            f.now,
        );
        assert_eq!(f.child().indirect_message_count(), 0);
        assert_eq!(f.mask_population(), 0);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn failed_fragment_marks_message_failed() {
        let mut f = fixture();
        static PAYLOAD: [u8; 150] = [0xef; 150];
        let message = f.enqueue(MessageType::Ip6, &PAYLOAD);

        // First fragment is lost, but fragments keep going out.
        let (_, context) = f.prepare();
        assert!(f.sent(&context, Err(Error::NoAck)).is_none());
        assert!(!f.child().indirect_tx_success);
        assert_eq!(f.child().indirect_fragment_offset, 96);

        // Last fragment succeeds, the message still counts as failed.
        let (_, context) = f.prepare();
        let done = f.sent(&context, Ok(())).unwrap();
        assert_eq!(done.message, message);
        assert_eq!(done.result, Err(Error::Failed));
    }

    #[test]
    fn drop_fragments_on_failure_finishes_early() {
        let mut f = fixture();
        f.sender = IndirectSender::new(true, NoMetrics);
        f.sender.start();

        static PAYLOAD: [u8; 150] = [0x11; 150];
        let message = f.enqueue(MessageType::Ip6, &PAYLOAD);

        let (_, context) = f.prepare();
        let done = f.sent(&context, Err(Error::NoAck)).unwrap();
        assert_eq!(done.message, message);
        assert_eq!(done.result, Err(Error::NoAck));
        assert!(done.removed_from_queue);
    }

    #[test]
    fn mode_change_promotes_messages_to_direct() {
        let mut f = fixture();
        f.enqueue(MessageType::Ip6, b"first");
        f.enqueue(MessageType::Ip6, b"second");
        f.mac.requests.clear();

        // The child wakes up.
        f.children.get_mut(f.child).unwrap().rx_on_when_idle = true;
        f.sender.handle_child_mode_change(
            &mut f.queue,
            &mut f.children,
            f.child,
            false,
            &mut f.mac,
            f.now,
        );

        assert_eq!(f.child().indirect_message_count(), 0);
        assert_eq!(f.mask_population(), 0);
        assert_eq!(f.queue.len(), 2);
        assert!(f.queue.iter().all(|m| m.direct));
        assert_eq!(f.mac.requests, vec![(FrameChange::Purge, f.child)]);
    }

    #[test]
    fn removed_child_state_is_reclaimed() {
        let mut f = fixture();
        f.enqueue(MessageType::Ip6, b"first");

        f.children.get_mut(f.child).unwrap().state = ChildState::Invalid;
        f.sender.clear_messages_for_removed_children(
            &mut f.queue,
            &mut f.children,
            &mut f.mac,
            f.now,
        );

        assert!(f.queue.is_empty());
        assert_eq!(f.child().indirect_message_count(), 0);
    }

    #[test]
    fn disabled_engine_aborts_frame_preparation() {
        let mut f = fixture();
        f.sender.stop(&mut f.children, &mut f.mac);

        let mut frame = TxFrame::default();
        let mut context = FrameContext::default();
        assert_eq!(
            f.sender.prepare_frame_for_child(
                &mut frame,
                &mut context,
                &f.queue,
                &f.children,
                f.child,
            ),
            Err(Error::Abort)
        );
    }
}
