//! The owning container wiring the network data store, the DHCPv6 client
//! and the indirect sender together.
//!
//! All subsystems live as plain fields and are driven from one event loop.
//! External state changes are queued on the [`Notifier`] and dispatched by
//! [`process_events`](Stack::process_events) within a single turn, so
//! every subsystem observes a consistent network data image and child
//! table. Platform side effects (socket, interface addresses, radio
//! source matching, staged frames) go through the [`Platform`] seam.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::child::{Child, ChildIndex, ChildTable};
use crate::dhcp6::{Client, Netif, Transport};
use crate::indirect::{IndirectSender, TxDone};
use crate::mac::{FrameContext, FrameScheduler, SourceMatcher, TxFrame};
use crate::message::{MessagePriority, MessageType, SendQueue};
use crate::metrics::Metrics;
use crate::netdata::NetworkData;
use crate::notifier::{Event, Notifier, Role};
use crate::rloc::MeshLocalPrefix;
use crate::Error;

/// Everything the stack needs from its embedding platform: the DHCPv6
/// socket, the thread interface, and the radio/MAC seams.
pub trait Platform: Netif + Transport + SourceMatcher + FrameScheduler {}

impl<T> Platform for T where T: Netif + Transport + SourceMatcher + FrameScheduler {}

/// Configuration of a [`Stack`].
#[derive(Debug, Clone)]
pub struct Config {
    /// The device's factory EUI-64.
    pub eui64: [u8; 8],
    /// The partition's mesh-local prefix.
    pub mesh_local_prefix: MeshLocalPrefix,
    /// Send DHCPv6 solicits to the realm-local all routers group instead
    /// of the agent's routing locator address.
    pub multicast_solicit: bool,
    /// Finish an indirect message on the first failed fragment instead of
    /// transmitting its tail.
    pub drop_fragments_on_failure: bool,
}

/// External inputs fed into [`Stack::run`].
#[derive(Debug, Clone)]
pub enum ExternalEvent {
    /// A new partition network data image arrived.
    NetworkData(Vec<u8>),
    /// The device role changed.
    RoleChanged(Role),
    /// A datagram arrived on the DHCPv6 client socket.
    Dhcp6Datagram(Vec<u8>),
}

/// The stack: network data, DHCPv6 client, send queue, child table and
/// indirect sender under one owner.
pub struct Stack<M> {
    /// The partition network data image.
    pub netdata: NetworkData,
    /// The shared outbound message queue.
    pub send_queue: SendQueue,
    /// The child table.
    pub children: ChildTable,
    /// The indirect transmission engine.
    pub indirect: IndirectSender<M>,
    dhcp6: Client<M>,
    notifier: Notifier,
    mesh_local: MeshLocalPrefix,
    role: Role,
}

impl<M> Stack<M>
where
    M: Metrics + Clone,
{
    /// Create a new `Stack`.
    pub fn new(config: Config, metrics: M) -> Self {
        Self {
            netdata: NetworkData::new(),
            send_queue: SendQueue::new(),
            children: ChildTable::new(),
            indirect: IndirectSender::new(config.drop_fragments_on_failure, metrics.clone()),
            dhcp6: Client::new(config.eui64, config.multicast_solicit, metrics),
            notifier: Notifier::new(),
            mesh_local: config.mesh_local_prefix,
            role: Role::Disabled,
        }
    }

    /// The partition's mesh-local prefix.
    pub fn mesh_local_prefix(&self) -> &MeshLocalPrefix {
        &self.mesh_local
    }

    /// The current device role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the DHCPv6 client wants its socket open.
    pub fn dhcp6_running(&self) -> bool {
        self.dhcp6.is_running()
    }

    /// Replace the network data image and queue the change notification.
    pub fn replace_network_data(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let change = self.netdata.set(bytes)?;
        if change.changed {
            self.notifier.signal(Event::ThreadNetdataChanged);
        }
        Ok(())
    }

    /// Record a role change and queue its notification.
    pub fn set_role(&mut self, role: Role) {
        if role == self.role {
            return;
        }
        info!(?role, "Role changed");
        self.role = role;
        self.notifier.signal(Event::ThreadRoleChanged(role));
    }

    /// Attach a child.
    pub fn add_child(&mut self, child: Child) -> Result<ChildIndex, Error> {
        let index = self.children.add(child)?;
        self.notifier.signal(Event::ChildAdded(index));
        Ok(index)
    }

    /// Detach a child, reclaiming everything queued for it.
    pub fn remove_child<P: Platform>(
        &mut self,
        index: ChildIndex,
        platform: &mut P,
        now: Instant,
    ) {
        self.indirect.clear_all_messages_for_sleepy_child(
            &mut self.send_queue,
            &mut self.children,
            index,
            platform,
            now,
        );
        if self.children.remove(index).is_some() {
            self.notifier.signal(Event::ChildRemoved(index));
        }
    }

    /// Record a child's receiver mode change and queue its notification.
    pub fn set_child_mode(&mut self, index: ChildIndex, rx_on_when_idle: bool) {
        let Some(child) = self.children.get_mut(index) else {
            return;
        };
        let old_rx_on_when_idle = child.rx_on_when_idle;
        if old_rx_on_when_idle == rx_on_when_idle {
            return;
        }
        child.rx_on_when_idle = rx_on_when_idle;
        self.notifier.signal(Event::ChildModeChanged {
            child: index,
            old_rx_on_when_idle,
        });
    }

    /// Queue an outbound message for a sleepy child.
    pub fn send_to_sleepy_child<P: Platform>(
        &mut self,
        message_type: MessageType,
        payload: Bytes,
        priority: MessagePriority,
        index: ChildIndex,
        platform: &mut P,
        now: Instant,
    ) -> crate::message::MessageId {
        let id = self
            .send_queue
            .push(message_type, payload, priority, false, now);
        self.indirect.add_message_for_sleepy_child(
            id,
            &mut self.send_queue,
            &mut self.children,
            index,
            platform,
            now,
        );
        id
    }

    /// Dispatch all pending notifications to the subsystems.
    pub fn process_events<P: Platform>(&mut self, platform: &mut P, now: Instant) {
        while let Some(event) = self.notifier.pop() {
            trace!(?event, "Dispatching event");
            match event {
                Event::ThreadNetdataChanged => {
                    self.dhcp6
                        .handle_netdata_changed(&self.netdata, platform, now);
                }
                Event::ThreadRoleChanged(role) => match role {
                    Role::Router | Role::Leader => self.indirect.start(),
                    Role::Disabled | Role::Detached | Role::Child => {
                        self.indirect.stop(&mut self.children, platform);
                    }
                },
                Event::ChildAdded(index) => {
                    debug!(child = index, "Child attached");
                }
                Event::ChildRemoved(index) => {
                    debug!(child = index, "Child detached");
                    self.indirect.clear_messages_for_removed_children(
                        &mut self.send_queue,
                        &mut self.children,
                        platform,
                        now,
                    );
                }
                Event::ChildModeChanged {
                    child,
                    old_rx_on_when_idle,
                } => {
                    self.indirect.handle_child_mode_change(
                        &mut self.send_queue,
                        &mut self.children,
                        child,
                        old_rx_on_when_idle,
                        platform,
                        now,
                    );
                }
            }
        }
    }

    /// The next point in time [`handle_timer`](Self::handle_timer) wants
    /// to run.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.dhcp6.next_deadline()
    }

    /// Drive the timed state machines.
    pub fn handle_timer<P: Platform>(&mut self, platform: &mut P, now: Instant) {
        self.dhcp6.handle_timer(&self.mesh_local, platform, now);
        self.dhcp6.evaluate_lifetimes(platform, now);
    }

    /// Feed a datagram received on the DHCPv6 client socket.
    pub fn handle_dhcp6_datagram<P: Platform>(
        &mut self,
        payload: &[u8],
        platform: &mut P,
        now: Instant,
    ) {
        self.dhcp6.handle_udp_receive(payload, platform, now);
    }

    /// Stage the frame answering a child's data poll.
    pub fn prepare_frame_for_child(
        &mut self,
        frame: &mut TxFrame,
        context: &mut FrameContext,
        index: ChildIndex,
    ) -> Result<(), Error> {
        self.indirect
            .prepare_frame_for_child(frame, context, &self.send_queue, &self.children, index)
    }

    /// Report the transmission outcome of a staged frame.
    pub fn handle_sent_frame_to_child<P: Platform>(
        &mut self,
        context: &FrameContext,
        result: Result<(), Error>,
        index: ChildIndex,
        platform: &mut P,
        now: Instant,
    ) -> Option<TxDone> {
        self.indirect.handle_sent_frame_to_child(
            context,
            result,
            &mut self.send_queue,
            &mut self.children,
            index,
            platform,
            now,
        )
    }

    /// The MAC confirmed a requested frame change.
    pub fn handle_frame_change_done(&mut self, index: ChildIndex, now: Instant) {
        self.indirect
            .handle_frame_change_done(&self.send_queue, &mut self.children, index, now);
    }

    /// Drive the stack on a tokio runtime: external inputs arrive on
    /// `events`, timers are slept out in between. Runs until the channel
    /// closes. MAC facing calls stay synchronous methods on the stack and
    /// are expected to be made from the same task.
    pub async fn run<P: Platform>(
        mut self,
        mut platform: P,
        mut events: tokio::sync::mpsc::Receiver<ExternalEvent>,
    ) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Event channel closed, stack shutting down");
                        break;
                    };
                    let now = Instant::now();
                    match event {
                        ExternalEvent::NetworkData(bytes) => {
                            if let Err(error) = self.replace_network_data(&bytes) {
                                warn!(%error, "Rejected network data image");
                            }
                        }
                        ExternalEvent::RoleChanged(role) => self.set_role(role),
                        ExternalEvent::Dhcp6Datagram(payload) => {
                            self.handle_dhcp6_datagram(&payload, &mut platform, now);
                        }
                    }
                    self.process_events(&mut platform, now);
                }
                () = sleep_until_or_forever(deadline) => {
                    let now = Instant::now();
                    self.handle_timer(&mut platform, now);
                    self.process_events(&mut platform, now);
                }
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp6::NetifAddress;
    use crate::mac::FrameChange;
    use crate::metrics::NoMetrics;
    use crate::rloc::Rloc16;
    use std::net::SocketAddrV6;

    #[derive(Default)]
    struct TestPlatform {
        sent: Vec<(Vec<u8>, SocketAddrV6)>,
        added: Vec<NetifAddress>,
        removed: Vec<NetifAddress>,
        requests: Vec<(FrameChange, ChildIndex)>,
        short_entries: Vec<u16>,
        extended_entries: Vec<[u8; 8]>,
    }

    impl Transport for TestPlatform {
        fn send_to(&mut self, payload: &[u8], dst: SocketAddrV6) -> Result<(), Error> {
            self.sent.push((payload.to_vec(), dst));
            Ok(())
        }
    }

    impl Netif for TestPlatform {
        fn add_address(&mut self, address: NetifAddress) {
            self.added.push(address);
        }

        fn remove_address(&mut self, address: &NetifAddress) {
            self.removed.push(*address);
        }
    }

    impl SourceMatcher for TestPlatform {
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

    impl FrameScheduler for TestPlatform {
        fn request_frame_change(&mut self, change: FrameChange, child_index: ChildIndex) {
            self.requests.push((change, child_index));
        }
    }

    fn stack() -> Stack<NoMetrics> {
        Stack::new(
            Config {
                eui64: [0x18, 0xb4, 0x30, 0x00, 0x00, 0x00, 0x00, 0x01],
                mesh_local_prefix: MeshLocalPrefix::new([
                    0xfd, 0xde, 0xad, 0x00, 0xbe, 0xef, 0x00, 0x00,
                ]),
                multicast_solicit: false,
                drop_fragments_on_failure: false,
            },
            NoMetrics,
        )
    }

    #[test]
    fn netdata_change_drives_the_dhcp6_client() {
        let mut stack = stack();
        let mut platform = TestPlatform::default();
        let now = Instant::now();

        // fd01:beef::/64 with the dhcp flag, agent 0x4000.
        let bytes = [
            0x03, 0x10, 0x00, 0x40, 0xfd, 0x01, 0xbe, 0xef, 0x00, 0x00, 0x00, 0x00, //
            0x05, 0x04, 0x40, 0x00, 0x09, 0x00,
        ];
        stack.replace_network_data(&bytes).unwrap();
        assert!(!stack.dhcp6_running());

        stack.process_events(&mut platform, now);
        assert!(stack.dhcp6_running());
        assert!(stack.next_deadline().is_some());

        stack.handle_timer(&mut platform, now);
        assert_eq!(platform.sent.len(), 1);

        // Unchanged data queues no event, the exchange is untouched.
        stack.replace_network_data(&bytes).unwrap();
        stack.process_events(&mut platform, now);
        assert!(stack.dhcp6_running());

        // Withdraw the prefix.
        stack.replace_network_data(&[]).unwrap();
        stack.process_events(&mut platform, now);
        assert!(!stack.dhcp6_running());
        assert!(stack.next_deadline().is_none());
    }

    #[test]
    fn role_gates_the_indirect_sender() {
        let mut stack = stack();
        let mut platform = TestPlatform::default();
        let now = Instant::now();

        assert!(!stack.indirect.is_enabled());
        stack.set_role(Role::Router);
        stack.process_events(&mut platform, now);
        assert!(stack.indirect.is_enabled());

        stack.set_role(Role::Detached);
        stack.process_events(&mut platform, now);
        assert!(!stack.indirect.is_enabled());
    }

    #[test]
    fn sleepy_child_message_round_trip() {
        let mut stack = stack();
        let mut platform = TestPlatform::default();
        let now = Instant::now();

        stack.set_role(Role::Router);
        stack.process_events(&mut platform, now);

        let mut child = Child::new(Rloc16::new(0x0401), [7; 8]);
        child.rx_on_when_idle = false;
        let index = stack.add_child(child).unwrap();
        stack.process_events(&mut platform, now);

        let id = stack.send_to_sleepy_child(
            MessageType::Ip6,
            Bytes::from_static(b"datagram"),
            MessagePriority::Normal,
            index,
            &mut platform,
            now,
        );
        assert_eq!(platform.extended_entries, vec![[7; 8]]);

        let mut frame = TxFrame::default();
        let mut context = FrameContext::default();
        stack
            .prepare_frame_for_child(&mut frame, &mut context, index)
            .unwrap();
        assert_eq!(&frame.payload[..], b"datagram");

        let done = stack
            .handle_sent_frame_to_child(&context, Ok(()), index, &mut platform, now)
            .unwrap();
        assert_eq!(done.message, id);
        assert!(stack.send_queue.is_empty());
    }

    #[test]
    fn mode_change_event_promotes_messages() {
        let mut stack = stack();
        let mut platform = TestPlatform::default();
        let now = Instant::now();

        stack.set_role(Role::Router);
        stack.process_events(&mut platform, now);

        let mut child = Child::new(Rloc16::new(0x0401), [7; 8]);
        child.rx_on_when_idle = false;
        let index = stack.add_child(child).unwrap();
        stack.send_to_sleepy_child(
            MessageType::Ip6,
            Bytes::from_static(b"datagram"),
            MessagePriority::Normal,
            index,
            &mut platform,
            now,
        );

        stack.set_child_mode(index, true);
        stack.process_events(&mut platform, now);

        assert!(stack.send_queue.iter().all(|m| m.direct));
        assert_eq!(
            stack.children.get(index).unwrap().indirect_message_count(),
            0
        );
    }

    #[test]
    fn removing_a_child_reclaims_its_queue() {
        let mut stack = stack();
        let mut platform = TestPlatform::default();
        let now = Instant::now();

        stack.set_role(Role::Leader);
        stack.process_events(&mut platform, now);

        let mut child = Child::new(Rloc16::new(0x0401), [7; 8]);
        child.rx_on_when_idle = false;
        let index = stack.add_child(child).unwrap();
        stack.send_to_sleepy_child(
            MessageType::Ip6,
            Bytes::from_static(b"datagram"),
            MessagePriority::Normal,
            index,
            &mut platform,
            now,
        );
        assert_eq!(stack.send_queue.len(), 1);

        stack.remove_child(index, &mut platform, now);
        stack.process_events(&mut platform, now);
        assert!(stack.send_queue.is_empty());
        assert!(stack.children.get(index).is_none());
    }

    #[tokio::test]
    async fn run_loop_processes_external_events() {
        let stack = stack();
        let platform = TestPlatform::default();
        let (tx, rx) = tokio::sync::mpsc::channel(8);

        let handle = tokio::spawn(stack.run(platform, rx));

        tx.send(ExternalEvent::RoleChanged(Role::Router))
            .await
            .unwrap();
        tx.send(ExternalEvent::NetworkData(vec![
            0x03, 0x10, 0x00, 0x40, 0xfd, 0x01, 0xbe, 0xef, 0x00, 0x00, 0x00, 0x00, 0x05, 0x04,
            0x40, 0x00, 0x09, 0x00,
        ]))
        .await
        .unwrap();

        // Closing the channel shuts the loop down.
        drop(tx);
        handle.await.unwrap();
    }
}
