use std::cmp::max;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::{BufMut, BytesMut};
use rand::Rng;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace};
use crate::config::UdpxConfig;
use crate::events::{DisconnectObserver, OrderedPacketObserver, PacketObserver};
use crate::packet_header::{PacketHeader, SEQUENCE_WINDOW};
use crate::send_pipeline::SendPipeline;

/// Initial sequence numbers are drawn from the negative `i32` range: random to avoid
///  collisions with stale packets across reconnects, negative so that sign handling in the
///  sequence arithmetic is exercised from the first packet on.
pub(crate) fn random_initial_sequence() -> i64 {
    rand::thread_rng().gen_range(i32::MIN..0) as i64
}

struct ConnectionInner {
    peer_addr: SocketAddr,
    send_pipeline: Arc<SendPipeline>,

    /// the randomly chosen start of the local send sequence, kept around so a
    ///  retransmitted peer handshake can be re-acknowledged at any time
    initial_sequence: i64,
    /// next sequence number to assign to a reliably sent payload
    send_sequence: i64,
    /// smallest sequence number not yet delivered in order, i.e. the next value the
    ///  ordered delivery observers are waiting for
    receive_sequence: i64,
    /// highest sequence number observed from the peer so far
    last_receive_sequence: i64,

    /// reliably sent payloads the peer has not acknowledged yet, kept to satisfy
    ///  retransmission requests
    sent_log: BTreeMap<i64, Vec<u8>>,
    /// sequenced payloads received ahead of `receive_sequence`; the value is `None` if no
    ///  ordered observer was registered when the packet arrived (gap bookkeeping without
    ///  unbounded buffering)
    reorder_buffer: BTreeMap<i64, Option<Vec<u8>>>,

    keep_alive: Option<Duration>,
    timeout: Option<Duration>,
    keep_alive_handle: Option<JoinHandle<()>>,
    timeout_handle: Option<JoinHandle<()>>,
    /// receive loop feeding this connection, if it owns its socket (connector side)
    io_handle: Option<JoinHandle<()>>,

    packet_observers: Vec<Arc<dyn PacketObserver>>,
    ordered_observers: Vec<Arc<dyn OrderedPacketObserver>>,
    disconnect_observers: Vec<Arc<dyn DisconnectObserver>>,

    closed: bool,
}

impl ConnectionInner {
    fn encode(header: &PacketHeader, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(PacketHeader::MAX_SERIALIZED_LEN + payload.len());
        header.ser(&mut buf);
        buf.put_slice(payload);
        buf
    }

    /// Bounds an incoming `(sequence, ack)` pair to a plausible window relative to local
    ///  state, rejecting spoofed or badly stale packets in O(1).
    fn valid(&self, seq: i64, ack: i64) -> bool {
        seq >= self.receive_sequence
            && seq < self.last_receive_sequence + SEQUENCE_WINDOW
            && ack <= self.send_sequence
            && ack > self.send_sequence - SEQUENCE_WINDOW
    }

    /// The peer reported everything up through `ack - 1` as received: prune the sent log
    ///  accordingly. Pruning is monotonic, entries are never re-inserted.
    fn process_receive_ack(&mut self, ack: i64) {
        let kept = self.sent_log.split_off(&(ack - 1));
        self.sent_log = kept;
    }

    /// Encodes a retransmission request for every sequence in
    ///  `[receive_sequence, upto_exclusive)` that is neither delivered nor buffered.
    fn gap_requests(&self, upto_exclusive: i64, outbound: &mut Vec<BytesMut>) {
        for sequence in self.receive_sequence..upto_exclusive {
            if !self.reorder_buffer.contains_key(&sequence) {
                trace!("requesting retransmission of #{} from {:?}", sequence, self.peer_addr);
                outbound.push(Self::encode(&PacketHeader::Request { sequence }, &[]));
            }
        }
    }

    /// Cancels the timers and releases buffers. Must run before any disconnect observer is
    ///  invoked so no timer can fire on torn-down state.
    ///
    /// The receive loop handle is returned instead of aborted: the caller may *be* that
    ///  task, and aborting it here would cancel the caller's remaining sends and observer
    ///  notifications at their next await point. The caller aborts it when it is done.
    #[must_use]
    fn teardown(&mut self) -> Option<JoinHandle<()>> {
        self.closed = true;
        if let Some(handle) = self.keep_alive_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.timeout_handle.take() {
            handle.abort();
        }
        self.sent_log.clear();
        self.reorder_buffer.clear();
        self.io_handle.take()
    }
}

/// What a single inbound datagram produced, collected under the connection lock and acted
///  on after it is released (so observers can call back into the connection).
#[derive(Default)]
struct Deliveries {
    unordered: Option<(bool, Vec<u8>)>,
    ordered: Vec<Vec<u8>>,
    disconnect: bool,
}

/// The reliability state machine for one remote endpoint: sequencing, reordering,
///  retransmission bookkeeping and the keep-alive / idle-timeout timers, multiplexed over
///  whatever socket the owning side provides.
///
/// Cheap to clone; all clones share the same underlying state.
#[derive(Clone)]
pub struct Connection {
    peer_addr: SocketAddr,
    inner: Arc<RwLock<ConnectionInner>>,
}

impl Connection {
    pub(crate) async fn new(
        peer_addr: SocketAddr,
        send_pipeline: Arc<SendPipeline>,
        initial_sequence: i64,
        peer_initial_sequence: i64,
        config: &UdpxConfig,
    ) -> Connection {
        let inner = ConnectionInner {
            peer_addr,
            send_pipeline,
            initial_sequence,
            send_sequence: initial_sequence,
            receive_sequence: peer_initial_sequence,
            last_receive_sequence: peer_initial_sequence,
            sent_log: BTreeMap::default(),
            reorder_buffer: BTreeMap::default(),
            keep_alive: config.keep_alive,
            timeout: config.timeout,
            keep_alive_handle: None,
            timeout_handle: None,
            io_handle: None,
            packet_observers: Vec::new(),
            ordered_observers: Vec::new(),
            disconnect_observers: Vec::new(),
            closed: false,
        };

        let connection = Connection {
            peer_addr,
            inner: Arc::new(RwLock::new(inner)),
        };

        {
            let mut inner = connection.inner.write().await;
            connection.reset_keep_alive_locked(&mut inner);
            connection.reset_timeout_locked(&mut inner);
        }

        connection
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.closed
    }

    pub async fn add_packet_observer(&self, observer: Arc<dyn PacketObserver>) {
        self.inner.write().await.packet_observers.push(observer);
    }

    pub async fn add_ordered_observer(&self, observer: Arc<dyn OrderedPacketObserver>) {
        self.inner.write().await.ordered_observers.push(observer);
    }

    pub async fn add_disconnect_observer(&self, observer: Arc<dyn DisconnectObserver>) {
        self.inner.write().await.disconnect_observers.push(observer);
    }

    /// Changes the keep-alive interval; `None` disables the probe. Takes effect
    ///  immediately, the running timer is rescheduled.
    pub async fn set_keep_alive(&self, interval: Option<Duration>) {
        let mut inner = self.inner.write().await;
        inner.keep_alive = interval;
        self.reset_keep_alive_locked(&mut inner);
    }

    /// Changes the idle timeout; `None` disables it. Takes effect immediately.
    pub async fn set_timeout(&self, timeout: Option<Duration>) {
        let mut inner = self.inner.write().await;
        inner.timeout = timeout;
        self.reset_timeout_locked(&mut inner);
    }

    pub(crate) async fn attach_io_task(&self, handle: JoinHandle<()>) {
        let mut inner = self.inner.write().await;
        if inner.closed {
            handle.abort();
        }
        else {
            inner.io_handle = Some(handle);
        }
    }

    /// Sends a payload on the reliable, ordered channel. Never fails from the caller's
    ///  perspective: transport loss is handled by the retransmission protocol, not here.
    pub async fn send(&self, payload: &[u8]) {
        let (pipeline, buf) = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                debug!("send on closed connection to {:?} - dropping", self.peer_addr);
                return;
            }

            let sequence = inner.send_sequence;
            let header = PacketHeader::Sequenced { sequence, receive_ack: inner.receive_sequence };
            inner.sent_log.insert(sequence, payload.to_vec());
            inner.send_sequence += 1;
            self.reset_keep_alive_locked(&mut inner);

            (inner.send_pipeline.clone(), ConnectionInner::encode(&header, payload))
        };
        pipeline.do_send_packet(self.peer_addr, buf.as_ref()).await;
    }

    /// Sends a payload best-effort: no sequencing, no retransmission, no ordering.
    pub async fn send_unchecked(&self, payload: &[u8]) {
        let (pipeline, buf) = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                debug!("send on closed connection to {:?} - dropping", self.peer_addr);
                return;
            }
            self.reset_keep_alive_locked(&mut inner);
            (inner.send_pipeline.clone(), ConnectionInner::encode(&PacketHeader::Unsequenced, payload))
        };
        pipeline.do_send_packet(self.peer_addr, buf.as_ref()).await;
    }

    /// Announces the termination to the peer (best effort, no ack is awaited) and tears
    ///  down local state. Disconnect observers fire with `explicit = true`.
    pub async fn disconnect(&self) {
        let (pipeline, buf, observers, io_handle) = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return;
            }
            debug!("disconnecting from {:?}", self.peer_addr);

            let header = PacketHeader::Disconnect {
                sequence: inner.send_sequence,
                receive_ack: inner.receive_sequence,
            };
            let io_handle = inner.teardown();
            (inner.send_pipeline.clone(), ConnectionInner::encode(&header, &[]), inner.disconnect_observers.clone(), io_handle)
        };

        pipeline.do_send_packet(self.peer_addr, buf.as_ref()).await;
        for observer in &observers {
            observer.on_disconnect(true).await;
        }
        if let Some(handle) = io_handle {
            handle.abort();
        }
    }

    /// The single entry point for inbound datagrams, called by whoever owns the socket.
    ///  Dispatches by packet type; every accepted datagram (i.e. well-formed and passing
    ///  the validity window) re-arms the idle timeout.
    pub async fn receive_raw(&self, datagram: &[u8]) {
        let mut parse_buf = datagram;
        let header = match PacketHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(_) => {
                debug!("received datagram with unparsable header from {:?} - dropping", self.peer_addr);
                return;
            }
        };
        let payload = parse_buf;

        let mut outbound: Vec<BytesMut> = Vec::new();
        let mut deliveries = Deliveries::default();
        let mut io_handle = None;

        let (pipeline, packet_observers, ordered_observers, disconnect_observers) = {
            let mut inner = self.inner.write().await;
            if inner.closed {
                return;
            }

            let accepted = match header {
                PacketHeader::Handshake { .. } => {
                    // the peer re-sent its handshake, most likely because our ack got
                    // lost; re-ack without touching sequence state
                    trace!("re-acknowledging handshake from {:?}", self.peer_addr);
                    outbound.push(ConnectionInner::encode(
                        &PacketHeader::HandshakeAck { initial_sequence: inner.initial_sequence },
                        &[],
                    ));
                    true
                }
                PacketHeader::HandshakeAck { .. } => {
                    trace!("ignoring stray handshake ack from {:?}", self.peer_addr);
                    true
                }
                PacketHeader::Unsequenced => {
                    deliveries.unordered = Some((false, payload.to_vec()));
                    true
                }
                PacketHeader::Sequenced { sequence, receive_ack } => {
                    self.on_sequenced(&mut inner, sequence, receive_ack, payload, &mut deliveries, &mut outbound)
                }
                PacketHeader::Request { sequence } => {
                    if let Some(payload) = inner.sent_log.get(&sequence) {
                        // resent under the *same* sequence number so the peer's ordering
                        // logic treats it like the original
                        let header = PacketHeader::Sequenced { sequence, receive_ack: inner.receive_sequence };
                        outbound.push(ConnectionInner::encode(&header, payload));
                    }
                    else {
                        debug!("{:?} requested #{} which is no longer in the sent log", self.peer_addr, sequence);
                    }
                    true
                }
                PacketHeader::KeepAlive { last_sent_sequence, receive_ack } => {
                    self.on_keep_alive(&mut inner, last_sent_sequence, receive_ack, &mut outbound)
                }
                PacketHeader::Disconnect { sequence, receive_ack } => {
                    if inner.valid(sequence, receive_ack) {
                        debug!("peer {:?} disconnected", self.peer_addr);
                        deliveries.disconnect = true;
                        io_handle = inner.teardown();
                    }
                    else {
                        debug!("received disconnect outside the validity window from {:?} - dropping", self.peer_addr);
                    }
                    false
                }
            };

            if accepted && !inner.closed {
                self.reset_timeout_locked(&mut inner);
            }

            (
                inner.send_pipeline.clone(),
                inner.packet_observers.clone(),
                inner.ordered_observers.clone(),
                inner.disconnect_observers.clone(),
            )
        };

        // lock released: send first, then deliver, so observers may call back in
        for buf in &outbound {
            pipeline.do_send_packet(self.peer_addr, buf.as_ref()).await;
        }
        if let Some((checked, data)) = &deliveries.unordered {
            for observer in &packet_observers {
                observer.on_packet(*checked, data).await;
            }
        }
        for data in &deliveries.ordered {
            for observer in &ordered_observers {
                observer.on_packet_ordered(data).await;
            }
        }
        if deliveries.disconnect {
            for observer in &disconnect_observers {
                observer.on_disconnect(true).await;
            }
        }
        if let Some(handle) = io_handle {
            handle.abort();
        }
    }

    fn on_sequenced(
        &self,
        inner: &mut ConnectionInner,
        sequence: i64,
        receive_ack: i64,
        payload: &[u8],
        deliveries: &mut Deliveries,
        outbound: &mut Vec<BytesMut>,
    ) -> bool {
        if !inner.valid(sequence, receive_ack) {
            debug!("received #{} outside the validity window from {:?} - dropping", sequence, self.peer_addr);
            return false;
        }
        inner.process_receive_ack(receive_ack);

        if sequence < inner.receive_sequence || inner.reorder_buffer.contains_key(&sequence) {
            // duplicate of something already delivered or buffered
            inner.last_receive_sequence = max(inner.last_receive_sequence, sequence);
        }
        else {
            deliveries.unordered = Some((true, payload.to_vec()));
            inner.last_receive_sequence = max(inner.last_receive_sequence, sequence);

            if sequence == inner.receive_sequence {
                // the next in-order packet: deliver it, then drain the contiguous run
                // it may have completed
                deliveries.ordered.push(payload.to_vec());
                inner.receive_sequence += 1;
                while let Some(buffered) = inner.reorder_buffer.remove(&inner.receive_sequence) {
                    if let Some(data) = buffered {
                        deliveries.ordered.push(data);
                    }
                    inner.receive_sequence += 1;
                }
            }
            else {
                let stored = if inner.ordered_observers.is_empty() { None } else { Some(payload.to_vec()) };
                inner.reorder_buffer.insert(sequence, stored);
            }
        }

        let upto = inner.last_receive_sequence;
        inner.gap_requests(upto, outbound);
        true
    }

    fn on_keep_alive(
        &self,
        inner: &mut ConnectionInner,
        last_sent_sequence: i64,
        receive_ack: i64,
        outbound: &mut Vec<BytesMut>,
    ) -> bool {
        // NB: validated one past the advertised sequence: on a fully synchronized
        //  connection `last_sent_sequence + 1 == receive_sequence`, and the probe of an
        //  idle peer must still count as liveness
        if !inner.valid(last_sent_sequence + 1, receive_ack) {
            debug!("received keep-alive outside the validity window from {:?} - dropping", self.peer_addr);
            return false;
        }
        trace!("keep-alive from {:?}, peer sent up to #{}", self.peer_addr, last_sent_sequence);
        inner.process_receive_ack(receive_ack);
        inner.last_receive_sequence = max(inner.last_receive_sequence, last_sent_sequence);

        // an idle peer's keep-alive alone drives gap discovery: request everything up to
        //  and including its advertised last sent sequence
        let upto = last_sent_sequence + 1;
        inner.gap_requests(upto, outbound);
        true
    }

    /// (Re-)arms the keep-alive timer: cancel-and-reschedule, called on every outbound
    ///  send and on interval changes.
    fn reset_keep_alive_locked(&self, inner: &mut ConnectionInner) {
        if let Some(handle) = inner.keep_alive_handle.take() {
            handle.abort();
        }
        if inner.closed {
            return;
        }
        let Some(interval) = inner.keep_alive else {
            return;
        };

        let inner_arc = self.inner.clone();
        inner.keep_alive_handle = Some(tokio::spawn(keep_alive_loop(inner_arc, interval)));
    }

    /// (Re-)arms the idle timeout: cancel-and-reschedule, called on every accepted
    ///  inbound datagram and on timeout changes.
    fn reset_timeout_locked(&self, inner: &mut ConnectionInner) {
        if let Some(handle) = inner.timeout_handle.take() {
            handle.abort();
        }
        if inner.closed {
            return;
        }
        let Some(timeout) = inner.timeout else {
            return;
        };

        let inner_arc = self.inner.clone();
        inner.timeout_handle = Some(tokio::spawn(async move {
            time::sleep(timeout).await;

            let (observers, io_handle) = {
                let mut inner = inner_arc.write().await;
                if inner.closed {
                    return;
                }
                debug!("connection to {:?} timed out after {:?}", inner.peer_addr, timeout);

                // this very task - taking it out keeps teardown() from aborting us
                inner.timeout_handle = None;
                let io_handle = inner.teardown();
                (inner.disconnect_observers.clone(), io_handle)
            };
            if let Some(handle) = io_handle {
                handle.abort();
            }

            for observer in &observers {
                observer.on_disconnect(false).await;
            }
        }));
    }
}

/// Emits a keep-alive whenever the connection has been outbound-idle for the configured
///  interval. The probe advertises the highest sequence sent so far, so the peer can
///  request gaps even when no fresh data flows.
async fn keep_alive_loop(inner_arc: Arc<RwLock<ConnectionInner>>, mut interval: Duration) {
    loop {
        time::sleep(interval).await;

        let (pipeline, peer_addr, buf) = {
            let inner = inner_arc.read().await;
            if inner.closed {
                return;
            }
            let header = PacketHeader::KeepAlive {
                last_sent_sequence: inner.send_sequence - 1,
                receive_ack: inner.receive_sequence,
            };
            (inner.send_pipeline.clone(), inner.peer_addr, ConnectionInner::encode(&header, &[]))
        };

        trace!("sending keep-alive to {:?}", peer_addr);
        pipeline.do_send_packet(peer_addr, buf.as_ref()).await;

        match inner_arc.read().await.keep_alive {
            Some(current) => interval = current,
            None => return,
        }
    }
}
