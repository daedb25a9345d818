use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, error, info, Instrument};
use uuid::Uuid;
use crate::config::UdpxConfig;
use crate::connection::{random_initial_sequence, Connection};
use crate::events::{AcceptObserver, DisconnectObserver};
use crate::packet_header::PacketHeader;
use crate::send_pipeline::{is_transient_socket_error, SendPipeline};

type ConnectionTable = Arc<RwLock<FxHashMap<SocketAddr, Connection>>>;

/// Removes a connection from the endpoint's table once it terminates, regardless of who
///  initiated the termination.
struct EvictOnDisconnect {
    connections: ConnectionTable,
    peer_addr: SocketAddr,
}

#[async_trait]
impl DisconnectObserver for EvictOnDisconnect {
    async fn on_disconnect(&self, _explicit: bool) {
        debug!("evicting connection to {:?}", self.peer_addr);
        self.connections.write().await.remove(&self.peer_addr);
    }
}

/// The accepting side of the protocol: one UDP socket shared by any number of peers, with
///  per-peer [Connection] state keyed by remote address.
///
/// An [EndPoint] is passive until its [recv_loop](EndPoint::recv_loop) runs; use
///  [listen] for the common case of running it on a background task.
#[derive(Clone)]
pub struct EndPoint {
    config: Arc<UdpxConfig>,
    receive_socket: Arc<UdpSocket>,
    send_pipeline: Arc<SendPipeline>,
    connections: ConnectionTable,
    accept_observers: Arc<RwLock<Vec<Arc<dyn AcceptObserver>>>>,
}

impl EndPoint {
    pub async fn bind(addrs: impl ToSocketAddrs, config: UdpxConfig) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(addrs).await?);
        info!("bound endpoint on {:?}", receive_socket.local_addr()?);

        Ok(EndPoint {
            config: Arc::new(config),
            send_pipeline: Arc::new(SendPipeline::new(Arc::new(receive_socket.clone()))),
            receive_socket,
            connections: Arc::new(RwLock::new(FxHashMap::default())),
            accept_observers: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.receive_socket.local_addr()?)
    }

    /// Registers a callback for newly accepted connections. Observers added after a peer
    ///  connected are not notified retroactively.
    pub async fn add_accept_observer(&self, observer: Arc<dyn AcceptObserver>) {
        self.accept_observers.write().await.push(observer);
    }

    pub async fn connection_to(&self, peer_addr: SocketAddr) -> Option<Connection> {
        self.connections.read().await.get(&peer_addr).cloned()
    }

    pub async fn num_connections(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Disconnects all peers. The endpoint stays bound and keeps accepting.
    pub async fn disconnect_all(&self) {
        let connections: Vec<Connection> = self.connections.read().await.values().cloned().collect();
        for connection in connections {
            connection.disconnect().await;
        }
    }

    /// Reads datagrams off the socket until a fatal socket error occurs, demultiplexing
    ///  them onto per-peer connections. Meant to be called on a dedicated task; it never
    ///  returns during regular operation.
    pub async fn recv_loop(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.config.max_packet_size];
        loop {
            let (len, from) = match self.receive_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) if is_transient_socket_error(&e) => {
                    debug!("transient error receiving datagram: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("error receiving datagram: {}", e);
                    return Err(e.into());
                }
            };

            // correlation id for tracing a single datagram through the state machine
            self.handle_datagram(from, &buf[..len])
                .instrument(debug_span!("recv", correlation_id = %Uuid::new_v4()))
                .await;
        }
    }

    async fn handle_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        if let Some(connection) = self.connection_to(from).await {
            connection.receive_raw(datagram).await;
            return;
        }

        // unknown sender: only a handshake may open a connection
        let mut parse_buf = datagram;
        match PacketHeader::deser(&mut parse_buf) {
            Ok(PacketHeader::Handshake { initial_sequence }) => {
                self.accept(from, initial_sequence, datagram).await;
            }
            Ok(header) => {
                debug!("dropping {:?} from unconnected sender {:?}", header, from);
            }
            Err(_) => {
                debug!("dropping unparsable datagram from {:?}", from);
            }
        }
    }

    async fn accept(&self, from: SocketAddr, peer_initial_sequence: i64, handshake: &[u8]) {
        info!("accepting connection from {:?}", from);

        let connection = Connection::new(
            from,
            self.send_pipeline.clone(),
            random_initial_sequence(),
            peer_initial_sequence,
            &self.config,
        ).await;
        connection.add_disconnect_observer(Arc::new(EvictOnDisconnect {
            connections: self.connections.clone(),
            peer_addr: from,
        })).await;

        self.connections.write().await
            .insert(from, connection.clone());

        // running the handshake through the regular dispatch acknowledges it
        connection.receive_raw(handshake).await;

        let observers = self.accept_observers.read().await.clone();
        for observer in &observers {
            observer.on_connect(connection.clone()).await;
        }
    }
}

/// Binds an endpoint and runs its receive loop on a background task. Dropping the
///  returned handle stops the loop.
pub async fn listen(addrs: impl ToSocketAddrs, config: UdpxConfig) -> anyhow::Result<EndPointHandle> {
    let end_point = EndPoint::bind(addrs, config).await?;
    let recv_end_point = end_point.clone();
    let recv_handle = tokio::spawn(async move {
        let _ = recv_end_point.recv_loop().await;
    });
    Ok(EndPointHandle { end_point, recv_handle })
}

pub struct EndPointHandle {
    end_point: EndPoint,
    recv_handle: JoinHandle<()>,
}

impl EndPointHandle {
    pub fn end_point(&self) -> &EndPoint {
        &self.end_point
    }
}

impl Drop for EndPointHandle {
    fn drop(&mut self) {
        self.recv_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use bytes::BytesMut;
    use tokio::sync::mpsc;
    use tokio::time;
    use crate::packet_header::PacketHeader;

    fn encoded(header: PacketHeader) -> Vec<u8> {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        buf.to_vec()
    }

    async fn recv_header(socket: &UdpSocket) -> PacketHeader {
        let mut buf = [0u8; 1500];
        let (len, _) = time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await
            .expect("timeout waiting for datagram")
            .expect("recv failed");
        let mut parse_buf = &buf[..len];
        PacketHeader::deser(&mut parse_buf).expect("unparsable header")
    }

    struct AcceptToChannel {
        sender: mpsc::UnboundedSender<SocketAddr>,
    }

    #[async_trait]
    impl AcceptObserver for AcceptToChannel {
        async fn on_connect(&self, connection: Connection) {
            let _ = self.sender.send(connection.peer_addr());
        }
    }

    #[tokio::test]
    async fn test_handshake_is_accepted_and_acknowledged() {
        let handle = listen("127.0.0.1:0", UdpxConfig::default_ethernet()).await.unwrap();
        let end_point = handle.end_point();

        let (sender, mut receiver) = mpsc::unbounded_channel();
        end_point.add_accept_observer(Arc::new(AcceptToChannel { sender })).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(end_point.local_addr().unwrap()).await.unwrap();
        client.send(&encoded(PacketHeader::Handshake { initial_sequence: -5 })).await.unwrap();

        match recv_header(&client).await {
            PacketHeader::HandshakeAck { initial_sequence } => assert!(initial_sequence < 0),
            other => panic!("expected handshake ack, got {:?}", other),
        }

        let accepted_from = time::timeout(Duration::from_secs(5), receiver.recv()).await
            .expect("timeout waiting for accept callback")
            .expect("accept channel closed");
        assert_eq!(accepted_from, client.local_addr().unwrap());

        assert_eq!(end_point.num_connections().await, 1);
        assert!(end_point.connection_to(client.local_addr().unwrap()).await.is_some());
    }

    #[tokio::test]
    async fn test_retransmitted_handshake_is_reacknowledged() {
        let handle = listen("127.0.0.1:0", UdpxConfig::default_ethernet()).await.unwrap();
        let end_point = handle.end_point();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(end_point.local_addr().unwrap()).await.unwrap();

        client.send(&encoded(PacketHeader::Handshake { initial_sequence: -5 })).await.unwrap();
        let first_ack = recv_header(&client).await;

        client.send(&encoded(PacketHeader::Handshake { initial_sequence: -5 })).await.unwrap();
        let second_ack = recv_header(&client).await;

        // the duplicate does not open a second connection, and both acks carry the same
        // initial sequence
        assert_eq!(first_ack, second_ack);
        assert_eq!(end_point.num_connections().await, 1);
    }

    #[tokio::test]
    async fn test_non_handshake_from_unknown_sender_is_dropped() {
        let handle = listen("127.0.0.1:0", UdpxConfig::default_ethernet()).await.unwrap();
        let end_point = handle.end_point();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(end_point.local_addr().unwrap()).await.unwrap();
        client.send(&encoded(PacketHeader::Sequenced { sequence: 0, receive_ack: 0 })).await.unwrap();

        // give the endpoint a chance to (mis)handle it
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(end_point.num_connections().await, 0);
    }

    #[tokio::test]
    async fn test_peer_disconnect_evicts_connection() {
        let handle = listen("127.0.0.1:0", UdpxConfig::default_ethernet()).await.unwrap();
        let end_point = handle.end_point();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(end_point.local_addr().unwrap()).await.unwrap();

        client.send(&encoded(PacketHeader::Handshake { initial_sequence: 0 })).await.unwrap();
        let server_initial = match recv_header(&client).await {
            PacketHeader::HandshakeAck { initial_sequence } => initial_sequence,
            other => panic!("expected handshake ack, got {:?}", other),
        };
        assert_eq!(end_point.num_connections().await, 1);

        client.send(&encoded(PacketHeader::Disconnect { sequence: 0, receive_ack: server_initial })).await.unwrap();

        let deadline = time::Instant::now() + Duration::from_secs(5);
        while end_point.num_connections().await > 0 {
            assert!(time::Instant::now() < deadline, "connection was not evicted");
            time::sleep(Duration::from_millis(10)).await;
        }
    }
}
