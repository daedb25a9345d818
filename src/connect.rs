use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, debug_span, error, Instrument};
use uuid::Uuid;
use crate::config::UdpxConfig;
use crate::connection::{random_initial_sequence, Connection};
use crate::packet_header::PacketHeader;
use crate::send_pipeline::{is_transient_socket_error, SendPipeline};

/// Opens a connection to a listening endpoint: binds a fresh socket, runs the handshake
///  with retries, and spawns a receive loop feeding the returned [Connection]. The loop
///  is torn down with the connection.
pub async fn connect(server_addr: SocketAddr, config: UdpxConfig) -> anyhow::Result<Connection> {
    config.validate()?;

    let bind_addr: SocketAddr = if server_addr.is_ipv4() {
        "0.0.0.0:0".parse()?
    }
    else {
        "[::]:0".parse()?
    };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    let send_pipeline = Arc::new(SendPipeline::new(Arc::new(socket.clone())));

    let initial_sequence = random_initial_sequence();
    let mut handshake = BytesMut::new();
    PacketHeader::Handshake { initial_sequence }.ser(&mut handshake);

    // datagrams the server sends between its handshake ack and our first read must not
    //  be lost, so everything else from it is buffered for replay
    let mut early_arrivals: Vec<Vec<u8>> = Vec::new();
    let mut recv_buf = vec![0u8; config.max_packet_size];

    // the initial handshake plus `connect_retries` re-sends at the retry interval; the
    //  last send gets the (separately configured) final grace period
    let mut peer_initial_sequence = None;
    for attempt in 0..=config.connect_retries {
        debug!("sending handshake to {:?} (attempt {}/{})", server_addr, attempt + 1, config.connect_retries + 1);
        send_pipeline.do_send_packet(server_addr, handshake.as_ref()).await;

        let wait = if attempt == config.connect_retries { config.connect_timeout } else { config.connect_retry_interval };
        if let Some(sequence) = await_handshake_ack(
            &socket,
            server_addr,
            Instant::now() + wait,
            &mut recv_buf,
            &mut early_arrivals,
        ).await? {
            peer_initial_sequence = Some(sequence);
            break;
        }
    }
    let Some(peer_initial_sequence) = peer_initial_sequence else {
        bail!("no handshake ack from {:?} after {} attempts", server_addr, config.connect_retries + 1);
    };
    debug!("connected to {:?}", server_addr);

    let max_packet_size = config.max_packet_size;
    let connection = Connection::new(
        server_addr,
        send_pipeline,
        initial_sequence,
        peer_initial_sequence,
        &config,
    ).await;

    let recv_connection = connection.clone();
    connection.attach_io_task(tokio::spawn(
        client_recv_loop(socket, recv_connection, max_packet_size)
    )).await;

    for datagram in early_arrivals {
        connection.receive_raw(&datagram).await;
    }

    Ok(connection)
}

/// Waits until `deadline` for the server's handshake ack, returning its initial sequence.
///  Other datagrams from the server are pushed onto `early_arrivals`; datagrams from
///  third parties are dropped.
async fn await_handshake_ack(
    socket: &UdpSocket,
    server_addr: SocketAddr,
    deadline: Instant,
    recv_buf: &mut [u8],
    early_arrivals: &mut Vec<Vec<u8>>,
) -> anyhow::Result<Option<i64>> {
    loop {
        let received = match time::timeout_at(deadline, socket.recv_from(recv_buf)).await {
            Ok(received) => received,
            Err(_) => return Ok(None),
        };
        let (len, from) = match received {
            Ok(x) => x,
            Err(e) if is_transient_socket_error(&e) => {
                debug!("transient error receiving datagram: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if from != server_addr {
            debug!("dropping datagram from {:?} while connecting to {:?}", from, server_addr);
            continue;
        }

        let mut parse_buf = &recv_buf[..len];
        match PacketHeader::deser(&mut parse_buf) {
            Ok(PacketHeader::HandshakeAck { initial_sequence }) => return Ok(Some(initial_sequence)),
            Ok(_) => early_arrivals.push(recv_buf[..len].to_vec()),
            Err(_) => debug!("dropping unparsable datagram from {:?}", from),
        }
    }
}

async fn client_recv_loop(socket: Arc<UdpSocket>, connection: Connection, max_packet_size: usize) {
    let mut buf = vec![0u8; max_packet_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if from != connection.peer_addr() {
                    debug!("dropping datagram from {:?}, connected to {:?}", from, connection.peer_addr());
                    continue;
                }
                connection.receive_raw(&buf[..len])
                    .instrument(debug_span!("recv", correlation_id = %Uuid::new_v4()))
                    .await;
            }
            Err(e) if is_transient_socket_error(&e) => {
                debug!("transient error receiving datagram: {}", e);
            }
            Err(e) => {
                error!("error receiving datagram: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use crate::end_point::listen;
    use crate::events::{AcceptObserver, OrderedPacketObserver};

    struct OrderedToChannel {
        sender: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl OrderedPacketObserver for OrderedToChannel {
        async fn on_packet_ordered(&self, data: &[u8]) {
            let _ = self.sender.send(data.to_vec());
        }
    }

    struct AcceptToChannel {
        sender: mpsc::UnboundedSender<Connection>,
        ordered_sender: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl AcceptObserver for AcceptToChannel {
        async fn on_connect(&self, connection: Connection) {
            connection.add_ordered_observer(Arc::new(OrderedToChannel {
                sender: self.ordered_sender.clone(),
            })).await;
            let _ = self.sender.send(connection);
        }
    }

    async fn next<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> T {
        time::timeout(Duration::from_secs(5), receiver.recv()).await
            .expect("timeout waiting on channel")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_connect_and_exchange_payloads() {
        let handle = listen("127.0.0.1:0", UdpxConfig::default_ethernet()).await.unwrap();
        let server_addr = handle.end_point().local_addr().unwrap();

        let (accept_sender, mut accepted) = mpsc::unbounded_channel();
        let (server_ordered_sender, mut server_received) = mpsc::unbounded_channel();
        handle.end_point().add_accept_observer(Arc::new(AcceptToChannel {
            sender: accept_sender,
            ordered_sender: server_ordered_sender,
        })).await;

        let client = connect(server_addr, UdpxConfig::default_ethernet()).await.unwrap();
        assert_eq!(client.peer_addr(), server_addr);

        let (client_ordered_sender, mut client_received) = mpsc::unbounded_channel();
        client.add_ordered_observer(Arc::new(OrderedToChannel {
            sender: client_ordered_sender,
        })).await;

        client.send(b"ping 1").await;
        client.send(b"ping 2").await;
        assert_eq!(next(&mut server_received).await, b"ping 1");
        assert_eq!(next(&mut server_received).await, b"ping 2");

        let server_connection = next(&mut accepted).await;
        server_connection.send(b"pong").await;
        assert_eq!(next(&mut client_received).await, b"pong");

        client.disconnect().await;
        assert!(client.is_closed().await);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retries() {
        // a socket that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();

        let mut config = UdpxConfig::default_ethernet();
        config.connect_retries = 2;
        config.connect_retry_interval = Duration::from_millis(50);
        config.connect_timeout = Duration::from_millis(50);

        let result = connect(silent_addr, config).await;
        assert!(result.is_err());

        // the initial handshake plus two re-sends must have arrived
        let mut buf = [0u8; 1500];
        let mut handshakes = 0;
        while let Ok(Ok((len, _))) = time::timeout(Duration::from_millis(200), silent.recv_from(&mut buf)).await {
            let mut parse_buf = &buf[..len];
            assert!(matches!(PacketHeader::deser(&mut parse_buf), Ok(PacketHeader::Handshake { .. })));
            handshakes += 1;
        }
        assert_eq!(handshakes, 3);
    }

    #[tokio::test]
    async fn test_explicit_disconnect_reaches_server() {
        let handle = listen("127.0.0.1:0", UdpxConfig::default_ethernet()).await.unwrap();
        let server_addr = handle.end_point().local_addr().unwrap();

        let client = connect(server_addr, UdpxConfig::default_ethernet()).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.end_point().num_connections().await == 0 {
            assert!(Instant::now() < deadline, "server never registered the connection");
            time::sleep(Duration::from_millis(10)).await;
        }

        client.disconnect().await;

        while handle.end_point().num_connections().await > 0 {
            assert!(Instant::now() < deadline, "server kept the connection after disconnect");
            time::sleep(Duration::from_millis(10)).await;
        }
    }
}
