//! Reliable, ordered message delivery over plain UDP datagrams.
//!
//! Every payload travels in a single datagram with a small fixed-size header in front.
//! Sequenced payloads carry a per-connection sequence number and an acknowledgement of
//! everything received so far; the receiver reorders, deduplicates and explicitly
//! requests retransmission of anything missing. Unsequenced payloads bypass all of that
//! and are delivered best effort.
//!
//! The header is one discriminator byte followed by up to two big-endian `i32` values:
//!
//! | type          | fields                            |
//! |---------------|-----------------------------------|
//! | handshake     | initial sequence                  |
//! | handshake ack | initial sequence                  |
//! | unsequenced   | -                                 |
//! | sequenced     | sequence, receive ack             |
//! | request       | sequence                          |
//! | keep-alive    | last sent sequence, receive ack   |
//! | disconnect    | sequence, receive ack             |
//!
//! A server calls [listen] (or drives [EndPoint::recv_loop] itself) and accepts any
//! number of peers on one socket; a client calls [connect]. Both ends hold a
//! [Connection], which is where sending, the delivery observers and the keep-alive /
//! idle-timeout timers live.
//!
//! There is no congestion control, no fragmentation and no encryption: payloads must fit
//! in a single datagram below the configured MTU, and anything beyond transport
//! reliability belongs to the layer above.

pub mod config;
pub mod connect;
pub mod connection;
pub mod end_point;
pub mod events;
pub mod packet_header;
pub mod send_pipeline;

pub use config::UdpxConfig;
pub use connect::connect;
pub use connection::Connection;
pub use end_point::{listen, EndPoint, EndPointHandle};
pub use events::{AcceptObserver, DisconnectObserver, OrderedPacketObserver, PacketObserver};
pub use packet_header::{PacketHeader, SEQUENCE_WINDOW};
pub use send_pipeline::{SendPipeline, SendSocket};
