use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::connection::Connection;

/// Delivery callback for every payload a connection receives, sequenced or not. `checked`
///  is true for sequenced payloads (protected from loss and duplication) and false for
///  unsequenced ones. Sequenced payloads arrive here at most once per distinct sequence
///  number, but possibly out of order.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketObserver: Send + Sync + 'static {
    async fn on_packet(&self, checked: bool, data: &[u8]);
}

/// Delivery callback for the reliable, ordered channel: invoked in strictly increasing
///  sequence order with no gaps and no duplicates. If no ordered observer is registered on
///  a connection, out-of-order payloads are not buffered (only placeholders are kept for
///  the gap bookkeeping).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OrderedPacketObserver: Send + Sync + 'static {
    async fn on_packet_ordered(&self, data: &[u8]);
}

/// `explicit` is true for a disconnect initiated by either side, false when the connection
///  was torn down because its idle timeout expired.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DisconnectObserver: Send + Sync + 'static {
    async fn on_disconnect(&self, explicit: bool);
}

/// Called by an [`crate::end_point::EndPoint`] once per newly accepted peer. The given
///  connection can be used to respond and to register delivery observers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AcceptObserver: Send + Sync + 'static {
    async fn on_connect(&self, connection: Connection);
}
