use std::time::Duration;
use anyhow::bail;
use crate::packet_header::PacketHeader;

pub struct UdpxConfig {
    /// This is the maximum datagram payload that UDPX sends or expects to receive, i.e. the
    ///  receive buffer size and the upper bound on `header + application payload`.
    ///
    /// UDPX does not fragment: a payload that does not fit into a single datagram of this
    ///  size is the application's problem. With full Ethernet frames and no optional IP
    ///  headers the usable UDP payload is `1500 - 20 - 8 = 1472` for IPV4; choosing the
    ///  value too big causes packets to be dropped on constrained routes, choosing it too
    ///  small wastes bandwidth.
    pub max_packet_size: usize,

    /// Interval of the liveness probe sent when a connection is idle on the outbound side.
    ///  `None` disables keep-alives. Can be changed per connection at any time.
    pub keep_alive: Option<Duration>,

    /// A connection that has not received an acceptable datagram for this long is torn
    ///  down (surfaced as a non-explicit disconnect). `None` disables the idle timeout.
    pub timeout: Option<Duration>,

    /// Number of times the handshake is re-sent after the initial attempt, so a connect
    ///  sends `connect_retries + 1` handshakes before giving up.
    pub connect_retries: u32,

    /// Time to wait for a handshake ack after each attempt before re-sending.
    pub connect_retry_interval: Duration,

    /// Final grace period after the last re-send, before the connect fails.
    pub connect_timeout: Duration,
}

impl UdpxConfig {
    /// Defaults for IPV4 with end-to-end full Ethernet MTU: keep-alive and timeout start
    ///  disabled, connects re-send the handshake five times at one-second intervals before
    ///  the final grace period.
    pub fn default_ethernet() -> UdpxConfig {
        UdpxConfig {
            max_packet_size: 1472,
            keep_alive: None,
            timeout: None,
            connect_retries: 5,
            connect_retry_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size < PacketHeader::MAX_SERIALIZED_LEN {
            bail!("max packet size is too small to hold a packet header");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::defaults(1472, true)]
    #[case::minimal_packet_size(9, true)]
    #[case::packet_size_too_small(8, false)]
    fn test_validate(#[case] max_packet_size: usize, #[case] expected_ok: bool) {
        let config = UdpxConfig {
            max_packet_size,
            ..UdpxConfig::default_ethernet()
        };
        assert_eq!(config.validate().is_ok(), expected_ok);
    }
}
