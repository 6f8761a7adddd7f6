//! UDP datagram transport for the sensor multiplexer.

use crate::source::packet::{PacketError, PacketSource};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Largest datagram accepted from the sensor.
pub const MAX_DATAGRAM: usize = 2048;

const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Receives sensor packets on a bound UDP socket.
pub struct UdpPacketSource {
    bind: SocketAddr,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
}

impl UdpPacketSource {
    /// Bind to `addr` (e.g. `0.0.0.0:6789`).
    pub fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self {
            bind: addr,
            socket: Some(socket),
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl PacketSource for UdpPacketSource {
    fn recv_packet(&mut self, timeout: Duration) -> Result<Vec<u8>, PacketError> {
        let socket = self.socket.as_ref().ok_or(PacketError::Disconnected)?;
        // The OS rejects a zero read timeout.
        socket.set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;

        match socket.recv_from(&mut self.buf) {
            Ok((len, _peer)) => Ok(self.buf[..len].to_vec()),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(PacketError::Timeout)
            }
            Err(e) => Err(PacketError::Io(e)),
        }
    }

    fn reconnect(&mut self) -> Result<(), PacketError> {
        // Rebind on the original address so the sensor keeps its target.
        self.socket = None;
        let socket = UdpSocket::bind(self.bind)?;
        tracing::info!(addr = %self.bind, "rebound udp socket");
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn describe(&self) -> String {
        format!("udp:{}", self.bind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receives_datagram() {
        let mut source = UdpPacketSource::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = source.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"&acc:1,2,3:", target).unwrap();

        let packet = source.recv_packet(Duration::from_secs(2)).unwrap();
        assert_eq!(packet, b"&acc:1,2,3:");
    }

    #[test]
    fn test_timeout_when_silent() {
        let mut source = UdpPacketSource::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(matches!(
            source.recv_packet(Duration::from_millis(20)),
            Err(PacketError::Timeout)
        ));
    }

    #[test]
    fn test_closed_source_is_disconnected() {
        let mut source = UdpPacketSource::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        source.close();
        assert!(matches!(
            source.recv_packet(Duration::from_millis(20)),
            Err(PacketError::Disconnected)
        ));
    }

    #[test]
    fn test_zero_timeout_times_out() {
        let mut source = UdpPacketSource::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(matches!(
            source.recv_packet(Duration::ZERO),
            Err(PacketError::Timeout)
        ));
    }
}
