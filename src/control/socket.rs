//! Loopback control plane.
//!
//! The server runs on its own thread. It only parses requests, forwards
//! commands into the loop's channel and updates the shared label; the loop
//! acts on commands at the start of its next iteration. Every request gets a
//! reply: `ACK <request>` or `ERR <reason>`.

use crate::control::command::{CommandSender, ControlRequest};
use crate::control::slot::SharedLabel;
use crate::control::ControlError;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_REQUEST: usize = 512;

pub struct ControlServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind `addr` and start serving requests.
    pub fn spawn(addr: SocketAddr, commands: CommandSender, label: SharedLabel) -> Result<Self, ControlError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let addr = socket.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let handle = thread::Builder::new()
            .name("control-server".to_string())
            .spawn(move || serve(socket, commands, label, flag))?;

        tracing::info!(%addr, "control server listening");

        Ok(Self {
            addr,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(socket: UdpSocket, commands: CommandSender, label: SharedLabel, shutdown: Arc<AtomicBool>) {
    let mut buf = [0u8; MAX_REQUEST];

    while !shutdown.load(Ordering::SeqCst) {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "control socket receive failed");
                continue;
            }
        };

        let reply = match std::str::from_utf8(&buf[..len]) {
            Ok(text) => handle_request(text, &commands, &label),
            Err(_) => "ERR request is not UTF-8".to_string(),
        };

        if let Err(e) = socket.send_to(reply.as_bytes(), peer) {
            tracing::warn!(%peer, error = %e, "control reply failed");
        }
    }
}

fn handle_request(text: &str, commands: &CommandSender, label: &SharedLabel) -> String {
    match ControlRequest::parse(text) {
        Ok(ControlRequest::Command(command)) => {
            if commands.send(command) {
                tracing::debug!(%command, "control command accepted");
                format!("ACK {command}")
            } else {
                "ERR acquisition loop is not running".to_string()
            }
        }
        Ok(ControlRequest::SetLabel(name)) => {
            label.set(name.clone());
            tracing::info!(label = %name, "label selected");
            format!("ACK LABEL {name}")
        }
        Err(e) => format!("ERR {e}"),
    }
}

/// Send one request and wait for its acknowledgement.
pub fn send_request(server: SocketAddr, request: &ControlRequest, timeout: Duration) -> Result<String, ControlError> {
    let local: SocketAddr = if server.is_ipv6() {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([127, 0, 0, 1], 0))
    };
    let socket = UdpSocket::bind(local)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.send_to(request.encode().as_bytes(), server)?;

    let mut buf = [0u8; MAX_REQUEST];
    let len = match socket.recv_from(&mut buf) {
        Ok((len, _)) => len,
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            return Err(ControlError::NoReply(server));
        }
        // Nothing listening on a loopback port surfaces as a reset.
        Err(e) if e.kind() == ErrorKind::ConnectionRefused || e.kind() == ErrorKind::ConnectionReset => {
            return Err(ControlError::NoReply(server));
        }
        Err(e) => return Err(e.into()),
    };

    let reply = String::from_utf8_lossy(&buf[..len]).trim().to_string();
    match reply.strip_prefix("ERR") {
        Some(reason) => Err(ControlError::Rejected(reason.trim().to_string())),
        None => Ok(reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::command::{command_channel, Command, CommandSource};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_command_is_acknowledged_and_forwarded() {
        let (sender, mut commands) = command_channel();
        let server = ControlServer::spawn(loopback(), sender, SharedLabel::default()).unwrap();

        let reply = send_request(
            server.local_addr(),
            &ControlRequest::Command(Command::StartCollecting),
            Duration::from_secs(2),
        )
        .unwrap();

        assert_eq!(reply, "ACK START_COLLECTING");
        assert_eq!(commands.poll(), Some(Command::StartCollecting));
        server.shutdown();
    }

    #[test]
    fn test_label_request_updates_shared_label() {
        let (sender, _commands) = command_channel();
        let label = SharedLabel::default();
        let server = ControlServer::spawn(loopback(), sender, label.clone()).unwrap();

        let reply = send_request(
            server.local_addr(),
            &ControlRequest::SetLabel("wave".into()),
            Duration::from_secs(2),
        )
        .unwrap();

        assert_eq!(reply, "ACK LABEL wave");
        assert_eq!(label.get().as_deref(), Some("wave"));
    }

    #[test]
    fn test_unknown_request_is_rejected() {
        let (sender, _commands) = command_channel();
        let server = ControlServer::spawn(loopback(), sender, SharedLabel::default()).unwrap();

        let socket = UdpSocket::bind(loopback()).unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        socket.send_to(b"JUMP", server.local_addr()).unwrap();

        let mut buf = [0u8; 128];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        assert!(std::str::from_utf8(&buf[..len]).unwrap().starts_with("ERR"));
    }

    #[test]
    fn test_closed_loop_reports_error() {
        let (sender, commands) = command_channel();
        drop(commands);
        let server = ControlServer::spawn(loopback(), sender, SharedLabel::default()).unwrap();

        let result = send_request(
            server.local_addr(),
            &ControlRequest::Command(Command::Exit),
            Duration::from_secs(2),
        );
        assert!(matches!(result, Err(ControlError::Rejected(_))));
    }
}
