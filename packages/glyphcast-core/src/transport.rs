//! Client transport write side.
//!
//! Reads stay on the socket owned by the receive worker; every write goes
//! through [`TransportSlot`], which owns the per-client send mutex and the
//! optional transport override. Once an override is installed it supersedes
//! the socket for all subsequent sends.

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Alternative write transport (e.g. a datagram channel installed by an
/// embedding that handles its own NAT traversal). The hub is indifferent to
/// what is behind it.
pub trait ClientTransport: Send + Sync {
    fn send(&self, packet: &[u8]) -> std::io::Result<()>;

    /// Half-closes the transport; subsequent sends may fail.
    fn shutdown(&self);
}

/// The write side of one client's connection.
pub struct TransportSlot {
    /// The per-client send mutex. Held across every write so wire packets
    /// never interleave, including the bad-data path's final writes.
    send_lock: Mutex<()>,
    socket: RwLock<Option<TcpStream>>,
    override_transport: RwLock<Option<Arc<dyn ClientTransport>>>,
}

impl TransportSlot {
    /// A slot writing to `socket` (the write-half clone of the accepted
    /// stream).
    pub fn from_socket(socket: TcpStream) -> Self {
        Self {
            send_lock: Mutex::new(()),
            socket: RwLock::new(Some(socket)),
            override_transport: RwLock::new(None),
        }
    }

    /// A slot with no transport (memory participants).
    pub fn detached() -> Self {
        Self {
            send_lock: Mutex::new(()),
            socket: RwLock::new(None),
            override_transport: RwLock::new(None),
        }
    }

    /// Whether a send can reach a peer at all.
    pub fn is_connected(&self) -> bool {
        self.override_transport.read().is_some() || self.socket.read().is_some()
    }

    /// Installs an override transport; supersedes the socket from now on.
    pub fn set_override(&self, transport: Arc<dyn ClientTransport>) {
        let _guard = self.send_lock.lock();
        *self.override_transport.write() = Some(transport);
    }

    /// Writes one whole wire packet atomically with respect to other writers.
    pub fn send_packet(&self, packet: &[u8]) -> std::io::Result<()> {
        let _guard = self.send_lock.lock();
        if let Some(transport) = self.override_transport.read().as_ref() {
            return transport.send(packet);
        }
        let socket = self.socket.read();
        match socket.as_ref() {
            Some(mut stream) => {
                stream.write_all(packet)?;
                stream.flush()
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "client has no transport",
            )),
        }
    }

    /// Half-closes the write direction. Idempotent; errors are ignored
    /// (the peer may already be gone).
    pub fn half_close(&self) {
        let _guard = self.send_lock.lock();
        if let Some(transport) = self.override_transport.read().as_ref() {
            transport.shutdown();
        }
        if let Some(stream) = self.socket.read().as_ref() {
            let _ = stream.shutdown(Shutdown::Write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    /// Capture transport for tests: records every packet it is given.
    pub struct CaptureTransport {
        pub sent: PlMutex<Vec<Vec<u8>>>,
    }

    impl CaptureTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: PlMutex::new(Vec::new()),
            })
        }
    }

    impl ClientTransport for CaptureTransport {
        fn send(&self, packet: &[u8]) -> std::io::Result<()> {
            self.sent.lock().push(packet.to_vec());
            Ok(())
        }

        fn shutdown(&self) {}
    }

    #[test]
    fn detached_slot_rejects_sends() {
        let slot = TransportSlot::detached();
        assert!(!slot.is_connected());
        assert!(slot.send_packet(b"x").is_err());
    }

    #[test]
    fn override_supersedes_socket() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let _accepted = listener.accept().unwrap();

        let slot = TransportSlot::from_socket(client);
        let capture = CaptureTransport::new();
        slot.set_override(capture.clone());

        slot.send_packet(b"routed").unwrap();
        assert_eq!(capture.sent.lock().as_slice(), &[b"routed".to_vec()]);
    }

    #[test]
    fn socket_writes_reach_the_peer() {
        use std::io::Read;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut accepted, _) = listener.accept().unwrap();

        let slot = TransportSlot::from_socket(client);
        slot.send_packet(b"over the wire").unwrap();
        slot.half_close();

        let mut received = Vec::new();
        accepted.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"over the wire");
    }
}
