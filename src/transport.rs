//! Named inter-process transport the IPC bridge blocks ride on.
//!
//! Both ends of a bridge open the same endpoint name, of the form
//! `nvscistream_<N>` with `N = sensor * 2 * NUM_CONSUMERS + 2 * consumer + {0
//! src, 1 dst}`. A message is a small JSON header plus an opaque binary
//! payload part.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::config::NUM_CONSUMERS;
use crate::error::{Result, StreamError};

/// Endpoint name for one side of a producer/consumer bridge.
pub fn endpoint_name(sensor: u32, consumer: u32, is_src: bool) -> String {
    let n = sensor as usize * 2 * NUM_CONSUMERS + 2 * consumer as usize + usize::from(!is_src);
    format!("nvscistream_{n}")
}

/// The `_2k`/`_2k+1` endpoints are the two ends of one channel; transports
/// rendezvous on the channel id.
fn pair_key(name: &str) -> String {
    match name
        .rsplit('_')
        .next()
        .and_then(|n| n.parse::<usize>().ok())
    {
        Some(n) => format!("nvscistream_pair_{}", n / 2),
        None => name.to_string(),
    }
}

/// One side of a connected message pipe.
pub trait IpcEndpoint: Send + Sync {
    fn send(&self, header: &[u8], payload: &[u8]) -> Result<()>;
    fn recv(&self, timeout: Duration) -> Result<(Vec<u8>, Vec<u8>)>;
}

/// Opens endpoints by name; the master owns one per process.
pub trait IpcTransport: Send + Sync {
    fn open(&self, name: &str, is_src: bool) -> Result<Box<dyn IpcEndpoint>>;
}

// ---- in-memory pair (tests, single-process IPC simulation) ----------------

type Frame = (Vec<u8>, Vec<u8>);

pub struct MemoryEndpoint {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

impl MemoryEndpoint {
    pub fn pair() -> (MemoryEndpoint, MemoryEndpoint) {
        let (atx, arx) = unbounded();
        let (btx, brx) = unbounded();
        (
            MemoryEndpoint { tx: atx, rx: brx },
            MemoryEndpoint { tx: btx, rx: arx },
        )
    }
}

impl IpcEndpoint for MemoryEndpoint {
    fn send(&self, header: &[u8], payload: &[u8]) -> Result<()> {
        self.tx
            .send((header.to_vec(), payload.to_vec()))
            .map_err(|_| StreamError::Disconnected)
    }

    fn recv(&self, timeout: Duration) -> Result<(Vec<u8>, Vec<u8>)> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(StreamError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(StreamError::Disconnected),
        }
    }
}

/// In-process transport: the first open of a name creates the pipe, the
/// second one picks up the peer end. Clones share one namespace.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    pending: Arc<Mutex<HashMap<String, MemoryEndpoint>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IpcTransport for MemoryTransport {
    fn open(&self, name: &str, _is_src: bool) -> Result<Box<dyn IpcEndpoint>> {
        let key = pair_key(name);
        let mut pending = self.pending.lock().unwrap();
        if let Some(peer) = pending.remove(&key) {
            return Ok(Box::new(peer));
        }
        let (ours, theirs) = MemoryEndpoint::pair();
        pending.insert(key, theirs);
        Ok(Box::new(ours))
    }
}

// ---- ZeroMQ pair over ipc:// ----------------------------------------------

#[cfg(feature = "ipc-zmq")]
mod zmq_transport {
    use super::*;

    pub struct ZmqEndpoint {
        socket: Mutex<zmq::Socket>,
    }

    impl IpcEndpoint for ZmqEndpoint {
        fn send(&self, header: &[u8], payload: &[u8]) -> Result<()> {
            let socket = self.socket.lock().unwrap();
            socket
                .send_multipart([header, payload], 0)
                .map_err(|e| StreamError::Transport(e.to_string()))
        }

        fn recv(&self, timeout: Duration) -> Result<(Vec<u8>, Vec<u8>)> {
            let socket = self.socket.lock().unwrap();
            socket
                .set_rcvtimeo(timeout.as_millis() as i32)
                .map_err(|e| StreamError::Transport(e.to_string()))?;
            match socket.recv_multipart(0) {
                Ok(mut parts) if parts.len() == 2 => {
                    let payload = parts.pop().unwrap_or_default();
                    let header = parts.pop().unwrap_or_default();
                    Ok((header, payload))
                }
                Ok(parts) => Err(StreamError::Transport(format!(
                    "expected 2 message parts, got {}",
                    parts.len()
                ))),
                Err(zmq::Error::EAGAIN) => Err(StreamError::Timeout),
                Err(e) => Err(StreamError::Transport(e.to_string())),
            }
        }
    }

    /// PAIR sockets over `ipc://` paths under a shared runtime directory.
    /// The src side binds, the dst side connects.
    pub struct ZmqTransport {
        context: zmq::Context,
        runtime_dir: String,
    }

    impl ZmqTransport {
        pub fn new(runtime_dir: impl Into<String>) -> Self {
            ZmqTransport {
                context: zmq::Context::new(),
                runtime_dir: runtime_dir.into(),
            }
        }
    }

    impl IpcTransport for ZmqTransport {
        fn open(&self, name: &str, is_src: bool) -> Result<Box<dyn IpcEndpoint>> {
            let socket = self
                .context
                .socket(zmq::PAIR)
                .map_err(|e| StreamError::Transport(e.to_string()))?;
            let addr = format!("ipc://{}/{}", self.runtime_dir, super::pair_key(name));
            if is_src {
                socket
                    .bind(&addr)
                    .map_err(|e| StreamError::Transport(format!("bind {addr}: {e}")))?;
            } else {
                socket
                    .connect(&addr)
                    .map_err(|e| StreamError::Transport(format!("connect {addr}: {e}")))?;
            }
            Ok(Box::new(ZmqEndpoint {
                socket: Mutex::new(socket),
            }))
        }
    }
}

#[cfg(feature = "ipc-zmq")]
pub use zmq_transport::ZmqTransport;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_names_follow_the_pairing_scheme() {
        assert_eq!(endpoint_name(0, 0, true), "nvscistream_0");
        assert_eq!(endpoint_name(0, 0, false), "nvscistream_1");
        assert_eq!(endpoint_name(1, 2, true), format!("nvscistream_{}", 2 * NUM_CONSUMERS + 4));
    }

    #[test]
    fn memory_pair_delivers_in_order() {
        let (a, b) = MemoryEndpoint::pair();
        a.send(b"h1", b"p1").unwrap();
        a.send(b"h2", b"p2").unwrap();
        assert_eq!(b.recv(Duration::from_secs(1)).unwrap().0, b"h1");
        assert_eq!(b.recv(Duration::from_secs(1)).unwrap().1, b"p2");
    }

    #[test]
    fn memory_transport_pairs_the_two_channel_ends() {
        let transport = MemoryTransport::new();
        let src = transport.open(&endpoint_name(0, 0, true), true).unwrap();
        let dst = transport.open(&endpoint_name(0, 0, false), false).unwrap();
        src.send(b"hello", b"").unwrap();
        assert_eq!(dst.recv(Duration::from_secs(1)).unwrap().0, b"hello");

        // A different consumer id is a different channel.
        let other = transport.open(&endpoint_name(0, 1, false), false).unwrap();
        assert_eq!(
            other.recv(Duration::from_millis(10)),
            Err(StreamError::Timeout)
        );
    }

    #[test]
    fn dropped_peer_reports_disconnect() {
        let (a, b) = MemoryEndpoint::pair();
        drop(a);
        assert_eq!(
            b.recv(Duration::from_millis(10)),
            Err(StreamError::Disconnected)
        );
    }
}
