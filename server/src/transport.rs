//! Non-blocking transport seams.
//!
//! Connection handling never awaits: it only issues `try_*` calls and
//! treats `WouldBlock` as "come back later". The traits below are that
//! minimal surface, implemented for tokio sockets in production and by the
//! in-memory doubles in [`memory`] for tests.

use log::debug;
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};

pub trait StreamTransport: Send {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

pub trait DatagramTransport: Send + Sync {
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
}

/// TCP stream shared with the readiness watcher task.
pub struct TcpTransport {
    stream: Arc<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: Arc<TcpStream>) -> Self {
        Self { stream }
    }
}

impl StreamTransport for TcpTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }
}

impl DatagramTransport for UdpSocket {
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::try_send_to(self, buf, target)
    }
}

/// Drops a fraction of outbound datagrams to simulate a poor link.
pub struct LossyDatagrams {
    inner: Arc<dyn DatagramTransport>,
    drop_rate: f64,
}

impl LossyDatagrams {
    pub fn new(inner: Arc<dyn DatagramTransport>, drop_rate: f64) -> Self {
        Self {
            inner,
            drop_rate: drop_rate.clamp(0.0, 1.0),
        }
    }
}

impl DatagramTransport for LossyDatagrams {
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if rand::thread_rng().gen_bool(self.drop_rate) {
            debug!("Test link dropped {} byte datagram to {}", buf.len(), target);
            return Ok(buf.len());
        }
        self.inner.try_send_to(buf, target)
    }
}

/// In-memory transports with scripted behaviour.
pub mod memory {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Mutex, MutexGuard};

    #[derive(Debug, Default)]
    struct StreamState {
        incoming: VecDeque<u8>,
        peer_closed: bool,
        read_error: Option<io::ErrorKind>,
        written: Vec<u8>,
        write_budget: Option<usize>,
        write_error: Option<io::ErrorKind>,
        write_calls: usize,
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stream half handed to the connection under test.
    pub struct MemoryStream {
        state: Arc<Mutex<StreamState>>,
    }

    /// Test-side handle onto the same stream.
    #[derive(Clone)]
    pub struct MemoryStreamHandle {
        state: Arc<Mutex<StreamState>>,
    }

    impl MemoryStream {
        pub fn pair() -> (MemoryStream, MemoryStreamHandle) {
            let state = Arc::new(Mutex::new(StreamState::default()));
            (
                MemoryStream {
                    state: Arc::clone(&state),
                },
                MemoryStreamHandle { state },
            )
        }
    }

    impl StreamTransport for MemoryStream {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = lock(&self.state);
            if let Some(kind) = state.read_error {
                return Err(kind.into());
            }
            if state.incoming.is_empty() {
                if state.peer_closed {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(state.incoming.len());
            for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut state = lock(&self.state);
            state.write_calls += 1;
            if let Some(kind) = state.write_error {
                return Err(kind.into());
            }
            let n = match state.write_budget {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(budget) => budget.min(buf.len()),
                None => buf.len(),
            };
            if let Some(budget) = state.write_budget.as_mut() {
                *budget -= n;
            }
            state.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    impl MemoryStreamHandle {
        pub fn push_incoming(&self, bytes: &[u8]) {
            lock(&self.state).incoming.extend(bytes);
        }

        /// Subsequent reads return zero once the incoming bytes run out.
        pub fn close_incoming(&self) {
            lock(&self.state).peer_closed = true;
        }

        pub fn fail_reads(&self, kind: io::ErrorKind) {
            lock(&self.state).read_error = Some(kind);
        }

        /// Bytes accepted by the stream so far.
        pub fn written(&self) -> Vec<u8> {
            lock(&self.state).written.clone()
        }

        pub fn take_written(&self) -> Vec<u8> {
            std::mem::take(&mut lock(&self.state).written)
        }

        /// Limits how many more bytes writes accept before blocking.
        /// `None` removes the limit.
        pub fn set_write_budget(&self, budget: Option<usize>) {
            lock(&self.state).write_budget = budget;
        }

        pub fn fail_writes(&self, kind: Option<io::ErrorKind>) {
            lock(&self.state).write_error = kind;
        }

        pub fn write_calls(&self) -> usize {
            lock(&self.state).write_calls
        }
    }

    /// Records every datagram instead of sending it.
    #[derive(Default)]
    pub struct MemoryDatagrams {
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl MemoryDatagrams {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
            lock(&self.sent).clone()
        }

        pub fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
            std::mem::take(&mut *lock(&self.sent))
        }
    }

    impl DatagramTransport for MemoryDatagrams {
        fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            lock(&self.sent).push((target, buf.to_vec()));
            Ok(buf.len())
        }
    }
}
