//! Channel topologies and the per-block event loop host.
//!
//! A channel owns the blocks of one stream and drives the common lifecycle:
//! `create_blocks -> connect -> init_blocks -> reconcile -> start -> stop`.
//! Reconcile spawns one worker thread per active block and joins them once
//! every block reports setup completion; start spawns the runtime workers.

mod ipc_consumer;
mod ipc_producer;
mod single;

pub use ipc_consumer::IpcConsumerChannel;
pub use ipc_producer::IpcProducerChannel;
pub use single::SingleProcessChannel;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::config::{MAX_QUERY_TIMEOUTS, QUERY_TIMEOUT};
use crate::error::{Result, StreamError};
use crate::fabric::{BlockHandle, StreamEvent};
use crate::source::CapturedFrame;

/// Outcome of dispatching one event to a block's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Ok,
    Complete,
    TimedOut,
    Error,
}

/// A block's event handler, driven by the per-block worker thread.
pub trait EventHandler: Send {
    fn name(&self) -> &str;
    fn block(&self) -> BlockHandle;
    fn handle_event(&mut self, event: StreamEvent) -> EventStatus;
}

pub type SharedHandler = Arc<Mutex<dyn EventHandler>>;

pub(crate) fn to_handler<H: EventHandler + 'static>(handler: Arc<Mutex<H>>) -> SharedHandler {
    handler
}

/// Which concrete consumer runs in a consumer-resident process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerType {
    Cuda,
    Enc,
}

/// The per-thread loop for one block: query with a bounded timeout,
/// dispatch, honor stop and completion.
fn event_thread(running: Arc<AtomicBool>, handler: SharedHandler) {
    let (name, block) = {
        let h = handler.lock().unwrap();
        (h.name().to_string(), h.block())
    };
    let mut timeouts: u32 = 0;
    while running.load(Ordering::Acquire) {
        match block.event_query(QUERY_TIMEOUT) {
            Err(StreamError::Timeout) => {
                // Keep waiting until the threshold, then complain and keep
                // waiting anyway; setup can legitimately take long.
                if timeouts < MAX_QUERY_TIMEOUTS {
                    timeouts += 1;
                    continue;
                }
                warn!(block = %name, "event handling seems to be taking forever");
            }
            Err(_) => {
                running.store(false, Ordering::Release);
                break;
            }
            Ok(event) => {
                let status = handler.lock().unwrap().handle_event(event);
                match status {
                    EventStatus::Ok | EventStatus::TimedOut => {
                        timeouts = 0;
                    }
                    EventStatus::Complete => break,
                    EventStatus::Error => {
                        running.store(false, Ordering::Release);
                        break;
                    }
                }
            }
        }
    }
    debug!(block = %name, "event thread exited");
}

/// Thread bookkeeping shared by every channel shape.
pub(crate) struct ChannelRunner {
    name: String,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ChannelRunner {
    pub fn new(name: impl Into<String>) -> ChannelRunner {
        ChannelRunner {
            name: name.into(),
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn spawn(&self, handlers: &[SharedHandler]) {
        let mut threads = self.threads.lock().unwrap();
        for handler in handlers {
            let name = handler.lock().unwrap().name().to_string();
            let running = Arc::clone(&self.running);
            let handler = Arc::clone(handler);
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || event_thread(running, handler))
            {
                Ok(t) => threads.push(t),
                Err(e) => error!(block = %name, error = %e, "failed to spawn event thread"),
            }
        }
    }

    fn join_all(&self) {
        let mut threads = self.threads.lock().unwrap();
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }

    /// Run the setup workers to completion; every block must reach the
    /// runtime-ready state.
    pub fn reconcile(&self, handlers: &[SharedHandler]) -> Result<()> {
        info!(channel = %self.name, "reconcile");
        self.running.store(true, Ordering::Release);
        self.spawn(handlers);
        self.join_all();
        if !self.running() {
            error!(channel = %self.name, "stream setup failed");
            return Err(StreamError::Config("stream setup failed".into()));
        }
        info!(channel = %self.name, "stream setup succeeded");
        Ok(())
    }

    pub fn start(&self, handlers: &[SharedHandler]) {
        debug!(channel = %self.name, "start");
        self.running.store(true, Ordering::Release);
        self.spawn(handlers);
    }

    pub fn stop(&self) {
        debug!(channel = %self.name, "stop");
        self.running.store(false, Ordering::Release);
        self.join_all();
        debug!(channel = %self.name, "all event threads exited");
    }
}

/// Block until a block observes its `Connected` event. Any other event
/// first, or a stream error, aborts channel setup.
pub(crate) fn wait_connected(block: &BlockHandle, what: &str) -> Result<()> {
    loop {
        match block.event_query(QUERY_TIMEOUT) {
            Ok(StreamEvent::Connected) => {
                debug!(block = what, "connected");
                return Ok(());
            }
            Ok(StreamEvent::Disconnected) => return Err(StreamError::Disconnected),
            Ok(other) => {
                error!(block = what, event = ?other, "unexpected event while connecting");
                return Err(StreamError::Protocol(format!(
                    "{what}: expected connect, got {other:?}"
                )));
            }
            Err(StreamError::Timeout) => {
                debug!(block = what, "still waiting for connection");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One stream topology: a set of blocks owned and driven together.
pub trait Channel: Send {
    fn name(&self) -> &str;
    fn create_blocks(&mut self) -> Result<()>;
    fn connect(&mut self) -> Result<()>;
    fn init_blocks(&mut self) -> Result<()>;
    fn reconcile(&mut self) -> Result<()>;
    fn start(&mut self);
    fn stop(&mut self);
    /// Whether the runtime phase is still healthy.
    fn running(&self) -> bool;
    /// Route a captured frame into this channel's producer.
    fn post(&self, _frame: CapturedFrame) -> Result<()> {
        Err(StreamError::Protocol(
            "channel has no resident producer".into(),
        ))
    }
}
