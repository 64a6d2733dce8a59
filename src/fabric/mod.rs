//! The streaming fabric: blocks, event routing and the packet ownership
//! ledger.
//!
//! A [`StreamHub`] hosts one stream. Blocks (producer, pool, multicast,
//! queues, consumers, IPC bridges) are created through factory methods and
//! wired with [`BlockHandle::connect`]. After that, all cross-block
//! communication happens through the event model: a block observes events on
//! its own handle and pulls the associated state through getter calls. The
//! hub serializes packet ownership: a packet is with the pool, with the
//! producer, or streaming through the consumer branches, and fences attached
//! to it order the actual buffer access.

pub mod event;
pub mod ipc;
mod queue;

pub use event::{SetupStep, StreamEvent};
pub use queue::QueueKind;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::buffer::{BufAttrs, BufObj};
use crate::error::{Result, StreamError};
use crate::sync::{Fence, SyncAttrs, SyncObj, SyncPerm};

use event::SetupSteps;
use queue::BranchQueue;

pub type BlockId = usize;

/// Fabric-assigned packet identity, opaque to endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHandle(pub(crate) u64);

/// Which side of the stream a pool query refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    Producer,
    Pool,
    Multicast { outputs: usize },
    Queue(QueueKind),
    Consumer,
    IpcSrc,
    IpcDst,
}

struct BlockEntry {
    role: BlockRole,
    tx: Sender<StreamEvent>,
    /// Consumer blocks remember the queue attached at creation.
    queue: Option<BlockId>,
}

enum UpstreamKind {
    Producer {
        block: BlockId,
    },
    /// Consumer-side bridge standing in for the remote producer.
    IpcDst {
        block: BlockId,
        out: Sender<ipc::DstOut>,
    },
}

struct UpstreamState {
    kind: UpstreamKind,
    steps: SetupSteps,
    elements: Vec<(u32, BufAttrs)>,
    waiter_attrs: Option<SyncAttrs>,
    signal: Option<Option<SyncObj>>,
    creation_pending: VecDeque<PacketHandle>,
    ready: VecDeque<PacketHandle>,
}

enum ConsumerKind {
    Local {
        consumer: BlockId,
        #[allow(dead_code)]
        queue: BlockId,
    },
    /// Producer-side bridge standing in for a remote consumer subtree.
    IpcSrc {
        block: BlockId,
        out: Sender<ipc::SrcOut>,
    },
}

struct ConsumerState {
    kind: ConsumerKind,
    steps: SetupSteps,
    elements: Vec<(u32, BufAttrs)>,
    waiter_attrs: Option<SyncAttrs>,
    signal: Option<Option<SyncObj>>,
    creation_pending: VecDeque<PacketHandle>,
    queue: BranchQueue,
    /// A dead branch (crashed peer process) no longer participates in
    /// delivery; packets it already held stay unreturned.
    dead: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    /// Created, not yet handed out (setup phase).
    Pool,
    /// Queued for `producer_packet_get`.
    ProducerReady,
    /// Owned by the producer endpoint.
    Producer,
    /// Presented; one or more consumer branches still hold it.
    Streaming,
    /// Consumer side: owned by the remote producer.
    Upstream,
}

struct PacketEntry {
    handle: PacketHandle,
    bufs: Vec<BufObj>,
    completed: bool,
    prod_status: Option<std::result::Result<u64, String>>,
    cons_status: Vec<Option<std::result::Result<u64, String>>>,
    status_fired: bool,
    location: Location,
    outstanding: HashSet<usize>,
    prod_fences: Vec<Option<Fence>>,
    cons_fences: Vec<Option<Fence>>,
}

impl PacketEntry {
    fn new(handle: PacketHandle, num_consumers: usize, location: Location) -> Self {
        PacketEntry {
            handle,
            bufs: Vec::new(),
            completed: false,
            prod_status: None,
            cons_status: vec![None; num_consumers],
            status_fired: false,
            location,
            outstanding: HashSet::new(),
            prod_fences: Vec::new(),
            cons_fences: vec![None; num_consumers],
        }
    }
}

struct PoolState {
    block: BlockId,
    steps: SetupSteps,
}

struct HubState {
    blocks: Vec<BlockEntry>,
    edges: Vec<(BlockId, BlockId)>,
    pool: Option<PoolState>,
    upstream: Option<UpstreamState>,
    consumers: Vec<ConsumerState>,
    branch_of: HashMap<BlockId, usize>,
    ipc_src_out: HashMap<BlockId, Sender<ipc::SrcOut>>,
    ipc_pending: HashSet<BlockId>,
    reconciled: Vec<(u32, BufAttrs)>,
    reconciled_done: bool,
    connected_fired: bool,
    elements_event_fired: bool,
    waiter_to_upstream_fired: bool,
    signal_to_upstream_fired: bool,
    setup_complete: bool,
    setup_done_sent: bool,
    packets: Vec<PacketEntry>,
    next_packet_id: u64,
    error: Option<String>,
    shut_down: bool,
}

impl HubState {
    fn entry(&mut self, handle: PacketHandle) -> Result<&mut PacketEntry> {
        self.packets
            .iter_mut()
            .find(|p| p.handle == handle)
            .ok_or(StreamError::Protocol(format!(
                "unknown packet handle {:#x}",
                handle.0
            )))
    }

    fn send_event(&self, block: BlockId, ev: StreamEvent) {
        let _ = self.blocks[block].tx.send(ev);
    }

    fn broadcast(&self, ev: StreamEvent) {
        for b in &self.blocks {
            let _ = b.tx.send(ev);
        }
    }

    fn out_degree(&self, id: BlockId) -> usize {
        self.edges.iter().filter(|(a, _)| *a == id).count()
    }
}

/// One stream's fabric state. Create blocks through the factory methods,
/// then drive everything through [`BlockHandle`]s.
pub struct StreamHub {
    name: String,
    weak_self: Weak<StreamHub>,
    state: Mutex<HubState>,
}

impl StreamHub {
    pub fn new(name: impl Into<String>) -> Arc<StreamHub> {
        let name = name.into();
        Arc::new_cyclic(|weak| StreamHub {
            name,
            weak_self: weak.clone(),
            state: Mutex::new(HubState {
                blocks: Vec::new(),
                edges: Vec::new(),
                pool: None,
                upstream: None,
                consumers: Vec::new(),
                branch_of: HashMap::new(),
                ipc_src_out: HashMap::new(),
                ipc_pending: HashSet::new(),
                reconciled: Vec::new(),
                reconciled_done: false,
                connected_fired: false,
                elements_event_fired: false,
                waiter_to_upstream_fired: false,
                signal_to_upstream_fired: false,
                setup_complete: false,
                setup_done_sent: false,
                packets: Vec::new(),
                next_packet_id: 1,
                error: None,
                shut_down: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add_block(&self, role: BlockRole, queue: Option<BlockId>) -> (BlockId, BlockHandle) {
        let hub = self
            .weak_self
            .upgrade()
            .expect("stream hub already torn down");
        let (tx, rx) = unbounded();
        let mut st = self.lock();
        let id = st.blocks.len();
        st.blocks.push(BlockEntry { role, tx, queue });
        drop(st);
        (
            id,
            BlockHandle {
                hub,
                id,
                events: rx,
            },
        )
    }

    /// Create the static packet pool block.
    pub fn create_static_pool(&self, _num_packets: usize) -> BlockHandle {
        let (id, handle) = self.add_block(BlockRole::Pool, None);
        let mut st = self.lock();
        st.pool = Some(PoolState {
            block: id,
            steps: SetupSteps::default(),
        });
        handle
    }

    /// Create the producer block, bound to its pool.
    pub fn create_producer(&self, pool: &BlockHandle) -> Result<BlockHandle> {
        if !matches!(pool.role(), BlockRole::Pool) {
            return Err(StreamError::Config("producer requires a pool block".into()));
        }
        let (id, handle) = self.add_block(BlockRole::Producer, None);
        let mut st = self.lock();
        st.upstream = Some(UpstreamState {
            kind: UpstreamKind::Producer { block: id },
            steps: SetupSteps::default(),
            elements: Vec::new(),
            waiter_attrs: None,
            signal: None,
            creation_pending: VecDeque::new(),
            ready: VecDeque::new(),
        });
        Ok(handle)
    }

    pub fn create_mailbox_queue(&self) -> BlockHandle {
        self.add_block(BlockRole::Queue(QueueKind::Mailbox), None).1
    }

    pub fn create_fifo_queue(&self) -> BlockHandle {
        self.add_block(BlockRole::Queue(QueueKind::Fifo), None).1
    }

    /// Create a consumer block, bound to its delivery queue.
    pub fn create_consumer(&self, queue: &BlockHandle) -> Result<BlockHandle> {
        if !matches!(queue.role(), BlockRole::Queue(_)) {
            return Err(StreamError::Config("consumer requires a queue block".into()));
        }
        let (_, handle) = self.add_block(BlockRole::Consumer, Some(queue.id));
        Ok(handle)
    }

    /// Create a multicast block fanning out to `outputs` consumer subtrees.
    pub fn create_multicast(&self, outputs: usize) -> BlockHandle {
        self.add_block(BlockRole::Multicast { outputs }, None).1
    }

    /// Abort the stream with an error observed by every block.
    pub fn post_error(&self, code: impl Into<String>) {
        let mut st = self.lock();
        let code = code.into();
        if st.error.is_none() {
            warn!(stream = %self.name, error = %code, "stream error");
            st.error = Some(code);
            st.broadcast(StreamEvent::Error);
        }
    }

    /// Tear the stream down; remote peers observe a disconnect.
    pub fn shutdown(&self) {
        let mut st = self.lock();
        if st.shut_down {
            return;
        }
        st.shut_down = true;
        for out in st.ipc_src_out.values() {
            let _ = out.send(ipc::SrcOut::Disconnect);
        }
        if let Some(up) = &st.upstream {
            if let UpstreamKind::IpcDst { out, .. } = &up.kind {
                let _ = out.send(ipc::DstOut::Disconnect);
            }
        }
    }

    pub(crate) fn post_disconnected(&self) {
        let st = self.lock();
        st.broadcast(StreamEvent::Disconnected);
    }

    // ---- connectivity ----------------------------------------------------

    fn connect_blocks(&self, from: BlockId, to: BlockId) -> Result<()> {
        let mut st = self.lock();
        let from_role = st.blocks[from].role;
        let to_role = st.blocks[to].role;
        let ok = matches!(
            (from_role, to_role),
            (BlockRole::Producer, BlockRole::Consumer)
                | (BlockRole::Producer, BlockRole::Multicast { .. })
                | (BlockRole::Producer, BlockRole::IpcSrc)
                | (BlockRole::Multicast { .. }, BlockRole::Consumer)
                | (BlockRole::Multicast { .. }, BlockRole::IpcSrc)
                | (BlockRole::IpcDst, BlockRole::Consumer)
        );
        if !ok {
            return Err(StreamError::Config(format!(
                "cannot connect {from_role:?} to {to_role:?}"
            )));
        }
        st.edges.push((from, to));
        self.try_fire_connected(&mut st);
        Ok(())
    }

    pub(crate) fn ipc_handshaken(&self, block: BlockId) {
        let mut st = self.lock();
        st.ipc_pending.remove(&block);
        self.try_fire_connected(&mut st);
    }

    fn try_fire_connected(&self, st: &mut HubState) {
        if st.connected_fired || st.upstream.is_none() {
            return;
        }
        if !st.ipc_pending.is_empty() {
            return;
        }
        for id in 0..st.blocks.len() {
            let need = match st.blocks[id].role {
                BlockRole::Producer => 1,
                BlockRole::Multicast { outputs } => outputs,
                BlockRole::IpcDst => 1,
                _ => 0,
            };
            if st.out_degree(id) < need {
                return;
            }
        }

        // Walk the graph from the upstream endpoint to fix branch order.
        let start = match &st.upstream.as_ref().unwrap().kind {
            UpstreamKind::Producer { block } => *block,
            UpstreamKind::IpcDst { block, .. } => *block,
        };
        let mut terminals: Vec<BlockId> = Vec::new();
        let first_hop: Vec<BlockId> = st
            .edges
            .iter()
            .filter(|(a, _)| *a == start)
            .map(|(_, b)| *b)
            .collect();
        for hop in first_hop {
            match st.blocks[hop].role {
                BlockRole::Multicast { .. } => {
                    terminals.extend(
                        st.edges
                            .iter()
                            .filter(|(a, _)| *a == hop)
                            .map(|(_, b)| *b),
                    );
                }
                _ => terminals.push(hop),
            }
        }

        let mut consumers = Vec::new();
        let mut branch_of = HashMap::new();
        for t in terminals {
            match st.blocks[t].role {
                BlockRole::Consumer => {
                    let queue = match st.blocks[t].queue {
                        Some(q) => q,
                        None => {
                            warn!(stream = %self.name, "consumer block without a queue");
                            return;
                        }
                    };
                    let kind = match st.blocks[queue].role {
                        BlockRole::Queue(k) => k,
                        _ => QueueKind::Fifo,
                    };
                    branch_of.insert(t, consumers.len());
                    consumers.push(ConsumerState {
                        kind: ConsumerKind::Local { consumer: t, queue },
                        steps: SetupSteps::default(),
                        elements: Vec::new(),
                        waiter_attrs: None,
                        signal: None,
                        creation_pending: VecDeque::new(),
                        queue: BranchQueue::new(kind),
                        dead: false,
                    });
                }
                BlockRole::IpcSrc => {
                    let out = st.ipc_src_out[&t].clone();
                    // A remote subtree never imports signal objects from this
                    // side and always exports a null one: fences terminate at
                    // the bridge.
                    let mut steps = SetupSteps::default();
                    steps.set(SetupStep::WaiterAttrImport, true);
                    steps.set(SetupStep::SignalObjExport, true);
                    steps.set(SetupStep::SignalObjImport, true);
                    branch_of.insert(t, consumers.len());
                    consumers.push(ConsumerState {
                        kind: ConsumerKind::IpcSrc { block: t, out },
                        steps,
                        elements: Vec::new(),
                        waiter_attrs: None,
                        signal: Some(None),
                        creation_pending: VecDeque::new(),
                        queue: BranchQueue::new(QueueKind::Fifo),
                        dead: false,
                    });
                }
                other => {
                    warn!(stream = %self.name, role = ?other, "dangling block in stream graph");
                    return;
                }
            }
        }
        if consumers.is_empty() {
            return;
        }
        st.consumers = consumers;
        st.branch_of = branch_of;
        st.connected_fired = true;
        debug!(stream = %self.name, consumers = st.consumers.len(), "stream connected");
        st.broadcast(StreamEvent::Connected);
    }

    // ---- element phase ---------------------------------------------------

    fn maybe_fire_elements_to_pool(&self, st: &mut HubState) {
        if st.elements_event_fired {
            return;
        }
        let up_done = st.upstream.as_ref().is_some_and(|u| u.steps.element_export);
        let cons_done =
            !st.consumers.is_empty() && st.consumers.iter().all(|c| c.steps.element_export);
        let pool_block = st.pool.as_ref().map(|p| p.block);
        match pool_block {
            Some(block) if up_done && cons_done => {
                st.elements_event_fired = true;
                st.send_event(block, StreamEvent::Elements);
            }
            None if cons_done => {
                // Consumer side: forward the consumer's exports upstream.
                let out = match st.upstream.as_ref() {
                    Some(UpstreamState {
                        kind: UpstreamKind::IpcDst { out, .. },
                        ..
                    }) => Some(out.clone()),
                    _ => None,
                };
                if let Some(out) = out {
                    st.elements_event_fired = true;
                    let elems = st.consumers[0].elements.clone();
                    let _ = out.send(ipc::DstOut::ConsElements { elems });
                }
            }
            _ => {}
        }
    }

    fn fire_reconciled_downstream(&self, st: &mut HubState) {
        // Elements flow to the producer endpoint and to every branch.
        if let Some(block) = Self::upstream_producer_block(st) {
            st.send_event(block, StreamEvent::Elements);
        }
        let reconciled = st.reconciled.clone();
        for ci in 0..st.consumers.len() {
            match &st.consumers[ci].kind {
                ConsumerKind::Local { consumer, .. } => {
                    let consumer = *consumer;
                    st.send_event(consumer, StreamEvent::Elements);
                }
                ConsumerKind::IpcSrc { out, .. } => {
                    let _ = out.send(ipc::SrcOut::PoolElements {
                        elems: reconciled.clone(),
                    });
                    // The bridge waits on the CPU for remote completion
                    // fences; that is its whole waiter requirement.
                    let c = &mut st.consumers[ci];
                    let mut cpu = SyncAttrs::new();
                    cpu.set_need_cpu_access(true).set_perm(SyncPerm::WaitOnly);
                    c.waiter_attrs = Some(cpu);
                    c.steps.set(SetupStep::ElementImport, true);
                    c.steps.set(SetupStep::WaiterAttrExport, true);
                }
            }
        }
        self.maybe_fire_waiter_to_upstream(st);
    }

    fn upstream_producer_block(st: &HubState) -> Option<BlockId> {
        match st.upstream.as_ref() {
            Some(UpstreamState {
                kind: UpstreamKind::Producer { block },
                ..
            }) => Some(*block),
            _ => None,
        }
    }

    fn maybe_fire_waiter_to_upstream(&self, st: &mut HubState) {
        if st.waiter_to_upstream_fired {
            return;
        }
        if st.consumers.is_empty() || !st.consumers.iter().all(|c| c.waiter_attrs.is_some()) {
            return;
        }
        if let Some(block) = Self::upstream_producer_block(st) {
            st.waiter_to_upstream_fired = true;
            st.send_event(block, StreamEvent::WaiterAttr);
        }
    }

    fn fire_upstream_sync_to_consumers(&self, st: &mut HubState, ev: StreamEvent) {
        for c in &st.consumers {
            if let ConsumerKind::Local { consumer, .. } = c.kind {
                st.send_event(consumer, ev);
            }
        }
    }

    fn maybe_fire_signal_to_upstream(&self, st: &mut HubState) {
        if st.signal_to_upstream_fired {
            return;
        }
        if st.consumers.is_empty() || !st.consumers.iter().all(|c| c.signal.is_some()) {
            return;
        }
        if let Some(block) = Self::upstream_producer_block(st) {
            st.signal_to_upstream_fired = true;
            st.send_event(block, StreamEvent::SignalObj);
        }
    }

    // ---- setup barrier ---------------------------------------------------

    fn maybe_setup_complete(&self, st: &mut HubState) {
        if st.setup_complete {
            return;
        }
        let pool_done = st.pool.as_ref().map(|p| p.steps.pool_done());
        match pool_done {
            Some(pool_done) => {
                let up_done = st.upstream.as_ref().is_some_and(|u| u.steps.endpoint_done());
                let all_cons = st.consumers.iter().all(|c| c.steps.endpoint_done());
                if !(up_done && all_cons && pool_done) {
                    return;
                }
                st.setup_complete = true;
                debug!(stream = %self.name, "setup complete");
                st.broadcast(StreamEvent::SetupComplete);
                for c in &st.consumers {
                    if let ConsumerKind::IpcSrc { out, .. } = &c.kind {
                        let _ = out.send(ipc::SrcOut::SetupComplete);
                    }
                }
                // All packets start under producer ownership.
                let block = match Self::upstream_producer_block(st) {
                    Some(block) => block,
                    None => return,
                };
                let handles: Vec<PacketHandle> = st.packets.iter().map(|p| p.handle).collect();
                if let Some(up) = st.upstream.as_mut() {
                    for h in &handles {
                        up.ready.push_back(*h);
                    }
                }
                for p in st.packets.iter_mut() {
                    p.location = Location::ProducerReady;
                }
                for _ in &handles {
                    st.send_event(block, StreamEvent::PacketReady);
                }
            }
            None => {
                // Consumer side: report local completion; the producer side
                // broadcasts the final transition over the wire.
                if st.setup_done_sent || !st.consumers.iter().all(|c| c.steps.endpoint_done()) {
                    return;
                }
                let out = match st.upstream.as_ref() {
                    Some(UpstreamState {
                        kind: UpstreamKind::IpcDst { out, .. },
                        ..
                    }) => Some(out.clone()),
                    _ => None,
                };
                if let Some(out) = out {
                    st.setup_done_sent = true;
                    let _ = out.send(ipc::DstOut::SetupDone);
                }
            }
        }
    }

    // ---- packet routing --------------------------------------------------

    fn recycle_to_upstream(&self, st: &mut HubState, handle: PacketHandle) {
        enum Target {
            Producer(BlockId),
            Ipc(Sender<ipc::DstOut>),
        }
        let target = match st.upstream.as_ref() {
            None => return,
            Some(up) => match &up.kind {
                UpstreamKind::Producer { block } => Target::Producer(*block),
                UpstreamKind::IpcDst { out, .. } => Target::Ipc(out.clone()),
            },
        };
        match target {
            Target::Producer(block) => {
                if let Some(up) = st.upstream.as_mut() {
                    up.ready.push_back(handle);
                }
                if let Ok(entry) = st.entry(handle) {
                    entry.location = Location::ProducerReady;
                }
                st.send_event(block, StreamEvent::PacketReady);
            }
            Target::Ipc(out) => {
                let fence = st
                    .entry(handle)
                    .ok()
                    .and_then(|e| e.cons_fences.first().cloned().flatten());
                if let Ok(entry) = st.entry(handle) {
                    entry.location = Location::Upstream;
                }
                let _ = out.send(ipc::DstOut::Release { handle, fence });
            }
        }
    }

    fn release_branch(
        &self,
        st: &mut HubState,
        branch: usize,
        handle: PacketHandle,
        clear_fence: bool,
    ) -> Result<()> {
        let entry = st.entry(handle)?;
        if !entry.outstanding.remove(&branch) {
            return Err(StreamError::Protocol(format!(
                "branch {branch} released packet {:#x} it does not hold",
                handle.0
            )));
        }
        if clear_fence {
            entry.cons_fences[branch] = None;
        }
        if entry.outstanding.is_empty() {
            self.recycle_to_upstream(st, handle);
        }
        Ok(())
    }

    // ---- remote (bridge) entry points ------------------------------------

    pub(crate) fn remote_consumer_elements(
        &self,
        branch: usize,
        elems: Vec<(u32, BufAttrs)>,
    ) -> Result<()> {
        let mut st = self.lock();
        let c = st
            .consumers
            .get_mut(branch)
            .ok_or(StreamError::Protocol("unknown ipc branch".into()))?;
        c.elements = elems;
        c.steps.set(SetupStep::ElementExport, true);
        self.maybe_fire_elements_to_pool(&mut st);
        Ok(())
    }

    pub(crate) fn remote_packet_status(
        &self,
        branch: usize,
        handle: PacketHandle,
        status: std::result::Result<u64, String>,
    ) -> Result<()> {
        let mut st = self.lock();
        let entry = st.entry(handle)?;
        entry.cons_status[branch] = Some(status);
        self.maybe_fire_packet_status(&mut st, handle);
        Ok(())
    }

    pub(crate) fn remote_setup_done(&self, branch: usize) -> Result<()> {
        let mut st = self.lock();
        let c = st
            .consumers
            .get_mut(branch)
            .ok_or(StreamError::Protocol("unknown ipc branch".into()))?;
        c.steps.set(SetupStep::WaiterAttrImport, true);
        c.steps.set(SetupStep::SignalObjExport, true);
        c.steps.set(SetupStep::SignalObjImport, true);
        c.steps.set(SetupStep::PacketImport, true);
        self.maybe_setup_complete(&mut st);
        Ok(())
    }

    pub(crate) fn remote_release(&self, branch: usize, handle: PacketHandle) -> Result<()> {
        let mut st = self.lock();
        self.release_branch(&mut st, branch, handle, true)
    }

    pub(crate) fn branch_index_of(&self, block: BlockId) -> Option<usize> {
        self.lock().branch_of.get(&block).copied()
    }

    /// Stop delivering to a branch whose peer process went away. Packets it
    /// already held are not recovered.
    pub(crate) fn branch_dead(&self, branch: usize) {
        let mut st = self.lock();
        if let Some(c) = st.consumers.get_mut(branch) {
            if !c.dead {
                c.dead = true;
                warn!(stream = %self.name, branch, "consumer branch went away");
            }
        }
    }

    /// Consumer side: install the reconciled element list received from the
    /// producer process.
    pub(crate) fn remote_pool_elements(&self, elems: Vec<(u32, BufAttrs)>) -> Result<()> {
        let mut st = self.lock();
        st.reconciled = elems;
        st.reconciled_done = true;
        if let Some(up) = st.upstream.as_mut() {
            let mut cpu = SyncAttrs::new();
            cpu.set_need_cpu_access(true).set_perm(SyncPerm::WaitOnly);
            up.waiter_attrs = Some(cpu);
            up.signal = Some(None);
            up.steps = SetupSteps::all();
        }
        let events = [
            StreamEvent::Elements,
            StreamEvent::WaiterAttr,
            StreamEvent::SignalObj,
        ];
        for ev in events {
            self.fire_upstream_sync_to_consumers(&mut st, ev);
        }
        Ok(())
    }

    /// Consumer side: a packet definition arrived; buffers were allocated by
    /// the bridge from the reconciled attribute lists.
    pub(crate) fn remote_packet_create(
        &self,
        handle: PacketHandle,
        bufs: Vec<BufObj>,
    ) -> Result<()> {
        let mut st = self.lock();
        let num_consumers = st.consumers.len();
        let mut entry = PacketEntry::new(handle, num_consumers, Location::Upstream);
        entry.bufs = bufs;
        entry.completed = true;
        st.packets.push(entry);
        for ci in 0..st.consumers.len() {
            st.consumers[ci].creation_pending.push_back(handle);
            if let ConsumerKind::Local { consumer, .. } = st.consumers[ci].kind {
                st.send_event(consumer, StreamEvent::PacketCreate);
            }
        }
        Ok(())
    }

    pub(crate) fn remote_packets_complete(&self) -> Result<()> {
        let mut st = self.lock();
        for ci in 0..st.consumers.len() {
            if let ConsumerKind::Local { consumer, .. } = st.consumers[ci].kind {
                st.send_event(consumer, StreamEvent::PacketsComplete);
            }
        }
        Ok(())
    }

    pub(crate) fn remote_setup_complete(&self) -> Result<()> {
        let mut st = self.lock();
        st.setup_complete = true;
        st.broadcast(StreamEvent::SetupComplete);
        Ok(())
    }

    /// Consumer side: payload bytes for `handle` were copied into the local
    /// buffers; deliver it through the branch queue.
    pub(crate) fn remote_present(&self, handle: PacketHandle) -> Result<()> {
        let mut st = self.lock();
        let num_elems = st.reconciled.len();
        let num_consumers = st.consumers.len();
        let entry = st.entry(handle)?;
        if entry.location != Location::Upstream {
            return Err(StreamError::Protocol(format!(
                "remote presented packet {:#x} still local",
                handle.0
            )));
        }
        entry.location = Location::Streaming;
        entry.outstanding = (0..num_consumers).collect();
        entry.prod_fences = vec![None; num_elems];
        entry.cons_fences = vec![None; num_consumers];
        for branch in 0..num_consumers {
            let evicted = st.consumers[branch].queue.push(handle);
            match evicted {
                Some(stale) => {
                    self.release_branch(&mut st, branch, stale, true)?;
                }
                None => {
                    if let ConsumerKind::Local { consumer, .. } = st.consumers[branch].kind {
                        st.send_event(consumer, StreamEvent::PacketReady);
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn packet_buffers(&self, handle: PacketHandle) -> Result<Vec<BufObj>> {
        let mut st = self.lock();
        let entry = st.entry(handle)?;
        Ok(entry.bufs.iter().map(BufObj::dup).collect())
    }

    pub(crate) fn packet_data_fence(&self, handle: PacketHandle) -> Result<Option<Fence>> {
        let mut st = self.lock();
        let entry = st.entry(handle)?;
        Ok(entry.prod_fences.first().cloned().flatten())
    }

    pub(crate) fn reconciled_elements(&self) -> Vec<(u32, BufAttrs)> {
        self.lock().reconciled.clone()
    }

    fn maybe_fire_packet_status(&self, st: &mut HubState, handle: PacketHandle) {
        let pool_block = match &st.pool {
            Some(p) => p.block,
            None => return,
        };
        let Ok(entry) = st.entry(handle) else {
            return;
        };
        let complete =
            entry.prod_status.is_some() && entry.cons_status.iter().all(|s| s.is_some());
        if complete && !entry.status_fired {
            entry.status_fired = true;
            st.send_event(pool_block, StreamEvent::PacketStatus);
        }
    }
}

impl Drop for StreamHub {
    fn drop(&mut self) {
        // Peers observe the endpoint going away.
        let st = self.lock();
        if !st.shut_down {
            for out in st.ipc_src_out.values() {
                let _ = out.send(ipc::SrcOut::Disconnect);
            }
            if let Some(UpstreamState {
                kind: UpstreamKind::IpcDst { out, .. },
                ..
            }) = st.upstream.as_ref()
            {
                let _ = out.send(ipc::DstOut::Disconnect);
            }
        }
    }
}

/// Handle to one block in the stream graph. Cloning shares the event source.
#[derive(Clone)]
pub struct BlockHandle {
    hub: Arc<StreamHub>,
    id: BlockId,
    events: Receiver<StreamEvent>,
}

impl BlockHandle {
    pub fn role(&self) -> BlockRole {
        self.hub.lock().blocks[self.id].role
    }

    /// Block until an event arrives or the timeout elapses.
    pub fn event_query(&self, timeout: Duration) -> Result<StreamEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(ev) => Ok(ev),
            Err(RecvTimeoutError::Timeout) => Err(StreamError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Ok(StreamEvent::Disconnected),
        }
    }

    /// Wire this block to a downstream block.
    pub fn connect(&self, downstream: &BlockHandle) -> Result<()> {
        if !Arc::ptr_eq(&self.hub, &downstream.hub) {
            return Err(StreamError::Config(
                "blocks belong to different streams".into(),
            ));
        }
        self.hub.connect_blocks(self.id, downstream.id)
    }

    /// Last error posted on the stream.
    pub fn error_get(&self) -> Option<String> {
        self.hub.lock().error.clone()
    }

    /// Number of consumer endpoints reachable from the producer.
    pub fn consumer_count(&self) -> Result<usize> {
        let st = self.hub.lock();
        if !st.connected_fired {
            return Err(StreamError::Protocol(
                "consumer count queried before connect".into(),
            ));
        }
        Ok(st.consumers.len())
    }

    fn branch_index(&self, st: &HubState) -> Result<usize> {
        st.branch_of
            .get(&self.id)
            .copied()
            .ok_or(StreamError::Protocol("block is not a consumer branch".into()))
    }

    // ---- element attribute exchange --------------------------------------

    /// Export one element's attributes (endpoints and, for the reconciled
    /// set, the pool).
    pub fn element_attr_set(&self, name: u32, attrs: BufAttrs) -> Result<()> {
        let mut st = self.hub.lock();
        match st.blocks[self.id].role {
            BlockRole::Producer => {
                let up = st.upstream.as_mut().unwrap();
                up.elements.push((name, attrs));
                Ok(())
            }
            BlockRole::Consumer => {
                let branch = self.branch_index(&st)?;
                st.consumers[branch].elements.push((name, attrs));
                Ok(())
            }
            BlockRole::Pool => {
                st.reconciled.push((name, attrs));
                Ok(())
            }
            role => Err(StreamError::Protocol(format!(
                "{role:?} cannot export elements"
            ))),
        }
    }

    /// Count elements exported by one side (pool queries).
    pub fn element_count(&self, origin: EndpointKind) -> Result<usize> {
        let st = self.hub.lock();
        match origin {
            EndpointKind::Producer => Ok(st.upstream.as_ref().map_or(0, |u| u.elements.len())),
            EndpointKind::Consumer => {
                let mut names: Vec<u32> = Vec::new();
                for c in &st.consumers {
                    for (name, _) in &c.elements {
                        if !names.contains(name) {
                            names.push(*name);
                        }
                    }
                }
                Ok(names.len())
            }
        }
    }

    /// Fetch one exported element by side and index (pool queries). Consumer
    /// requirements with the same name are combined across branches.
    pub fn element_attr_get(&self, origin: EndpointKind, index: usize) -> Result<(u32, BufAttrs)> {
        let st = self.hub.lock();
        match origin {
            EndpointKind::Producer => st
                .upstream
                .as_ref()
                .and_then(|u| u.elements.get(index).cloned())
                .ok_or(StreamError::Protocol(format!(
                    "no producer element {index}"
                ))),
            EndpointKind::Consumer => {
                let mut names: Vec<u32> = Vec::new();
                for c in &st.consumers {
                    for (name, _) in &c.elements {
                        if !names.contains(name) {
                            names.push(*name);
                        }
                    }
                }
                let name = *names.get(index).ok_or(StreamError::Protocol(format!(
                    "no consumer element {index}"
                )))?;
                let lists: Vec<&BufAttrs> = st
                    .consumers
                    .iter()
                    .flat_map(|c| {
                        c.elements
                            .iter()
                            .filter(|(n, _)| *n == name)
                            .map(|(_, a)| a)
                    })
                    .collect();
                let merged = BufAttrs::reconcile(lists)?;
                Ok((name, merged))
            }
        }
    }

    /// Fetch the pool's reconciled element list (endpoint queries).
    pub fn reconciled_attr_get(&self, index: usize) -> Result<(u32, BufAttrs)> {
        let st = self.hub.lock();
        st.reconciled
            .get(index)
            .cloned()
            .ok_or(StreamError::Protocol(format!(
                "no reconciled element {index}"
            )))
    }

    pub fn reconciled_count(&self) -> usize {
        self.hub.lock().reconciled.len()
    }

    // ---- sync exchange ---------------------------------------------------

    /// Export this endpoint's waiter requirements for an element.
    pub fn element_waiter_attr_set(&self, _elem: usize, attrs: SyncAttrs) -> Result<()> {
        let mut st = self.hub.lock();
        match st.blocks[self.id].role {
            BlockRole::Producer => {
                st.upstream.as_mut().unwrap().waiter_attrs = Some(attrs);
                self.hub
                    .fire_upstream_sync_to_consumers(&mut st, StreamEvent::WaiterAttr);
                Ok(())
            }
            BlockRole::Consumer => {
                let branch = self.branch_index(&st)?;
                st.consumers[branch].waiter_attrs = Some(attrs);
                self.hub.maybe_fire_waiter_to_upstream(&mut st);
                Ok(())
            }
            role => Err(StreamError::Protocol(format!(
                "{role:?} cannot export waiter attrs"
            ))),
        }
    }

    /// Import the peer's waiter requirements. The producer sees the merged
    /// requirements of every consumer branch.
    pub fn element_waiter_attr_get(&self, _elem: usize) -> Result<SyncAttrs> {
        let st = self.hub.lock();
        match st.blocks[self.id].role {
            BlockRole::Producer => {
                let mut merged = SyncAttrs::new();
                for c in &st.consumers {
                    let attrs = c.waiter_attrs.as_ref().ok_or(StreamError::Protocol(
                        "consumer waiter attrs not yet exported".into(),
                    ))?;
                    merged.need_cpu_access |= attrs.need_cpu_access;
                    if let Some(p) = attrs.perm {
                        merged.set_perm(p);
                    }
                    merged.hw.extend(attrs.hw.iter().copied());
                }
                Ok(merged)
            }
            BlockRole::Consumer => st
                .upstream
                .as_ref()
                .and_then(|u| u.waiter_attrs.clone())
                .ok_or(StreamError::Protocol(
                    "producer waiter attrs not yet exported".into(),
                )),
            role => Err(StreamError::Protocol(format!(
                "{role:?} cannot import waiter attrs"
            ))),
        }
    }

    /// Export this endpoint's signal object (None announces that peers never
    /// need to wait on this endpoint).
    pub fn element_signal_obj_set(&self, _elem: usize, obj: Option<SyncObj>) -> Result<()> {
        let mut st = self.hub.lock();
        match st.blocks[self.id].role {
            BlockRole::Producer => {
                st.upstream.as_mut().unwrap().signal = Some(obj);
                self.hub
                    .fire_upstream_sync_to_consumers(&mut st, StreamEvent::SignalObj);
                Ok(())
            }
            BlockRole::Consumer => {
                let branch = self.branch_index(&st)?;
                st.consumers[branch].signal = Some(obj);
                self.hub.maybe_fire_signal_to_upstream(&mut st);
                Ok(())
            }
            role => Err(StreamError::Protocol(format!(
                "{role:?} cannot export signal objects"
            ))),
        }
    }

    /// Import the signal object of upstream endpoint `index` (consumers pass
    /// 0; the producer passes the consumer branch index).
    pub fn element_signal_obj_get(&self, index: usize, _elem: usize) -> Result<Option<SyncObj>> {
        let st = self.hub.lock();
        match st.blocks[self.id].role {
            BlockRole::Producer => st
                .consumers
                .get(index)
                .and_then(|c| c.signal.clone())
                .ok_or(StreamError::Protocol(format!(
                    "consumer {index} signal object not yet exported"
                ))),
            BlockRole::Consumer => st
                .upstream
                .as_ref()
                .and_then(|u| u.signal.clone())
                .ok_or(StreamError::Protocol(
                    "producer signal object not yet exported".into(),
                )),
            role => Err(StreamError::Protocol(format!(
                "{role:?} cannot import signal objects"
            ))),
        }
    }

    // ---- setup status ----------------------------------------------------

    /// Report a setup milestone; the fabric advances the protocol when all
    /// parties reach the matching point.
    pub fn setup_status_set(&self, step: SetupStep, done: bool) -> Result<()> {
        let mut st = self.hub.lock();
        match st.blocks[self.id].role {
            BlockRole::Producer => {
                st.upstream.as_mut().unwrap().steps.set(step, done);
                if step == SetupStep::ElementExport {
                    self.hub.maybe_fire_elements_to_pool(&mut st);
                }
            }
            BlockRole::Consumer => {
                let branch = self.branch_index(&st)?;
                st.consumers[branch].steps.set(step, done);
                if step == SetupStep::ElementExport {
                    self.hub.maybe_fire_elements_to_pool(&mut st);
                }
            }
            BlockRole::Pool => {
                let pool = st.pool.as_mut().unwrap();
                pool.steps.set(step, done);
                match step {
                    SetupStep::ElementExport => {
                        st.reconciled_done = true;
                        self.hub.fire_reconciled_downstream(&mut st);
                    }
                    SetupStep::PacketExport => {
                        let handles: Vec<BlockId> = st
                            .blocks
                            .iter()
                            .enumerate()
                            .filter(|(_, b)| {
                                matches!(b.role, BlockRole::Producer | BlockRole::Consumer)
                            })
                            .map(|(i, _)| i)
                            .collect();
                        for id in handles {
                            st.send_event(id, StreamEvent::PacketsComplete);
                        }
                        for c in &st.consumers {
                            if let ConsumerKind::IpcSrc { out, .. } = &c.kind {
                                let _ = out.send(ipc::SrcOut::PacketsComplete);
                            }
                        }
                    }
                    _ => {}
                }
            }
            role => {
                return Err(StreamError::Protocol(format!(
                    "{role:?} has no setup status"
                )));
            }
        }
        self.hub.maybe_setup_complete(&mut st);
        Ok(())
    }

    // ---- pool packet operations ------------------------------------------

    /// Create a packet (pool only).
    pub fn pool_packet_create(&self, _cookie: u64) -> Result<PacketHandle> {
        let mut st = self.hub.lock();
        if !matches!(st.blocks[self.id].role, BlockRole::Pool) {
            return Err(StreamError::Protocol("only the pool creates packets".into()));
        }
        let handle = PacketHandle(st.next_packet_id);
        st.next_packet_id += 1;
        let num_consumers = st.consumers.len();
        st.packets
            .push(PacketEntry::new(handle, num_consumers, Location::Pool));
        Ok(handle)
    }

    pub fn pool_packet_insert_buffer(
        &self,
        handle: PacketHandle,
        elem: usize,
        buf: &BufObj,
    ) -> Result<()> {
        let mut st = self.hub.lock();
        let entry = st.entry(handle)?;
        if entry.bufs.len() != elem {
            return Err(StreamError::Protocol(format!(
                "buffer for element {elem} inserted out of order"
            )));
        }
        entry.bufs.push(buf.dup());
        Ok(())
    }

    /// Finish a packet's definition; endpoints observe `PacketCreate`.
    pub fn pool_packet_complete(&self, handle: PacketHandle) -> Result<()> {
        let mut st = self.hub.lock();
        let entry = st.entry(handle)?;
        entry.completed = true;
        let up_block = match st.upstream.as_mut() {
            Some(up) => {
                up.creation_pending.push_back(handle);
                match up.kind {
                    UpstreamKind::Producer { block } => Some(block),
                    UpstreamKind::IpcDst { .. } => None,
                }
            }
            None => None,
        };
        if let Some(block) = up_block {
            st.send_event(block, StreamEvent::PacketCreate);
        }
        for ci in 0..st.consumers.len() {
            st.consumers[ci].creation_pending.push_back(handle);
            match &st.consumers[ci].kind {
                ConsumerKind::Local { consumer, .. } => {
                    let consumer = *consumer;
                    st.send_event(consumer, StreamEvent::PacketCreate);
                }
                ConsumerKind::IpcSrc { out, .. } => {
                    let _ = out.send(ipc::SrcOut::PacketCreate { handle });
                }
            }
        }
        Ok(())
    }

    /// Packet acceptance from one endpoint (pool queries after all statuses
    /// arrived).
    pub fn pool_packet_status_accept(&self, handle: PacketHandle) -> Result<bool> {
        let mut st = self.hub.lock();
        let entry = st.entry(handle)?;
        let prod_ok = matches!(entry.prod_status, Some(Ok(_)));
        let cons_ok = entry
            .cons_status
            .iter()
            .all(|s| matches!(s, Some(Ok(_))));
        Ok(prod_ok && cons_ok)
    }

    /// Detailed per-endpoint packet status (None means accepted).
    pub fn pool_packet_status_value(
        &self,
        handle: PacketHandle,
        endpoint: EndpointKind,
        index: usize,
    ) -> Result<Option<String>> {
        let mut st = self.hub.lock();
        let entry = st.entry(handle)?;
        let status = match endpoint {
            EndpointKind::Producer => entry.prod_status.clone(),
            EndpointKind::Consumer => entry.cons_status.get(index).cloned().flatten(),
        };
        match status {
            Some(Ok(_)) => Ok(None),
            Some(Err(code)) => Ok(Some(code)),
            None => Err(StreamError::Protocol(format!(
                "packet {:#x} status not yet reported",
                handle.0
            ))),
        }
    }

    // ---- endpoint packet operations --------------------------------------

    /// Pop the handle of the next packet pending creation at this endpoint.
    pub fn packet_new_handle(&self) -> Result<PacketHandle> {
        let mut st = self.hub.lock();
        let pending = match st.blocks[self.id].role {
            BlockRole::Producer => &mut st.upstream.as_mut().unwrap().creation_pending,
            BlockRole::Consumer => {
                let branch = self.branch_index(&st)?;
                &mut st.consumers[branch].creation_pending
            }
            role => {
                return Err(StreamError::Protocol(format!(
                    "{role:?} does not import packets"
                )));
            }
        };
        pending
            .pop_front()
            .ok_or(StreamError::Protocol("no packet pending creation".into()))
    }

    pub fn packet_buffer_get(&self, handle: PacketHandle, elem: usize) -> Result<BufObj> {
        let mut st = self.hub.lock();
        let entry = st.entry(handle)?;
        entry
            .bufs
            .get(elem)
            .map(BufObj::dup)
            .ok_or(StreamError::Protocol(format!(
                "packet {:#x} has no element {elem}",
                handle.0
            )))
    }

    /// Accept or reject a packet, binding this endpoint's cookie to it.
    pub fn packet_status_set(
        &self,
        handle: PacketHandle,
        cookie: Option<u64>,
        status: std::result::Result<(), StreamError>,
    ) -> Result<()> {
        let mut st = self.hub.lock();
        let value = match (&status, cookie) {
            (Ok(()), Some(c)) => Ok(c),
            (Ok(()), None) => {
                return Err(StreamError::Protocol(
                    "accepted packet requires a cookie".into(),
                ));
            }
            (Err(e), _) => Err(e.code().to_string()),
        };
        match st.blocks[self.id].role {
            BlockRole::Producer => {
                if let Ok(c) = value {
                    let duplicate = st
                        .packets
                        .iter()
                        .any(|p| p.handle != handle && p.prod_status == Some(Ok(c)));
                    if duplicate {
                        return Err(StreamError::InvalidCookie(c));
                    }
                }
                let entry = st.entry(handle)?;
                entry.prod_status = Some(value);
            }
            BlockRole::Consumer => {
                let branch = self.branch_index(&st)?;
                if let Ok(c) = value {
                    let duplicate = st.packets.iter().any(|p| {
                        p.handle != handle && p.cons_status.get(branch) == Some(&Some(Ok(c)))
                    });
                    if duplicate {
                        return Err(StreamError::InvalidCookie(c));
                    }
                }
                let is_dst = st.pool.is_none();
                let entry = st.entry(handle)?;
                entry.cons_status[branch] = Some(value.clone());
                if is_dst {
                    if let Some(UpstreamState {
                        kind: UpstreamKind::IpcDst { out, .. },
                        ..
                    }) = st.upstream.as_ref()
                    {
                        let _ = out.send(ipc::DstOut::PacketStatus {
                            handle,
                            status: value,
                        });
                    }
                }
            }
            role => {
                return Err(StreamError::Protocol(format!(
                    "{role:?} cannot report packet status"
                )));
            }
        }
        self.hub.maybe_fire_packet_status(&mut st, handle);
        Ok(())
    }

    // ---- runtime ---------------------------------------------------------

    /// Producer: take ownership of the next returned (or initial) packet.
    /// Returns the cookie this endpoint bound to the packet.
    pub fn producer_packet_get(&self) -> Result<u64> {
        let mut st = self.hub.lock();
        let up = st
            .upstream
            .as_mut()
            .ok_or(StreamError::Protocol("no producer endpoint".into()))?;
        let handle = up
            .ready
            .pop_front()
            .ok_or(StreamError::Protocol("no packet ready".into()))?;
        let entry = st.entry(handle)?;
        entry.location = Location::Producer;
        match &entry.prod_status {
            Some(Ok(cookie)) => Ok(*cookie),
            _ => Err(StreamError::Protocol(format!(
                "packet {:#x} was never accepted by the producer",
                handle.0
            ))),
        }
    }

    /// Attach a fence to a packet element prior to present (producer) or
    /// release (consumer).
    pub fn packet_fence_set(&self, handle: PacketHandle, elem: usize, fence: Fence) -> Result<()> {
        let mut st = self.hub.lock();
        match st.blocks[self.id].role {
            BlockRole::Producer => {
                let num_elems = st.reconciled.len().max(elem + 1);
                let entry = st.entry(handle)?;
                if entry.prod_fences.len() < num_elems {
                    entry.prod_fences.resize(num_elems, None);
                }
                entry.prod_fences[elem] = Some(fence);
                Ok(())
            }
            BlockRole::Consumer => {
                let branch = self.branch_index(&st)?;
                let entry = st.entry(handle)?;
                entry.cons_fences[branch] = Some(fence);
                Ok(())
            }
            role => Err(StreamError::Protocol(format!(
                "{role:?} cannot attach fences"
            ))),
        }
    }

    /// Retrieve a peer's fence for a packet element. The producer passes the
    /// consumer branch index; consumers pass the upstream index (0).
    pub fn packet_fence_get(
        &self,
        handle: PacketHandle,
        index: usize,
        elem: usize,
    ) -> Result<Option<Fence>> {
        let mut st = self.hub.lock();
        match st.blocks[self.id].role {
            BlockRole::Producer => {
                let entry = st.entry(handle)?;
                Ok(entry.cons_fences.get(index).cloned().flatten())
            }
            BlockRole::Consumer => {
                let entry = st.entry(handle)?;
                Ok(entry.prod_fences.get(elem).cloned().flatten())
            }
            role => Err(StreamError::Protocol(format!(
                "{role:?} cannot query fences"
            ))),
        }
    }

    /// Producer: hand a packet to every consumer branch.
    pub fn producer_packet_present(&self, handle: PacketHandle) -> Result<()> {
        let mut st = self.hub.lock();
        if !matches!(st.blocks[self.id].role, BlockRole::Producer) {
            return Err(StreamError::Protocol("only the producer presents".into()));
        }
        let num_consumers = st.consumers.len();
        let live: Vec<usize> = (0..num_consumers)
            .filter(|i| !st.consumers[*i].dead)
            .collect();
        let entry = st.entry(handle)?;
        if entry.location != Location::Producer {
            return Err(StreamError::Protocol(format!(
                "present of packet {:#x} not owned by producer",
                handle.0
            )));
        }
        entry.location = Location::Streaming;
        entry.outstanding = live.iter().copied().collect();
        entry.cons_fences = vec![None; num_consumers];
        for branch in live {
            match &st.consumers[branch].kind {
                ConsumerKind::Local { consumer, .. } => {
                    let consumer = *consumer;
                    match st.consumers[branch].queue.push(handle) {
                        Some(stale) => {
                            // The pending packet-ready event now refers to
                            // the replacement; no new event is due.
                            debug!(
                                stream = %self.hub.name,
                                branch,
                                packet = stale.0,
                                "mailbox dropped stale packet"
                            );
                            self.hub.release_branch(&mut st, branch, stale, true)?;
                        }
                        None => st.send_event(consumer, StreamEvent::PacketReady),
                    }
                }
                ConsumerKind::IpcSrc { out, .. } => {
                    let _ = out.send(ipc::SrcOut::Present { handle });
                }
            }
        }
        let entry = st.entry(handle)?;
        if entry.outstanding.is_empty() {
            // Every branch is gone; hand the packet straight back.
            self.hub.recycle_to_upstream(&mut st, handle);
        }
        Ok(())
    }

    /// Consumer: take ownership of the next delivered packet. Returns this
    /// endpoint's cookie for it.
    pub fn consumer_packet_acquire(&self) -> Result<u64> {
        let mut st = self.hub.lock();
        let branch = self.branch_index(&st)?;
        let handle = st.consumers[branch]
            .queue
            .pop()
            .ok_or(StreamError::Protocol("acquire with empty queue".into()))?;
        let entry = st.entry(handle)?;
        match entry.cons_status.get(branch) {
            Some(Some(Ok(cookie))) => Ok(*cookie),
            _ => Err(StreamError::Protocol(format!(
                "packet {:#x} was never accepted by this consumer",
                handle.0
            ))),
        }
    }

    /// Consumer: return a packet to the producer. Any fence attached via
    /// [`BlockHandle::packet_fence_set`] travels with it.
    pub fn consumer_packet_release(&self, handle: PacketHandle) -> Result<()> {
        let mut st = self.hub.lock();
        let branch = self.branch_index(&st)?;
        self.hub.release_branch(&mut st, branch, handle, false)
    }

    /// Packets dropped by this consumer's mailbox queue.
    pub fn queue_dropped(&self) -> Result<u64> {
        let st = self.hub.lock();
        let branch = self.branch_index(&st)?;
        Ok(st.consumers[branch].queue.dropped())
    }
}

pub(crate) fn register_ipc_src(
    hub: &Arc<StreamHub>,
    out: Sender<ipc::SrcOut>,
) -> (BlockId, BlockHandle) {
    let (id, handle) = hub.add_block(BlockRole::IpcSrc, None);
    let mut st = hub.lock();
    st.ipc_src_out.insert(id, out);
    st.ipc_pending.insert(id);
    (id, handle)
}

pub(crate) fn register_ipc_dst(
    hub: &Arc<StreamHub>,
    out: Sender<ipc::DstOut>,
) -> (BlockId, BlockHandle) {
    let (id, handle) = hub.add_block(BlockRole::IpcDst, None);
    let mut st = hub.lock();
    st.upstream = Some(UpstreamState {
        kind: UpstreamKind::IpcDst { block: id, out },
        steps: SetupSteps::default(),
        elements: Vec::new(),
        waiter_attrs: None,
        signal: None,
        creation_pending: VecDeque::new(),
        ready: VecDeque::new(),
    });
    st.ipc_pending.insert(id);
    (id, handle)
}

pub(crate) fn hub_weak(hub: &Arc<StreamHub>) -> Weak<StreamHub> {
    Arc::downgrade(hub)
}
