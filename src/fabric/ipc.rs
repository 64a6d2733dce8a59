//! Cross-process bridge blocks.
//!
//! An `ipc-src` block stands in for a remote consumer subtree on the
//! producer side; an `ipc-dst` block stands in for the remote producer on
//! the consumer side. Setup traffic crosses the wire verbatim so both sides
//! run the identical state machine. Fences do not cross: each bridge
//! CPU-waits the local fence before forwarding, and the far side imports a
//! null signal object, which the protocol already defines as "ready when
//! received".

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buffer::{BufAttrs, BufModule};
use crate::config::{FENCE_FRAME_TIMEOUT, QUERY_TIMEOUT};
use crate::error::{Result, StreamError};
use crate::sync::{device_wait, Fence};
use crate::transport::IpcEndpoint;

use super::{register_ipc_dst, register_ipc_src, BlockHandle, BlockId, PacketHandle, StreamHub};

/// Hub-to-bridge traffic on the producer side.
pub(crate) enum SrcOut {
    PoolElements { elems: Vec<(u32, BufAttrs)> },
    PacketCreate { handle: PacketHandle },
    PacketsComplete,
    SetupComplete,
    Present { handle: PacketHandle },
    Disconnect,
}

/// Hub-to-bridge traffic on the consumer side.
pub(crate) enum DstOut {
    ConsElements {
        elems: Vec<(u32, BufAttrs)>,
    },
    PacketStatus {
        handle: PacketHandle,
        status: std::result::Result<u64, String>,
    },
    SetupDone,
    Release {
        handle: PacketHandle,
        fence: Option<Fence>,
    },
    Disconnect,
}

#[derive(Debug, Serialize, Deserialize)]
enum WireMsg {
    Hello { sensor: u32, consumer: u32 },
    HelloAck,
    // downstream (src -> dst)
    PoolElements { elems: Vec<(u32, BufAttrs)> },
    PacketCreate { packet: u64 },
    PacketsComplete,
    SetupComplete,
    Present { packet: u64, sizes: Vec<u64> },
    // upstream (dst -> src)
    ConsElements { elems: Vec<(u32, BufAttrs)> },
    PacketStatus { packet: u64, cookie: Option<u64>, error: Option<String> },
    SetupDone,
    Release { packet: u64 },
    // either direction
    Disconnect,
    Error { code: String },
}

fn send_msg(endpoint: &dyn IpcEndpoint, msg: &WireMsg, payload: &[u8]) -> Result<()> {
    let header =
        serde_json::to_vec(msg).map_err(|e| StreamError::Transport(e.to_string()))?;
    endpoint.send(&header, payload)
}

fn parse_msg(header: &[u8]) -> Result<WireMsg> {
    serde_json::from_slice(header).map_err(|e| StreamError::Transport(e.to_string()))
}

/// Wait until the stream graph assigns this bridge its branch index.
fn wait_branch(hub: &Weak<StreamHub>, block: BlockId) -> Option<usize> {
    for _ in 0..200 {
        let hub = hub.upgrade()?;
        if let Some(branch) = hub.branch_index_of(block) {
            return Some(branch);
        }
        drop(hub);
        thread::sleep(Duration::from_millis(10));
    }
    None
}

/// Create the producer-side bridge for one remote consumer.
pub fn create_ipc_src(
    hub: &Arc<StreamHub>,
    endpoint: Box<dyn IpcEndpoint>,
    sensor: u32,
    consumer: u32,
) -> BlockHandle {
    let (out_tx, out_rx) = unbounded();
    let (id, handle) = register_ipc_src(hub, out_tx);
    let endpoint: Arc<dyn IpcEndpoint> = Arc::from(endpoint);
    let weak = super::hub_weak(hub);

    {
        let endpoint = Arc::clone(&endpoint);
        let weak = weak.clone();
        thread::Builder::new()
            .name(format!("ipcsrc{sensor}.{consumer}.out"))
            .spawn(move || src_outbound(weak, endpoint, out_rx, sensor, consumer))
            .ok();
    }
    thread::Builder::new()
        .name(format!("ipcsrc{sensor}.{consumer}.in"))
        .spawn(move || src_inbound(weak, endpoint, id))
        .ok();
    handle
}

fn src_outbound(
    hub: Weak<StreamHub>,
    endpoint: Arc<dyn IpcEndpoint>,
    out: Receiver<SrcOut>,
    sensor: u32,
    consumer: u32,
) {
    if send_msg(&*endpoint, &WireMsg::Hello { sensor, consumer }, &[]).is_err() {
        return;
    }
    while let Ok(msg) = out.recv() {
        let res = match msg {
            SrcOut::PoolElements { elems } => {
                send_msg(&*endpoint, &WireMsg::PoolElements { elems }, &[])
            }
            SrcOut::PacketCreate { handle } => {
                send_msg(&*endpoint, &WireMsg::PacketCreate { packet: handle.0 }, &[])
            }
            SrcOut::PacketsComplete => send_msg(&*endpoint, &WireMsg::PacketsComplete, &[]),
            SrcOut::SetupComplete => send_msg(&*endpoint, &WireMsg::SetupComplete, &[]),
            SrcOut::Present { handle } => forward_present(&hub, &*endpoint, handle),
            SrcOut::Disconnect => {
                let _ = send_msg(&*endpoint, &WireMsg::Disconnect, &[]);
                return;
            }
        };
        if let Err(e) = res {
            if let Some(hub) = hub.upgrade() {
                hub.post_error(format!("ipc src: {e}"));
            }
            return;
        }
    }
    // Hub went away without an orderly stop.
    let _ = send_msg(&*endpoint, &WireMsg::Disconnect, &[]);
}

fn forward_present(
    hub: &Weak<StreamHub>,
    endpoint: &dyn IpcEndpoint,
    handle: PacketHandle,
) -> Result<()> {
    let hub = hub.upgrade().ok_or(StreamError::Disconnected)?;
    // The remote side has no way to wait on this producer's fence, so the
    // bridge resolves it here before the bytes travel.
    if let Some(fence) = hub.packet_data_fence(handle)? {
        device_wait(&fence, FENCE_FRAME_TIMEOUT)?;
    }
    let bufs = hub.packet_buffers(handle)?;
    drop(hub);
    let mut sizes = Vec::with_capacity(bufs.len());
    let mut payload = Vec::new();
    for buf in &bufs {
        let bytes = buf.snapshot();
        sizes.push(bytes.len() as u64);
        payload.extend_from_slice(&bytes);
    }
    send_msg(
        endpoint,
        &WireMsg::Present {
            packet: handle.0,
            sizes,
        },
        &payload,
    )
}

fn src_inbound(hub: Weak<StreamHub>, endpoint: Arc<dyn IpcEndpoint>, block: BlockId) {
    loop {
        let (header, _payload) = match endpoint.recv(QUERY_TIMEOUT) {
            Ok(frame) => frame,
            Err(StreamError::Timeout) => {
                if hub.upgrade().is_none() {
                    return;
                }
                continue;
            }
            Err(_) => {
                // Peer process went away without a disconnect message.
                if let Some(hub) = hub.upgrade() {
                    if let Some(branch) = hub.branch_index_of(block) {
                        hub.branch_dead(branch);
                    }
                }
                return;
            }
        };
        let Some(hub_now) = hub.upgrade() else {
            return;
        };
        let msg = match parse_msg(&header) {
            Ok(m) => m,
            Err(e) => {
                hub_now.post_error(format!("ipc src: {e}"));
                return;
            }
        };
        let res = match msg {
            WireMsg::HelloAck => {
                hub_now.ipc_handshaken(block);
                Ok(())
            }
            WireMsg::ConsElements { elems } => {
                drop(hub_now);
                match wait_branch(&hub, block) {
                    Some(branch) => hub
                        .upgrade()
                        .map(|h| h.remote_consumer_elements(branch, elems))
                        .unwrap_or(Ok(())),
                    None => return,
                }
            }
            WireMsg::PacketStatus {
                packet,
                cookie,
                error,
            } => {
                let status = match (cookie, error) {
                    (Some(c), None) => Ok(c),
                    (_, Some(e)) => Err(e),
                    (None, None) => Err("missing status".to_string()),
                };
                let branch = hub_now.branch_index_of(block);
                match branch {
                    Some(b) => hub_now.remote_packet_status(b, PacketHandle(packet), status),
                    None => Ok(()),
                }
            }
            WireMsg::SetupDone => match hub_now.branch_index_of(block) {
                Some(b) => hub_now.remote_setup_done(b),
                None => Ok(()),
            },
            WireMsg::Release { packet } => match hub_now.branch_index_of(block) {
                Some(b) => hub_now.remote_release(b, PacketHandle(packet)),
                None => Ok(()),
            },
            WireMsg::Error { code } => {
                hub_now.post_error(code);
                Ok(())
            }
            WireMsg::Disconnect => {
                if let Some(branch) = hub_now.branch_index_of(block) {
                    hub_now.branch_dead(branch);
                }
                return;
            }
            other => {
                debug!(?other, "ipc src ignoring unexpected message");
                Ok(())
            }
        };
        if let Err(e) = res {
            if let Some(hub) = hub.upgrade() {
                hub.post_error(format!("ipc src: {e}"));
            }
            return;
        }
    }
}

/// Create the consumer-side bridge toward the remote producer.
pub fn create_ipc_dst(
    hub: &Arc<StreamHub>,
    endpoint: Box<dyn IpcEndpoint>,
    buf_module: BufModule,
) -> BlockHandle {
    let (out_tx, out_rx) = unbounded();
    let (id, handle) = register_ipc_dst(hub, out_tx);
    let endpoint: Arc<dyn IpcEndpoint> = Arc::from(endpoint);
    let weak = super::hub_weak(hub);

    {
        let endpoint = Arc::clone(&endpoint);
        let weak = weak.clone();
        thread::Builder::new()
            .name("ipcdst.out".into())
            .spawn(move || dst_outbound(weak, endpoint, out_rx))
            .ok();
    }
    thread::Builder::new()
        .name("ipcdst.in".into())
        .spawn(move || dst_inbound(weak, endpoint, id, buf_module))
        .ok();
    handle
}

fn dst_outbound(hub: Weak<StreamHub>, endpoint: Arc<dyn IpcEndpoint>, out: Receiver<DstOut>) {
    while let Ok(msg) = out.recv() {
        let res = match msg {
            DstOut::ConsElements { elems } => {
                send_msg(&*endpoint, &WireMsg::ConsElements { elems }, &[])
            }
            DstOut::PacketStatus { handle, status } => {
                let (cookie, error) = match status {
                    Ok(c) => (Some(c), None),
                    Err(e) => (None, Some(e)),
                };
                send_msg(
                    &*endpoint,
                    &WireMsg::PacketStatus {
                        packet: handle.0,
                        cookie,
                        error,
                    },
                    &[],
                )
            }
            DstOut::SetupDone => send_msg(&*endpoint, &WireMsg::SetupDone, &[]),
            DstOut::Release { handle, fence } => {
                // Resolve the consumer's completion fence before telling the
                // producer the packet is free.
                let waited = match fence {
                    Some(f) => device_wait(&f, FENCE_FRAME_TIMEOUT),
                    None => Ok(()),
                };
                waited.and_then(|()| {
                    send_msg(&*endpoint, &WireMsg::Release { packet: handle.0 }, &[])
                })
            }
            DstOut::Disconnect => {
                let _ = send_msg(&*endpoint, &WireMsg::Disconnect, &[]);
                return;
            }
        };
        if let Err(e) = res {
            if let Some(hub) = hub.upgrade() {
                hub.post_error(format!("ipc dst: {e}"));
            }
            return;
        }
    }
    let _ = send_msg(&*endpoint, &WireMsg::Disconnect, &[]);
}

fn dst_inbound(
    hub: Weak<StreamHub>,
    endpoint: Arc<dyn IpcEndpoint>,
    block: BlockId,
    buf_module: BufModule,
) {
    loop {
        let (header, payload) = match endpoint.recv(QUERY_TIMEOUT) {
            Ok(frame) => frame,
            Err(StreamError::Timeout) => {
                if hub.upgrade().is_none() {
                    return;
                }
                continue;
            }
            Err(_) => {
                if let Some(hub) = hub.upgrade() {
                    hub.post_disconnected();
                }
                return;
            }
        };
        let Some(hub_now) = hub.upgrade() else {
            return;
        };
        let msg = match parse_msg(&header) {
            Ok(m) => m,
            Err(e) => {
                hub_now.post_error(format!("ipc dst: {e}"));
                return;
            }
        };
        let res = match msg {
            WireMsg::Hello { sensor, consumer } => {
                debug!(sensor, consumer, "ipc dst handshake");
                send_msg(&*endpoint, &WireMsg::HelloAck, &[])
                    .map(|()| hub_now.ipc_handshaken(block))
            }
            WireMsg::PoolElements { elems } => hub_now.remote_pool_elements(elems),
            WireMsg::PacketCreate { packet } => {
                let elems = hub_now.reconciled_elements();
                let mut bufs = Vec::with_capacity(elems.len());
                let mut failed = None;
                for (_, attrs) in &elems {
                    match buf_module.alloc(attrs) {
                        Ok(b) => bufs.push(b),
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
                match failed {
                    Some(e) => Err(e),
                    None => hub_now.remote_packet_create(PacketHandle(packet), bufs),
                }
            }
            WireMsg::PacketsComplete => hub_now.remote_packets_complete(),
            WireMsg::SetupComplete => hub_now.remote_setup_complete(),
            WireMsg::Present { packet, sizes } => {
                apply_present(&hub_now, PacketHandle(packet), &sizes, &payload)
            }
            WireMsg::Error { code } => {
                hub_now.post_error(code);
                Ok(())
            }
            WireMsg::Disconnect => {
                hub_now.post_disconnected();
                return;
            }
            other => {
                debug!(?other, "ipc dst ignoring unexpected message");
                Ok(())
            }
        };
        if let Err(e) = res {
            if let Some(hub) = hub.upgrade() {
                hub.post_error(format!("ipc dst: {e}"));
            }
            return;
        }
    }
}

fn apply_present(
    hub: &Arc<StreamHub>,
    handle: PacketHandle,
    sizes: &[u64],
    payload: &[u8],
) -> Result<()> {
    let bufs = hub.packet_buffers(handle)?;
    if bufs.len() != sizes.len() {
        return Err(StreamError::Protocol(format!(
            "present with {} payload sections for {} elements",
            sizes.len(),
            bufs.len()
        )));
    }
    let mut offset = 0usize;
    for (buf, size) in bufs.iter().zip(sizes) {
        let size = *size as usize;
        let section = payload
            .get(offset..offset + size)
            .ok_or(StreamError::Protocol("truncated present payload".into()))?;
        buf.copy_from_slice(section)?;
        offset += size;
    }
    hub.remote_present(handle)
}
