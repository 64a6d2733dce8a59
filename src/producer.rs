//! Producer endpoint: owns packets between captures, posts frames into the
//! stream and recycles packets returned by the consumers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::buffer::{AccessPerm, BufAttrs, BufModule, BufObj};
use crate::client::{Client, ClientCore, ClientRole};
use crate::config::{FENCE_FRAME_TIMEOUT, NUM_CONSUMERS, NUM_LOCAL_CONSUMERS, QUERY_TIMEOUT};
use crate::error::{Result, StreamError};
use crate::fabric::StreamEvent;
use crate::source::{CapturedFrame, FrameSource, OutputKind, SyncRole};
use crate::sync::{SyncAttrs, SyncObj, SyncPerm};

pub struct ProducerRole {
    source: Arc<dyn FrameSource>,
    buf_module: BufModule,
    num_consumers: usize,
    /// Packets currently with consumers. Single writer on the post path,
    /// single writer on the recycle path, readable for diagnostics.
    outstanding: AtomicU32,
    frames: Vec<Option<CapturedFrame>>,
    raw_bufs: Vec<BufObj>,
}

impl ProducerRole {
    pub fn new(source: Arc<dyn FrameSource>, buf_module: BufModule) -> ProducerRole {
        ProducerRole {
            source,
            buf_module,
            num_consumers: 0,
            outstanding: AtomicU32::new(0),
            frames: (0..crate::config::MAX_PACKETS).map(|_| None).collect(),
            raw_bufs: Vec::new(),
        }
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Relaxed)
    }
}

impl ClientRole for ProducerRole {
    fn handle_stream_init(&mut self, core: &mut ClientCore) -> Result<()> {
        self.num_consumers = core.block.consumer_count()?;
        if self.num_consumers > NUM_CONSUMERS + NUM_LOCAL_CONSUMERS {
            error!(client = %core.name, count = self.num_consumers, "consumer count is too big");
            return Err(StreamError::Config(format!(
                "consumer count {} exceeds limit",
                self.num_consumers
            )));
        }
        core.num_wait_sync = self.num_consumers;
        Ok(())
    }

    fn handle_client_init(&mut self, _core: &mut ClientCore) -> Result<()> {
        Ok(())
    }

    fn set_data_buf_attrs(&mut self, core: &ClientCore, attrs: &mut BufAttrs) -> Result<()> {
        *attrs = self.source.image_attrs(core.sensor, OutputKind::Processed)?;
        attrs.set_perm(AccessPerm::ReadWrite);
        Ok(())
    }

    fn meta_perm(&self) -> AccessPerm {
        AccessPerm::ReadWrite
    }

    // The capture unit cannot register foreign sync objects, so consumer
    // fences are resolved on the CPU during recycle.
    fn has_cpu_wait(&self) -> bool {
        true
    }

    fn set_sync_attrs(
        &mut self,
        core: &ClientCore,
        signaler: &mut SyncAttrs,
        waiter: &mut SyncAttrs,
    ) -> Result<()> {
        self.source
            .fill_sync_attrs(core.sensor, SyncRole::EofSignaler, signaler)?;
        waiter.set_need_cpu_access(true).set_perm(SyncPerm::WaitOnly);
        Ok(())
    }

    fn map_data_buffer(&mut self, _core: &mut ClientCore, _index: usize) -> Result<()> {
        // The duplicate stored in the packet is the producer's mapping.
        Ok(())
    }

    fn register_signal_sync(&mut self, core: &ClientCore, obj: &SyncObj) -> Result<()> {
        self.source
            .register_sync(core.sensor, SyncRole::EofSignaler, obj.clone())
    }

    fn register_waiter_sync(
        &mut self,
        _core: &ClientCore,
        _index: usize,
        _obj: &SyncObj,
    ) -> Result<()> {
        // Consumer fences are CPU-waited instead; see has_cpu_wait.
        Ok(())
    }

    fn handle_setup_complete(&mut self, core: &mut ClientCore) -> Result<()> {
        // Take initial ownership: one packet-ready event per packet.
        for _ in 0..core.num_packets {
            let event = core.block.event_query(QUERY_TIMEOUT)?;
            if event != StreamEvent::PacketReady {
                error!(client = %core.name, event = ?event, "expected initial packet ready");
                return Err(StreamError::Protocol(
                    "missing initial packet ownership".into(),
                ));
            }
            core.block.producer_packet_get()?;
        }
        debug!(client = %core.name, packets = core.num_packets, "initial packet ownership taken");

        // Raw capture buffers live outside the stream; allocate and register
        // them alongside the streamed processed images.
        let raw_attrs = self.source.image_attrs(core.sensor, OutputKind::Capture)?;
        let reconciled = BufAttrs::reconcile([&raw_attrs])?;
        let mut raw_images = Vec::with_capacity(core.num_packets);
        for packet in &core.packets {
            let buf = self.buf_module.alloc(&reconciled)?;
            raw_images.push((packet.cookie, buf.dup()));
            self.raw_bufs.push(buf);
        }
        self.source
            .register_images(core.sensor, OutputKind::Capture, raw_images)?;

        let mut images = Vec::with_capacity(core.num_packets);
        for packet in &core.packets {
            let data = packet.data_obj.as_ref().ok_or(StreamError::Protocol(
                "packet without a mapped data buffer".into(),
            ))?;
            images.push((packet.cookie, data.dup()));
        }
        self.source
            .register_images(core.sensor, OutputKind::Processed, images)
    }

    /// Inbound recycle: a consumer chain finished with a packet.
    fn handle_payload(&mut self, core: &mut ClientCore) -> Result<()> {
        if self.outstanding.load(Ordering::Acquire) == 0 {
            error!(client = %core.name, "packet returned while none outstanding");
            return Err(StreamError::Protocol(
                "packet returned while none outstanding".into(),
            ));
        }
        let cookie = core.block.producer_packet_get()?;
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let index = core.index_from_cookie(cookie)?;
        let handle = core.packet(index)?.handle;

        for i in 0..self.num_consumers {
            // A null waiter object means that consumer never signals.
            if core.waiter_objs[i].is_none() {
                continue;
            }
            if let Some(fence) = core.block.packet_fence_get(handle, i, 0)? {
                if let Some(ctx) = &core.cpu_wait {
                    ctx.wait(&fence, FENCE_FRAME_TIMEOUT)?;
                }
                // The capture unit must also not overwrite the buffer before
                // the consumer is done reading it.
                if let Some(frame) = &self.frames[index] {
                    frame.add_prefence(fence);
                }
            }
        }
        // Release the captured frame back to the source.
        self.frames[index] = None;
        Ok(())
    }
}

impl Client<ProducerRole> {
    /// Outbound flow: map a captured frame onto its packet and present it.
    pub fn post(&mut self, frame: CapturedFrame) -> Result<()> {
        let cookie = frame.tag();
        let index = self.core.index_from_cookie(cookie)?;
        debug!(client = %self.core.name, index, "post");

        self.core.write_meta(index, &frame.metadata())?;
        let postfence = frame.eof_fence();
        if self.role.frames[index].is_some() {
            warn!(client = %self.core.name, index, "frame slot still busy at post");
        }
        self.role.frames[index] = Some(frame);

        if let (Some(ctx), Some(fence)) = (&self.core.cpu_wait, &postfence) {
            ctx.wait(fence, FENCE_FRAME_TIMEOUT)?;
        }

        let handle = self.core.packet(index)?.handle;
        if let Some(fence) = postfence {
            self.core
                .block
                .packet_fence_set(handle, self.core.data_index, fence)?;
        }
        self.core.block.producer_packet_present(handle)?;
        self.role.outstanding.fetch_add(1, Ordering::AcqRel);
        debug!(
            client = %self.core.name,
            outstanding = self.role.outstanding(),
            "presented packet"
        );
        self.core.on_frame_available();
        Ok(())
    }
}
