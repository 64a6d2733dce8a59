//! Consumer endpoints: the abstract acquire/process/release cycle and the
//! two concrete payload processors.

mod enc;
mod gpu;

pub use enc::EncProcessor;
pub use gpu::GpuProcessor;

use std::path::PathBuf;

use tracing::debug;

use crate::buffer::{AccessPerm, BufAttrs};
use crate::client::{ClientCore, ClientRole};
use crate::config::FENCE_FRAME_TIMEOUT;
use crate::error::Result;
use crate::fabric::BlockHandle;
use crate::sync::{Fence, SyncAttrs, SyncObj};

/// Runtime toggle for per-consumer dump files.
#[derive(Debug, Clone, Default)]
pub struct DumpConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl DumpConfig {
    pub fn file_path(&self, stem: &str, sensor: u32, ext: &str) -> PathBuf {
        self.dir.join(format!("{stem}{sensor}.{ext}"))
    }
}

/// Hardware-unit-specific half of a consumer.
pub trait ConsumerProcessor: Send {
    fn init(&mut self, core: &ClientCore) -> Result<()>;
    fn set_data_buf_attrs(&mut self, core: &ClientCore, attrs: &mut BufAttrs) -> Result<()>;
    fn has_cpu_wait(&self) -> bool {
        true
    }
    fn set_sync_attrs(
        &mut self,
        core: &ClientCore,
        signaler: &mut SyncAttrs,
        waiter: &mut SyncAttrs,
    ) -> Result<()>;
    fn map_data_buffer(&mut self, core: &ClientCore, index: usize) -> Result<()>;
    fn register_signal_sync(&mut self, core: &ClientCore, obj: &SyncObj) -> Result<()>;
    fn register_waiter_sync(&mut self, core: &ClientCore, index: usize, obj: &SyncObj)
        -> Result<()>;
    fn unregister_syncs(&mut self, _core: &ClientCore) -> Result<()> {
        Ok(())
    }
    /// Bind the consumer's signal object as the end-of-frame producer for
    /// the next operation.
    fn set_eof_sync(&mut self, _core: &ClientCore) -> Result<()> {
        Ok(())
    }
    fn insert_prefence(&mut self, index: usize, fence: &Fence) -> Result<()>;
    fn skip_frame(&self, _frame_num: u64) -> bool {
        false
    }
    /// Process one packet asynchronously; returns the completion fence.
    fn process_payload(&mut self, core: &ClientCore, index: usize) -> Result<Option<Fence>>;
    fn on_payload_done(&mut self, core: &ClientCore, index: usize, frame_num: u64) -> Result<()>;
}

/// Shared consumer logic parameterized over the payload processor.
pub struct ConsumerRole<P: ConsumerProcessor> {
    queue: BlockHandle,
    pub processor: P,
    frame_num: u64,
}

impl<P: ConsumerProcessor> ConsumerRole<P> {
    pub fn new(queue: BlockHandle, processor: P) -> ConsumerRole<P> {
        ConsumerRole {
            queue,
            processor,
            frame_num: 0,
        }
    }

    pub fn queue_handle(&self) -> BlockHandle {
        self.queue.clone()
    }

    pub fn frames_seen(&self) -> u64 {
        self.frame_num
    }
}

impl<P: ConsumerProcessor> ClientRole for ConsumerRole<P> {
    fn handle_client_init(&mut self, core: &mut ClientCore) -> Result<()> {
        self.processor.init(core)
    }

    fn set_data_buf_attrs(&mut self, core: &ClientCore, attrs: &mut BufAttrs) -> Result<()> {
        self.processor.set_data_buf_attrs(core, attrs)
    }

    fn meta_perm(&self) -> AccessPerm {
        AccessPerm::Readonly
    }

    fn has_cpu_wait(&self) -> bool {
        self.processor.has_cpu_wait()
    }

    fn set_sync_attrs(
        &mut self,
        core: &ClientCore,
        signaler: &mut SyncAttrs,
        waiter: &mut SyncAttrs,
    ) -> Result<()> {
        self.processor.set_sync_attrs(core, signaler, waiter)
    }

    fn map_data_buffer(&mut self, core: &mut ClientCore, index: usize) -> Result<()> {
        self.processor.map_data_buffer(core, index)
    }

    fn register_signal_sync(&mut self, core: &ClientCore, obj: &SyncObj) -> Result<()> {
        self.processor.register_signal_sync(core, obj)
    }

    fn register_waiter_sync(
        &mut self,
        core: &ClientCore,
        index: usize,
        obj: &SyncObj,
    ) -> Result<()> {
        self.processor.register_waiter_sync(core, index, obj)
    }

    fn unregister_syncs(&mut self, core: &ClientCore) -> Result<()> {
        self.processor.unregister_syncs(core)
    }

    fn handle_payload(&mut self, core: &mut ClientCore) -> Result<()> {
        let cookie = core.block.consumer_packet_acquire()?;
        debug!(client = %core.name, cookie, "acquired packet");
        let index = core.index_from_cookie(cookie)?;
        let handle = core.packet(index)?.handle;

        self.frame_num += 1;
        if self.processor.skip_frame(self.frame_num) {
            return core.block.consumer_packet_release(handle);
        }
        core.on_frame_available();

        // A null producer signal object means the data is already coherent.
        if core.waiter_objs[0].is_some() {
            if let Some(prefence) = core.block.packet_fence_get(handle, 0, 0)? {
                self.processor.insert_prefence(index, &prefence)?;
            }
        }

        self.processor.set_eof_sync(core)?;
        let postfence = self.processor.process_payload(core, index)?;

        if let (Some(ctx), Some(fence)) = (&core.cpu_wait, &postfence) {
            ctx.wait(fence, FENCE_FRAME_TIMEOUT)?;
        }
        if let Some(meta_obj) = &core.packet(index)?.meta_obj {
            let meta = crate::source::FrameMetadata::read_from(meta_obj);
            debug!(
                client = %core.name,
                capture_tsc = meta.capture_tsc,
                frame = meta.frame_count,
                "payload metadata"
            );
        }
        self.processor.on_payload_done(core, index, self.frame_num)?;

        if let Some(fence) = postfence {
            core.block.packet_fence_set(handle, core.data_index, fence)?;
        }
        core.block.consumer_packet_release(handle)
    }
}
