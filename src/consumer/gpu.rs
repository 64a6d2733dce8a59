//! GPU consumer: imports packet buffers as external memory, performs the
//! tiled-to-pitched copy and a device-to-host readback, and signals its
//! end-of-frame semaphore on the same stream.

use std::fs::File;
use std::io::Write;

use tracing::{debug, error};

use crate::buffer::{BufAttrs, BufKind};
use crate::client::ClientCore;
use crate::compute::{
    ComputeDevice, ComputeStream, ExternalImage, ExternalSemaphore, HostBuffer, SemaphoreRole,
};
use crate::config::{DUMP_END_FRAME, DUMP_START_FRAME, MAX_PACKETS};
use crate::consumer::{ConsumerProcessor, DumpConfig};
use crate::error::{Result, StreamError};
use crate::sync::{Fence, SyncAttrs, SyncObj};

pub struct GpuProcessor {
    device_id: u32,
    dump: DumpConfig,
    device: Option<ComputeDevice>,
    stream: Option<ComputeStream>,
    images: Vec<Option<ExternalImage>>,
    host_bufs: Vec<Option<HostBuffer>>,
    signaler_sem: Option<ExternalSemaphore>,
    waiter_sem: Option<ExternalSemaphore>,
    output: Option<File>,
}

impl GpuProcessor {
    pub fn new(device_id: u32, dump: DumpConfig) -> GpuProcessor {
        GpuProcessor {
            device_id,
            dump,
            device: None,
            stream: None,
            images: (0..MAX_PACKETS).map(|_| None).collect(),
            host_bufs: (0..MAX_PACKETS).map(|_| None).collect(),
            signaler_sem: None,
            waiter_sem: None,
            output: None,
        }
    }

    fn device(&self) -> Result<&ComputeDevice> {
        self.device
            .as_ref()
            .ok_or(StreamError::Hardware("compute device not initialized".into()))
    }

    fn stream(&self) -> Result<&ComputeStream> {
        self.stream
            .as_ref()
            .ok_or(StreamError::Hardware("compute stream not initialized".into()))
    }
}

impl ConsumerProcessor for GpuProcessor {
    fn init(&mut self, core: &ClientCore) -> Result<()> {
        let device = ComputeDevice::new(self.device_id)?;
        self.stream = Some(device.create_stream()?);
        self.device = Some(device);
        debug!(client = %core.name, device = self.device_id, "created consumer compute stream");

        if self.dump.enabled {
            let path = self.dump.file_path("multicast_cuda", core.sensor, "yuv");
            self.output = Some(File::create(&path).map_err(|e| {
                error!(client = %core.name, path = %path.display(), error = %e,
                       "failed to open output file");
                StreamError::Io(e.to_string())
            })?);
        }
        Ok(())
    }

    fn set_data_buf_attrs(&mut self, _core: &ClientCore, attrs: &mut BufAttrs) -> Result<()> {
        attrs.kind = Some(BufKind::Image);
        attrs.set_need_cpu_access(true);
        attrs.set_gpu(self.device_id);
        Ok(())
    }

    fn set_sync_attrs(
        &mut self,
        _core: &ClientCore,
        signaler: &mut SyncAttrs,
        waiter: &mut SyncAttrs,
    ) -> Result<()> {
        let device = self.device()?;
        device.fill_sync_attrs(signaler, SemaphoreRole::Signal);
        device.fill_sync_attrs(waiter, SemaphoreRole::Wait);
        Ok(())
    }

    fn map_data_buffer(&mut self, core: &ClientCore, index: usize) -> Result<()> {
        let packet = core.packet(index)?;
        let buf = packet.data_obj.as_ref().ok_or(StreamError::Protocol(
            "mapping a packet without a data buffer".into(),
        ))?;
        // Only block-linear layouts can be imported; anything else is a
        // setup-time rejection.
        let image = self.device()?.import_external_image(buf)?;
        self.host_bufs[index] = Some(self.device()?.alloc_host(buf.size()));
        self.images[index] = Some(image);
        Ok(())
    }

    fn register_signal_sync(&mut self, _core: &ClientCore, obj: &SyncObj) -> Result<()> {
        self.signaler_sem = Some(self.device()?.import_semaphore(obj));
        Ok(())
    }

    fn register_waiter_sync(
        &mut self,
        _core: &ClientCore,
        _index: usize,
        obj: &SyncObj,
    ) -> Result<()> {
        self.waiter_sem = Some(self.device()?.import_semaphore(obj));
        Ok(())
    }

    fn insert_prefence(&mut self, _index: usize, fence: &Fence) -> Result<()> {
        let sem = self
            .waiter_sem
            .as_ref()
            .ok_or(StreamError::Hardware("waiter semaphore not imported".into()))?;
        self.stream()?.wait_semaphore_async(sem, fence)
    }

    fn process_payload(&mut self, core: &ClientCore, index: usize) -> Result<Option<Fence>> {
        let image = self.images[index]
            .as_ref()
            .ok_or(StreamError::Protocol(format!("packet {index} not mapped")))?;
        let host = self.host_bufs[index]
            .as_ref()
            .ok_or(StreamError::Hardware("host buffer missing".into()))?;
        let luma = image
            .plane(0)
            .ok_or(StreamError::Hardware("image without luma plane".into()))?;
        let luma_bytes = luma.width as usize * luma.height as usize;

        let device = self.device()?;
        let stream = self.stream()?;
        let scratch = device.alloc_device(host.len());
        stream.copy_plane_to_pitch_async(image, 0, &scratch, 0)?;
        stream.copy_plane_to_pitch_async(image, 1, &scratch, luma_bytes)?;
        stream.copy_device_to_host_async(&scratch, host)?;

        let signal_obj = core
            .signal_obj
            .as_ref()
            .ok_or(StreamError::Protocol("signal object not allocated".into()))?;
        let sem = self
            .signaler_sem
            .as_ref()
            .ok_or(StreamError::Hardware("signaler semaphore not imported".into()))?;
        let postfence = signal_obj.generate_fence();
        stream.signal_semaphore_async(sem, &postfence)?;
        Ok(Some(postfence))
    }

    fn on_payload_done(&mut self, core: &ClientCore, index: usize, frame_num: u64) -> Result<()> {
        if !(DUMP_START_FRAME..=DUMP_END_FRAME).contains(&frame_num) {
            return Ok(());
        }
        let Some(file) = self.output.as_mut() else {
            return Ok(());
        };
        let host = self.host_bufs[index]
            .as_ref()
            .ok_or(StreamError::Hardware("host buffer missing".into()))?;
        host.with_read(|data| file.write_all(data)).map_err(|e| {
            error!(client = %core.name, error = %e, "dump write failed");
            StreamError::Io(e.to_string())
        })
    }
}
