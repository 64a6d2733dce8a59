//! Compute-runtime stand-in: a software device with asynchronous streams.
//!
//! A [`ComputeStream`] executes enqueued operations in order on a dedicated
//! worker thread, which is all the ordering the streaming core relies on:
//! fence waits, plane copies and semaphore signals queued on one stream
//! happen sequentially and asynchronously with respect to the caller.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use tracing::debug;

use crate::buffer::{BufObj, ImageLayout, PlaneDesc};
use crate::config::FENCE_FRAME_TIMEOUT;
use crate::error::{Result, StreamError};
use crate::sync::{device_wait, Fence, SyncAttrs, SyncHw, SyncObj, SyncPerm};

/// Sync attribute role at the device boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreRole {
    Signal,
    Wait,
}

/// Handle to one software compute device.
#[derive(Clone)]
pub struct ComputeDevice {
    id: u32,
}

impl ComputeDevice {
    pub fn new(id: u32) -> Result<ComputeDevice> {
        Ok(ComputeDevice { id })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Fill a sync attribute list with this device's requirements.
    pub fn fill_sync_attrs(&self, attrs: &mut SyncAttrs, role: SemaphoreRole) {
        match role {
            SemaphoreRole::Signal => attrs.set_perm(SyncPerm::SignalOnly),
            SemaphoreRole::Wait => attrs.set_perm(SyncPerm::WaitOnly),
        };
        attrs.add_hw(SyncHw::Gpu(self.id));
    }

    /// Import a shared buffer as device-accessible external memory. Only
    /// block-linear images can be tiled through the copy engine.
    pub fn import_external_image(&self, buf: &BufObj) -> Result<ExternalImage> {
        if buf.attrs().layout != Some(ImageLayout::BlockLinear) {
            return Err(StreamError::Hardware(format!(
                "unsupported layout {:?} for external memory import",
                buf.attrs().layout
            )));
        }
        if buf.planes().is_empty() {
            return Err(StreamError::Hardware(
                "external memory import of a planeless buffer".into(),
            ));
        }
        Ok(ExternalImage {
            buf: buf.dup(),
            planes: buf.planes().to_vec(),
        })
    }

    /// Import a reconciled sync object as an external semaphore.
    pub fn import_semaphore(&self, obj: &SyncObj) -> ExternalSemaphore {
        ExternalSemaphore { obj: obj.clone() }
    }

    pub fn alloc_device(&self, len: usize) -> DeviceBuffer {
        DeviceBuffer {
            data: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    /// Page-locked host memory for device-to-host transfers.
    pub fn alloc_host(&self, len: usize) -> HostBuffer {
        HostBuffer {
            data: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    pub fn create_stream(&self) -> Result<ComputeStream> {
        ComputeStream::spawn(self.id)
    }
}

/// Device-side view of an imported image.
#[derive(Clone)]
pub struct ExternalImage {
    buf: BufObj,
    planes: Vec<PlaneDesc>,
}

impl ExternalImage {
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, index: usize) -> Option<&PlaneDesc> {
        self.planes.get(index)
    }
}

#[derive(Clone)]
pub struct ExternalSemaphore {
    obj: SyncObj,
}

#[derive(Clone)]
pub struct DeviceBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

#[derive(Clone)]
pub struct HostBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock().unwrap())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

enum Op {
    Exec(Box<dyn FnOnce() -> Result<()> + Send>),
    Marker(Sender<Result<()>>),
}

/// In-order asynchronous execution queue.
pub struct ComputeStream {
    tx: Sender<Op>,
    err: Arc<Mutex<Option<StreamError>>>,
    worker: Option<thread::JoinHandle<()>>,
}

static STREAM_SEQ: AtomicU32 = AtomicU32::new(0);

impl ComputeStream {
    fn spawn(device: u32) -> Result<ComputeStream> {
        let (tx, rx) = unbounded::<Op>();
        let err = Arc::new(Mutex::new(None));
        let err_worker = Arc::clone(&err);
        let seq = STREAM_SEQ.fetch_add(1, Ordering::Relaxed);
        let worker = thread::Builder::new()
            .name(format!("gpu{device}.stream{seq}"))
            .spawn(move || {
                for op in rx {
                    match op {
                        Op::Exec(f) => {
                            if let Err(e) = f() {
                                let mut slot = err_worker.lock().unwrap();
                                if slot.is_none() {
                                    *slot = Some(e);
                                }
                            }
                        }
                        Op::Marker(ack) => {
                            let taken = err_worker.lock().unwrap().take();
                            let _ = ack.send(match taken {
                                Some(e) => Err(e),
                                None => Ok(()),
                            });
                        }
                    }
                }
                debug!(device, "compute stream drained");
            })
            .map_err(|e| StreamError::Hardware(e.to_string()))?;
        Ok(ComputeStream {
            tx,
            err,
            worker: Some(worker),
        })
    }

    fn enqueue(&self, f: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        self.tx
            .send(Op::Exec(Box::new(f)))
            .map_err(|_| StreamError::Hardware("compute stream gone".into()))
    }

    /// Queue a wait for `fence` ahead of later operations on this stream.
    pub fn wait_semaphore_async(&self, _sem: &ExternalSemaphore, fence: &Fence) -> Result<()> {
        let fence = fence.clone();
        self.enqueue(move || device_wait(&fence, FENCE_FRAME_TIMEOUT))
    }

    /// Queue a signal of `fence` behind earlier operations on this stream.
    pub fn signal_semaphore_async(&self, sem: &ExternalSemaphore, fence: &Fence) -> Result<()> {
        let obj = sem.obj.clone();
        let value = fence.value();
        self.enqueue(move || {
            obj.signal_to(value);
            Ok(())
        })
    }

    /// Tiled-to-pitched copy of one image plane into device memory.
    pub fn copy_plane_to_pitch_async(
        &self,
        image: &ExternalImage,
        plane_index: usize,
        dst: &DeviceBuffer,
        dst_offset: usize,
    ) -> Result<()> {
        let plane = *image
            .plane(plane_index)
            .ok_or(StreamError::Hardware(format!("no plane {plane_index}")))?;
        let src = image.buf.dup();
        let dst = dst.clone();
        self.enqueue(move || {
            let row_bytes = plane.width as usize * plane.bits_per_pixel as usize / 8;
            let rows = plane.height as usize;
            let mut out = dst.data.lock().unwrap();
            let needed = dst_offset + row_bytes * rows;
            if out.len() < needed {
                return Err(StreamError::Hardware(format!(
                    "device buffer too small: {} < {needed}",
                    out.len()
                )));
            }
            src.with_read(|data| {
                for row in 0..rows {
                    let s = plane.offset as usize + row * plane.pitch as usize;
                    let d = dst_offset + row * row_bytes;
                    out[d..d + row_bytes].copy_from_slice(&data[s..s + row_bytes]);
                }
            });
            Ok(())
        })
    }

    pub fn copy_device_to_host_async(&self, src: &DeviceBuffer, dst: &HostBuffer) -> Result<()> {
        let src = src.clone();
        let dst = dst.clone();
        self.enqueue(move || {
            let s = src.data.lock().unwrap();
            let mut d = dst.data.lock().unwrap();
            if d.len() != s.len() {
                return Err(StreamError::Hardware(format!(
                    "host buffer size {} does not match device size {}",
                    d.len(),
                    s.len()
                )));
            }
            d.copy_from_slice(&s);
            Ok(())
        })
    }

    /// Block until every queued operation retired; returns the first error
    /// recorded since the previous synchronize.
    pub fn synchronize(&self) -> Result<()> {
        let (ack_tx, ack_rx) = unbounded();
        self.tx
            .send(Op::Marker(ack_tx))
            .map_err(|_| StreamError::Hardware("compute stream gone".into()))?;
        ack_rx
            .recv()
            .map_err(|_| StreamError::Hardware("compute stream gone".into()))?
    }
}

impl Drop for ComputeStream {
    fn drop(&mut self) {
        // Close the queue, then let the worker drain.
        let (closed_tx, _) = unbounded();
        let _ = std::mem::replace(&mut self.tx, closed_tx);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufAttrs, BufModule, SurfaceFormat};
    use crate::sync::SyncModule;

    fn image(module: &BufModule, w: u32, h: u32) -> BufObj {
        module
            .alloc(&BufAttrs::image(
                w,
                h,
                SurfaceFormat::Yuv420SemiPlanar,
                ImageLayout::BlockLinear,
            ))
            .unwrap()
    }

    #[test]
    fn pitch_layout_is_rejected_at_import() {
        let module = BufModule::open();
        let buf = module
            .alloc(&BufAttrs::image(
                16,
                16,
                SurfaceFormat::Yuv420SemiPlanar,
                ImageLayout::Pitch,
            ))
            .unwrap();
        let device = ComputeDevice::new(0).unwrap();
        assert!(device.import_external_image(&buf).is_err());
    }

    #[test]
    fn plane_copies_and_readback_preserve_payload() {
        let module = BufModule::open();
        let buf = image(&module, 8, 4);
        buf.with_write(|d| {
            for (i, b) in d.iter_mut().enumerate() {
                *b = i as u8;
            }
        });

        let device = ComputeDevice::new(0).unwrap();
        let img = device.import_external_image(&buf).unwrap();
        let stream = device.create_stream().unwrap();
        let total = buf.size();
        let dev = device.alloc_device(total);
        let host = device.alloc_host(total);

        stream.copy_plane_to_pitch_async(&img, 0, &dev, 0).unwrap();
        stream
            .copy_plane_to_pitch_async(&img, 1, &dev, 8 * 4)
            .unwrap();
        stream.copy_device_to_host_async(&dev, &host).unwrap();
        stream.synchronize().unwrap();

        let expect: Vec<u8> = (0..total).map(|i| i as u8).collect();
        assert_eq!(host.to_vec(), expect);
    }

    #[test]
    fn stream_orders_wait_before_copy() {
        let sync_module = SyncModule::open();
        let mut attrs = SyncAttrs::new();
        attrs.set_perm(SyncPerm::WaitSignal).set_need_cpu_access(true);
        let obj = sync_module.alloc(&attrs).unwrap();

        let device = ComputeDevice::new(0).unwrap();
        let stream = device.create_stream().unwrap();
        let sem = device.import_semaphore(&obj);

        let fence = obj.generate_fence();
        stream.wait_semaphore_async(&sem, &fence).unwrap();
        let post = obj.generate_fence();
        stream.signal_semaphore_async(&sem, &post).unwrap();

        assert!(!post.is_signaled());
        obj.signal();
        stream.synchronize().unwrap();
        assert!(post.is_signaled());
    }
}
