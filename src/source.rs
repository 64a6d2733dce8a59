//! Frame source contract and the synthetic test-pattern implementation.
//!
//! The streaming core only ever talks to [`FrameSource`]: it fills sync
//! attributes, registers buffers and sync objects, starts/stops capture and
//! drains the per-sensor completion and notification queues. The synthetic
//! source writes YUV 4:2:0 semi-planar test frames directly into the
//! registered processed-output buffers, honoring any pre-fences inserted on
//! a buffer before overwriting it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use tracing::{debug, warn};

use crate::buffer::{AccessPerm, BufAttrs, BufObj, ImageLayout, SurfaceFormat};
use crate::config::{ModuleInfo, PlatformCfg, FENCE_FRAME_TIMEOUT};
use crate::error::{Result, StreamError};
use crate::sync::{Fence, SyncAttrs, SyncHw, SyncObj, SyncPerm};

/// Role of a sync object at the frame-source boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    /// The source signals this object when a frame's pixels are coherent.
    EofSignaler,
    /// The source waits on fences from this object before buffer reuse.
    PreWaiter,
}

/// Which output of the capture pipeline an image attribute query refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Raw capture output.
    Capture,
    /// Processed (display-ready) output.
    Processed,
}

/// Fixed-size scalar metadata carried in each packet's meta element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMetadata {
    pub capture_tsc: u64,
    pub frame_count: u64,
}

impl FrameMetadata {
    pub const SIZE: u64 = 16;

    pub fn write_to(&self, buf: &BufObj) {
        buf.with_write(|d| {
            d[0..8].copy_from_slice(&self.capture_tsc.to_le_bytes());
            d[8..16].copy_from_slice(&self.frame_count.to_le_bytes());
        });
    }

    pub fn read_from(buf: &BufObj) -> FrameMetadata {
        buf.with_read(|d| FrameMetadata {
            capture_tsc: u64::from_le_bytes(d[0..8].try_into().unwrap_or_default()),
            frame_count: u64::from_le_bytes(d[8..16].try_into().unwrap_or_default()),
        })
    }
}

/// Pipeline events delivered on the per-sensor notification queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineNotification {
    ProcessingDone,
    FrameDrop,
    FrameDiscontinuity,
    CaptureTimeout,
    BadInputStream,
    CaptureFailure,
    InternalFailure,
}

impl PipelineNotification {
    /// Whether this event can be waived by the ignore-error switch.
    pub fn is_fatal(self, ignore_errors: bool) -> bool {
        match self {
            PipelineNotification::ProcessingDone
            | PipelineNotification::FrameDrop
            | PipelineNotification::FrameDiscontinuity
            | PipelineNotification::CaptureTimeout => false,
            PipelineNotification::BadInputStream => !ignore_errors,
            PipelineNotification::CaptureFailure | PipelineNotification::InternalFailure => true,
        }
    }
}

/// Events delivered on the per-device-block notification queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBlockNotification {
    DeserializerFailure,
    SerializerFailure,
    SensorFailure,
    InternalFailure,
}

impl DeviceBlockNotification {
    pub fn is_fatal(self, ignore_errors: bool) -> bool {
        match self {
            DeviceBlockNotification::InternalFailure => true,
            _ => !ignore_errors,
        }
    }
}

/// One captured frame handed to the producer. Dropping it returns the
/// underlying buffer to the source for reuse.
pub struct CapturedFrame {
    tag: u64,
    meta: FrameMetadata,
    eof: Option<Fence>,
    slot: usize,
    prefences: Arc<Mutex<Vec<Fence>>>,
    free_tx: Sender<usize>,
}

impl CapturedFrame {
    /// Tag bound to the underlying image at registration time.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn metadata(&self) -> FrameMetadata {
        self.meta
    }

    /// Fence that signals once the frame's pixels are coherent.
    pub fn eof_fence(&self) -> Option<Fence> {
        self.eof.clone()
    }

    /// Insert a fence the source must honor before overwriting this buffer.
    pub fn add_prefence(&self, fence: Fence) {
        self.prefences.lock().unwrap().push(fence);
    }
}

impl Drop for CapturedFrame {
    fn drop(&mut self) {
        let _ = self.free_tx.send(self.slot);
    }
}

/// Contract between the streaming core and the camera driver.
pub trait FrameSource: Send + Sync {
    fn fill_sync_attrs(&self, sensor: u32, role: SyncRole, attrs: &mut SyncAttrs) -> Result<()>;
    fn register_sync(&self, sensor: u32, role: SyncRole, obj: SyncObj) -> Result<()>;
    fn image_attrs(&self, sensor: u32, output: OutputKind) -> Result<BufAttrs>;
    /// Register image buffers, each bound to a caller-chosen tag that later
    /// identifies the frame on the completion queue.
    fn register_images(&self, sensor: u32, output: OutputKind, images: Vec<(u64, BufObj)>)
        -> Result<()>;
    fn register_tuning_blob(&self, sensor: u32, blob: Vec<u8>) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn stop(&self);
    fn completion_queue(&self, sensor: u32) -> Result<Receiver<CapturedFrame>>;
    fn notification_queue(&self, sensor: u32) -> Result<Receiver<PipelineNotification>>;
    fn device_notification_queue(&self, block: usize) -> Result<Receiver<DeviceBlockNotification>>;
}

struct Slot {
    tag: u64,
    buf: BufObj,
    prefences: Arc<Mutex<Vec<Fence>>>,
}

struct SensorState {
    module: ModuleInfo,
    slots: Mutex<Vec<Slot>>,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
    completion_tx: Sender<CapturedFrame>,
    completion_rx: Receiver<CapturedFrame>,
    notify_tx: Sender<PipelineNotification>,
    notify_rx: Receiver<PipelineNotification>,
    eof_sync: Mutex<Option<SyncObj>>,
    tuning_blob: Mutex<Option<Vec<u8>>>,
    frame_count: AtomicU64,
}

/// Software frame source generating deterministic test patterns.
pub struct SyntheticSource {
    sensors: HashMap<u32, Arc<SensorState>>,
    device_queues: Vec<(Sender<DeviceBlockNotification>, Receiver<DeviceBlockNotification>)>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    epoch: Instant,
}

impl SyntheticSource {
    pub fn new(cfg: &PlatformCfg) -> Arc<SyntheticSource> {
        let mut sensors = HashMap::new();
        for module in cfg.modules() {
            let (free_tx, free_rx) = unbounded();
            let (completion_tx, completion_rx) = unbounded();
            let (notify_tx, notify_rx) = unbounded();
            sensors.insert(
                module.sensor_id,
                Arc::new(SensorState {
                    module: module.clone(),
                    slots: Mutex::new(Vec::new()),
                    free_tx,
                    free_rx,
                    completion_tx,
                    completion_rx,
                    notify_tx,
                    notify_rx,
                    eof_sync: Mutex::new(None),
                    tuning_blob: Mutex::new(None),
                    frame_count: AtomicU64::new(0),
                }),
            );
        }
        let device_queues = cfg.device_blocks.iter().map(|_| unbounded()).collect();
        Arc::new(SyntheticSource {
            sensors,
            device_queues,
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            epoch: Instant::now(),
        })
    }

    fn sensor(&self, sensor: u32) -> Result<&Arc<SensorState>> {
        self.sensors
            .get(&sensor)
            .ok_or(StreamError::Config(format!("unknown sensor {sensor}")))
    }

    /// Test hook: push a pipeline notification as the driver would.
    pub fn inject_notification(&self, sensor: u32, n: PipelineNotification) -> Result<()> {
        let state = self.sensor(sensor)?;
        state
            .notify_tx
            .send(n)
            .map_err(|_| StreamError::Disconnected)
    }

    /// Test hook: push a device-block notification.
    pub fn inject_device_notification(
        &self,
        block: usize,
        n: DeviceBlockNotification,
    ) -> Result<()> {
        let queue = self
            .device_queues
            .get(block)
            .ok_or(StreamError::Config(format!("unknown device block {block}")))?;
        queue.0.send(n).map_err(|_| StreamError::Disconnected)
    }

    fn capture_loop(state: Arc<SensorState>, running: Arc<AtomicBool>, epoch: Instant) {
        let interval = Duration::from_secs(1) / state.module.fps.max(1);
        while running.load(Ordering::Relaxed) {
            thread::sleep(interval);
            if !running.load(Ordering::Relaxed) {
                break;
            }
            let slot_idx = match state.free_rx.try_recv() {
                Ok(i) => i,
                Err(TryRecvError::Empty) => {
                    // All buffers are downstream; this frame is lost.
                    let _ = state.notify_tx.send(PipelineNotification::FrameDrop);
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
            };

            let (tag, buf, prefences) = {
                let slots = state.slots.lock().unwrap();
                let slot = &slots[slot_idx];
                (slot.tag, slot.buf.dup(), Arc::clone(&slot.prefences))
            };

            // Consumers from the previous cycle must be done with the buffer.
            let mut pending: Vec<Fence> = prefences.lock().unwrap().drain(..).collect();
            let mut blocked = false;
            while let Some(fence) = pending.first().cloned() {
                if crate::sync::device_wait(&fence, FENCE_FRAME_TIMEOUT).is_err() {
                    let _ = state.notify_tx.send(PipelineNotification::CaptureTimeout);
                    blocked = true;
                    break;
                }
                pending.remove(0);
            }
            if blocked {
                // Unresolved fences stay with the slot; try again next cycle.
                let mut guard = prefences.lock().unwrap();
                pending.extend(guard.drain(..));
                *guard = pending;
                drop(guard);
                let _ = state.free_tx.send(slot_idx);
                continue;
            }

            let frame_count = state.frame_count.fetch_add(1, Ordering::Relaxed) + 1;
            write_test_pattern(&buf, frame_count);
            let meta = FrameMetadata {
                capture_tsc: epoch.elapsed().as_micros() as u64,
                frame_count,
            };

            let eof = state.eof_sync.lock().unwrap().as_ref().map(|obj| {
                let fence = obj.generate_fence();
                obj.signal();
                fence
            });

            let frame = CapturedFrame {
                tag,
                meta,
                eof,
                slot: slot_idx,
                prefences,
                free_tx: state.free_tx.clone(),
            };
            if state.completion_tx.send(frame).is_err() {
                break;
            }
        }
        debug!(sensor = state.module.sensor_id, "capture loop exited");
    }
}

/// Deterministic YUV 4:2:0 pattern: a luma gradient shifted by frame number.
fn write_test_pattern(buf: &BufObj, frame: u64) {
    let planes = buf.planes().to_vec();
    buf.with_write(|d| {
        if planes.len() == 2 {
            let y = &planes[0];
            for row in 0..y.height as usize {
                for col in 0..y.width as usize {
                    d[row * y.pitch as usize + col] =
                        ((row + col + frame as usize) & 0xFF) as u8;
                }
            }
            let uv = &planes[1];
            let base = uv.offset as usize;
            for i in 0..(uv.pitch as usize * uv.height as usize) {
                d[base + i] = 0x80;
            }
        } else {
            for (i, b) in d.iter_mut().enumerate() {
                *b = ((i as u64 + frame) & 0xFF) as u8;
            }
        }
    });
}

impl FrameSource for SyntheticSource {
    fn fill_sync_attrs(&self, sensor: u32, role: SyncRole, attrs: &mut SyncAttrs) -> Result<()> {
        self.sensor(sensor)?;
        match role {
            SyncRole::EofSignaler => {
                attrs.set_perm(SyncPerm::SignalOnly).add_hw(SyncHw::Capture);
            }
            SyncRole::PreWaiter => {
                attrs.set_perm(SyncPerm::WaitOnly).add_hw(SyncHw::Capture);
            }
        }
        Ok(())
    }

    fn register_sync(&self, sensor: u32, role: SyncRole, obj: SyncObj) -> Result<()> {
        let state = self.sensor(sensor)?;
        match role {
            SyncRole::EofSignaler => {
                *state.eof_sync.lock().unwrap() = Some(obj);
                Ok(())
            }
            SyncRole::PreWaiter => Err(StreamError::Hardware(
                "capture unit cannot register foreign waiter objects".into(),
            )),
        }
    }

    fn image_attrs(&self, sensor: u32, output: OutputKind) -> Result<BufAttrs> {
        let state = self.sensor(sensor)?;
        let m = &state.module;
        let mut attrs = match output {
            OutputKind::Capture => {
                // Raw bayer-style output, two bytes per photosite.
                BufAttrs::raw(u64::from(m.width) * u64::from(m.height) * 2, 64)
            }
            OutputKind::Processed => BufAttrs::image(
                m.width,
                m.height,
                SurfaceFormat::Yuv420SemiPlanar,
                ImageLayout::BlockLinear,
            ),
        };
        attrs.set_perm(AccessPerm::ReadWrite).set_need_cpu_access(true);
        Ok(attrs)
    }

    fn register_images(
        &self,
        sensor: u32,
        output: OutputKind,
        images: Vec<(u64, BufObj)>,
    ) -> Result<()> {
        let state = self.sensor(sensor)?;
        if output != OutputKind::Processed {
            // Raw capture buffers are owned by the driver; nothing to stream.
            return Ok(());
        }
        let mut slots = state.slots.lock().unwrap();
        if !slots.is_empty() {
            return Err(StreamError::Config(format!(
                "sensor {sensor} images already registered"
            )));
        }
        for (idx, (tag, buf)) in images.into_iter().enumerate() {
            slots.push(Slot {
                tag,
                buf,
                prefences: Arc::new(Mutex::new(Vec::new())),
            });
            let _ = state.free_tx.send(idx);
        }
        Ok(())
    }

    fn register_tuning_blob(&self, sensor: u32, blob: Vec<u8>) -> Result<()> {
        let state = self.sensor(sensor)?;
        if blob.is_empty() {
            return Err(StreamError::Config(format!(
                "empty tuning blob for sensor {sensor}"
            )));
        }
        *state.tuning_blob.lock().unwrap() = Some(blob);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut threads = self.threads.lock().unwrap();
        for state in self.sensors.values() {
            if state.slots.lock().unwrap().is_empty() {
                warn!(
                    sensor = state.module.sensor_id,
                    "starting capture with no registered buffers"
                );
            }
            let state = Arc::clone(state);
            let running = Arc::clone(&self.running);
            let epoch = self.epoch;
            let name = format!("capture{}", state.module.sensor_id);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || Self::capture_loop(state, running, epoch))
                .map_err(|e| StreamError::Hardware(e.to_string()))?;
            threads.push(handle);
        }
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }

    fn completion_queue(&self, sensor: u32) -> Result<Receiver<CapturedFrame>> {
        Ok(self.sensor(sensor)?.completion_rx.clone())
    }

    fn notification_queue(&self, sensor: u32) -> Result<Receiver<PipelineNotification>> {
        Ok(self.sensor(sensor)?.notify_rx.clone())
    }

    fn device_notification_queue(
        &self,
        block: usize,
    ) -> Result<Receiver<DeviceBlockNotification>> {
        self.device_queues
            .get(block)
            .map(|(_, rx)| rx.clone())
            .ok_or(StreamError::Config(format!("unknown device block {block}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufModule;
    use crate::config::PlatformCfg;

    fn small_cfg() -> PlatformCfg {
        let mut cfg = PlatformCfg::by_name("SIM480P_QUAD").unwrap();
        cfg.apply_masks(&[0b0001]);
        cfg
    }

    #[test]
    fn ignore_errors_waives_only_recoverable_kinds() {
        assert!(!PipelineNotification::BadInputStream.is_fatal(true));
        assert!(PipelineNotification::BadInputStream.is_fatal(false));
        assert!(PipelineNotification::CaptureFailure.is_fatal(true));
        assert!(!PipelineNotification::FrameDrop.is_fatal(false));
        assert!(!DeviceBlockNotification::SensorFailure.is_fatal(true));
        assert!(DeviceBlockNotification::InternalFailure.is_fatal(true));
    }

    #[test]
    fn metadata_round_trips_through_meta_buffer() {
        let module = BufModule::open();
        let buf = module
            .alloc(&BufAttrs::raw(64, 1))
            .unwrap();
        let meta = FrameMetadata {
            capture_tsc: 0xDEAD_BEEF,
            frame_count: 42,
        };
        meta.write_to(&buf);
        assert_eq!(FrameMetadata::read_from(&buf), meta);
    }

    #[test]
    fn frames_flow_and_buffers_recycle() {
        let cfg = small_cfg();
        let source = SyntheticSource::new(&cfg);
        let module = BufModule::open();
        let attrs = source.image_attrs(0, OutputKind::Processed).unwrap();
        let images: Vec<(u64, BufObj)> = (0..2)
            .map(|i| (100 + i, module.alloc(&attrs).unwrap()))
            .collect();
        source
            .register_images(0, OutputKind::Processed, images)
            .unwrap();

        let queue = source.completion_queue(0).unwrap();
        source.start().unwrap();
        let first = queue.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(first.tag() == 100 || first.tag() == 101);
        assert_eq!(first.metadata().frame_count, 1);
        let tag = first.tag();
        drop(first);

        // With both slots cycling, the same tag must come around again.
        let mut seen_again = false;
        for _ in 0..8 {
            let f = queue.recv_timeout(Duration::from_secs(5)).unwrap();
            let t = f.tag();
            drop(f);
            if t == tag {
                seen_again = true;
                break;
            }
        }
        source.stop();
        assert!(seen_again);
    }

    #[test]
    fn drops_are_reported_when_no_buffer_is_free() {
        let cfg = small_cfg();
        let source = SyntheticSource::new(&cfg);
        let module = BufModule::open();
        let attrs = source.image_attrs(0, OutputKind::Processed).unwrap();
        let images = vec![(7u64, module.alloc(&attrs).unwrap())];
        source
            .register_images(0, OutputKind::Processed, images)
            .unwrap();

        let queue = source.completion_queue(0).unwrap();
        let notifications = source.notification_queue(0).unwrap();
        source.start().unwrap();
        // Hold the only buffer; subsequent cycles must report drops.
        let _held = queue.recv_timeout(Duration::from_secs(5)).unwrap();
        let n = notifications.recv_timeout(Duration::from_secs(5)).unwrap();
        source.stop();
        assert_eq!(n, PipelineNotification::FrameDrop);
    }

    #[test]
    fn prefence_blocks_buffer_reuse() {
        use crate::sync::{SyncAttrs, SyncModule, SyncPerm};

        let cfg = small_cfg();
        let source = SyntheticSource::new(&cfg);
        let module = BufModule::open();
        let attrs = source.image_attrs(0, OutputKind::Processed).unwrap();
        source
            .register_images(0, OutputKind::Processed, vec![(1, module.alloc(&attrs).unwrap())])
            .unwrap();

        let sync_module = SyncModule::open();
        let mut a = SyncAttrs::new();
        a.set_perm(SyncPerm::WaitSignal).set_need_cpu_access(true);
        let obj = sync_module.alloc(&a).unwrap();

        let queue = source.completion_queue(0).unwrap();
        let notifications = source.notification_queue(0).unwrap();
        source.start().unwrap();

        let frame = queue.recv_timeout(Duration::from_secs(5)).unwrap();
        frame.add_prefence(obj.generate_fence());
        drop(frame);

        // The unsignaled fence forces a capture timeout instead of reuse.
        let mut timed_out = false;
        for _ in 0..10 {
            match notifications.recv_timeout(Duration::from_secs(5)) {
                Ok(PipelineNotification::CaptureTimeout) => {
                    timed_out = true;
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        source.stop();
        assert!(timed_out);
    }
}
