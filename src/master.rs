//! Process master: owns the process-wide module handles, one channel per
//! sensor, and the queue drainer threads around the frame source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use crate::buffer::BufModule;
use crate::channel::{
    Channel, ConsumerType, IpcConsumerChannel, IpcProducerChannel, SingleProcessChannel,
};
use crate::config::{AppType, ModuleInfo, MAX_NUM_SENSORS};
use crate::consumer::DumpConfig;
use crate::error::{Result, StreamError};
use crate::source::{CapturedFrame, DeviceBlockNotification, FrameSource, PipelineNotification};
use crate::sync::SyncModule;
use crate::transport::IpcTransport;

const QUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-sensor frame counter sampled by the main loop for FPS reporting.
pub struct Profiler {
    sensor: u32,
    frame_count: AtomicU64,
    prev_frame_count: AtomicU64,
}

impl Profiler {
    pub fn new(sensor: u32) -> Arc<Profiler> {
        Arc::new(Profiler {
            sensor,
            frame_count: AtomicU64::new(0),
            prev_frame_count: AtomicU64::new(0),
        })
    }

    pub fn sensor(&self) -> u32 {
        self.sensor
    }

    pub fn on_frame_available(&self) {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_frames(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Frames since the previous sample.
    pub fn sample_delta(&self) -> u64 {
        let current = self.frame_count.load(Ordering::Relaxed);
        let prev = self.prev_frame_count.swap(current, Ordering::Relaxed);
        current - prev
    }
}

/// Per-process master: module handles, channels, frame routing.
pub struct Master {
    app_type: AppType,
    buf_module: BufModule,
    sync_module: SyncModule,
    transport: Arc<dyn IpcTransport>,
    source: Arc<dyn FrameSource>,
    dump: DumpConfig,
    consumer_id: u32,
    channels: Mutex<HashMap<u32, Box<dyn Channel>>>,
}

impl Master {
    pub fn new(
        app_type: AppType,
        source: Arc<dyn FrameSource>,
        transport: Arc<dyn IpcTransport>,
        dump: DumpConfig,
        consumer_id: u32,
    ) -> Master {
        Master {
            app_type,
            buf_module: BufModule::open(),
            sync_module: SyncModule::open(),
            transport,
            source,
            dump,
            consumer_id,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn app_type(&self) -> AppType {
        self.app_type
    }

    pub fn buf_module(&self) -> BufModule {
        self.buf_module.clone()
    }

    pub fn sync_module(&self) -> SyncModule {
        self.sync_module.clone()
    }

    /// Bind one channel to a sensor and create its blocks.
    pub fn register_source(&self, module: &ModuleInfo, profiler: Arc<Profiler>) -> Result<()> {
        if module.sensor_id as usize >= MAX_NUM_SENSORS {
            return Err(StreamError::Config(format!(
                "invalid sensor id {}",
                module.sensor_id
            )));
        }
        let mut channel: Box<dyn Channel> = match self.app_type {
            AppType::SingleProcess => Box::new(SingleProcessChannel::new(
                module.clone(),
                self.buf_module.clone(),
                self.sync_module.clone(),
                Arc::clone(&self.source),
                self.dump.clone(),
                profiler,
            )),
            AppType::IpcProducer => Box::new(IpcProducerChannel::new(
                module.clone(),
                self.buf_module.clone(),
                self.sync_module.clone(),
                Arc::clone(&self.source),
                Arc::clone(&self.transport),
                self.dump.clone(),
                profiler,
            )),
            AppType::IpcCudaConsumer | AppType::IpcEncConsumer => {
                let consumer_type = if self.app_type == AppType::IpcCudaConsumer {
                    ConsumerType::Cuda
                } else {
                    ConsumerType::Enc
                };
                Box::new(IpcConsumerChannel::new(
                    module.clone(),
                    self.buf_module.clone(),
                    self.sync_module.clone(),
                    Arc::clone(&self.transport),
                    consumer_type,
                    self.consumer_id,
                    self.dump.clone(),
                    profiler,
                ))
            }
        };
        channel.create_blocks()?;
        self.channels
            .lock()
            .unwrap()
            .insert(module.sensor_id, channel);
        Ok(())
    }

    /// Connect, initialize and reconcile every channel.
    pub fn init_stream(&self) -> Result<()> {
        info!("master: init stream");
        let mut channels = self.channels.lock().unwrap();
        for (sensor, channel) in channels.iter_mut() {
            debug!(sensor = *sensor, channel = channel.name(), "connect");
            channel.connect()?;
            channel.init_blocks()?;
            channel.reconcile()?;
        }
        Ok(())
    }

    pub fn start_stream(&self) {
        for channel in self.channels.lock().unwrap().values_mut() {
            channel.start();
        }
    }

    pub fn stop_stream(&self) {
        for channel in self.channels.lock().unwrap().values_mut() {
            channel.stop();
        }
    }

    /// Route a captured frame to its sensor's producer.
    pub fn on_frame_available(&self, sensor: u32, frame: CapturedFrame) -> Result<()> {
        let channels = self.channels.lock().unwrap();
        let channel = channels
            .get(&sensor)
            .ok_or(StreamError::Config(format!("no channel for sensor {sensor}")))?;
        channel.post(frame)
    }

    /// True once any channel's runtime workers gave up.
    pub fn any_channel_stopped(&self) -> bool {
        self.channels
            .lock()
            .unwrap()
            .values()
            .any(|c| !c.running())
    }

    /// Tear all channels down; must precede dropping the module handles.
    pub fn deinit(&self) {
        self.channels.lock().unwrap().clear();
        debug!("master released all channels");
    }
}

/// Drains one sensor's frame completion queue into the master.
pub struct FrameQueueHandler {
    quit: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FrameQueueHandler {
    pub fn spawn(
        sensor: u32,
        queue: Receiver<CapturedFrame>,
        master: Arc<Master>,
    ) -> FrameQueueHandler {
        let quit = Arc::new(AtomicBool::new(false));
        let quit_thread = Arc::clone(&quit);
        let thread = thread::Builder::new()
            .name(format!("framequeue{sensor}"))
            .spawn(move || {
                while !quit_thread.load(Ordering::Acquire) {
                    match queue.recv_timeout(QUEUE_TIMEOUT) {
                        Ok(frame) => {
                            if let Err(e) = master.on_frame_available(sensor, frame) {
                                error!(sensor, error = %e, "frame routing failed");
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            warn!(sensor, "frame completion queue timeout");
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .ok();
        FrameQueueHandler { quit, thread }
    }

    pub fn stop(&mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for FrameQueueHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drains one sensor's pipeline notification queue, counting frame drops and
/// latching fatal errors.
pub struct NotificationHandler {
    sensor: u32,
    quit: Arc<AtomicBool>,
    in_error: Arc<AtomicBool>,
    frame_drops: Arc<AtomicU64>,
    thread: Option<thread::JoinHandle<()>>,
}

impl NotificationHandler {
    pub fn spawn(
        sensor: u32,
        queue: Receiver<PipelineNotification>,
        ignore_errors: bool,
    ) -> NotificationHandler {
        let quit = Arc::new(AtomicBool::new(false));
        let in_error = Arc::new(AtomicBool::new(false));
        let frame_drops = Arc::new(AtomicU64::new(0));
        let (quit_t, err_t, drops_t) = (quit.clone(), in_error.clone(), frame_drops.clone());
        let thread = thread::Builder::new()
            .name(format!("pipenotify{sensor}"))
            .spawn(move || {
                while !quit_t.load(Ordering::Acquire) {
                    match queue.recv_timeout(QUEUE_TIMEOUT) {
                        Ok(n) => {
                            match n {
                                PipelineNotification::FrameDrop => {
                                    warn!(sensor, "frame drop");
                                    drops_t.fetch_add(1, Ordering::Relaxed);
                                }
                                PipelineNotification::ProcessingDone => {
                                    debug!(sensor, "processing done")
                                }
                                other => warn!(sensor, notification = ?other, "pipeline event"),
                            }
                            if n.is_fatal(ignore_errors) {
                                error!(sensor, notification = ?n, "fatal pipeline error");
                                err_t.store(true, Ordering::Release);
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => debug!(sensor, "queue timeout"),
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .ok();
        NotificationHandler {
            sensor,
            quit,
            in_error,
            frame_drops,
            thread,
        }
    }

    pub fn sensor(&self) -> u32 {
        self.sensor
    }

    pub fn is_in_error(&self) -> bool {
        self.in_error.load(Ordering::Acquire)
    }

    pub fn num_frame_drops(&self) -> u64 {
        self.frame_drops.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for NotificationHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drains one device block's notification queue.
pub struct DeviceBlockHandler {
    block: usize,
    quit: Arc<AtomicBool>,
    in_error: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DeviceBlockHandler {
    pub fn spawn(
        block: usize,
        queue: Receiver<DeviceBlockNotification>,
        ignore_errors: bool,
    ) -> DeviceBlockHandler {
        let quit = Arc::new(AtomicBool::new(false));
        let in_error = Arc::new(AtomicBool::new(false));
        let (quit_t, err_t) = (quit.clone(), in_error.clone());
        let thread = thread::Builder::new()
            .name(format!("devblkevent{block}"))
            .spawn(move || {
                while !quit_t.load(Ordering::Acquire) {
                    match queue.recv_timeout(QUEUE_TIMEOUT) {
                        Ok(n) => {
                            if n.is_fatal(ignore_errors) {
                                error!(block, notification = ?n, "device block error");
                                err_t.store(true, Ordering::Release);
                            } else {
                                warn!(block, notification = ?n, "device block event ignored");
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => debug!(block, "queue timeout"),
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .ok();
        DeviceBlockHandler {
            block,
            quit,
            in_error,
            thread,
        }
    }

    pub fn block(&self) -> usize {
        self.block
    }

    pub fn is_in_error(&self) -> bool {
        self.in_error.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for DeviceBlockHandler {
    fn drop(&mut self) {
        self.stop();
    }
}
