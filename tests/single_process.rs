//! End-to-end: one sensor, GPU + encoder consumers in one process.

use std::sync::Arc;
use std::time::Duration;

use cam_multicast::buffer::{AccessPerm, BufAttrs, ImageLayout, SurfaceFormat};
use cam_multicast::channel::{EventHandler, EventStatus};
use cam_multicast::config::{
    AppType, DeviceBlockInfo, ModuleInfo, PlatformCfg, DUMP_END_FRAME, DUMP_START_FRAME,
    ELEMENT_NAME_DATA,
};
use cam_multicast::consumer::DumpConfig;
use cam_multicast::encode::{count_nal_units, IDR_NAL, SPS_NAL};
use cam_multicast::fabric::{SetupStep, StreamEvent, StreamHub};
use cam_multicast::master::{Master, Profiler};
use cam_multicast::pool::PoolManager;
use cam_multicast::source::{FrameSource, SyntheticSource};
use cam_multicast::transport::MemoryTransport;

const W: u32 = 64;
const H: u32 = 48;

fn test_platform() -> PlatformCfg {
    PlatformCfg {
        name: "test".into(),
        device_blocks: vec![DeviceBlockInfo {
            modules: vec![ModuleInfo {
                name: "testcam0".into(),
                sensor_id: 0,
                link_index: 0,
                width: W,
                height: H,
                fps: 250,
            }],
        }],
    }
}

fn build_master(dump: DumpConfig) -> (Arc<Master>, Arc<SyntheticSource>, Arc<Profiler>) {
    let platform = test_platform();
    let source = SyntheticSource::new(&platform);
    let source_dyn: Arc<dyn FrameSource> = source.clone();
    let master = Arc::new(Master::new(
        AppType::SingleProcess,
        source_dyn,
        Arc::new(MemoryTransport::new()),
        dump,
        0,
    ));
    let profiler = Profiler::new(0);
    let module = platform.modules().next().unwrap().clone();
    master.register_source(&module, Arc::clone(&profiler)).unwrap();
    (master, source, profiler)
}

#[test]
fn frames_reach_both_consumers_and_dumps_have_expected_shape() {
    let dir = tempfile::tempdir().unwrap();
    let dump = DumpConfig {
        enabled: true,
        dir: dir.path().to_path_buf(),
    };
    let (master, source, profiler) = build_master(dump);

    master.init_stream().unwrap();
    master.start_stream();

    let queue = source.completion_queue(0).unwrap();
    source.start().unwrap();

    // Route enough frames for both consumers to pass the dump window.
    let mut posts = 0u64;
    while posts < 250 {
        let frame = queue
            .recv_timeout(Duration::from_secs(10))
            .expect("frame source stalled");
        master.on_frame_available(0, frame).expect("post failed");
        posts += 1;
    }
    assert_eq!(profiler.total_frames(), 250);
    assert!(!master.any_channel_stopped(), "channel died mid-stream");

    // Let in-flight packets drain before stopping.
    std::thread::sleep(Duration::from_millis(300));
    source.stop();
    master.stop_stream();
    master.deinit();

    // GPU dump: every processed frame in [start, end] as raw 4:2:0.
    let frame_size = (W * H * 3 / 2) as u64;
    let gpu_dump = std::fs::metadata(dir.path().join("multicast_cuda0.yuv")).unwrap();
    let dumped_frames = DUMP_END_FRAME - DUMP_START_FRAME + 1;
    assert_eq!(gpu_dump.len(), dumped_frames * frame_size);

    // Encoder dump: only even frames inside the window, with SPS on IDR.
    let enc_dump = std::fs::read(dir.path().join("multicast_enc0.h264")).unwrap();
    assert!(!enc_dump.is_empty());
    let slices = count_nal_units(&enc_dump, IDR_NAL) + count_nal_units(&enc_dump, 0x41);
    assert_eq!(slices, 21);
    let sps = count_nal_units(&enc_dump, SPS_NAL);
    assert!(sps >= 1, "no parameter sets in the bitstream");
}

#[test]
fn start_stop_cycles_leave_no_allocations() {
    for cycle in 0..3 {
        let (master, source, _profiler) = build_master(DumpConfig::default());
        let buf_module = master.buf_module();
        let sync_module = master.sync_module();

        master.init_stream().unwrap();
        master.start_stream();
        master.stop_stream();
        master.deinit();
        drop(master);
        source.stop();
        drop(source);

        assert_eq!(buf_module.live_objects(), 0, "buffer leak in cycle {cycle}");
        assert_eq!(sync_module.live_objects(), 0, "sync leak in cycle {cycle}");
    }
}

#[test]
fn stop_without_frames_completes_promptly() {
    let (master, source, _profiler) = build_master(DumpConfig::default());
    master.init_stream().unwrap();
    master.start_stream();

    // No frame is ever posted; stop must still finish within the query
    // timeout budget.
    let started = std::time::Instant::now();
    master.stop_stream();
    assert!(started.elapsed() < Duration::from_secs(2));
    master.deinit();
    source.stop();
}

#[test]
fn notification_drainers_honor_the_ignore_switch() {
    use cam_multicast::master::NotificationHandler;
    use cam_multicast::source::PipelineNotification;

    let platform = test_platform();
    let source = SyntheticSource::new(&platform);

    let mut lenient = NotificationHandler::spawn(0, source.notification_queue(0).unwrap(), true);
    source
        .inject_notification(0, PipelineNotification::BadInputStream)
        .unwrap();
    source
        .inject_notification(0, PipelineNotification::FrameDrop)
        .unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while lenient.num_frame_drops() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(lenient.num_frame_drops(), 1);
    assert!(!lenient.is_in_error(), "-I must waive a bad input stream");
    lenient.stop();

    let strict = NotificationHandler::spawn(0, source.notification_queue(0).unwrap(), false);
    source
        .inject_notification(0, PipelineNotification::CaptureFailure)
        .unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !strict.is_in_error() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(strict.is_in_error());
}

#[test]
fn unreconcilable_element_attributes_abort_setup() {
    let hub = StreamHub::new("mismatch");
    let pool_block = hub.create_static_pool(6);
    let mut pool = PoolManager::new(pool_block, 0, cam_multicast::buffer::BufModule::open());
    let producer = hub.create_producer(&pool.block()).unwrap();
    let queue = hub.create_mailbox_queue();
    let consumer = hub.create_consumer(&queue).unwrap();
    producer.connect(&consumer).unwrap();

    for block in [&producer, &consumer, &pool.block()] {
        assert_eq!(
            block.event_query(Duration::from_secs(1)).unwrap(),
            StreamEvent::Connected
        );
    }
    pool.init().unwrap();

    // Producer offers block-linear, the consumer demands pitch layout.
    let mut prod_attrs = BufAttrs::image(
        W,
        H,
        SurfaceFormat::Yuv420SemiPlanar,
        ImageLayout::BlockLinear,
    );
    prod_attrs.set_perm(AccessPerm::ReadWrite);
    producer.element_attr_set(ELEMENT_NAME_DATA, prod_attrs).unwrap();
    producer
        .setup_status_set(SetupStep::ElementExport, true)
        .unwrap();

    let mut cons_attrs = BufAttrs::new();
    cons_attrs.kind = Some(cam_multicast::buffer::BufKind::Image);
    cons_attrs.layout = Some(ImageLayout::Pitch);
    cons_attrs.set_perm(AccessPerm::Readonly);
    consumer.element_attr_set(ELEMENT_NAME_DATA, cons_attrs).unwrap();
    consumer
        .setup_status_set(SetupStep::ElementExport, true)
        .unwrap();

    let event = pool.block().event_query(Duration::from_secs(1)).unwrap();
    assert_eq!(event, StreamEvent::Elements);
    assert_eq!(pool.handle_event(event), EventStatus::Error);
}
