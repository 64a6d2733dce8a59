//! End-to-end over the IPC bridges: a producer-side master and six
//! consumer-side masters wired through the in-memory named transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cam_multicast::config::{AppType, DeviceBlockInfo, ModuleInfo, PlatformCfg};
use cam_multicast::consumer::DumpConfig;
use cam_multicast::master::{Master, Profiler};
use cam_multicast::source::{FrameSource, SyntheticSource};
use cam_multicast::transport::MemoryTransport;

fn test_platform() -> PlatformCfg {
    PlatformCfg {
        name: "ipc-test".into(),
        device_blocks: vec![DeviceBlockInfo {
            modules: vec![ModuleInfo {
                name: "testcam0".into(),
                sensor_id: 0,
                link_index: 0,
                width: 32,
                height: 16,
                fps: 250,
            }],
        }],
    }
}

fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn ipc_topology_streams_and_survives_consumer_loss() {
    let platform = test_platform();
    let module = platform.modules().next().unwrap().clone();
    let transport = Arc::new(MemoryTransport::new());

    // Six consumer-side processes, alternating GPU and encoder consumers.
    let mut consumer_masters = Vec::new();
    let mut consumer_profilers = Vec::new();
    for id in 0..6u32 {
        let app = if id % 2 == 0 {
            AppType::IpcCudaConsumer
        } else {
            AppType::IpcEncConsumer
        };
        let side_source: Arc<dyn FrameSource> = SyntheticSource::new(&platform);
        let master = Arc::new(Master::new(
            app,
            side_source,
            transport.clone(),
            DumpConfig::default(),
            id,
        ));
        let profiler = Profiler::new(0);
        master.register_source(&module, Arc::clone(&profiler)).unwrap();
        consumer_masters.push(master);
        consumer_profilers.push(profiler);
    }

    // Producer-side process.
    let source = SyntheticSource::new(&platform);
    let source_dyn: Arc<dyn FrameSource> = source.clone();
    let producer_master = Arc::new(Master::new(
        AppType::IpcProducer,
        source_dyn,
        transport.clone(),
        DumpConfig::default(),
        0,
    ));
    let producer_profiler = Profiler::new(0);
    producer_master
        .register_source(&module, Arc::clone(&producer_profiler))
        .unwrap();

    // Both sides run setup concurrently; each blocks until its peers are up.
    let consumer_inits: Vec<_> = consumer_masters
        .iter()
        .map(|m| {
            let m = Arc::clone(m);
            std::thread::spawn(move || m.init_stream().unwrap())
        })
        .collect();
    producer_master.init_stream().unwrap();
    for t in consumer_inits {
        t.join().unwrap();
    }

    for m in &consumer_masters {
        m.start_stream();
    }
    producer_master.start_stream();

    let queue = source.completion_queue(0).unwrap();
    source.start().unwrap();
    let mut post = |count: u64| {
        for _ in 0..count {
            let frame = queue
                .recv_timeout(Duration::from_secs(10))
                .expect("frame source stalled");
            producer_master.on_frame_available(0, frame).expect("post failed");
        }
    };
    post(40);

    // Every remote consumer observed payloads.
    for (id, profiler) in consumer_profilers.iter().enumerate() {
        wait_until(
            &format!("consumer {id} to see frames"),
            Duration::from_secs(5),
            || profiler.total_frames() > 0,
        );
    }

    // One consumer process goes away mid-stream; the producer keeps going.
    consumer_masters[5].stop_stream();
    post(40);
    assert!(
        !producer_master.any_channel_stopped(),
        "producer must survive a lost consumer branch"
    );

    // Producer stops first: remaining consumers observe the disconnect and
    // wind down their channels.
    source.stop();
    producer_master.stop_stream();
    for (id, master) in consumer_masters.iter().enumerate().take(5) {
        wait_until(
            &format!("consumer {id} to observe disconnect"),
            Duration::from_secs(5),
            || master.any_channel_stopped(),
        );
        master.stop_stream();
    }

    producer_master.deinit();
    for m in &consumer_masters {
        m.deinit();
    }
}
