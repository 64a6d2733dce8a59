//! Multicast camera streaming CLI.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use cam_multicast::config::{AppType, PlatformCfg};
use cam_multicast::consumer::DumpConfig;
use cam_multicast::master::{
    DeviceBlockHandler, FrameQueueHandler, Master, NotificationHandler, Profiler,
};
use cam_multicast::source::{FrameSource, SyntheticSource};
use cam_multicast::transport::IpcTransport;

const SECONDS_PER_ITERATION: u64 = 2;

#[derive(Parser, Debug)]
#[command(name = "cam-multicast")]
#[command(about = "Multi-consumer zero-copy camera frame streaming")]
#[command(version)]
struct Cli {
    /// Verbosity: 0 none, 1 errors, 2 warnings, 3 info, 4 debug
    #[arg(short, long, default_value_t = 1)]
    verbosity: u32,

    /// Platform configuration name, or a path to a TOML file
    #[arg(short = 't', default_value = "SIM1080P_DUAL")]
    platform: String,

    /// Folder containing per-module tuning (IQ) blobs
    #[arg(long)]
    nito: Option<PathBuf>,

    /// Tolerate non-fatal errors
    #[arg(short = 'I', long = "ignore-errors")]
    ignore_errors: bool,

    /// Per-device-block link masks, e.g. "0x3 0x1"
    #[arg(short = 'm', long)]
    masks: Option<String>,

    /// Producer resides in this process (multi-process mode)
    #[arg(short = 'p')]
    producer: bool,

    /// Consumer resides in this process: 'cuda' or 'enc'
    #[arg(short = 'c')]
    consumer: Option<String>,

    /// Consumer id within the multicast group
    #[arg(short = 'u', default_value_t = 0)]
    consumer_id: u32,

    /// Enable per-consumer dump files
    #[arg(long)]
    dump: bool,

    /// Directory for dump files
    #[arg(long, default_value = ".")]
    dump_dir: PathBuf,

    /// Seconds to run before an orderly stop
    #[arg(long, default_value_t = 10)]
    duration: u64,
}

fn app_type(cli: &Cli) -> Result<AppType> {
    match (&cli.producer, &cli.consumer) {
        (false, None) => Ok(AppType::SingleProcess),
        (true, None) => Ok(AppType::IpcProducer),
        (false, Some(kind)) => match kind.as_str() {
            "cuda" => Ok(AppType::IpcCudaConsumer),
            "enc" => Ok(AppType::IpcEncConsumer),
            other => bail!("unsupported consumer type '{other}'"),
        },
        (true, Some(_)) => bail!("-p and -c are mutually exclusive"),
    }
}

fn open_transport() -> Result<Arc<dyn IpcTransport>> {
    #[cfg(feature = "ipc-zmq")]
    {
        let dir = std::env::temp_dir();
        Ok(Arc::new(cam_multicast::transport::ZmqTransport::new(
            dir.to_string_lossy().into_owned(),
        )))
    }
    #[cfg(not(feature = "ipc-zmq"))]
    {
        warn!("built without the ipc-zmq feature; cross-process mode is limited to one process");
        Ok(Arc::new(cam_multicast::transport::MemoryTransport::new()))
    }
}

fn main() {
    if let Err(e) = run() {
        error!(error = %e, "fatal");
        std::process::exit(-1);
    }
    info!("SUCCESS");
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbosity {
        0 => EnvFilter::new("off"),
        1 => EnvFilter::new("error"),
        2 => EnvFilter::new("warn"),
        3 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    fmt().with_env_filter(filter).with_target(false).init();

    let app = app_type(&cli)?;
    let producer_resident = app.is_producer_resident();
    info!(?app, producer_resident, "starting");

    let mut platform = if cli.platform.ends_with(".toml") {
        PlatformCfg::from_file(&cli.platform)?
    } else {
        PlatformCfg::by_name(&cli.platform)?
    };
    if let Some(masks) = &cli.masks {
        let parsed: Vec<u32> = masks
            .split_whitespace()
            .map(|m| u32::from_str_radix(m.trim_start_matches("0x"), 16))
            .collect::<std::result::Result<_, _>>()
            .context("parsing link masks")?;
        platform.apply_masks(&parsed);
    }
    let modules: Vec<_> = platform.modules().cloned().collect();
    if modules.is_empty() {
        bail!("platform configuration has no camera modules");
    }

    let source = SyntheticSource::new(&platform);
    let transport = open_transport()?;
    let dump = DumpConfig {
        enabled: cli.dump,
        dir: cli.dump_dir.clone(),
    };

    let source_dyn: Arc<dyn FrameSource> = source.clone();
    let master = Arc::new(Master::new(app, source_dyn, transport, dump, cli.consumer_id));

    // Per-sensor profilers and channels.
    let mut profilers = Vec::new();
    for module in &modules {
        let profiler = Profiler::new(module.sensor_id);
        master.register_source(module, Arc::clone(&profiler))?;
        profilers.push(profiler);
    }

    // Pipeline and device-block notification drainers (producer side only).
    let mut notification_handlers = Vec::new();
    let mut devblk_handlers = Vec::new();
    let mut frame_handlers = Vec::new();
    if producer_resident {
        for module in &modules {
            let queue = source.notification_queue(module.sensor_id)?;
            notification_handlers.push(NotificationHandler::spawn(
                module.sensor_id,
                queue,
                cli.ignore_errors,
            ));
        }
        for (block, _) in platform.device_blocks.iter().enumerate() {
            let queue = source.device_notification_queue(block)?;
            devblk_handlers.push(DeviceBlockHandler::spawn(block, queue, cli.ignore_errors));
        }
    }

    info!("master: init stream");
    master.init_stream()?;

    if producer_resident {
        // Load and register per-module tuning blobs before capture starts.
        if let Some(dir) = &cli.nito {
            for module in &modules {
                let path = dir.join(format!("{}.nito", module.name));
                let blob = std::fs::read(&path)
                    .with_context(|| format!("loading tuning blob {}", path.display()))?;
                source.register_tuning_blob(module.sensor_id, blob)?;
            }
        }
    }

    info!("master: start stream");
    master.start_stream();

    if producer_resident {
        for module in &modules {
            let queue = source.completion_queue(module.sensor_id)?;
            frame_handlers.push(FrameQueueHandler::spawn(
                module.sensor_id,
                queue,
                Arc::clone(&master),
            ));
        }
        source.start().map_err(|e| anyhow::anyhow!(e))?;
    }

    // Report per-sensor FPS until the duration elapses or something fails.
    let deadline = Instant::now() + Duration::from_secs(cli.duration);
    let mut failed = false;
    while Instant::now() < deadline {
        let started = Instant::now();
        std::thread::sleep(Duration::from_secs(SECONDS_PER_ITERATION));
        let elapsed = started.elapsed().as_secs_f64();
        println!("Output");
        for profiler in &profilers {
            let fps = profiler.sample_delta() as f64 / elapsed;
            println!(
                "Sensor{}_Out0\tFrame rate (fps):\t\t{fps:.2}",
                profiler.sensor()
            );
        }
        println!();

        if master.any_channel_stopped() {
            warn!("a channel stopped; shutting down");
            failed = true;
            break;
        }
        if notification_handlers.iter().any(|h| h.is_in_error()) {
            error!("pipeline failure");
            failed = true;
            break;
        }
        if devblk_handlers.iter().any(|h| h.is_in_error()) {
            error!("device block failure");
            failed = true;
            break;
        }
    }

    // Orderly teardown: frame source first, then channels, then the rest.
    if producer_resident {
        source.stop();
    }
    for h in &mut frame_handlers {
        h.stop();
    }
    master.stop_stream();
    for h in &mut notification_handlers {
        h.stop();
    }
    for h in &mut devblk_handlers {
        h.stop();
    }
    master.deinit();

    if failed {
        bail!("stream failed");
    }
    Ok(())
}
