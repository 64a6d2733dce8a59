//! IPC producer topology: producer -> multicast -> {local consumers, one
//! ipc-src bridge per remote consumer}.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::buffer::BufModule;
use crate::channel::{to_handler, wait_connected, Channel, ChannelRunner, EventHandler, SharedHandler};
use crate::client::Client;
use crate::config::{
    EncoderParams, ModuleInfo, MAX_PACKETS, NUM_CONSUMERS, NUM_LOCAL_CONSUMERS,
    NUM_LOCAL_CUDA_CONSUMERS, NUM_LOCAL_ENC_CONSUMERS,
};
use crate::consumer::{ConsumerRole, DumpConfig, EncProcessor, GpuProcessor};
use crate::error::{Result, StreamError};
use crate::fabric::{ipc::create_ipc_src, BlockHandle, StreamHub};
use crate::master::Profiler;
use crate::pool::PoolManager;
use crate::producer::ProducerRole;
use crate::source::{CapturedFrame, FrameSource};
use crate::sync::SyncModule;
use crate::transport::{endpoint_name, IpcTransport};

pub struct IpcProducerChannel {
    runner: ChannelRunner,
    module: ModuleInfo,
    buf_module: BufModule,
    sync_module: SyncModule,
    source: Arc<dyn FrameSource>,
    transport: Arc<dyn IpcTransport>,
    dump: DumpConfig,
    profiler: Arc<Profiler>,
    hub: Option<Arc<StreamHub>>,
    pool: Option<Arc<Mutex<PoolManager>>>,
    producer: Option<Arc<Mutex<Client<ProducerRole>>>>,
    gpu: Option<Arc<Mutex<Client<ConsumerRole<GpuProcessor>>>>>,
    enc: Option<Arc<Mutex<Client<ConsumerRole<EncProcessor>>>>>,
    producer_block: Option<BlockHandle>,
    consumer_blocks: Vec<(BlockHandle, BlockHandle)>,
    ipc_src_blocks: Vec<BlockHandle>,
    multicast: Option<BlockHandle>,
}

impl IpcProducerChannel {
    pub fn new(
        module: ModuleInfo,
        buf_module: BufModule,
        sync_module: SyncModule,
        source: Arc<dyn FrameSource>,
        transport: Arc<dyn IpcTransport>,
        dump: DumpConfig,
        profiler: Arc<Profiler>,
    ) -> IpcProducerChannel {
        IpcProducerChannel {
            runner: ChannelRunner::new(format!("IpcProdChan{}", module.sensor_id)),
            module,
            buf_module,
            sync_module,
            source,
            transport,
            dump,
            profiler,
            hub: None,
            pool: None,
            producer: None,
            gpu: None,
            enc: None,
            producer_block: None,
            consumer_blocks: Vec::new(),
            ipc_src_blocks: Vec::new(),
            multicast: None,
        }
    }

    fn runtime_handlers(&self) -> Vec<SharedHandler> {
        let mut handlers: Vec<SharedHandler> = Vec::new();
        if let Some(p) = &self.producer {
            handlers.push(to_handler(p.clone()));
        }
        if let Some(c) = &self.gpu {
            handlers.push(to_handler(c.clone()));
        }
        if let Some(c) = &self.enc {
            handlers.push(to_handler(c.clone()));
        }
        handlers
    }
}

impl Channel for IpcProducerChannel {
    fn name(&self) -> &str {
        self.runner.name()
    }

    fn create_blocks(&mut self) -> Result<()> {
        let sensor = self.module.sensor_id;
        let hub = StreamHub::new(self.runner.name());

        let pool_block = hub.create_static_pool(MAX_PACKETS);
        let pool = PoolManager::new(pool_block, sensor, self.buf_module.clone());
        debug!(channel = %self.runner.name(), "pool manager is created");

        let producer_block = hub.create_producer(&pool.block())?;
        let mut producer = Client::new(
            "CamProducer",
            producer_block.clone(),
            sensor,
            self.sync_module.clone(),
            ProducerRole::new(Arc::clone(&self.source), self.buf_module.clone()),
        );
        producer.set_profiler(Arc::clone(&self.profiler));

        let multicast = hub.create_multicast(NUM_CONSUMERS + NUM_LOCAL_CONSUMERS);
        debug!(channel = %self.runner.name(), "multicast block is created");

        if NUM_LOCAL_CUDA_CONSUMERS > 0 {
            let queue = hub.create_mailbox_queue();
            let block = hub.create_consumer(&queue)?;
            let gpu = Client::new(
                "CudaConsumer",
                block.clone(),
                sensor,
                self.sync_module.clone(),
                ConsumerRole::new(queue.clone(), GpuProcessor::new(0, self.dump.clone())),
            );
            self.consumer_blocks.push((block, queue));
            self.gpu = Some(Arc::new(Mutex::new(gpu)));
            debug!(channel = %self.runner.name(), "local cuda consumer is created");
        }
        if NUM_LOCAL_ENC_CONSUMERS > 0 {
            let queue = hub.create_mailbox_queue();
            let block = hub.create_consumer(&queue)?;
            let enc = Client::new(
                "EncConsumer",
                block.clone(),
                sensor,
                self.sync_module.clone(),
                ConsumerRole::new(
                    queue.clone(),
                    EncProcessor::new(
                        EncoderParams::new(self.module.width, self.module.height),
                        self.dump.clone(),
                    ),
                ),
            );
            self.consumer_blocks.push((block, queue));
            self.enc = Some(Arc::new(Mutex::new(enc)));
            debug!(channel = %self.runner.name(), "local encoder consumer is created");
        }

        for i in 0..NUM_CONSUMERS {
            let endpoint = self
                .transport
                .open(&endpoint_name(sensor, i as u32, true), true)?;
            let block = create_ipc_src(&hub, endpoint, sensor, i as u32);
            self.ipc_src_blocks.push(block);
            debug!(channel = %self.runner.name(), index = i, "ipc src block is created");
        }

        self.pool = Some(Arc::new(Mutex::new(pool)));
        self.producer = Some(Arc::new(Mutex::new(producer)));
        self.producer_block = Some(producer_block);
        self.multicast = Some(multicast);
        self.hub = Some(hub);
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        let producer_block = self
            .producer_block
            .as_ref()
            .ok_or(StreamError::Config("blocks not created".into()))?;
        let multicast = self
            .multicast
            .as_ref()
            .ok_or(StreamError::Config("blocks not created".into()))?;

        producer_block.connect(multicast)?;
        for (consumer, _) in &self.consumer_blocks {
            multicast.connect(consumer)?;
        }
        for ipc in &self.ipc_src_blocks {
            multicast.connect(ipc)?;
        }

        info!(channel = %self.runner.name(), "producer is connecting to the stream");
        wait_connected(producer_block, "producer")?;
        if let Some(pool) = &self.pool {
            wait_connected(&pool.lock().unwrap().block(), "pool")?;
        }
        for (i, (consumer, queue)) in self.consumer_blocks.iter().enumerate() {
            wait_connected(queue, &format!("queue{i}"))?;
            wait_connected(consumer, &format!("consumer{i}"))?;
        }
        for (i, ipc) in self.ipc_src_blocks.iter().enumerate() {
            wait_connected(ipc, &format!("ipc-src{i}"))?;
        }
        wait_connected(multicast, "multicast")?;
        info!(channel = %self.runner.name(), "producer is connected to the stream");
        Ok(())
    }

    fn init_blocks(&mut self) -> Result<()> {
        debug!(channel = %self.runner.name(), "init blocks");
        if let Some(pool) = &self.pool {
            pool.lock().unwrap().init()?;
        }
        if let Some(producer) = &self.producer {
            producer.lock().unwrap().init()?;
        }
        if let Some(gpu) = &self.gpu {
            gpu.lock().unwrap().init()?;
        }
        if let Some(enc) = &self.enc {
            enc.lock().unwrap().init()?;
        }
        Ok(())
    }

    fn reconcile(&mut self) -> Result<()> {
        let mut handlers: Vec<SharedHandler> = Vec::new();
        if let Some(p) = &self.pool {
            handlers.push(to_handler(p.clone()));
        }
        handlers.extend(self.runtime_handlers());
        self.runner.reconcile(&handlers)
    }

    fn start(&mut self) {
        self.runner.start(&self.runtime_handlers());
    }

    fn stop(&mut self) {
        self.runner.stop();
        if let Some(hub) = &self.hub {
            hub.shutdown();
        }
    }

    fn running(&self) -> bool {
        self.runner.running()
    }

    fn post(&self, frame: CapturedFrame) -> Result<()> {
        let producer = self
            .producer
            .as_ref()
            .ok_or(StreamError::Config("channel has no producer".into()))?;
        producer.lock().unwrap().post(frame)
    }
}
