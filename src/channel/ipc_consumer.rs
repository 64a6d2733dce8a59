//! IPC consumer topology: ipc-dst bridge -> queue -> one consumer, in its
//! own process.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::buffer::BufModule;
use crate::channel::{wait_connected, Channel, ChannelRunner, ConsumerType, SharedHandler};
use crate::client::Client;
use crate::config::{EncoderParams, ModuleInfo};
use crate::consumer::{ConsumerRole, DumpConfig, EncProcessor, GpuProcessor};
use crate::error::{Result, StreamError};
use crate::fabric::{ipc::create_ipc_dst, BlockHandle, StreamHub};
use crate::master::Profiler;
use crate::sync::SyncModule;
use crate::transport::{endpoint_name, IpcTransport};

enum ConsumerClient {
    Cuda(Arc<Mutex<Client<ConsumerRole<GpuProcessor>>>>),
    Enc(Arc<Mutex<Client<ConsumerRole<EncProcessor>>>>),
}

impl ConsumerClient {
    fn handler(&self) -> SharedHandler {
        match self {
            ConsumerClient::Cuda(c) => super::to_handler(c.clone()),
            ConsumerClient::Enc(c) => super::to_handler(c.clone()),
        }
    }

    fn init(&self) -> Result<()> {
        match self {
            ConsumerClient::Cuda(c) => c.lock().unwrap().init(),
            ConsumerClient::Enc(c) => c.lock().unwrap().init(),
        }
    }

    fn set_profiler(&self, profiler: Arc<Profiler>) {
        match self {
            ConsumerClient::Cuda(c) => c.lock().unwrap().set_profiler(profiler),
            ConsumerClient::Enc(c) => c.lock().unwrap().set_profiler(profiler),
        }
    }
}

pub struct IpcConsumerChannel {
    runner: ChannelRunner,
    module: ModuleInfo,
    buf_module: BufModule,
    sync_module: SyncModule,
    transport: Arc<dyn IpcTransport>,
    consumer_type: ConsumerType,
    consumer_id: u32,
    dump: DumpConfig,
    profiler: Arc<Profiler>,
    hub: Option<Arc<StreamHub>>,
    consumer: Option<ConsumerClient>,
    consumer_block: Option<BlockHandle>,
    queue_block: Option<BlockHandle>,
    ipc_dst: Option<BlockHandle>,
}

impl IpcConsumerChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        module: ModuleInfo,
        buf_module: BufModule,
        sync_module: SyncModule,
        transport: Arc<dyn IpcTransport>,
        consumer_type: ConsumerType,
        consumer_id: u32,
        dump: DumpConfig,
        profiler: Arc<Profiler>,
    ) -> IpcConsumerChannel {
        IpcConsumerChannel {
            runner: ChannelRunner::new(format!("IpcConsChan{}", module.sensor_id)),
            module,
            buf_module,
            sync_module,
            transport,
            consumer_type,
            consumer_id,
            dump,
            profiler,
            hub: None,
            consumer: None,
            consumer_block: None,
            queue_block: None,
            ipc_dst: None,
        }
    }
}

impl Channel for IpcConsumerChannel {
    fn name(&self) -> &str {
        self.runner.name()
    }

    fn create_blocks(&mut self) -> Result<()> {
        let sensor = self.module.sensor_id;
        let hub = StreamHub::new(self.runner.name());

        let queue = hub.create_mailbox_queue();
        let block = hub.create_consumer(&queue)?;
        let consumer = match self.consumer_type {
            ConsumerType::Cuda => {
                let client = Client::new(
                    "CudaConsumer",
                    block.clone(),
                    sensor,
                    self.sync_module.clone(),
                    ConsumerRole::new(queue.clone(), GpuProcessor::new(0, self.dump.clone())),
                );
                ConsumerClient::Cuda(Arc::new(Mutex::new(client)))
            }
            ConsumerType::Enc => {
                let client = Client::new(
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
                ConsumerClient::Enc(Arc::new(Mutex::new(client)))
            }
        };
        consumer.set_profiler(Arc::clone(&self.profiler));
        debug!(channel = %self.runner.name(), kind = ?self.consumer_type, "consumer is created");

        let endpoint = self
            .transport
            .open(&endpoint_name(sensor, self.consumer_id, false), false)?;
        let ipc_dst = create_ipc_dst(&hub, endpoint, self.buf_module.clone());
        debug!(channel = %self.runner.name(), "dst ipc block is created");

        self.consumer = Some(consumer);
        self.consumer_block = Some(block);
        self.queue_block = Some(queue);
        self.ipc_dst = Some(ipc_dst);
        self.hub = Some(hub);
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        let ipc_dst = self
            .ipc_dst
            .as_ref()
            .ok_or(StreamError::Config("blocks not created".into()))?;
        let consumer_block = self
            .consumer_block
            .as_ref()
            .ok_or(StreamError::Config("blocks not created".into()))?;

        ipc_dst.connect(consumer_block)?;

        info!(channel = %self.runner.name(), "consumer is connecting to the stream");
        wait_connected(ipc_dst, "ipc-dst")?;
        if let Some(queue) = &self.queue_block {
            wait_connected(queue, "queue")?;
        }
        wait_connected(consumer_block, "consumer")?;
        info!(channel = %self.runner.name(), "consumer is connected to the stream");
        Ok(())
    }

    fn init_blocks(&mut self) -> Result<()> {
        debug!(channel = %self.runner.name(), "init blocks");
        self.consumer
            .as_ref()
            .ok_or(StreamError::Config("blocks not created".into()))?
            .init()
    }

    fn reconcile(&mut self) -> Result<()> {
        let handlers: Vec<SharedHandler> = self
            .consumer
            .iter()
            .map(|c| c.handler())
            .collect();
        self.runner.reconcile(&handlers)
    }

    fn start(&mut self) {
        let handlers: Vec<SharedHandler> = self
            .consumer
            .iter()
            .map(|c| c.handler())
            .collect();
        self.runner.start(&handlers);
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
}
