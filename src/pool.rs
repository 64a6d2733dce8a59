//! Buffer pool manager: reconciles element attributes and allocates the
//! packet pool for one stream.

use tracing::{debug, error, warn};

use crate::buffer::{BufAttrs, BufModule};
use crate::channel::{EventHandler, EventStatus};
use crate::config::{MAX_PACKETS, NUM_CONSUMERS, NUM_LOCAL_CONSUMERS};
use crate::error::{Result, StreamError};
use crate::fabric::{BlockHandle, EndpointKind, PacketHandle, SetupStep, StreamEvent};

pub struct PoolManager {
    name: String,
    block: BlockHandle,
    buf_module: BufModule,
    num_consumers: usize,
    packet_handles: Vec<PacketHandle>,
    num_packet_status: usize,
    elements_done: bool,
    packets_done: bool,
}

impl PoolManager {
    pub fn new(block: BlockHandle, sensor: u32, buf_module: BufModule) -> PoolManager {
        PoolManager {
            name: format!("Pool{sensor}"),
            block,
            buf_module,
            num_consumers: 0,
            packet_handles: Vec::new(),
            num_packet_status: 0,
            elements_done: false,
            packets_done: false,
        }
    }

    pub fn init(&mut self) -> Result<()> {
        debug!(pool = %self.name, "init");
        self.num_consumers = self.block.consumer_count()?;
        if self.num_consumers > NUM_CONSUMERS + NUM_LOCAL_CONSUMERS {
            error!(pool = %self.name, count = self.num_consumers, "consumer count is too big");
            return Err(StreamError::Config(format!(
                "consumer count {} exceeds limit {}",
                self.num_consumers,
                NUM_CONSUMERS + NUM_LOCAL_CONSUMERS
            )));
        }
        Ok(())
    }

    fn handle_buffer_setup(&mut self) -> Result<()> {
        let num_prod_elem = self.block.element_count(EndpointKind::Producer)?;
        let num_cons_elem = self.block.element_count(EndpointKind::Consumer)?;

        let mut prod_elems = Vec::with_capacity(num_prod_elem);
        for i in 0..num_prod_elem {
            prod_elems.push(self.block.element_attr_get(EndpointKind::Producer, i)?);
        }
        let mut cons_elems = Vec::with_capacity(num_cons_elem);
        for i in 0..num_cons_elem {
            cons_elems.push(self.block.element_attr_get(EndpointKind::Consumer, i)?);
        }

        self.elements_done = true;
        self.block.setup_status_set(SetupStep::ElementImport, true)?;

        // Pair producer and consumer elements by user name and reconcile
        // each matched pair.
        let mut reconciled: Vec<(u32, BufAttrs)> = Vec::new();
        for (p_name, p_attrs) in &prod_elems {
            for (c_name, c_attrs) in &cons_elems {
                if p_name == c_name {
                    let merged = BufAttrs::reconcile([p_attrs, c_attrs]).map_err(|e| {
                        error!(pool = %self.name, element = *p_name, error = %e,
                               "element reconcile failed");
                        e
                    })?;
                    reconciled.push((*p_name, merged));
                    break;
                }
            }
        }
        if reconciled.is_empty() {
            error!(pool = %self.name, "no common elements between producer and consumers");
            return Err(StreamError::Config(
                "producer and consumer share no element".into(),
            ));
        }

        for (name, attrs) in &reconciled {
            self.block.element_attr_set(*name, attrs.clone())?;
        }
        self.block.setup_status_set(SetupStep::ElementExport, true)?;

        // Create and send all the packets and their buffers. Status messages
        // come back asynchronously and unordered.
        for i in 0..MAX_PACKETS {
            let handle = self.block.pool_packet_create(i as u64 + 1)?;
            for (e, (_, attrs)) in reconciled.iter().enumerate() {
                // The buffer handle is dropped after insertion; the stream
                // owns propagation to the endpoints.
                let obj = self.buf_module.alloc(attrs).map_err(|err| {
                    error!(pool = %self.name, packet = i, element = e, error = %err,
                           "buffer allocation failed");
                    err
                })?;
                self.block.pool_packet_insert_buffer(handle, e, &obj)?;
            }
            self.block.pool_packet_complete(handle)?;
            self.packet_handles.push(handle);
        }
        self.block.setup_status_set(SetupStep::PacketExport, true)?;

        Ok(())
    }

    fn handle_packets_status(&mut self) -> Result<()> {
        let mut packet_failure = false;

        for (p, handle) in self.packet_handles.iter().enumerate() {
            if self.block.pool_packet_status_accept(*handle)? {
                continue;
            }
            packet_failure = true;
            if let Some(code) =
                self.block
                    .pool_packet_status_value(*handle, EndpointKind::Producer, 0)?
            {
                error!(pool = %self.name, packet = p, %code, "producer rejected packet");
            }
            for c in 0..self.num_consumers {
                if let Some(code) =
                    self.block
                        .pool_packet_status_value(*handle, EndpointKind::Consumer, c)?
                {
                    error!(pool = %self.name, packet = p, consumer = c, %code,
                           "consumer rejected packet");
                }
            }
        }

        self.packets_done = true;
        self.block.setup_status_set(SetupStep::PacketImport, true)?;

        if packet_failure {
            Err(StreamError::Config("packet rejected by an endpoint".into()))
        } else {
            Ok(())
        }
    }
}

impl EventHandler for PoolManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn block(&self) -> BlockHandle {
        self.block.clone()
    }

    fn handle_event(&mut self, event: StreamEvent) -> EventStatus {
        let status = match event {
            StreamEvent::Connected => Ok(()),
            StreamEvent::Elements => self.handle_buffer_setup(),
            StreamEvent::PacketStatus => {
                self.num_packet_status += 1;
                if self.num_packet_status < MAX_PACKETS {
                    Ok(())
                } else {
                    debug!(pool = %self.name, "received all packet status events");
                    self.handle_packets_status()
                }
            }
            StreamEvent::Error => {
                let code = self.block.error_get().unwrap_or_default();
                error!(pool = %self.name, %code, "received error event");
                Err(StreamError::Protocol(code))
            }
            StreamEvent::Disconnected => {
                if !self.elements_done {
                    warn!(pool = %self.name, "disconnect before element support");
                } else if !self.packets_done {
                    warn!(pool = %self.name, "disconnect before packet setup");
                }
                Err(StreamError::Disconnected)
            }
            StreamEvent::SetupComplete => {
                debug!(pool = %self.name, "setup completed");
                return EventStatus::Complete;
            }
            other => {
                error!(pool = %self.name, event = ?other, "received unexpected event");
                Err(StreamError::Protocol(format!("unexpected event {other:?}")))
            }
        };
        match status {
            Ok(()) => EventStatus::Ok,
            Err(_) => EventStatus::Error,
        }
    }
}
