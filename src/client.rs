//! Client base: the setup state machine shared by the producer and every
//! consumer.
//!
//! A [`Client`] pairs the endpoint-agnostic protocol bookkeeping
//! ([`ClientCore`]) with a [`ClientRole`] that supplies the hardware-facing
//! hooks: buffer requirements, sync registration, payload handling. The
//! event dispatch mirrors the per-event transitions of the stream protocol;
//! roles never talk to the block handle for setup themselves.

use tracing::{debug, error, warn};

use crate::buffer::{AccessPerm, BufAttrs, BufObj};
use crate::channel::{EventHandler, EventStatus};
use crate::config::{
    COOKIE_BASE, ELEMENT_NAME_DATA, ELEMENT_NAME_META, MAX_PACKETS, MAX_WAIT_SYNCOBJ,
};
use crate::error::{Result, StreamError};
use crate::fabric::{BlockHandle, PacketHandle, SetupStep, StreamEvent};
use crate::master::Profiler;
use crate::source::FrameMetadata;
use crate::sync::{CpuWaitContext, SyncAttrs, SyncModule, SyncObj, SyncPerm};
use std::sync::Arc;

/// One packet as seen from an endpoint.
pub struct ClientPacket {
    pub cookie: u64,
    pub handle: PacketHandle,
    pub data_obj: Option<BufObj>,
    pub meta_obj: Option<BufObj>,
}

/// Endpoint-agnostic client state.
pub struct ClientCore {
    pub name: String,
    pub sensor: u32,
    pub block: BlockHandle,
    pub sync_module: SyncModule,
    pub signaler_attrs: Option<SyncAttrs>,
    pub waiter_attrs: Option<SyncAttrs>,
    pub cpu_wait: Option<CpuWaitContext>,
    pub signal_obj: Option<SyncObj>,
    /// How many upstream signal objects this endpoint imports.
    pub num_wait_sync: usize,
    pub waiter_objs: Vec<Option<SyncObj>>,
    pub num_packets: usize,
    pub packets: Vec<ClientPacket>,
    pub data_index: usize,
    pub meta_index: usize,
    pub profiler: Option<Arc<Profiler>>,
}

impl ClientCore {
    pub fn index_from_cookie(&self, cookie: u64) -> Result<usize> {
        if cookie <= COOKIE_BASE || cookie > COOKIE_BASE + MAX_PACKETS as u64 {
            error!(client = %self.name, cookie, "invalid cookie assignment");
            return Err(StreamError::InvalidCookie(cookie));
        }
        Ok((cookie - COOKIE_BASE) as usize - 1)
    }

    fn assign_cookie(&self) -> u64 {
        COOKIE_BASE + self.num_packets as u64
    }

    pub fn packet(&self, index: usize) -> Result<&ClientPacket> {
        self.packets
            .get(index)
            .ok_or(StreamError::Protocol(format!("no packet {index}")))
    }

    /// Write frame metadata into a packet's meta element.
    pub fn write_meta(&self, index: usize, meta: &FrameMetadata) -> Result<()> {
        let packet = self.packet(index)?;
        if let Some(obj) = &packet.meta_obj {
            meta.write_to(obj);
        }
        Ok(())
    }

    pub fn on_frame_available(&self) {
        if let Some(p) = &self.profiler {
            p.on_frame_available();
        }
    }
}

/// Role-specific hooks invoked by the shared state machine.
pub trait ClientRole: Send {
    /// Early stream queries (consumer counts).
    fn handle_stream_init(&mut self, _core: &mut ClientCore) -> Result<()> {
        Ok(())
    }
    /// Bring up the role's hardware unit.
    fn handle_client_init(&mut self, core: &mut ClientCore) -> Result<()>;
    fn set_data_buf_attrs(&mut self, core: &ClientCore, attrs: &mut BufAttrs) -> Result<()>;
    fn meta_perm(&self) -> AccessPerm;
    /// Whether this role needs host-visible completion (allocates a CPU wait
    /// context and folds CPU-wait attributes into sync reconciliation).
    fn has_cpu_wait(&self) -> bool {
        false
    }
    fn set_sync_attrs(
        &mut self,
        core: &ClientCore,
        signaler: &mut SyncAttrs,
        waiter: &mut SyncAttrs,
    ) -> Result<()>;
    fn map_data_buffer(&mut self, core: &mut ClientCore, index: usize) -> Result<()>;
    fn map_meta_buffer(&mut self, _core: &mut ClientCore, _index: usize) -> Result<()> {
        Ok(())
    }
    fn register_signal_sync(&mut self, core: &ClientCore, obj: &SyncObj) -> Result<()>;
    fn register_waiter_sync(&mut self, core: &ClientCore, index: usize, obj: &SyncObj)
        -> Result<()>;
    fn unregister_syncs(&mut self, _core: &ClientCore) -> Result<()> {
        Ok(())
    }
    fn handle_setup_complete(&mut self, _core: &mut ClientCore) -> Result<()> {
        Ok(())
    }
    fn handle_payload(&mut self, core: &mut ClientCore) -> Result<()>;
}

pub struct Client<R: ClientRole> {
    pub core: ClientCore,
    pub role: R,
}

impl<R: ClientRole> Client<R> {
    pub fn new(
        name: impl Into<String>,
        block: BlockHandle,
        sensor: u32,
        sync_module: SyncModule,
        role: R,
    ) -> Client<R> {
        let name = name.into();
        Client {
            core: ClientCore {
                name: format!("{name}{sensor}"),
                sensor,
                block,
                sync_module,
                signaler_attrs: None,
                waiter_attrs: None,
                cpu_wait: None,
                signal_obj: None,
                num_wait_sync: 1,
                waiter_objs: vec![None; MAX_WAIT_SYNCOBJ],
                num_packets: 0,
                packets: Vec::new(),
                data_index: 0,
                meta_index: 1,
                profiler: None,
            },
            role,
        }
    }

    pub fn set_profiler(&mut self, profiler: Arc<Profiler>) {
        self.core.profiler = Some(profiler);
    }

    /// Initialization before the reconcile phase: stream queries, client
    /// bring-up, element export, sync attribute export.
    pub fn init(&mut self) -> Result<()> {
        self.role.handle_stream_init(&mut self.core)?;
        self.role.handle_client_init(&mut self.core)?;
        self.handle_elem_support()?;
        self.handle_sync_support()?;
        Ok(())
    }

    fn handle_elem_support(&mut self) -> Result<()> {
        let mut data_attrs = BufAttrs::new();
        self.role.set_data_buf_attrs(&self.core, &mut data_attrs)?;

        // The meta element is a small raw buffer written by the CPU.
        let mut meta_attrs = BufAttrs::raw(FrameMetadata::SIZE.max(64), 1);
        meta_attrs.set_perm(self.role.meta_perm());
        meta_attrs.set_need_cpu_access(true);

        self.core
            .block
            .element_attr_set(ELEMENT_NAME_DATA, data_attrs)?;
        self.core
            .block
            .element_attr_set(ELEMENT_NAME_META, meta_attrs)?;
        debug!(client = %self.core.name, "sent element attributes");

        self.core
            .block
            .setup_status_set(SetupStep::ElementExport, true)
    }

    fn handle_sync_support(&mut self) -> Result<()> {
        let mut signaler = SyncAttrs::new();
        let mut waiter = SyncAttrs::new();
        self.role
            .set_sync_attrs(&self.core, &mut signaler, &mut waiter)?;
        self.core.signaler_attrs = Some(signaler);
        self.core.waiter_attrs = Some(waiter);

        if self.role.has_cpu_wait() {
            self.core.cpu_wait = Some(self.core.sync_module.cpu_wait_context());
        }
        Ok(())
    }

    fn handle_elem_setting(&mut self) -> Result<()> {
        for i in 0..self.core.block.reconciled_count() {
            let (name, _attrs) = self.core.block.reconciled_attr_get(i)?;
            if name == ELEMENT_NAME_DATA {
                self.core.data_index = i;
                let waiter = self.core.waiter_attrs.take().ok_or(StreamError::Protocol(
                    "waiter attributes already exported".into(),
                ))?;
                self.core.block.element_waiter_attr_set(0, waiter)?;
            } else if name == ELEMENT_NAME_META {
                self.core.meta_index = i;
            }
        }
        self.core
            .block
            .setup_status_set(SetupStep::ElementImport, true)?;
        self.core
            .block
            .setup_status_set(SetupStep::WaiterAttrExport, true)
    }

    fn handle_packet_create(&mut self) -> Result<()> {
        let handle = self.core.block.packet_new_handle()?;
        if self.core.num_packets >= MAX_PACKETS {
            error!(client = %self.core.name, "exceeded max packets");
            return self
                .core
                .block
                .packet_status_set(handle, None, Err(StreamError::Overflow));
        }
        debug!(client = %self.core.name, count = self.core.num_packets, "received packet create");
        self.core.num_packets += 1;

        let cookie = self.core.assign_cookie();
        let index = self.core.index_from_cookie(cookie)?;
        self.core.packets.push(ClientPacket {
            cookie,
            handle,
            data_obj: None,
            meta_obj: None,
        });

        for i in 0..self.core.block.reconciled_count() {
            let buf = self.core.block.packet_buffer_get(handle, i)?;
            if i == self.core.data_index {
                self.core.packets[index].data_obj = Some(buf);
                self.role.map_data_buffer(&mut self.core, index)?;
            } else if i == self.core.meta_index {
                self.core.packets[index].meta_obj = Some(buf);
                self.role.map_meta_buffer(&mut self.core, index)?;
            } else {
                error!(client = %self.core.name, element = i, "buffer for unknown element");
                return Err(StreamError::Protocol(format!(
                    "buffer for unknown element {i}"
                )));
            }
        }
        self.core
            .block
            .packet_status_set(handle, Some(cookie), Ok(()))
    }

    fn handle_sync_export(&mut self) -> Result<()> {
        let peer_waiter = self.core.block.element_waiter_attr_get(0)?;
        self.core
            .block
            .setup_status_set(SetupStep::WaiterAttrImport, true)?;

        let signaler = self.core.signaler_attrs.take().ok_or(StreamError::Protocol(
            "signaler attributes already consumed".into(),
        ))?;
        let mut lists = vec![signaler, peer_waiter];
        if self.role.has_cpu_wait() {
            let mut cpu = SyncAttrs::new();
            cpu.set_need_cpu_access(true).set_perm(SyncPerm::WaitOnly);
            lists.push(cpu);
        }
        let reconciled = SyncAttrs::reconcile(lists.iter())?;
        let obj = self.core.sync_module.alloc(&reconciled)?;
        self.role.register_signal_sync(&self.core, &obj)?;
        self.core.signal_obj = Some(obj.clone());

        self.core.block.element_signal_obj_set(0, Some(obj))?;
        self.core
            .block
            .setup_status_set(SetupStep::SignalObjExport, true)
    }

    fn handle_sync_import(&mut self) -> Result<()> {
        for i in 0..self.core.num_wait_sync {
            let obj = self.core.block.element_signal_obj_get(i, 0)?;
            // A null signal object means the element is ready to use as
            // soon as it is received.
            if let Some(obj) = &obj {
                self.role.register_waiter_sync(&self.core, i, obj)?;
            }
            self.core.waiter_objs[i] = obj;
        }
        self.core
            .block
            .setup_status_set(SetupStep::SignalObjImport, true)
    }
}

impl<R: ClientRole> EventHandler for Client<R> {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn block(&self) -> BlockHandle {
        self.core.block.clone()
    }

    fn handle_event(&mut self, event: StreamEvent) -> EventStatus {
        let status = match event {
            StreamEvent::Connected => Ok(()),
            StreamEvent::Elements => self.handle_elem_setting(),
            StreamEvent::PacketCreate => self.handle_packet_create(),
            StreamEvent::PacketsComplete => self
                .core
                .block
                .setup_status_set(SetupStep::PacketImport, true),
            StreamEvent::PacketDelete => {
                warn!(client = %self.core.name, "received packet delete");
                Ok(())
            }
            StreamEvent::WaiterAttr => self.handle_sync_export(),
            StreamEvent::SignalObj => self.handle_sync_import(),
            StreamEvent::SetupComplete => {
                let res = self.role.handle_setup_complete(&mut self.core);
                match res {
                    Ok(()) => {
                        debug!(client = %self.core.name, "setup completed");
                        return EventStatus::Complete;
                    }
                    Err(e) => Err(e),
                }
            }
            StreamEvent::PacketReady => self.role.handle_payload(&mut self.core),
            StreamEvent::Error => {
                let code = self.core.block.error_get().unwrap_or_default();
                error!(client = %self.core.name, %code, "received error event");
                Err(StreamError::Protocol(code))
            }
            StreamEvent::Disconnected => {
                warn!(client = %self.core.name, "received disconnect");
                Err(StreamError::Disconnected)
            }
            StreamEvent::PacketStatus => {
                error!(client = %self.core.name, "received pool-only event");
                Err(StreamError::Protocol("packet status at endpoint".into()))
            }
        };
        match status {
            Ok(()) => EventStatus::Ok,
            Err(_) => EventStatus::Error,
        }
    }
}

impl<R: ClientRole> Drop for Client<R> {
    fn drop(&mut self) {
        let _ = self.role.unregister_syncs(&self.core);
    }
}
