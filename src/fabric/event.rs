//! Events delivered on block event sources.

/// Event kinds a block can observe through [`super::BlockHandle::event_query`].
///
/// Associated state (attribute lists, buffers, fences, error codes) is pulled
/// through the block handle after the event is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// The whole stream graph is wired up; setup may begin.
    Connected,
    /// Element attributes are available for import.
    Elements,
    /// A new packet is pending creation at this endpoint.
    PacketCreate,
    /// All packets have been delivered to this endpoint.
    PacketsComplete,
    /// A packet was withdrawn (unused with a static pool).
    PacketDelete,
    /// Acceptance status arrived for a packet (pool only).
    PacketStatus,
    /// Peer waiter requirements are available for sync reconciliation.
    WaiterAttr,
    /// Peer signal objects are available for import.
    SignalObj,
    /// Every block finished setup; the stream is entering the runtime phase.
    SetupComplete,
    /// A packet is available for acquisition (or reuse, on the producer).
    PacketReady,
    /// The stream failed; query the error through the handle.
    Error,
    /// The other side of the stream went away.
    Disconnected,
}

/// Setup milestones an endpoint reports back to the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    ElementExport,
    ElementImport,
    WaiterAttrExport,
    WaiterAttrImport,
    SignalObjExport,
    SignalObjImport,
    PacketExport,
    PacketImport,
}

/// Per-endpoint setup checklist tracked by the fabric.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SetupSteps {
    pub element_export: bool,
    pub element_import: bool,
    pub waiter_attr_export: bool,
    pub waiter_attr_import: bool,
    pub signal_obj_export: bool,
    pub signal_obj_import: bool,
    pub packet_export: bool,
    pub packet_import: bool,
}

impl SetupSteps {
    pub fn set(&mut self, step: SetupStep, done: bool) {
        match step {
            SetupStep::ElementExport => self.element_export = done,
            SetupStep::ElementImport => self.element_import = done,
            SetupStep::WaiterAttrExport => self.waiter_attr_export = done,
            SetupStep::WaiterAttrImport => self.waiter_attr_import = done,
            SetupStep::SignalObjExport => self.signal_obj_export = done,
            SetupStep::SignalObjImport => self.signal_obj_import = done,
            SetupStep::PacketExport => self.packet_export = done,
            SetupStep::PacketImport => self.packet_import = done,
        }
    }

    /// Checklist for a producer or consumer endpoint.
    pub fn endpoint_done(&self) -> bool {
        self.element_export
            && self.element_import
            && self.waiter_attr_export
            && self.waiter_attr_import
            && self.signal_obj_export
            && self.signal_obj_import
            && self.packet_import
    }

    /// Checklist for the pool.
    pub fn pool_done(&self) -> bool {
        self.element_import && self.element_export && self.packet_export && self.packet_import
    }

    pub fn all() -> Self {
        SetupSteps {
            element_export: true,
            element_import: true,
            waiter_attr_export: true,
            waiter_attr_import: true,
            signal_obj_export: true,
            signal_obj_import: true,
            packet_export: true,
            packet_import: true,
        }
    }
}
