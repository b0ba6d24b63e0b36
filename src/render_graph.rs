//! Render graph (C6): the per-tick immutable mirror of the simulation
//! graph, restricted to data edges, plus kernel storage and buffer
//! allocation.
//!
//! `kernel_data` and `outputs` are read by many jobs at once but each
//! entry has exactly one writer per tick (the node that owns it), so
//! access is guarded with short-lived `parking_lot` locks rather than
//! handed out as raw pointers — the same "lock just long enough to hand
//! over ownership" shape `dozer_core::forwarder::ChannelManager` uses
//! around its `crossbeam::channel::Sender`s.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use dyn_clone::DynClone;
use parking_lot::RwLock;

use crate::codegen::NodeKind;
use crate::port::{PortOrdinal, PortRef};
use crate::topology::{Connection, NodeHandle};

/// Type-erased, cheaply cloned per-node render data. Cloned once per tick
/// per node so each scheduled job can own an independent copy without
/// requiring `Sync`.
pub trait KernelData: Any + DynClone + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
dyn_clone::clone_trait_object!(KernelData);

impl<T: Any + Clone + Send> KernelData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A data-port payload: a contiguous, densely packed element array. The
/// wire layout named in §6: `{ *element[], length, element_size }`.
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    elem_count: u32,
    elem_size: u32,
}

impl Buffer {
    pub fn zeroed(elem_count: u32, elem_size: u32) -> Self {
        Self {
            data: vec![0u8; elem_count as usize * elem_size as usize],
            elem_count,
            elem_size,
        }
    }

    pub fn from_i32_slice(values: &[i32]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            data,
            elem_count: values.len() as u32,
            elem_size: 4,
        }
    }

    pub fn as_i32_vec(&self) -> Vec<i32> {
        self.data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn elem_count(&self) -> u32 {
        self.elem_count
    }

    pub fn elem_size(&self) -> u32 {
        self.elem_size
    }
}

/// Information available to a kernel about the tick it is running in.
#[derive(Clone, Copy, Debug)]
pub struct RenderContext {
    pub render_version: u64,
}

/// A read-only snapshot of a node's input buffers and a writable view of
/// its own output buffers, handed to exactly one kernel invocation and
/// dropped before the next.
pub struct PortsView {
    inputs: HashMap<PortRef, Buffer>,
    outputs: HashMap<PortRef, Buffer>,
    size_requests: HashMap<PortRef, u32>,
}

impl PortsView {
    pub(crate) fn new(inputs: HashMap<PortRef, Buffer>, outputs: HashMap<PortRef, Buffer>) -> Self {
        Self {
            inputs,
            outputs,
            size_requests: HashMap::new(),
        }
    }

    pub fn input(&self, port: PortOrdinal) -> Option<&Buffer> {
        self.inputs.get(&PortRef::single(port))
    }

    pub fn input_array(&self, port: PortOrdinal, index: u32) -> Option<&Buffer> {
        self.inputs.get(&PortRef::array(port, index))
    }

    pub fn input_array_indices(&self, port: PortOrdinal) -> impl Iterator<Item = u32> + '_ {
        self.inputs.keys().filter_map(move |k| {
            (k.port == port).then_some(k.array_index).flatten()
        })
    }

    pub fn output_mut(&mut self, port: PortOrdinal) -> &mut Buffer {
        self.outputs.entry(PortRef::single(port)).or_insert_with(Default::default)
    }

    /// Recorded for the render graph's *next* sync, which reconciles
    /// buffer sizes from each kernel's last request (§4.6).
    pub fn request_output_size(&mut self, port: PortOrdinal, elem_count: u32, elem_size: u32) {
        self.size_requests.insert(PortRef::single(port), elem_count);
        let buffer = self.outputs.entry(PortRef::single(port)).or_insert_with(Default::default);
        if buffer.elem_count != elem_count || buffer.elem_size != elem_size {
            *buffer = Buffer::zeroed(elem_count, elem_size);
        }
    }

    pub(crate) fn into_parts(self) -> (HashMap<PortRef, Buffer>, HashMap<PortRef, u32>) {
        (self.outputs, self.size_requests)
    }
}

pub struct RenderGraph {
    render_version: u64,
    kernel_data: HashMap<NodeHandle, Box<dyn KernelData>>,
    kernel_state: HashMap<NodeHandle, Box<dyn Any + Send>>,
    outputs: Arc<RwLock<HashMap<(NodeHandle, PortRef), Buffer>>>,
    size_requests: HashMap<(NodeHandle, PortRef), u32>,
    data_edges: Vec<Connection>,
    batch_overrides: HashMap<(NodeHandle, PortRef), Buffer>,
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderGraph {
    pub fn new() -> Self {
        Self {
            render_version: 0,
            kernel_data: HashMap::new(),
            kernel_state: HashMap::new(),
            outputs: Arc::new(RwLock::new(HashMap::new())),
            size_requests: HashMap::new(),
            data_edges: Vec::new(),
            batch_overrides: HashMap::new(),
        }
    }

    pub fn render_version(&self) -> u64 {
        self.render_version
    }

    pub fn data_edges(&self) -> &[Connection] {
        &self.data_edges
    }

    pub(crate) fn outputs_handle(&self) -> Arc<RwLock<HashMap<(NodeHandle, PortRef), Buffer>>> {
        self.outputs.clone()
    }

    /// Called once per `NodeSet::update()` after messages have flowed.
    /// Copies kernel data for live/changed nodes, drops destroyed ones,
    /// refreshes the data-edge mirror, and reconciles buffer sizes from
    /// the previous tick's requests.
    pub fn sync(
        &mut self,
        live_nodes: impl IntoIterator<Item = (NodeHandle, Box<dyn KernelData>)>,
        destroyed: impl IntoIterator<Item = NodeHandle>,
        data_edges: Vec<Connection>,
        kernels: &HashMap<NodeHandle, Arc<NodeKind>>,
    ) {
        self.render_version += 1;
        self.batch_overrides.clear();

        for handle in destroyed {
            self.kernel_data.remove(&handle);
            self.kernel_state.remove(&handle);
            self.outputs.write().retain(|(n, _), _| *n != handle);
            self.size_requests.retain(|(n, _), _| *n != handle);
        }

        for (handle, data) in live_nodes {
            self.kernel_data.insert(handle, data);
            if !self.kernel_state.contains_key(&handle) {
                if let Some(kind) = kernels.get(&handle) {
                    self.kernel_state.insert(handle, (kind.kernel_state_factory)());
                }
            }
            if let Some(kind) = kernels.get(&handle) {
                let mut outputs = self.outputs.write();
                for port in &kind.output_ports {
                    if !port.has_buffers {
                        continue;
                    }
                    let port_ref = PortRef::single(port.ordinal);
                    let size = self
                        .size_requests
                        .get(&(handle, port_ref))
                        .copied()
                        .unwrap_or(1);
                    outputs
                        .entry((handle, port_ref))
                        .or_insert_with(|| Buffer::zeroed(size, port.element_size));
                }
            }
        }

        self.data_edges = data_edges;
    }

    pub fn kernel_data(&self, node: NodeHandle) -> Option<Box<dyn KernelData>> {
        self.kernel_data.get(&node).map(|b| dyn_clone::clone_box(&**b))
    }

    pub(crate) fn take_kernel_state(&mut self, node: NodeHandle) -> Option<Box<dyn Any + Send>> {
        self.kernel_state.remove(&node)
    }

    pub(crate) fn put_kernel_state(&mut self, node: NodeHandle, state: Box<dyn Any + Send>) {
        self.kernel_state.insert(node, state);
    }

    pub(crate) fn record_size_requests(&mut self, node: NodeHandle, requests: HashMap<PortRef, u32>) {
        for (port_ref, size) in requests {
            self.size_requests.insert((node, port_ref), size);
        }
    }

    /// Installs an input batch's external buffer as a synthetic producer
    /// for `node`'s `port` for the *current* render version only.
    pub fn install_batch_override(&mut self, node: NodeHandle, port: PortRef, buffer: Buffer) {
        self.batch_overrides.insert((node, port), buffer);
    }

    pub(crate) fn batch_override(&self, node: NodeHandle, port: PortRef) -> Option<&Buffer> {
        self.batch_overrides.get(&(node, port))
    }

    /// Post-fence readback of a data output's storage.
    pub fn read_output(&self, node: NodeHandle, port: PortOrdinal) -> Option<Buffer> {
        self.outputs.read().get(&(node, PortRef::single(port))).cloned()
    }
}
