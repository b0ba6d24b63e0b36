//! External interfaces (C8): input batches and graph values, the two
//! ways a host thread observes or drives the graph across a tick
//! boundary without going through a node.
//!
//! Grounded on `dozer_core::epoch`'s fence-then-read discipline (a
//! reader blocks on a barrier before touching state the writer side
//! owns) generalized from "one epoch barrier" to per-handle fencing on a
//! specific render version.

use crate::error::{BatchError, GraphError, Orphaned};
use crate::handle::{GraphValueMarker, InputBatchMarker, VersionedHandle, VersionedList};
use crate::node_set::NodeSet;
use crate::port::{PortOrdinal, PortRef};
use crate::render_graph::Buffer;
use crate::topology::NodeHandle;

pub type InputBatchHandle = VersionedHandle<InputBatchMarker>;
pub type GraphValueHandle = VersionedHandle<GraphValueMarker>;

struct PendingBatch {
    node: NodeHandle,
    port: PortRef,
    buffer: Buffer,
    /// The render version this batch was submitted for; it is installed
    /// as that tick's synthetic producer and then retired.
    fence_version: Option<u64>,
}

/// Deferred external writes into data inputs. A batch is installed as a
/// synthetic producer for exactly one render version, then discarded —
/// callers resubmit every tick they want the override to hold.
pub struct InputBatchQueue {
    pending: VersionedList<PendingBatch>,
}

impl Default for InputBatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InputBatchQueue {
    pub fn new() -> Self {
        Self {
            pending: VersionedList::new(3),
        }
    }

    /// Submits `buffer` to land on `(node, port)` for the next tick's
    /// render graph sync. Returns a handle whose fence version is not
    /// known until that tick has been scheduled.
    pub fn submit(&mut self, node: NodeHandle, port: PortRef, buffer: Buffer) -> InputBatchHandle {
        self.pending
            .allocate(PendingBatch {
                node,
                port,
                buffer,
                fence_version: None,
            })
            .cast()
    }

    /// Installs every still-pending batch as a render-graph override for
    /// the tick about to be scheduled, stamping each with the version it
    /// was applied at. Called by the host between `NodeSet::update()` and
    /// `schedule_tick()`.
    pub fn install_all(&mut self, node_set: &mut NodeSet, render_version: u64) {
        let handles: Vec<InputBatchHandle> = self.pending.iter().map(|(h, _)| h.cast()).collect();
        for handle in handles {
            if let Ok(batch) = self.pending.get_mut(handle.cast()) {
                batch.fence_version = Some(render_version);
                node_set
                    .render_graph_mut()
                    .install_batch_override(batch.node, batch.port, batch.buffer.clone());
            }
        }
    }

    /// Retires every batch that was installed for `render_version` or
    /// earlier; called once that tick has completed.
    pub fn retire(&mut self, render_version: u64) {
        let handles: Vec<InputBatchHandle> = self
            .pending
            .iter()
            .filter(|(_, b)| b.fence_version.is_some_and(|v| v <= render_version))
            .map(|(h, _)| h.cast())
            .collect();
        for handle in handles {
            let _ = self.pending.release(handle.cast());
        }
    }

    /// The render version a batch was installed for, or
    /// `PrematureBatchQuery` if it has not been scheduled into a tick yet.
    pub fn fence_version(&self, handle: InputBatchHandle) -> Result<u64, GraphError> {
        let batch = self.pending.get(handle.cast()).map_err(GraphError::from)?;
        batch.fence_version.ok_or(BatchError::PrematureBatchQuery.into())
    }
}

/// What a graph-value handle names: the output port it reads and the
/// render version it was fenced to when created. Rides the same
/// [`VersionedList`] arena as every other handle type (§3), so a released
/// handle reads back as [`ArenaError::Disposed`](crate::error::ArenaError::Disposed)
/// rather than silently continuing to resolve.
struct GraphValueEntry {
    node: NodeHandle,
    port: PortOrdinal,
    render_version: u64,
}

/// Reads graph values against a node set's render graph. A value whose
/// target node was destroyed after the handle was taken reads back as
/// [`Orphaned`] rather than erroring — the node's disappearance mid-flight
/// is an expected, non-fatal outcome (§4.8). Handles must be explicitly
/// released with [`GraphValues::release`] once a caller is done with them.
pub struct GraphValues {
    entries: VersionedList<GraphValueEntry>,
}

impl Default for GraphValues {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphValues {
    pub fn new() -> Self {
        Self {
            entries: VersionedList::new(4),
        }
    }

    /// Creates a handle fenced to the render graph's *current* version.
    /// The value is not legible until that version's tick has completed.
    pub fn create(&mut self, node_set: &NodeSet, node: NodeHandle, port: PortOrdinal) -> GraphValueHandle {
        self.entries
            .allocate(GraphValueEntry {
                node,
                port,
                render_version: node_set.render_graph().render_version(),
            })
            .cast()
    }

    /// Blocks logically on the fence: returns `None` if the owning tick
    /// has not advanced past the handle's render version yet. Returns
    /// `Some(Err(Orphaned))` if the tick completed but the node is gone.
    /// Returns `None` if `handle` was already released.
    pub fn try_get(&self, node_set: &NodeSet, handle: GraphValueHandle) -> Option<Result<Buffer, Orphaned>> {
        let entry = self.entries.get(handle.cast()).ok()?;
        if node_set.render_graph().render_version() < entry.render_version {
            return None;
        }
        if !node_set.exists(entry.node) {
            return Some(Err(Orphaned));
        }
        Some(node_set.render_graph().read_output(entry.node, entry.port).ok_or(Orphaned))
    }

    /// Releases a graph-value handle, freeing its arena slot for reuse
    /// (§3, "must still be explicitly released").
    pub fn release(&mut self, handle: GraphValueHandle) -> Result<(), GraphError> {
        self.entries.release(handle.cast())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{InitContext, KernelFns, NodeBehavior, NodeKind};
    use crate::node_set::NodeSetOptions;
    use crate::port::{PortCategory, PortDescriptor, PortDirection};

    struct SinkBehavior;
    impl NodeBehavior for SinkBehavior {
        fn init(&mut self, _ctx: &mut InitContext) {}
    }

    fn sink_kind(id: u32) -> NodeKind {
        NodeKind {
            id,
            name: "sink",
            input_ports: vec![PortDescriptor {
                ordinal: 0,
                direction: PortDirection::Input,
                category: PortCategory::Data,
                element_size: 4,
                has_buffers: true,
                is_port_array: false,
            }],
            output_ports: vec![],
            behavior_factory: || Box::new(SinkBehavior),
            kernel_data_factory: || Box::new(()) as Box<dyn crate::render_graph::KernelData>,
            kernel_state_factory: || Box::new(()) as Box<dyn std::any::Any + Send>,
            kernel: KernelFns::managed_only(|_, _, _, _| {}),
        }
    }

    #[test]
    fn batch_query_before_install_is_premature() {
        let mut queue = InputBatchQueue::new();
        let mut set = NodeSet::new(NodeSetOptions::default());
        let kind = set.register_kind(sink_kind(1));
        let node = set.create(kind).unwrap();
        let handle = queue.submit(node, PortRef::single(0), Buffer::from_i32_slice(&[9]));
        assert!(matches!(queue.fence_version(handle), Err(GraphError::Batch(BatchError::PrematureBatchQuery))));

        queue.install_all(&mut set, 1);
        assert_eq!(queue.fence_version(handle).unwrap(), 1);
    }

    #[test]
    fn graph_value_orphans_after_node_destroyed() {
        let mut set = NodeSet::new(NodeSetOptions::default());
        let kind = set.register_kind(sink_kind(2));
        let node = set.create(kind).unwrap();
        set.update().unwrap();
        let mut values = GraphValues::new();
        let value = values.create(&set, node, 0);
        set.destroy(node).unwrap();
        set.update().unwrap();
        assert!(matches!(values.try_get(&set, value), Some(Err(Orphaned))));
        values.release(value).unwrap();
        assert!(values.try_get(&set, value).is_none());
    }
}
