//! Topology store (C2): the vertex set, the flat connection list, and the
//! dirty set that drives traversal-cache rebuilds.
//!
//! Grounded on `dozer_core::dag_impl::Dag::connect` — validate both
//! endpoints' ports before touching any state, reject with a specific
//! error variant, never leave the graph half-mutated.

use std::collections::{HashMap, HashSet};

use crate::error::TopologyError;
use crate::handle::{NodeMarker, VersionedHandle};
use crate::port::{PortCategory, PortDescriptor, PortDirection, PortOrdinal, PortRef};
use crate::traversal::TraversalCache;

pub type NodeHandle = VersionedHandle<NodeMarker>;

/// A directed edge between a source output port and a destination input
/// port, tagged with the traffic category both endpoints agreed on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Connection {
    pub source: NodeHandle,
    pub source_port: PortOrdinal,
    pub source_array_index: Option<u32>,
    pub dest: NodeHandle,
    pub dest_port: PortOrdinal,
    pub dest_array_index: Option<u32>,
    pub category: PortCategory,
}

impl Connection {
    fn matches(&self, source: NodeHandle, sp: PortRef, dest: NodeHandle, dp: PortRef) -> bool {
        self.source == source
            && self.source_port == sp.port
            && self.source_array_index == sp.array_index
            && self.dest == dest
            && self.dest_port == dp.port
            && self.dest_array_index == dp.array_index
    }
}

/// A port-array shrink, or a vertex removal, disconnected this edge as a
/// side effect.
#[derive(Clone, Debug)]
pub struct AutoDisconnected {
    pub connection: Connection,
}

/// Supplies port descriptors so [`TopologyStore`] can validate a connect
/// or array-resize call without owning node storage itself. Implemented
/// by the node set (C5).
pub trait PortLookup {
    fn port_descriptor(&self, node: NodeHandle, port: PortOrdinal) -> Option<PortDescriptor>;
}

pub struct TopologyStore {
    vertices: HashSet<NodeHandle>,
    connections: Vec<Connection>,
    array_sizes: HashMap<(NodeHandle, PortOrdinal), u32>,
    traversal: TraversalCache,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyStore {
    pub fn new() -> Self {
        Self {
            vertices: HashSet::new(),
            connections: Vec::new(),
            array_sizes: HashMap::new(),
            traversal: TraversalCache::new(),
        }
    }

    pub fn traversal(&self) -> &TraversalCache {
        &self.traversal
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    pub fn add_vertex(&mut self, handle: NodeHandle) {
        self.vertices.insert(handle);
        self.traversal.add_vertex(handle);
    }

    /// Removes `handle` and cascades removal of every incident connection.
    pub fn remove_vertex(&mut self, handle: NodeHandle) -> Vec<AutoDisconnected> {
        self.vertices.remove(&handle);
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .connections
            .drain(..)
            .partition(|c| c.source == handle || c.dest == handle);
        self.connections = kept;
        self.array_sizes.retain(|(node, _), _| *node != handle);
        self.traversal.remove_vertex(handle);
        removed
            .into_iter()
            .map(|connection| AutoDisconnected { connection })
            .collect()
    }

    pub fn mark_dirty(&mut self, handle: NodeHandle) {
        self.traversal.mark_dirty(handle);
    }

    /// Rebuilds the traversal cache if anything has been marked dirty
    /// since the last call. Invoked once per `NodeSet::update()`.
    pub fn rebuild_traversal(&mut self) -> Result<(), TopologyError> {
        self.traversal.rebuild().map_err(TopologyError::CycleAt)
    }

    pub fn connect(
        &mut self,
        lookup: &dyn PortLookup,
        source: NodeHandle,
        source_port: PortRef,
        dest: NodeHandle,
        dest_port: PortRef,
        category: PortCategory,
    ) -> Result<(), TopologyError> {
        let source_desc = lookup
            .port_descriptor(source, source_port.port)
            .ok_or(TopologyError::UnknownPort {
                node: source,
                port: source_port.port,
            })?;
        if !source_desc.matches(PortDirection::Output, category) {
            return Err(TopologyError::PortTypeMismatch {
                node: source,
                port: source_port.port,
                expected: category,
                found: source_desc.category,
            });
        }

        let dest_desc = lookup
            .port_descriptor(dest, dest_port.port)
            .ok_or(TopologyError::UnknownPort {
                node: dest,
                port: dest_port.port,
            })?;
        if !dest_desc.matches(PortDirection::Input, category) {
            return Err(TopologyError::PortTypeMismatch {
                node: dest,
                port: dest_port.port,
                expected: category,
                found: dest_desc.category,
            });
        }

        // I3: at most one incoming data edge per non-array data input.
        if category == PortCategory::Data && !dest_desc.is_port_array {
            let duplicate = self
                .connections
                .iter()
                .any(|c| c.dest == dest && c.dest_port == dest_port.port && c.category == PortCategory::Data);
            if duplicate {
                return Err(TopologyError::DuplicateDataInput {
                    node: dest,
                    port: dest_port.port,
                });
            }
        }

        let connection = Connection {
            source,
            source_port: source_port.port,
            source_array_index: source_port.array_index,
            dest,
            dest_port: dest_port.port,
            dest_array_index: dest_port.array_index,
            category,
        };

        // I4: data/DSL edges must keep the subgraph acyclic; message edges
        // are allowed to cycle (bounded instead by recursion depth at
        // dispatch time).
        if matches!(category, PortCategory::Data | PortCategory::DslLink) {
            self.traversal
                .try_add_edge(connection.clone())
                .map_err(|(source, dest)| TopologyError::CycleCreated {
                    source_node: source,
                    dest_node: dest,
                })?;
        }

        tracing::debug!(?source, ?dest, ?category, "connected");
        self.connections.push(connection);
        Ok(())
    }

    /// Requires the exact edge; not idempotent.
    pub fn disconnect(
        &mut self,
        source: NodeHandle,
        source_port: PortRef,
        dest: NodeHandle,
        dest_port: PortRef,
    ) -> Result<(), TopologyError> {
        let position = self
            .connections
            .iter()
            .position(|c| c.matches(source, source_port, dest, dest_port))
            .ok_or(TopologyError::NoSuchEdge {
                source_node: source,
                source_port: source_port.port,
                dest_node: dest,
                dest_port: dest_port.port,
            })?;
        let connection = self.connections.remove(position);
        if matches!(connection.category, PortCategory::Data | PortCategory::DslLink) {
            self.traversal.remove_edge(&connection);
        }
        tracing::debug!(?source, ?dest, "disconnected");
        Ok(())
    }

    /// Grows or shrinks a port array. Shrinking past an existing
    /// connection's array index auto-disconnects it.
    pub fn set_port_array_size(
        &mut self,
        node: NodeHandle,
        port: PortOrdinal,
        size: u32,
    ) -> Vec<AutoDisconnected> {
        self.array_sizes.insert((node, port), size);

        let (removed, kept): (Vec<_>, Vec<_>) = self.connections.drain(..).partition(|c| {
            (c.source == node && c.source_port == port && c.source_array_index.is_some_and(|i| i >= size))
                || (c.dest == node && c.dest_port == port && c.dest_array_index.is_some_and(|i| i >= size))
        });
        self.connections = kept;

        let mut events = Vec::with_capacity(removed.len());
        for connection in removed {
            if matches!(connection.category, PortCategory::Data | PortCategory::DslLink) {
                self.traversal.remove_edge(&connection);
            }
            tracing::debug!(?connection, "auto-disconnected by array resize");
            events.push(AutoDisconnected { connection });
        }
        events
    }

    pub fn port_array_size(&self, node: NodeHandle, port: PortOrdinal) -> u32 {
        self.array_sizes.get(&(node, port)).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::VersionedList;

    struct FixedPorts;
    impl PortLookup for FixedPorts {
        fn port_descriptor(&self, _node: NodeHandle, port: PortOrdinal) -> Option<PortDescriptor> {
            Some(PortDescriptor {
                ordinal: port,
                direction: if port == 0 {
                    PortDirection::Output
                } else {
                    PortDirection::Input
                },
                category: PortCategory::Data,
                element_size: 4,
                has_buffers: true,
                is_port_array: port == 2,
            })
        }
    }

    fn two_nodes() -> (TopologyStore, NodeHandle, NodeHandle) {
        let mut arena = VersionedList::<()>::new(1);
        let a: NodeHandle = arena.allocate(()).cast();
        let b: NodeHandle = arena.allocate(()).cast();
        let mut topology = TopologyStore::new();
        topology.add_vertex(a);
        topology.add_vertex(b);
        (topology, a, b)
    }

    #[test]
    fn connect_then_rebuild_orders_dependency() {
        let (mut topology, a, b) = two_nodes();
        let lookup = FixedPorts;
        topology
            .connect(&lookup, a, PortRef::single(0), b, PortRef::single(1), PortCategory::Data)
            .unwrap();
        topology.rebuild_traversal().unwrap();
        let order: Vec<_> = topology.traversal().ordered().collect();
        assert_eq!(order, vec![a, b]);
    }

    #[test]
    fn cycle_rejected_and_topology_unchanged() {
        let (mut topology, a, b) = two_nodes();
        let lookup = FixedPorts;
        topology
            .connect(&lookup, a, PortRef::single(0), b, PortRef::single(1), PortCategory::Data)
            .unwrap();
        let err = topology.connect(&lookup, b, PortRef::single(0), a, PortRef::single(1), PortCategory::Data);
        assert!(matches!(err, Err(TopologyError::CycleCreated { .. })));
        assert_eq!(topology.connections().count(), 1);
    }

    #[test]
    fn duplicate_data_input_rejected() {
        let (mut topology, a, b) = two_nodes();
        let lookup = FixedPorts;
        topology
            .connect(&lookup, a, PortRef::single(0), b, PortRef::single(1), PortCategory::Data)
            .unwrap();
        let err = topology.connect(&lookup, a, PortRef::single(0), b, PortRef::single(1), PortCategory::Data);
        assert!(matches!(err, Err(TopologyError::DuplicateDataInput { .. })));
    }

    #[test]
    fn array_shrink_auto_disconnects_excess() {
        let (mut topology, a, b) = two_nodes();
        topology.set_port_array_size(b, 2, 3);
        let lookup = FixedPorts;
        for i in 0..3u32 {
            topology
                .connect(&lookup, a, PortRef::single(0), b, PortRef::array(2, i), PortCategory::Data)
                .unwrap();
        }
        let events = topology.set_port_array_size(b, 2, 2);
        assert_eq!(events.len(), 1);
        assert_eq!(topology.connections().count(), 2);
    }
}
