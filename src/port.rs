//! Port model (C4): typed descriptors, port arrays, and the forwarding
//! table used to alias an outer port onto an inner node's port.

use std::fmt;

use crate::topology::NodeHandle;

pub type PortOrdinal = u16;

/// Low 16 bits of a port's raw storage are the ordinal; everything from
/// bit 16 up is tag flags. `IS_DFG_PORT` and `IS_ECS_PORT` never overlap.
pub const IS_DFG_PORT: u32 = 1 << 16;
pub const IS_ECS_PORT: u32 = 1 << 17;

/// A port identified within a node: an ordinal plus its origin tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u32);

impl PortId {
    pub fn dfg(ordinal: PortOrdinal) -> Self {
        Self(ordinal as u32 | IS_DFG_PORT)
    }

    pub fn ecs(ordinal: PortOrdinal) -> Self {
        Self(ordinal as u32 | IS_ECS_PORT)
    }

    pub fn ordinal(&self) -> PortOrdinal {
        (self.0 & 0xffff) as PortOrdinal
    }

    pub fn is_dfg_port(&self) -> bool {
        self.0 & IS_DFG_PORT != 0
    }

    pub fn is_ecs_port(&self) -> bool {
        self.0 & IS_ECS_PORT != 0
    }
}

impl fmt::Debug for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortId({}, dfg={}, ecs={})", self.ordinal(), self.is_dfg_port(), self.is_ecs_port())
    }
}

/// A port's direction: data flows out of an `Output` and into an `Input`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PortDirection {
    Input,
    Output,
}

/// What kind of traffic a port carries. Mirrors the traversal flags on
/// [`crate::topology::Connection`] — a connection's category must match
/// both endpoints' categories.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PortCategory {
    Message,
    Data,
    DslLink,
}

/// A node-kind-level, compile-time-generated port descriptor (§6 codegen
/// contract: ordinals are assigned by a port-definition initializer given
/// running `(in, out)` counters).
#[derive(Clone, Debug)]
pub struct PortDescriptor {
    pub ordinal: PortOrdinal,
    pub direction: PortDirection,
    pub category: PortCategory,
    pub element_size: u32,
    pub has_buffers: bool,
    pub is_port_array: bool,
}

impl PortDescriptor {
    pub fn matches(&self, direction: PortDirection, category: PortCategory) -> bool {
        self.direction == direction && self.category == category
    }
}

/// A reference to a single endpoint, with an optional array index for
/// port-array ordinals.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PortRef {
    pub port: PortOrdinal,
    pub array_index: Option<u32>,
}

impl PortRef {
    pub fn single(port: PortOrdinal) -> Self {
        Self {
            port,
            array_index: None,
        }
    }

    pub fn array(port: PortOrdinal, index: u32) -> Self {
        Self {
            port,
            array_index: Some(index),
        }
    }
}

/// One entry in a node's forwarding table: `outer_port` is rewritten to
/// `(inner_node, inner_port)` before reaching the topology store.
#[derive(Clone, Copy, Debug)]
pub struct ForwardingEntry {
    pub outer_port: PortOrdinal,
    pub inner_node: NodeHandle,
    pub inner_port: PortOrdinal,
}

/// Per-node forwarding table. Only ever populated during that node's
/// `init` callback; a reused arena slot always starts from an empty table.
#[derive(Clone, Debug, Default)]
pub struct ForwardingTable {
    entries: Vec<ForwardingEntry>,
}

impl ForwardingTable {
    pub fn declare(&mut self, outer_port: PortOrdinal, inner_node: NodeHandle, inner_port: PortOrdinal) {
        self.entries.push(ForwardingEntry {
            outer_port,
            inner_node,
            inner_port,
        });
    }

    pub fn resolve_one(&self, port: PortOrdinal) -> Option<(NodeHandle, PortOrdinal)> {
        self.entries
            .iter()
            .find(|e| e.outer_port == port)
            .map(|e| (e.inner_node, e.inner_port))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_id_roundtrips_ordinal_and_tag() {
        let p = PortId::dfg(7);
        assert_eq!(p.ordinal(), 7);
        assert!(p.is_dfg_port());
        assert!(!p.is_ecs_port());
    }
}
