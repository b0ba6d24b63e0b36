//! Node set (C5): node lifecycle, topology mutation, and the synchronous
//! per-tick update/message/mutation contract (§4.5).
//!
//! Grounded on `dozer_core::dag::Dag`'s split between topology (handled by
//! [`crate::topology`]) and the owning container that actually holds node
//! instances — the same separation `dag_impl::Dag<T>` draws between its
//! `daggy::Dag` and the caller-supplied node payloads.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codegen::{InitContext, KindId, Message, MessageContext, NodeBehavior, NodeKind, UpdateContext};
use crate::error::{invariant_violated, DispatchError, GraphError};
use crate::handle::VersionedList;
use crate::port::{ForwardingTable, PortCategory, PortDescriptor, PortOrdinal, PortRef};
use crate::render_graph::{KernelData, RenderGraph};
use crate::topology::{AutoDisconnected, Connection, NodeHandle, PortLookup, TopologyStore};

/// Bounds the two recursion-prone traversals the node set performs at
/// runtime: synchronous message fan-out, and forwarded-port resolution.
#[derive(Clone, Copy, Debug)]
pub struct NodeSetOptions {
    pub max_message_recursion_depth: u32,
    pub max_forwarding_depth: u32,
}

impl Default for NodeSetOptions {
    fn default() -> Self {
        Self {
            max_message_recursion_depth: 16,
            max_forwarding_depth: 8,
        }
    }
}

/// A topology or lifecycle change requested from inside `update()`.
/// Applied at the start of the *next* call, per §4.5 step 4.
pub enum Mutation {
    Create { kind: KindId, token: u64 },
    Destroy(NodeHandle),
    Connect {
        source: NodeHandle,
        source_port: PortRef,
        dest: NodeHandle,
        dest_port: PortRef,
        category: PortCategory,
    },
    Disconnect {
        source: NodeHandle,
        source_port: PortRef,
        dest: NodeHandle,
        dest_port: PortRef,
    },
    SetPortArraySize { node: NodeHandle, port: PortOrdinal, size: u32 },
}

/// What happened while draining deferred mutations, keyed by the caller's
/// own `token` so a request made during `update()` can be matched back to
/// the handle it produced, plus the per-tick observability counters a
/// host uses the way it would read the teacher's own epoch summary.
#[derive(Default, Debug)]
pub struct UpdateReport {
    pub render_version: u64,
    pub ticked_nodes: u32,
    pub messages_dispatched: u32,
    pub created: Vec<(u64, NodeHandle)>,
    pub auto_disconnected: Vec<AutoDisconnected>,
}

struct Node {
    kind: Arc<NodeKind>,
    behavior: Box<dyn NodeBehavior>,
    forwarding: ForwardingTable,
    kernel_data: Box<dyn KernelData>,
}

struct NodeSetPortLookup<'a> {
    nodes: &'a VersionedList<Node>,
}

impl PortLookup for NodeSetPortLookup<'_> {
    fn port_descriptor(&self, node: NodeHandle, port: PortOrdinal) -> Option<PortDescriptor> {
        let node = self.nodes.get(node.cast()).ok()?;
        node.kind
            .input_ports
            .iter()
            .chain(node.kind.output_ports.iter())
            .find(|d| d.ordinal == port)
            .cloned()
    }
}

pub struct NodeSet {
    options: NodeSetOptions,
    nodes: VersionedList<Node>,
    topology: TopologyStore,
    kinds: HashMap<KindId, Arc<NodeKind>>,
    pending_mutations: Vec<Mutation>,
    destroyed_since_sync: Vec<NodeHandle>,
    render_graph: RenderGraph,
}

impl NodeSet {
    pub fn new(options: NodeSetOptions) -> Self {
        Self {
            options,
            nodes: VersionedList::new(1),
            topology: TopologyStore::new(),
            kinds: HashMap::new(),
            pending_mutations: Vec::new(),
            destroyed_since_sync: Vec::new(),
            render_graph: RenderGraph::new(),
        }
    }

    /// Registers a node kind's constant table, the explicit alternative to
    /// implicit `inventory`-style self-registration (§9 redesign note).
    pub fn register_kind(&mut self, kind: NodeKind) -> KindId {
        let id = kind.id;
        if self.kinds.contains_key(&id) {
            tracing::warn!(id, "re-registering node kind, previous registration discarded");
        }
        self.kinds.insert(id, Arc::new(kind));
        id
    }

    pub fn topology(&self) -> &TopologyStore {
        &self.topology
    }

    pub fn render_graph(&self) -> &RenderGraph {
        &self.render_graph
    }

    pub fn render_graph_mut(&mut self) -> &mut RenderGraph {
        &mut self.render_graph
    }

    pub fn node_kind(&self, handle: NodeHandle) -> Option<&NodeKind> {
        self.nodes.get(handle.cast()).ok().map(|n| n.kind.as_ref())
    }

    pub fn node_kind_arc(&self, handle: NodeHandle) -> Option<Arc<NodeKind>> {
        self.nodes.get(handle.cast()).ok().map(|n| n.kind.clone())
    }

    pub fn exists(&self, handle: NodeHandle) -> bool {
        self.nodes.exists(handle.cast())
    }

    pub fn options(&self) -> NodeSetOptions {
        self.options
    }

    pub fn create(&mut self, kind_id: KindId) -> Result<NodeHandle, GraphError> {
        let kind = self
            .kinds
            .get(&kind_id)
            .cloned()
            .ok_or_else(|| invariant_violated(format!("unregistered node kind {kind_id}")))?;
        let behavior = (kind.behavior_factory)();
        let kernel_data = (kind.kernel_data_factory)();
        let node = Node {
            kind,
            behavior,
            forwarding: ForwardingTable::default(),
            kernel_data,
        };
        let handle: NodeHandle = self.nodes.allocate(node).cast();
        self.topology.add_vertex(handle);

        let node_mut = self.nodes.get_mut(handle.cast())?;
        let mut ctx = InitContext {
            handle,
            forwarding: &mut node_mut.forwarding,
            kernel_data: node_mut.kernel_data.as_mut(),
        };
        node_mut.behavior.init(&mut ctx);

        tracing::debug!(?handle, kind = kind_id, "node created");
        Ok(handle)
    }

    pub fn destroy(&mut self, handle: NodeHandle) -> Result<(), GraphError> {
        {
            let node_mut = self.nodes.get_mut(handle.cast())?;
            let mut ctx = InitContext {
                handle,
                forwarding: &mut node_mut.forwarding,
                kernel_data: node_mut.kernel_data.as_mut(),
            };
            node_mut.behavior.destroy(&mut ctx);
        }
        self.nodes.release(handle.cast())?;
        self.topology.remove_vertex(handle);
        self.destroyed_since_sync.push(handle);
        tracing::debug!(?handle, "node destroyed");
        Ok(())
    }

    /// Resolves `(node, port)` through any forwarding chain declared at
    /// `init`, up to the configured depth (`DispatchError::ForwardingCycle`
    /// past that).
    fn resolve_port(&self, node: NodeHandle, port: PortOrdinal) -> Result<(NodeHandle, PortOrdinal), GraphError> {
        let mut current = (node, port);
        let mut depth = 0u32;
        loop {
            let n = self.nodes.get(current.0.cast())?;
            match n.forwarding.resolve_one(current.1) {
                Some(next) => {
                    current = next;
                    depth += 1;
                    if depth > self.options.max_forwarding_depth {
                        return Err(DispatchError::ForwardingCycle(self.options.max_forwarding_depth).into());
                    }
                }
                None => return Ok(current),
            }
        }
    }

    pub fn connect(
        &mut self,
        source: NodeHandle,
        source_port: PortRef,
        dest: NodeHandle,
        dest_port: PortRef,
        category: PortCategory,
    ) -> Result<(), GraphError> {
        let (source, resolved_source_port) = self.resolve_port(source, source_port.port)?;
        let (dest, resolved_dest_port) = self.resolve_port(dest, dest_port.port)?;
        let source_ref = PortRef {
            port: resolved_source_port,
            array_index: source_port.array_index,
        };
        let dest_ref = PortRef {
            port: resolved_dest_port,
            array_index: dest_port.array_index,
        };
        let lookup = NodeSetPortLookup { nodes: &self.nodes };
        self.topology.connect(&lookup, source, source_ref, dest, dest_ref, category)?;
        Ok(())
    }

    pub fn disconnect(
        &mut self,
        source: NodeHandle,
        source_port: PortRef,
        dest: NodeHandle,
        dest_port: PortRef,
    ) -> Result<(), GraphError> {
        let (source, resolved_source_port) = self.resolve_port(source, source_port.port)?;
        let (dest, resolved_dest_port) = self.resolve_port(dest, dest_port.port)?;
        let source_ref = PortRef {
            port: resolved_source_port,
            array_index: source_port.array_index,
        };
        let dest_ref = PortRef {
            port: resolved_dest_port,
            array_index: dest_port.array_index,
        };
        self.topology.disconnect(source, source_ref, dest, dest_ref)?;
        Ok(())
    }

    pub fn set_port_array_size(&mut self, node: NodeHandle, port: PortOrdinal, size: u32) -> Result<Vec<AutoDisconnected>, GraphError> {
        let (node, port) = self.resolve_port(node, port)?;
        Ok(self.topology.set_port_array_size(node, port, size))
    }

    pub fn send_message(&mut self, node: NodeHandle, port: PortOrdinal, message: Message) -> Result<(), GraphError> {
        let (node, port) = self.resolve_port(node, port)?;
        let mut outbox = Vec::new();
        {
            let n = self.nodes.get_mut(node.cast())?;
            let mut ctx = MessageContext {
                handle: node,
                outbox: &mut outbox,
            };
            n.behavior.on_message(&mut ctx, port, &message);
        }
        let mut dispatched = 0;
        self.dispatch_messages(node, outbox, 0, &mut dispatched)
    }

    pub fn send_message_to_array(&mut self, node: NodeHandle, port: PortOrdinal, index: u32, message: Message) -> Result<(), GraphError> {
        let (node, port) = self.resolve_port(node, port)?;
        let mut outbox = Vec::new();
        {
            let n = self.nodes.get_mut(node.cast())?;
            let mut ctx = MessageContext {
                handle: node,
                outbox: &mut outbox,
            };
            n.behavior.on_array_message(&mut ctx, port, index, &message);
        }
        let mut dispatched = 0;
        self.dispatch_messages(node, outbox, 0, &mut dispatched)
    }

    /// Depth-first delivery of every message a node's handler queued,
    /// recursing into each recipient's own reaction before moving to the
    /// next queued message (§4.5 step 3). `dispatched` accumulates a count
    /// of every handler invoked, for `UpdateReport::messages_dispatched`.
    fn dispatch_messages(
        &mut self,
        source: NodeHandle,
        outbox: Vec<(PortOrdinal, Message)>,
        depth: u32,
        dispatched: &mut u32,
    ) -> Result<(), GraphError> {
        if depth > self.options.max_message_recursion_depth {
            return Err(DispatchError::MessageCycle(self.options.max_message_recursion_depth).into());
        }
        for (port, message) in outbox {
            let targets: Vec<(NodeHandle, PortOrdinal, Option<u32>)> = self
                .topology
                .connections()
                .filter(|c| c.category == PortCategory::Message && c.source == source && c.source_port == port)
                .map(|c| (c.dest, c.dest_port, c.dest_array_index))
                .collect();
            for (dest, dest_port, dest_array_index) in targets {
                let mut nested = Vec::new();
                {
                    let node = self.nodes.get_mut(dest.cast())?;
                    let mut ctx = MessageContext {
                        handle: dest,
                        outbox: &mut nested,
                    };
                    match dest_array_index {
                        Some(index) => node.behavior.on_array_message(&mut ctx, dest_port, index, &message),
                        None => node.behavior.on_message(&mut ctx, dest_port, &message),
                    }
                }
                *dispatched += 1;
                self.dispatch_messages(dest, nested, depth + 1, dispatched)?;
            }
        }
        Ok(())
    }

    fn apply_mutation(&mut self, mutation: Mutation, report: &mut UpdateReport) -> Result<(), GraphError> {
        match mutation {
            Mutation::Create { kind, token } => {
                let handle = self.create(kind)?;
                report.created.push((token, handle));
            }
            Mutation::Destroy(handle) => self.destroy(handle)?,
            Mutation::Connect {
                source,
                source_port,
                dest,
                dest_port,
                category,
            } => self.connect(source, source_port, dest, dest_port, category)?,
            Mutation::Disconnect {
                source,
                source_port,
                dest,
                dest_port,
            } => self.disconnect(source, source_port, dest, dest_port)?,
            Mutation::SetPortArraySize { node, port, size } => {
                let events = self.set_port_array_size(node, port, size)?;
                report.auto_disconnected.extend(events);
            }
        }
        Ok(())
    }

    /// The full tick contract (§4.5):
    /// 1. drain mutations deferred from the previous tick, then rebuild
    ///    the traversal cache;
    /// 2. run every node with an `OnUpdate` handler, in traversal order;
    /// 3. synchronously fan out whatever messages step 2 queued;
    /// 4. mutations requested during steps 2/3 are held for the *next*
    ///    call rather than applied now;
    /// 5. sync the render graph from the post-mutation, post-message
    ///    simulation state.
    pub fn update(&mut self) -> Result<UpdateReport, GraphError> {
        let mut report = UpdateReport::default();

        let mutations = std::mem::take(&mut self.pending_mutations);
        for mutation in mutations {
            self.apply_mutation(mutation, &mut report)?;
        }
        self.topology.rebuild_traversal()?;

        let order: Vec<NodeHandle> = self.topology.traversal().ordered().collect();
        let mut next_mutations = Vec::new();
        for node_handle in order {
            let has_update = self.nodes.get(node_handle.cast())?.behavior.has_update();
            if !has_update {
                continue;
            }
            let mut outbox = Vec::new();
            {
                let node_mut = self.nodes.get_mut(node_handle.cast())?;
                let mut ctx = UpdateContext {
                    handle: node_handle,
                    outbox: &mut outbox,
                    mutations: &mut next_mutations,
                    kernel_data: node_mut.kernel_data.as_mut(),
                };
                node_mut.behavior.on_update(&mut ctx);
            }
            report.ticked_nodes += 1;
            self.dispatch_messages(node_handle, outbox, 0, &mut report.messages_dispatched)?;
        }

        self.pending_mutations = next_mutations;

        self.sync_render_graph();
        report.render_version = self.render_graph.render_version();
        Ok(report)
    }

    fn sync_render_graph(&mut self) {
        let kernels: HashMap<NodeHandle, Arc<NodeKind>> =
            self.nodes.iter().map(|(h, n)| (h.cast(), n.kind.clone())).collect();
        let live: Vec<(NodeHandle, Box<dyn KernelData>)> = self
            .nodes
            .iter()
            .map(|(h, n)| (h.cast(), dyn_clone::clone_box(&*n.kernel_data)))
            .collect();
        let destroyed = std::mem::take(&mut self.destroyed_since_sync);
        let data_edges: Vec<Connection> = self
            .topology
            .connections()
            .filter(|c| c.category == PortCategory::Data)
            .cloned()
            .collect();
        self.render_graph.sync(live, destroyed, data_edges, &kernels);
    }
}
