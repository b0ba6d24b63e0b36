//! Traversal cache (C3): the flattened, islands-partitioned, ordered view
//! of the data+DSL subgraph that the scheduler and DSL walkers consume.
//!
//! Grounded on `dozer_core::dag_impl::Dag`: a `daggy::Dag` mirror plus a
//! `NodeHandle -> NodeIndex` lookup table, with `daggy`'s own cycle
//! rejection doing the heavy lifting for invariant I4. What the teacher's
//! `Dag` doesn't need and this does: a materialized topological order,
//! split into weakly-connected islands, with per-vertex parent/child
//! connection slices kept around so walkers don't re-derive them.

use std::collections::{HashMap, HashSet, VecDeque};

use daggy::petgraph::visit::EdgeRef;

use crate::topology::{Connection, NodeHandle};

/// Selects which connection categories a walk should traverse.
#[derive(Clone, Copy, Debug, Default)]
pub struct Hierarchy {
    pub message: bool,
    pub data: bool,
    pub dsl: bool,
}

impl Hierarchy {
    pub const DATA_ONLY: Self = Self {
        message: false,
        data: true,
        dsl: false,
    };
    pub const DSL_ONLY: Self = Self {
        message: false,
        data: false,
        dsl: true,
    };
    pub const ALL: Self = Self {
        message: true,
        data: true,
        dsl: true,
    };

    fn accepts(&self, connection: &Connection) -> bool {
        use crate::port::PortCategory::*;
        match connection.category {
            Message => self.message,
            Data => self.data,
            DslLink => self.dsl,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrderedEntry {
    pub vertex: NodeHandle,
    pub island_id: u32,
    parent_range: (usize, usize),
    child_range: (usize, usize),
}

#[derive(Clone, Copy, Debug)]
pub struct Island {
    pub offset_in_ordered: usize,
    pub count: usize,
}

pub struct TraversalCache {
    graph: daggy::Dag<NodeHandle, Connection>,
    node_index: HashMap<NodeHandle, daggy::NodeIndex>,
    ordered: Vec<OrderedEntry>,
    parent_entries: Vec<Connection>,
    child_entries: Vec<Connection>,
    islands: Vec<Island>,
    roots: Vec<usize>,
    leaves: Vec<usize>,
    dirty: HashSet<NodeHandle>,
}

impl Default for TraversalCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TraversalCache {
    pub fn new() -> Self {
        Self {
            graph: daggy::Dag::new(),
            node_index: HashMap::new(),
            ordered: Vec::new(),
            parent_entries: Vec::new(),
            child_entries: Vec::new(),
            islands: Vec::new(),
            roots: Vec::new(),
            leaves: Vec::new(),
            dirty: HashSet::new(),
        }
    }

    pub fn add_vertex(&mut self, handle: NodeHandle) {
        let index = self.graph.add_node(handle);
        self.node_index.insert(handle, index);
        self.dirty.insert(handle);
    }

    /// Removes `handle` and every incident edge. The underlying
    /// `petgraph::Graph::remove_node` relabels the last node into the
    /// freed slot, so the lookup table is patched to match.
    pub fn remove_vertex(&mut self, handle: NodeHandle) {
        let Some(&index) = self.node_index.get(&handle) else {
            return;
        };
        let last_index = daggy::NodeIndex::new(self.graph.node_count() - 1);
        let moved_handle = (last_index != index).then(|| self.graph[last_index]);

        self.graph.remove_node(index);
        self.node_index.remove(&handle);
        if let Some(moved_handle) = moved_handle {
            self.node_index.insert(moved_handle, index);
        }
        self.dirty.remove(&handle);
    }

    pub fn mark_dirty(&mut self, handle: NodeHandle) {
        self.dirty.insert(handle);
    }

    /// Adds `connection` as an edge from `connection.source` to
    /// `connection.dest`. Rejects the edge (leaving the graph untouched)
    /// if it would create a cycle, satisfying invariant I4.
    pub fn try_add_edge(&mut self, connection: Connection) -> Result<(), (NodeHandle, NodeHandle)> {
        let source_index = self.node_index[&connection.source];
        let dest_index = self.node_index[&connection.dest];
        self.graph
            .add_edge(source_index, dest_index, connection.clone())
            .map(|_| ())
            .map_err(|_| (connection.source, connection.dest))?;
        self.dirty.insert(connection.source);
        self.dirty.insert(connection.dest);
        Ok(())
    }

    pub fn remove_edge(&mut self, connection: &Connection) -> bool {
        let Some(&source_index) = self.node_index.get(&connection.source) else {
            return false;
        };
        let Some(&dest_index) = self.node_index.get(&connection.dest) else {
            return false;
        };
        let edge = self
            .graph
            .graph()
            .edges_connecting(source_index, dest_index)
            .find(|e| {
                e.weight().source_port == connection.source_port
                    && e.weight().dest_port == connection.dest_port
            })
            .map(|e| e.id());
        if let Some(edge) = edge {
            self.graph.remove_edge(edge);
            self.dirty.insert(connection.source);
            self.dirty.insert(connection.dest);
            true
        } else {
            false
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Incremental rebuild (§4.3):
    /// 1. expand the dirty set to the full islands it touches;
    /// 2. Kahn-order each touched island, tying ties on `(container_id, index)`;
    /// 3. report the first residual cycle, if any;
    /// 4. replace the old `ordered`/`parent_entries`/`child_entries` with
    ///    the recomputed islands, keeping untouched islands as they were.
    pub fn rebuild(&mut self) -> Result<(), NodeHandle> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        // Step 1: touched islands, found by BFS over undirected adjacency
        // starting from each dirty vertex.
        let mut visited: HashSet<daggy::NodeIndex> = HashSet::new();
        let mut touched_components: Vec<Vec<daggy::NodeIndex>> = Vec::new();
        let dirty_indexes: Vec<daggy::NodeIndex> = self
            .dirty
            .iter()
            .filter_map(|h| self.node_index.get(h).copied())
            .collect();
        for start in dirty_indexes {
            if visited.contains(&start) {
                continue;
            }
            let mut component = Vec::new();
            let mut queue = VecDeque::from([start]);
            visited.insert(start);
            while let Some(node) = queue.pop_front() {
                component.push(node);
                let mut neighbors: Vec<daggy::NodeIndex> = self
                    .graph
                    .graph()
                    .neighbors_undirected(node)
                    .collect();
                neighbors.sort_unstable();
                neighbors.dedup();
                for n in neighbors {
                    if visited.insert(n) {
                        queue.push_back(n);
                    }
                }
            }
            touched_components.push(component);
        }

        // Step 2+3: Kahn order each touched component.
        let mut new_islands: Vec<(Vec<OrderedEntry>, Vec<Connection>, Vec<Connection>)> =
            Vec::new();
        for component in &touched_components {
            let ordered = self.kahn_order(component).map_err(|cycle_at| {
                tracing::error!(?cycle_at, "traversal cache: cycle detected during rebuild");
                cycle_at
            })?;
            let mut parent_entries = Vec::new();
            let mut child_entries = Vec::new();
            let mut entries = Vec::new();
            for vertex in ordered {
                let index = self.node_index[&vertex];
                let parent_start = parent_entries.len();
                for edge in self.graph.graph().edges_directed(
                    index,
                    daggy::petgraph::Direction::Incoming,
                ) {
                    parent_entries.push(edge.weight().clone());
                }
                let parent_range = (parent_start, parent_entries.len());

                let child_start = child_entries.len();
                for edge in self
                    .graph
                    .graph()
                    .edges_directed(index, daggy::petgraph::Direction::Outgoing)
                {
                    child_entries.push(edge.weight().clone());
                }
                let child_range = (child_start, child_entries.len());

                entries.push(OrderedEntry {
                    vertex,
                    island_id: 0, // patched below
                    parent_range,
                    child_range,
                });
            }
            new_islands.push((entries, parent_entries, child_entries));
        }

        // Step 4: drop the old entries for every vertex that belonged to a
        // touched island (whether or not it was itself dirty), then
        // append the freshly computed islands.
        let touched_vertices: HashSet<NodeHandle> = touched_components
            .iter()
            .flatten()
            .map(|&idx| self.graph[idx])
            .collect();

        let mut kept_ordered = Vec::new();
        let mut kept_parents = Vec::new();
        let mut kept_children = Vec::new();
        let mut kept_islands = Vec::new();
        for island in &self.islands {
            let slice = &self.ordered[island.offset_in_ordered..island.offset_in_ordered + island.count];
            if slice.iter().any(|e| touched_vertices.contains(&e.vertex)) {
                continue;
            }
            let offset = kept_ordered.len();
            for entry in slice {
                let (ps, pe) = entry.parent_range;
                let (cs, ce) = entry.child_range;
                let new_parent_start = kept_parents.len();
                kept_parents.extend_from_slice(&self.parent_entries[ps..pe]);
                let new_child_start = kept_children.len();
                kept_children.extend_from_slice(&self.child_entries[cs..ce]);
                kept_ordered.push(OrderedEntry {
                    vertex: entry.vertex,
                    island_id: kept_islands.len() as u32,
                    parent_range: (new_parent_start, kept_parents.len()),
                    child_range: (new_child_start, kept_children.len()),
                });
            }
            kept_islands.push(Island {
                offset_in_ordered: offset,
                count: slice.len(),
            });
        }

        for (mut entries, parents, children) in new_islands {
            if entries.is_empty() {
                continue;
            }
            let island_id = kept_islands.len() as u32;
            let parent_base = kept_parents.len();
            let child_base = kept_children.len();
            for entry in &mut entries {
                entry.island_id = island_id;
                entry.parent_range = (entry.parent_range.0 + parent_base, entry.parent_range.1 + parent_base);
                entry.child_range = (entry.child_range.0 + child_base, entry.child_range.1 + child_base);
            }
            let offset = kept_ordered.len();
            kept_parents.extend(parents);
            kept_children.extend(children);
            let count = entries.len();
            kept_ordered.extend(entries);
            kept_islands.push(Island {
                offset_in_ordered: offset,
                count,
            });
        }

        self.ordered = kept_ordered;
        self.parent_entries = kept_parents;
        self.child_entries = kept_children;
        self.islands = kept_islands;
        self.roots = self
            .ordered
            .iter()
            .enumerate()
            .filter(|(_, e)| e.parent_range.0 == e.parent_range.1)
            .map(|(i, _)| i)
            .collect();
        self.leaves = self
            .ordered
            .iter()
            .enumerate()
            .filter(|(_, e)| e.child_range.0 == e.child_range.1)
            .map(|(i, _)| i)
            .collect();
        self.dirty.clear();
        Ok(())
    }

    /// Kahn's algorithm restricted to `component`, tie-broken on
    /// `(container_id, index)` for determinism.
    fn kahn_order(&self, component: &[daggy::NodeIndex]) -> Result<Vec<NodeHandle>, NodeHandle> {
        let member: HashSet<daggy::NodeIndex> = component.iter().copied().collect();
        let mut in_degree: HashMap<daggy::NodeIndex, usize> = HashMap::new();
        for &node in component {
            let degree = self
                .graph
                .graph()
                .edges_directed(node, daggy::petgraph::Direction::Incoming)
                .filter(|e| member.contains(&e.source()))
                .count();
            in_degree.insert(node, degree);
        }

        let mut ready: Vec<daggy::NodeIndex> =
            component.iter().copied().filter(|n| in_degree[n] == 0).collect();
        sort_deterministic(&mut ready, &self.graph);

        let mut order = Vec::with_capacity(component.len());
        while let Some(node) = ready.pop() {
            order.push(self.graph[node]);
            let mut newly_ready = Vec::new();
            for edge in self
                .graph
                .graph()
                .edges_directed(node, daggy::petgraph::Direction::Outgoing)
            {
                let target = edge.target();
                if !member.contains(&target) {
                    continue;
                }
                let degree = in_degree.get_mut(&target).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    newly_ready.push(target);
                }
            }
            sort_deterministic(&mut newly_ready, &self.graph);
            ready.extend(newly_ready);
            sort_deterministic(&mut ready, &self.graph);
        }

        if order.len() != component.len() {
            let stuck = component
                .iter()
                .find(|n| !order.contains(&self.graph[**n]))
                .expect("order is short, a residual vertex must exist");
            return Err(self.graph[*stuck]);
        }
        Ok(order)
    }

    pub fn parents_of(&self, vertex: NodeHandle, mask: Hierarchy) -> impl Iterator<Item = &Connection> {
        self.entry_of(vertex)
            .map(|e| &self.parent_entries[e.parent_range.0..e.parent_range.1])
            .unwrap_or(&[])
            .iter()
            .filter(move |c| mask.accepts(c))
    }

    pub fn children_of(&self, vertex: NodeHandle, mask: Hierarchy) -> impl Iterator<Item = &Connection> {
        self.entry_of(vertex)
            .map(|e| &self.child_entries[e.child_range.0..e.child_range.1])
            .unwrap_or(&[])
            .iter()
            .filter(move |c| mask.accepts(c))
    }

    pub fn parents_by_port(
        &self,
        vertex: NodeHandle,
        port: crate::port::PortOrdinal,
        mask: Hierarchy,
    ) -> impl Iterator<Item = &Connection> {
        self.parents_of(vertex, mask).filter(move |c| c.dest_port == port)
    }

    pub fn children_by_port(
        &self,
        vertex: NodeHandle,
        port: crate::port::PortOrdinal,
        mask: Hierarchy,
    ) -> impl Iterator<Item = &Connection> {
        self.children_of(vertex, mask).filter(move |c| c.source_port == port)
    }

    /// Vertices in execution order, flattened across all islands.
    pub fn ordered(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.ordered.iter().map(|e| e.vertex)
    }

    pub fn roots(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.roots.iter().map(|&i| self.ordered[i].vertex)
    }

    pub fn leaves(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.leaves.iter().map(|&i| self.ordered[i].vertex)
    }

    pub fn islands(&self) -> impl Iterator<Item = &[OrderedEntry]> {
        self.islands
            .iter()
            .map(|island| &self.ordered[island.offset_in_ordered..island.offset_in_ordered + island.count])
    }

    fn entry_of(&self, vertex: NodeHandle) -> Option<&OrderedEntry> {
        self.ordered.iter().find(|e| e.vertex == vertex)
    }
}

fn sort_deterministic(nodes: &mut [daggy::NodeIndex], graph: &daggy::Dag<NodeHandle, Connection>) {
    nodes.sort_by_key(|&n| {
        let h = graph[n];
        (h.container_id(), h.index())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortCategory;
    use crate::topology::Connection;

    fn conn(source: NodeHandle, dest: NodeHandle) -> Connection {
        Connection {
            source,
            source_port: 0,
            source_array_index: None,
            dest,
            dest_port: 0,
            dest_array_index: None,
            category: PortCategory::Data,
        }
    }

    fn handle(index: i32) -> NodeHandle {
        // Tests only exercise the traversal cache in isolation, so we
        // forge handles directly rather than going through a NodeSet.
        NodeHandle::for_test(index, 1, 1)
    }

    #[test]
    fn rebuild_produces_topological_order() {
        let mut cache = TraversalCache::new();
        let a = handle(1);
        let b = handle(2);
        let c = handle(3);
        cache.add_vertex(a);
        cache.add_vertex(b);
        cache.add_vertex(c);
        cache.try_add_edge(conn(a, b)).unwrap();
        cache.try_add_edge(conn(b, c)).unwrap();
        cache.rebuild().unwrap();
        let order: Vec<_> = cache.ordered().collect();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn cycle_is_rejected_at_edge_insertion() {
        let mut cache = TraversalCache::new();
        let a = handle(1);
        let b = handle(2);
        cache.add_vertex(a);
        cache.add_vertex(b);
        cache.try_add_edge(conn(a, b)).unwrap();
        assert!(cache.try_add_edge(conn(b, a)).is_err());
    }
}
