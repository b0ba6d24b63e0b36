//! Scheduler (C7): turns the render graph's data-only traversal order
//! into a dependency-respecting set of kernel jobs.
//!
//! Grounded on `dozer_core::executor`'s thread-per-source layout, but
//! generalized from "one thread per node" to "one `JobSystem` job per
//! node, dependencies expressed through job handles" — the contract
//! `JobSystem` in [`crate::jobs`] exists to decouple this crate from any
//! one concrete pool.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codegen::NodeKind;
use crate::jobs::{JobHandle, JobSystem};
use crate::node_set::NodeSet;
use crate::port::{PortCategory, PortRef};
use crate::render_graph::{PortsView, RenderContext};
use crate::topology::NodeHandle;
use crate::traversal::Hierarchy;

/// Tunables for one [`schedule_tick`] call, modeled on the teacher's
/// `ExecutorOptions` flat struct-of-knobs shape.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerOptions {
    /// A traversal-ordered node with no registered kind should never
    /// happen in a correctly maintained node set; this surfaces the drift
    /// instead of silently skipping the job.
    pub warn_on_missing_kind: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            warn_on_missing_kind: true,
        }
    }
}

/// Handles to the per-tick side tables kernel jobs write back into.
/// Opaque to callers; threaded from [`schedule_tick`] to [`finish_tick`].
#[derive(Clone)]
pub struct SideTables {
    kernel_states: Arc<Mutex<HashMap<NodeHandle, Box<dyn Any + Send>>>>,
    size_requests: Arc<Mutex<HashMap<(NodeHandle, PortRef), u32>>>,
}

pub struct ScheduledTick {
    pub completion: JobHandle,
    pub render_version: u64,
    job_handles: HashMap<NodeHandle, JobHandle>,
    side_tables: SideTables,
}

impl ScheduledTick {
    pub fn job_for(&self, node: NodeHandle) -> Option<JobHandle> {
        self.job_handles.get(&node).copied()
    }
}

/// Schedules one tick's kernels. Input batches are not a job dependency:
/// `InputBatchQueue::install_all` writes an override directly into the
/// render graph before this is called, so by the time a job closure reads
/// it the data is already there — ordering is the host's responsibility
/// (call `install_all` between `NodeSet::update()` and `schedule_tick`),
/// not something a job-graph edge could express. Call [`finish_tick`]
/// after `jobs.complete(tick.completion)` to fold kernel-state and
/// buffer-size writes back into the node set.
pub fn schedule_tick(node_set: &mut NodeSet, jobs: &dyn JobSystem, options: SchedulerOptions) -> ScheduledTick {
    let render_version = node_set.render_graph().render_version();
    let order: Vec<NodeHandle> = node_set.topology().traversal().ordered().collect();

    let kinds: HashMap<NodeHandle, Arc<NodeKind>> = order
        .iter()
        .filter_map(|&h| node_set.node_kind_arc(h).map(|k| (h, k)))
        .collect();

    // Exclusive ownership of every live node's kernel_state is pulled out
    // up front; nothing touches `node_set`/`render_graph` again until the
    // whole tick has completed, so the rendering phase never observes a
    // half-written simulation mutation.
    let mut kernel_states: HashMap<NodeHandle, Box<dyn Any + Send>> = HashMap::new();
    for &handle in &order {
        if let Some(state) = node_set.render_graph_mut().take_kernel_state(handle) {
            kernel_states.insert(handle, state);
        }
    }
    let side_tables = SideTables {
        kernel_states: Arc::new(Mutex::new(kernel_states)),
        size_requests: Arc::new(Mutex::new(HashMap::new())),
    };
    let outputs = node_set.render_graph().outputs_handle();

    let mut job_handles: HashMap<NodeHandle, JobHandle> = HashMap::new();
    for &handle in &order {
        let Some(kind) = kinds.get(&handle).cloned() else {
            if options.warn_on_missing_kind {
                tracing::warn!(?handle, "scheduler: traversal-ordered node has no registered kind, skipping");
            }
            continue;
        };

        let parent_deps: Vec<JobHandle> = node_set
            .topology()
            .traversal()
            .parents_of(handle, Hierarchy::DATA_ONLY)
            .filter_map(|c| job_handles.get(&c.source).copied())
            .collect();

        let data_edges: Vec<_> = node_set
            .render_graph()
            .data_edges()
            .iter()
            .filter(|c| c.category == PortCategory::Data && c.dest == handle)
            .cloned()
            .collect();

        // A batch override is a synthetic producer for this version only:
        // it takes every declared input port regardless of whether a real
        // data edge also feeds it.
        let batch_inputs: Vec<_> = kind
            .input_ports
            .iter()
            .filter(|p| p.has_buffers)
            .filter_map(|p| {
                let port_ref = PortRef::single(p.ordinal);
                node_set.render_graph().batch_override(handle, port_ref).map(|b| (port_ref, b.clone()))
            })
            .collect();

        let outputs = outputs.clone();
        let kernel_states = side_tables.kernel_states.clone();
        let size_requests = side_tables.size_requests.clone();
        let render_context = RenderContext { render_version };
        let kernel_fn = kind.kernel.select(kind.name);
        let kernel_data = node_set.render_graph().kernel_data(handle);
        let own_output_ports: Vec<_> = kind.output_ports.iter().filter(|p| p.has_buffers).map(|p| p.ordinal).collect();

        let work: Box<dyn FnOnce() + Send> = Box::new(move || {
            let mut inputs = HashMap::new();
            {
                let outputs = outputs.read();
                for edge in &data_edges {
                    let dest_ref = PortRef {
                        port: edge.dest_port,
                        array_index: edge.dest_array_index,
                    };
                    let source_ref = PortRef {
                        port: edge.source_port,
                        array_index: edge.source_array_index,
                    };
                    if let Some(buffer) = outputs.get(&(edge.source, source_ref)) {
                        inputs.insert(dest_ref, buffer.clone());
                    }
                }
            }
            for (port_ref, buffer) in batch_inputs {
                inputs.insert(port_ref, buffer);
            }

            let mut own_outputs = HashMap::new();
            {
                let outputs = outputs.read();
                for port in &own_output_ports {
                    let port_ref = PortRef::single(*port);
                    if let Some(buffer) = outputs.get(&(handle, port_ref)) {
                        own_outputs.insert(port_ref, buffer.clone());
                    }
                }
            }

            let mut ports_view = PortsView::new(inputs, own_outputs);
            let Some(mut state) = kernel_states.lock().remove(&handle) else {
                tracing::error!(?handle, "scheduler: kernel invoked with no kernel_state slot");
                return;
            };
            let kernel_data_ref: &dyn Any = kernel_data.as_ref().map(|d| d.as_any()).unwrap_or(&());
            kernel_fn(&render_context, state.as_mut(), kernel_data_ref, &mut ports_view);
            kernel_states.lock().insert(handle, state);

            let (new_outputs, new_size_requests) = ports_view.into_parts();
            {
                let mut outputs = outputs.write();
                for (port_ref, buffer) in new_outputs {
                    outputs.insert((handle, port_ref), buffer);
                }
            }
            size_requests
                .lock()
                .extend(new_size_requests.into_iter().map(|(port_ref, size)| ((handle, port_ref), size)));
        });

        let job = jobs.schedule(work, &parent_deps);
        job_handles.insert(handle, job);
    }

    let completion_deps: Vec<JobHandle> = job_handles.values().copied().collect();
    let completion = jobs.combine(&completion_deps);

    ScheduledTick {
        completion,
        render_version,
        job_handles,
        side_tables,
    }
}

/// Folds a completed tick's kernel-state and buffer-size writes back into
/// the node set's render graph. Must only be called after
/// `jobs.complete(tick.completion)` has returned.
pub fn finish_tick(node_set: &mut NodeSet, tick: ScheduledTick) {
    let states = Arc::try_unwrap(tick.side_tables.kernel_states)
        .map(Mutex::into_inner)
        .unwrap_or_else(|arc| arc.lock().drain().collect());
    for (handle, state) in states {
        node_set.render_graph_mut().put_kernel_state(handle, state);
    }

    let requests = Arc::try_unwrap(tick.side_tables.size_requests)
        .map(Mutex::into_inner)
        .unwrap_or_else(|arc| arc.lock().drain().collect());
    let mut by_node: HashMap<NodeHandle, HashMap<PortRef, u32>> = HashMap::new();
    for ((handle, port_ref), size) in requests {
        by_node.entry(handle).or_default().insert(port_ref, size);
    }
    for (handle, requests) in by_node {
        node_set.render_graph_mut().record_size_requests(handle, requests);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{InitContext, KernelFns, MessageContext, NodeBehavior, NodeKind, UpdateContext};
    use crate::jobs::LocalJobSystem;
    use crate::node_set::{NodeSet, NodeSetOptions};
    use crate::port::{PortDescriptor, PortDirection};
    use crate::render_graph::Buffer;

    #[derive(Clone)]
    struct Constant(i32);

    struct ConstantBehavior;
    impl NodeBehavior for ConstantBehavior {
        fn init(&mut self, _ctx: &mut InitContext) {}
    }

    struct AdderBehavior;
    impl NodeBehavior for AdderBehavior {
        fn init(&mut self, _ctx: &mut InitContext) {}
    }

    fn constant_kind(id: u32, value: i32) -> NodeKind {
        NodeKind {
            id,
            name: "constant",
            input_ports: vec![],
            output_ports: vec![PortDescriptor {
                ordinal: 0,
                direction: PortDirection::Output,
                category: PortCategory::Data,
                element_size: 4,
                has_buffers: true,
                is_port_array: false,
            }],
            behavior_factory: || Box::new(ConstantBehavior),
            kernel_data_factory: move || Box::new(Constant(value)),
            kernel_state_factory: || Box::new(()) as Box<dyn std::any::Any + Send>,
            kernel: KernelFns::managed_only(|_ctx, _state, data, ports| {
                let value = data.downcast_ref::<Constant>().unwrap().0;
                ports.request_output_size(0, 1, 4);
                *ports.output_mut(0) = Buffer::from_i32_slice(&[value]);
            }),
        }
    }

    fn adder_kind(id: u32) -> NodeKind {
        NodeKind {
            id,
            name: "adder",
            input_ports: vec![
                PortDescriptor {
                    ordinal: 0,
                    direction: PortDirection::Input,
                    category: PortCategory::Data,
                    element_size: 4,
                    has_buffers: true,
                    is_port_array: false,
                },
                PortDescriptor {
                    ordinal: 1,
                    direction: PortDirection::Input,
                    category: PortCategory::Data,
                    element_size: 4,
                    has_buffers: true,
                    is_port_array: false,
                },
            ],
            output_ports: vec![PortDescriptor {
                ordinal: 2,
                direction: PortDirection::Output,
                category: PortCategory::Data,
                element_size: 4,
                has_buffers: true,
                is_port_array: false,
            }],
            behavior_factory: || Box::new(AdderBehavior),
            kernel_data_factory: || Box::new(()) as Box<dyn crate::render_graph::KernelData>,
            kernel_state_factory: || Box::new(()) as Box<dyn std::any::Any + Send>,
            kernel: KernelFns::managed_only(|_ctx, _state, _data, ports| {
                let a = ports.input(0).map(|b| b.as_i32_vec()[0]).unwrap_or(0);
                let b = ports.input(1).map(|b| b.as_i32_vec()[0]).unwrap_or(0);
                ports.request_output_size(2, 1, 4);
                *ports.output_mut(2) = Buffer::from_i32_slice(&[a + b]);
            }),
        }
    }

    #[test]
    fn two_constants_feed_an_adder() {
        let mut set = NodeSet::new(NodeSetOptions::default());
        let k_const_a = set.register_kind(constant_kind(1, 3));
        let k_const_b = set.register_kind(constant_kind(2, 4));
        let k_adder = set.register_kind(adder_kind(3));

        let a = set.create(k_const_a).unwrap();
        let b = set.create(k_const_b).unwrap();
        let adder = set.create(k_adder).unwrap();
        set.connect(a, PortRef::single(0), adder, PortRef::single(0), PortCategory::Data).unwrap();
        set.connect(b, PortRef::single(0), adder, PortRef::single(1), PortCategory::Data).unwrap();

        set.update().unwrap();

        let jobs = LocalJobSystem::new(2);
        let tick = schedule_tick(&mut set, &jobs, SchedulerOptions::default());
        jobs.complete(tick.completion);
        finish_tick(&mut set, tick);

        let result = set.render_graph().read_output(adder, 2).unwrap();
        assert_eq!(result.as_i32_vec(), vec![7]);
    }
}
