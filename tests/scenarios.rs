use std::any::Any;

use flowgraph_core::codegen::{InitContext, KernelFns, MessageContext, NodeBehavior, NodeKind};
use flowgraph_core::error::{ArenaError, BatchError, GraphError};
use flowgraph_core::io::{GraphValues, InputBatchQueue};
use flowgraph_core::jobs::{JobSystem, LocalJobSystem};
use flowgraph_core::node_set::{NodeSet, NodeSetOptions};
use flowgraph_core::port::{PortCategory, PortDescriptor, PortDirection, PortRef};
use flowgraph_core::render_graph::{Buffer, KernelData};
use flowgraph_core::scheduler::{finish_tick, schedule_tick, SchedulerOptions};

struct NoOpBehavior;
impl NodeBehavior for NoOpBehavior {
    fn init(&mut self, _ctx: &mut InitContext) {}
}

fn data_port(ordinal: u16, direction: PortDirection, is_array: bool) -> PortDescriptor {
    PortDescriptor {
        ordinal,
        direction,
        category: PortCategory::Data,
        element_size: 4,
        has_buffers: true,
        is_port_array: is_array,
    }
}

fn message_port(ordinal: u16, direction: PortDirection) -> PortDescriptor {
    PortDescriptor {
        ordinal,
        direction,
        category: PortCategory::Message,
        element_size: 0,
        has_buffers: false,
        is_port_array: false,
    }
}

fn passthrough_kernel_data() -> Box<dyn KernelData> {
    Box::new(())
}

fn passthrough_kernel_state() -> Box<dyn Any + Send> {
    Box::new(())
}

/// A single data-input, single data-output node whose kernel reads port 0
/// and writes port 1 unchanged; used as a simple adder's building block.
fn adder_kind(id: u32) -> NodeKind {
    NodeKind {
        id,
        name: "adder",
        input_ports: vec![data_port(0, PortDirection::Input, false), data_port(1, PortDirection::Input, false)],
        output_ports: vec![data_port(2, PortDirection::Output, false)],
        behavior_factory: || Box::new(NoOpBehavior),
        kernel_data_factory: passthrough_kernel_data,
        kernel_state_factory: passthrough_kernel_state,
        kernel: KernelFns::managed_only(|_ctx, _state, _data, ports| {
            let a = ports.input(0).map(|b| b.as_i32_vec()[0]).unwrap_or(0);
            let b = ports.input(1).map(|b| b.as_i32_vec()[0]).unwrap_or(0);
            ports.request_output_size(2, 1, 4);
            *ports.output_mut(2) = Buffer::from_i32_slice(&[a + b]);
        }),
    }
}

/// A fixed layout (array input on port 0, scalar output on port 1) so the
/// kernel can be a plain non-capturing fn pointer, matching the ABI named
/// in the codegen contract.
fn array_sum_kernel(_ctx: &flowgraph_core::render_graph::RenderContext, _state: &mut dyn Any, _data: &dyn Any, ports: &mut flowgraph_core::render_graph::PortsView) {
    let total: i32 = ports
        .input_array_indices(0)
        .filter_map(|i| ports.input_array(0, i))
        .map(|b| b.as_i32_vec()[0])
        .sum();
    ports.request_output_size(1, 1, 4);
    *ports.output_mut(1) = Buffer::from_i32_slice(&[total]);
}

fn array_sum_kind(id: u32) -> NodeKind {
    NodeKind {
        id,
        name: "array_sum",
        input_ports: vec![data_port(0, PortDirection::Input, true)],
        output_ports: vec![data_port(1, PortDirection::Output, false)],
        behavior_factory: || Box::new(NoOpBehavior),
        kernel_data_factory: passthrough_kernel_data,
        kernel_state_factory: passthrough_kernel_state,
        kernel: KernelFns::managed_only(array_sum_kernel),
    }
}

#[test]
fn two_adder_chain_via_input_batch_and_graph_value() {
    let mut set = NodeSet::new(NodeSetOptions::default());
    let first = set.register_kind(adder_kind(1));
    let second = set.register_kind(adder_kind(2));
    let a = set.create(first).unwrap();
    let b = set.create(second).unwrap();
    set.connect(a, PortRef::single(2), b, PortRef::single(0), PortCategory::Data).unwrap();

    let mut batches = InputBatchQueue::new();
    batches.submit(a, PortRef::single(0), Buffer::from_i32_slice(&[2]));
    batches.submit(a, PortRef::single(1), Buffer::from_i32_slice(&[3]));
    batches.submit(b, PortRef::single(1), Buffer::from_i32_slice(&[10]));

    set.update().unwrap();
    let render_version = set.render_graph().render_version();
    batches.install_all(&mut set, render_version);

    let jobs = LocalJobSystem::new(2);
    let tick = schedule_tick(&mut set, &jobs, SchedulerOptions::default());
    jobs.complete(tick.completion);
    finish_tick(&mut set, tick);
    batches.retire(render_version);

    let mut values = GraphValues::new();
    let value = values.create(&set, b, 2);
    let result = values.try_get(&set, value).expect("tick already completed").unwrap();
    // a = 2 + 3 = 5 from its batch inputs; b = 5 (a's real data edge) + 10
    // (b's own batch input) = 15.
    assert_eq!(result.as_i32_vec(), vec![15]);
    values.release(value).unwrap();
}

#[test]
fn diamond_message_flow_observes_expected_values() {
    struct Source;
    impl NodeBehavior for Source {
        fn init(&mut self, _ctx: &mut InitContext) {}
        fn on_message(&mut self, ctx: &mut MessageContext, _port: u16, message: &Box<dyn Any + Send>) {
            let v = *message.downcast_ref::<i32>().unwrap();
            ctx.emit_message(0, Box::new(v));
        }
    }

    struct Doubler;
    impl NodeBehavior for Doubler {
        fn init(&mut self, _ctx: &mut InitContext) {}
        fn on_message(&mut self, ctx: &mut MessageContext, _port: u16, message: &Box<dyn Any + Send>) {
            let v = *message.downcast_ref::<i32>().unwrap();
            ctx.emit_message(0, Box::new(v * 2));
        }
    }

    struct Sink {
        seen: std::sync::Arc<std::sync::Mutex<Vec<i32>>>,
    }
    impl NodeBehavior for Sink {
        fn init(&mut self, _ctx: &mut InitContext) {}
        fn on_message(&mut self, _ctx: &mut MessageContext, _port: u16, message: &Box<dyn Any + Send>) {
            self.seen.lock().unwrap().push(*message.downcast_ref::<i32>().unwrap());
        }
    }

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut set = NodeSet::new(NodeSetOptions::default());

    let source_kind_id = set.register_kind(NodeKind {
        id: 10,
        name: "source",
        input_ports: vec![],
        output_ports: vec![message_port(0, PortDirection::Output)],
        behavior_factory: || Box::new(Source),
        kernel_data_factory: passthrough_kernel_data,
        kernel_state_factory: passthrough_kernel_state,
        kernel: KernelFns::managed_only(|_, _, _, _| {}),
    });
    let doubler_kind_id = set.register_kind(NodeKind {
        id: 11,
        name: "doubler",
        input_ports: vec![message_port(0, PortDirection::Input)],
        output_ports: vec![message_port(0, PortDirection::Output)],
        behavior_factory: || Box::new(Doubler),
        kernel_data_factory: passthrough_kernel_data,
        kernel_state_factory: passthrough_kernel_state,
        kernel: KernelFns::managed_only(|_, _, _, _| {}),
    });
    let sink_seen = seen.clone();
    let sink_kind_id = set.register_kind(NodeKind {
        id: 12,
        name: "sink",
        input_ports: vec![message_port(0, PortDirection::Input)],
        output_ports: vec![],
        behavior_factory: move || Box::new(Sink { seen: sink_seen.clone() }),
        kernel_data_factory: passthrough_kernel_data,
        kernel_state_factory: passthrough_kernel_state,
        kernel: KernelFns::managed_only(|_, _, _, _| {}),
    });

    let source = set.create(source_kind_id).unwrap();
    let left = set.create(doubler_kind_id).unwrap();
    let right = set.create(doubler_kind_id).unwrap();
    let sink = set.create(sink_kind_id).unwrap();

    set.connect(source, PortRef::single(0), left, PortRef::single(0), PortCategory::Message).unwrap();
    set.connect(source, PortRef::single(0), right, PortRef::single(0), PortCategory::Message).unwrap();
    set.connect(left, PortRef::single(0), sink, PortRef::single(0), PortCategory::Message).unwrap();
    set.connect(right, PortRef::single(0), sink, PortRef::single(0), PortCategory::Message).unwrap();

    set.send_message(source, 0, Box::new(5i32)).unwrap();

    let mut observed = seen.lock().unwrap().clone();
    observed.sort_unstable();
    assert_eq!(observed, vec![10, 10]);
}

#[test]
fn port_array_sum_with_resize_auto_disconnect() {
    let mut set = NodeSet::new(NodeSetOptions::default());
    let constant_kind_id = set.register_kind(adder_kind(20));
    let sum_kind_id = set.register_kind(array_sum_kind(21));

    let sum = set.create(sum_kind_id).unwrap();
    set.set_port_array_size(sum, 0, 3).unwrap();

    let feeders: Vec<_> = (0..3).map(|_| set.create(constant_kind_id).unwrap()).collect();
    for (i, feeder) in feeders.iter().enumerate() {
        set.connect(*feeder, PortRef::single(2), sum, PortRef::array(0, i as u32), PortCategory::Data)
            .unwrap();
    }
    assert_eq!(set.topology().connections().count(), 3);

    let events = set.set_port_array_size(sum, 0, 2).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(set.topology().connections().count(), 2);

    let mut batches = InputBatchQueue::new();
    batches.submit(feeders[0], PortRef::single(0), Buffer::from_i32_slice(&[5]));
    batches.submit(feeders[1], PortRef::single(0), Buffer::from_i32_slice(&[7]));
    // feeders[2] was auto-disconnected above; its value must not reach `sum`.
    batches.submit(feeders[2], PortRef::single(0), Buffer::from_i32_slice(&[1000]));

    set.update().unwrap();
    let render_version = set.render_graph().render_version();
    batches.install_all(&mut set, render_version);

    let jobs = LocalJobSystem::new(2);
    let tick = schedule_tick(&mut set, &jobs, SchedulerOptions::default());
    jobs.complete(tick.completion);
    finish_tick(&mut set, tick);
    batches.retire(render_version);

    let result = set.render_graph().read_output(sum, 1).unwrap();
    assert_eq!(result.as_i32_vec(), vec![12]);
}

#[test]
fn cycle_rejected_leaves_topology_unchanged() {
    let mut set = NodeSet::new(NodeSetOptions::default());
    let kind = set.register_kind(adder_kind(30));
    let a = set.create(kind).unwrap();
    let b = set.create(kind).unwrap();

    set.connect(a, PortRef::single(2), b, PortRef::single(0), PortCategory::Data).unwrap();
    let before = set.topology().connections().count();
    let err = set.connect(b, PortRef::single(2), a, PortRef::single(0), PortCategory::Data);
    assert!(err.is_err());
    assert_eq!(set.topology().connections().count(), before);
}

#[test]
fn stale_handle_fails_after_reuse() {
    let mut set = NodeSet::new(NodeSetOptions::default());
    let kind = set.register_kind(adder_kind(40));
    let first = set.create(kind).unwrap();
    set.destroy(first).unwrap();
    let second = set.create(kind).unwrap();
    assert_eq!(first.index(), second.index());

    // The slot was reused, so the stale handle's version no longer matches
    // what is stored there; it reads back as `Invalid`, not `Disposed`
    // (`Disposed` is reserved for a slot that hasn't been reused yet).
    let err = set.destroy(first);
    match err {
        Err(GraphError::Arena(ArenaError::Invalid)) => {}
        other => panic!("expected Invalid, got {other:?}"),
    }
    assert!(set.exists(second));
}

#[test]
fn batch_fence_lifecycle() {
    let mut set = NodeSet::new(NodeSetOptions::default());
    let kind = set.register_kind(adder_kind(50));
    let node = set.create(kind).unwrap();
    let mut batches = InputBatchQueue::new();
    let handle = batches.submit(node, PortRef::single(0), Buffer::from_i32_slice(&[1]));

    let err = batches.fence_version(handle);
    match err {
        Err(GraphError::Batch(BatchError::PrematureBatchQuery)) => {}
        other => panic!("expected PrematureBatchQuery, got {other:?}"),
    }

    set.update().unwrap();
    let render_version = set.render_graph().render_version();
    batches.install_all(&mut set, render_version);

    let jobs = LocalJobSystem::new(2);
    let tick = schedule_tick(&mut set, &jobs, SchedulerOptions::default());
    jobs.complete(tick.completion);
    finish_tick(&mut set, tick);
    batches.retire(render_version);

    assert_eq!(batches.fence_version(handle).unwrap(), render_version);
}
