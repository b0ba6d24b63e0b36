//! Codegen contract (C9, §6): what an offline IR rewriter is expected to
//! produce per node kind. This crate never runs that rewriter — it only
//! defines the shape `register_kind` accepts, the way `dozer_core::node`
//! defines `SourceFactory`/`ProcessorFactory`/`SinkFactory` as the contract
//! an assembly's generated code must satisfy.

use std::any::Any;
use std::fmt;

use crate::port::PortDescriptor;
use crate::render_graph::{KernelData, PortsView, RenderContext};
use crate::topology::NodeHandle;

pub type KindId = u32;

/// Type-erased simulation payload. Strong typing lives only at the
/// generated call-site wrappers; the core never inspects the contents.
pub type Message = Box<dyn Any + Send>;

/// Context handed to a node's `init` handler: the only time it may
/// declare port forwarding.
pub struct InitContext<'a> {
    pub(crate) handle: NodeHandle,
    pub(crate) forwarding: &'a mut crate::port::ForwardingTable,
    pub(crate) kernel_data: &'a mut dyn KernelData,
}

impl<'a> InitContext<'a> {
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    /// Declares that this node's own `outer_port` forwards to
    /// `(inner_node, inner_port)`. Only legal during `init`.
    pub fn forward_port(&mut self, outer_port: crate::port::PortOrdinal, inner_node: NodeHandle, inner_port: crate::port::PortOrdinal) {
        self.forwarding.declare(outer_port, inner_node, inner_port);
    }

    pub fn kernel_data_mut(&mut self) -> &mut dyn Any {
        self.kernel_data.as_any_mut()
    }
}

/// Context handed to a node's `OnUpdate` handler.
pub struct UpdateContext<'a> {
    pub(crate) handle: NodeHandle,
    pub(crate) outbox: &'a mut Vec<(crate::port::PortOrdinal, Message)>,
    pub(crate) mutations: &'a mut Vec<crate::node_set::Mutation>,
    pub(crate) kernel_data: &'a mut dyn KernelData,
}

impl<'a> UpdateContext<'a> {
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    /// Queues a message for synchronous delivery to every node connected
    /// to `port` (`emit_message`, §4.5 step 3).
    pub fn emit_message(&mut self, port: crate::port::PortOrdinal, message: Message) {
        self.outbox.push((port, message));
    }

    /// Any mutation requested here is deferred to the next tick's drain
    /// step, per §4.5 step 4.
    pub fn request_mutation(&mut self, mutation: crate::node_set::Mutation) {
        self.mutations.push(mutation);
    }

    /// The data this node's kernel reads at render time. Written here,
    /// copied into the render graph at the next sync.
    pub fn kernel_data_mut(&mut self) -> &mut dyn Any {
        self.kernel_data.as_any_mut()
    }
}

/// Context handed to a node's message handler.
pub struct MessageContext<'a> {
    pub(crate) handle: NodeHandle,
    pub(crate) outbox: &'a mut Vec<(crate::port::PortOrdinal, Message)>,
}

impl<'a> MessageContext<'a> {
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    pub fn emit_message(&mut self, port: crate::port::PortOrdinal, message: Message) {
        self.outbox.push((port, message));
    }
}

/// A node kind's simulation behavior. Every method has a default that
/// traps — the "pure-virtual trap" a kind's vtable falls back to for a
/// lifecycle event it never installs a handler for.
pub trait NodeBehavior: Send {
    fn init(&mut self, _ctx: &mut InitContext) {
        pure_virtual("init");
    }

    fn on_update(&mut self, _ctx: &mut UpdateContext) {
        pure_virtual("update");
    }

    fn on_message(&mut self, _ctx: &mut MessageContext, _port: crate::port::PortOrdinal, _message: &Message) {
        pure_virtual("message");
    }

    fn on_array_message(
        &mut self,
        _ctx: &mut MessageContext,
        _port: crate::port::PortOrdinal,
        _index: u32,
        _message: &Message,
    ) {
        pure_virtual("array_message");
    }

    fn destroy(&mut self, _ctx: &mut InitContext) {}

    fn has_update(&self) -> bool {
        false
    }
}

#[track_caller]
fn pure_virtual(what: &str) -> ! {
    tracing::error!(what, "pure virtual function called");
    panic!("pure virtual function called for lifecycle hook `{what}`; a node kind must install a handler before it can be invoked");
}

/// `fn(render_context, kernel_state, kernel_data, ports)` — the ABI named
/// in §6. Pointers passed through `PortsView` are valid for the duration
/// of the call only.
pub type KernelFn = fn(&RenderContext, &mut dyn Any, &dyn Any, &mut PortsView);

/// Two function pointers per kernel: a compiled native variant and an
/// always-available managed fallback. Falling back to `managed` is logged
/// only the first time it happens for a given kind (§7's `KernelCompileFailed`
/// row: "fall back to managed kernel, log once").
#[derive(Clone)]
pub struct KernelFns {
    pub native: Option<KernelFn>,
    pub managed: KernelFn,
    warned: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl KernelFns {
    pub fn managed_only(managed: KernelFn) -> Self {
        Self {
            native: None,
            managed,
            warned: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn with_native(native: KernelFn, managed: KernelFn) -> Self {
        Self {
            native: Some(native),
            managed,
            warned: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Picks the native pointer if present, logging and falling back to
    /// `managed` otherwise. The warning fires once per kind; later calls
    /// fall back silently.
    pub fn select(&self, kind_name: &str) -> KernelFn {
        match self.native {
            Some(f) => f,
            None => {
                if !self.warned.swap(true, std::sync::atomic::Ordering::Relaxed) {
                    tracing::warn!(kind = kind_name, "no native kernel installed, using managed fallback");
                }
                self.managed
            }
        }
    }
}

/// The per-kind constant table a codegen step would emit: port
/// definitions (assigned via running `(in, out)` counters, §6), the
/// simulation behavior factory, and the kernel function pointers.
pub struct NodeKind {
    pub id: KindId,
    pub name: &'static str,
    pub input_ports: Vec<PortDescriptor>,
    pub output_ports: Vec<PortDescriptor>,
    pub behavior_factory: fn() -> Box<dyn NodeBehavior>,
    pub kernel_data_factory: fn() -> Box<dyn KernelData>,
    pub kernel_state_factory: fn() -> Box<dyn Any + Send>,
    pub kernel: KernelFns,
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKind").field("name", &self.name).field("id", &self.id).finish()
    }
}

impl NodeKind {
    pub fn port_counters() -> (u16, u16) {
        (0, 0)
    }

    /// Assigns the next ordinal from the running `(in, out)` counters and
    /// advances it — the port-definition initializer named in §6.
    pub fn next_ordinal(counter: &mut u16) -> u16 {
        let ordinal = *counter;
        *counter += 1;
        ordinal
    }
}
