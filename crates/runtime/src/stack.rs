//! Stack frames
//!
//! Each enqueued node executes against a frame carrying the propagated
//! value, two scratch slots and a parent link for causal chaining.
//! Frames are arena-allocated per propagation and dropped when the drain
//! completes; layers refer to them by index.

use std::any::Any;
use std::cell::RefCell;

use crate::node::NodeHandle;
use crate::types::{Scope, Value};

/// Index of a frame within the live propagation's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(pub(crate) u32);

/// Per-node execution context for one traversal
#[derive(Debug)]
pub struct Frame {
    /// The propagated datum
    pub value: Value,
    /// Scratch slot for multi-argument opcodes
    pub a: Value,
    /// Scratch slot for multi-argument opcodes
    pub b: Value,
    /// Frame of the upstream node that produced this value
    pub parent: Option<FrameId>,
    /// The node this frame belongs to
    pub node: NodeHandle,
}

/// Arena of frames for the propagation in flight
#[derive(Debug, Default)]
pub struct FrameArena {
    frames: Vec<Frame>,
}

impl FrameArena {
    /// Allocate a frame for `node`, seeded with `value`.
    pub(crate) fn alloc(
        &mut self,
        node: NodeHandle,
        value: Value,
        parent: Option<FrameId>,
    ) -> FrameId {
        let id = FrameId(self.frames.len() as u32);
        self.frames.push(Frame {
            value,
            a: Value::Undefined,
            b: Value::Undefined,
            parent,
            node,
        });
        id
    }

    pub(crate) fn get(&self, id: FrameId) -> &Frame {
        &self.frames[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: FrameId) -> &mut Frame {
        &mut self.frames[id.0 as usize]
    }

    /// Drop all frames. Called when a drain reaches quiescence.
    pub(crate) fn clear(&mut self) {
        self.frames.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }
}

/// Read-only view of a frame and its causal chain, handed to user
/// functions
#[derive(Clone, Copy)]
pub struct StackView<'a> {
    arena: &'a FrameArena,
    frame: FrameId,
}

impl<'a> StackView<'a> {
    pub(crate) fn new(arena: &'a FrameArena, frame: FrameId) -> Self {
        Self { arena, frame }
    }

    pub fn value(&self) -> &'a Value {
        &self.arena.get(self.frame).value
    }

    pub fn a(&self) -> &'a Value {
        &self.arena.get(self.frame).a
    }

    pub fn b(&self) -> &'a Value {
        &self.arena.get(self.frame).b
    }

    pub fn node(&self) -> &'a NodeHandle {
        &self.arena.get(self.frame).node
    }

    /// The upstream frame that produced this value, if any.
    pub fn parent(&self) -> Option<StackView<'a>> {
        self.arena.get(self.frame).parent.map(|frame| StackView {
            arena: self.arena,
            frame,
        })
    }
}

/// A launch requested from inside a user function
pub(crate) struct PendingLaunch {
    pub node: NodeHandle,
    pub payload: Value,
    /// When set, the seed only joins the live queue; otherwise the
    /// driver drains in place before the current node continues
    pub defer: bool,
}

/// Execution context passed to user functions.
///
/// Carries the node's scope, the call stack of the current traversal and
/// the re-entrant injection surface.
pub struct CallContext<'a> {
    scope: Option<&'a Scope>,
    stack: StackView<'a>,
    pending: &'a RefCell<Vec<PendingLaunch>>,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(
        scope: Option<&'a Scope>,
        stack: StackView<'a>,
        pending: &'a RefCell<Vec<PendingLaunch>>,
    ) -> Self {
        Self {
            scope,
            stack,
            pending,
        }
    }

    /// The node's opaque scope record.
    pub fn scope(&self) -> Option<&'a Scope> {
        self.scope
    }

    /// Downcast the scope record.
    pub fn scope_as<T: Any>(&self) -> Option<&'a T> {
        self.scope.and_then(|scope| scope.downcast_ref::<T>())
    }

    /// The current stack frame; walk `parent` for causal context.
    pub fn stack(&self) -> StackView<'a> {
        self.stack
    }

    /// Inject a value into `target` from inside a user function.
    ///
    /// With `defer` set, the seed only joins the live queue and is
    /// consumed before the outer launch returns; no nested drain
    /// starts. Without it, the driver drains the live queue in place (a
    /// nested propagation) before the current node continues. Either
    /// way the seeds are gone by the time the outer launch returns.
    pub fn launch(&self, target: &NodeHandle, payload: impl Into<Value>, defer: bool) {
        self.pending.borrow_mut().push(PendingLaunch {
            node: target.clone(),
            payload: payload.into(),
            defer,
        });
    }
}
