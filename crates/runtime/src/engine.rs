//! Propagation engine
//!
//! [`Engine::launch`] seeds the queue and runs the drain loop. The
//! interpreter evaluates each dequeued layer's instruction sequence; the
//! driver fans completed values out to child nodes at `Child` priority.
//! One engine is one isolated instance: queue, shared heap, barrier
//! registry, frame arena and ref storage all live here.

use std::cell::RefCell;
use std::collections::HashSet;

use tracing::{debug, error, instrument, trace};

use crate::error::Result;
use crate::node::{Check, ComputeFn, MovSource, MovTarget, NodeHandle, Step, StepKind};
use crate::queue::{Layer, Queue};
use crate::stack::{CallContext, FrameArena, FrameId, PendingLaunch, StackView};
use crate::storage::RefStorage;
use crate::types::{BarrierId, Priority, Value};

/// Outcome of evaluating one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerExit {
    /// Ran to the end of the sequence; children are scheduled
    Completed,
    /// A check or filter stopped propagation
    Skipped,
    /// A user function failed; logged, no children
    Failed,
    /// Re-queued at another priority by `barrier` or `run`
    Suspended,
}

/// Counts of layer outcomes for one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Layers that ran their full sequence
    pub completed: usize,
    /// Layers stopped by a check or filter
    pub skipped: usize,
    /// Layers stopped by a failing user function
    pub failures: usize,
}

/// Injection request for [`Engine::launch`]
pub struct LaunchSpec {
    /// `(node, payload)` seeds, all entering at `Pure` priority
    pub seeds: Vec<(NodeHandle, Value)>,
    /// Descriptor parity field. Inert at this entry: `launch` borrows
    /// the engine exclusively, so it can never find a drain already
    /// live. The deferred/nested distinction is re-entrant only and
    /// lives on [`CallContext::launch`](crate::stack::CallContext::launch).
    pub defer: bool,
}

impl LaunchSpec {
    pub fn unit(target: &NodeHandle, payload: impl Into<Value>) -> Self {
        Self {
            seeds: vec![(target.clone(), payload.into())],
            defer: false,
        }
    }

    /// Descriptor form: unpacks `(target, params, defer)`.
    pub fn descriptor(target: &NodeHandle, params: impl Into<Value>, defer: bool) -> Self {
        Self {
            seeds: vec![(target.clone(), params.into())],
            defer,
        }
    }
}

impl<V: Into<Value>> From<(&NodeHandle, V)> for LaunchSpec {
    fn from((target, payload): (&NodeHandle, V)) -> Self {
        LaunchSpec::unit(target, payload)
    }
}

/// Parallel-arrays form: each pair seeds independently.
impl From<Vec<(NodeHandle, Value)>> for LaunchSpec {
    fn from(seeds: Vec<(NodeHandle, Value)>) -> Self {
        LaunchSpec {
            seeds,
            defer: false,
        }
    }
}

/// The propagation engine
#[derive(Default)]
pub struct Engine {
    queue: Queue,
    /// Barrier ids with a pending layer in the queue
    barriers: HashSet<BarrierId>,
    stacks: FrameArena,
    refs: RefStorage,
    /// Layer outcomes since the current outermost launch began. Engine-
    /// level so nested drains merge into the caller's report.
    tally: DrainReport,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ref cell storage, for graph construction and inspection.
    pub fn refs(&self) -> &RefStorage {
        &self.refs
    }

    pub fn refs_mut(&mut self) -> &mut RefStorage {
        &mut self.refs
    }

    /// Inject values into source nodes and propagate to quiescence.
    ///
    /// Seeds enter at `Pure` priority and the drain runs here until the
    /// queue is empty. This entry is never itself re-entrant: the
    /// exclusive borrow is the single-entrancy guarantee, so no started
    /// flag is needed. Injection from inside a running user function
    /// goes through [`CallContext::launch`](crate::stack::CallContext::launch),
    /// whose seeds (deferred or nested) are always consumed before this
    /// call returns. Structural corruption aborts the drain with an
    /// error and sheds the transient state so the engine stays usable.
    #[instrument(skip_all, name = "launch")]
    pub fn launch(&mut self, spec: impl Into<LaunchSpec>) -> Result<DrainReport> {
        let spec = spec.into();
        debug!(seeds = spec.seeds.len(), "seeding");
        for (node, payload) in spec.seeds {
            self.seed(node, payload);
        }

        let result = self.drain();
        self.stacks.clear();
        let report = std::mem::take(&mut self.tally);
        match result {
            Ok(()) => {
                trace!(?report, "drained");
                Ok(report)
            }
            Err(err) => {
                self.queue = Queue::default();
                self.barriers.clear();
                error!(%err, "drain aborted");
                Err(err)
            }
        }
    }

    fn seed(&mut self, node: NodeHandle, payload: Value) {
        let frame = self.stacks.alloc(node, payload, None);
        self.queue.enqueue(Layer {
            idx: 0,
            frame,
            priority: Priority::Pure,
            id: 0,
        });
    }

    /// Main drain loop: dequeue, interpret, fan out. Runs until the
    /// queue is empty; a nested call from [`Engine::adopt`] consumes
    /// pending outer layers too, exactly as a nested propagation must.
    fn drain(&mut self) -> Result<()> {
        while let Some(layer) = self.queue.dequeue() {
            match self.run_layer(layer)? {
                LayerExit::Completed => {
                    self.tally.completed += 1;
                    self.fan_out(layer.frame);
                }
                LayerExit::Skipped => self.tally.skipped += 1,
                LayerExit::Failed => self.tally.failures += 1,
                LayerExit::Suspended => {}
            }
        }
        Ok(())
    }

    /// Enqueue one `Child` layer per child of the completed node,
    /// sharing the final stack value and linking each new frame to the
    /// current one.
    fn fan_out(&mut self, frame: FrameId) {
        let (node, value) = {
            let completed = self.stacks.get(frame);
            (completed.node.clone(), completed.value.clone())
        };
        for child in &node.next {
            let child_frame = self.stacks.alloc(child.clone(), value.clone(), Some(frame));
            self.queue.enqueue(Layer {
                idx: 0,
                frame: child_frame,
                priority: Priority::Child,
                id: 0,
            });
        }
    }

    /// Evaluate one node's sequence from the layer's cursor.
    fn run_layer(&mut self, layer: Layer) -> Result<LayerExit> {
        let node = self.stacks.get(layer.frame).node.clone();
        trace!(node = %node.id, idx = layer.idx, priority = ?layer.priority, "layer");
        let mut skip = false;

        for (stepn, step) in node.seq.iter().enumerate().skip(layer.idx) {
            match &step.kind {
                StepKind::Barrier(barrier) => {
                    if stepn != layer.idx || layer.priority != barrier.priority {
                        // Checkpoint: defer to the barrier's class,
                        // coalescing with any layer already carrying the
                        // id so fan-in nodes fire once per propagation.
                        if self.barriers.insert(barrier.id) {
                            debug!(node = %node.id, barrier = %barrier.id,
                                priority = ?barrier.priority, "barrier deferred");
                            self.queue.enqueue(Layer {
                                idx: stepn,
                                frame: layer.frame,
                                priority: barrier.priority,
                                id: barrier.id.0,
                            });
                        } else {
                            debug!(node = %node.id, barrier = %barrier.id, "barrier coalesced");
                        }
                        return Ok(LayerExit::Suspended);
                    }
                    // Resumed at the matching cursor and class
                    self.barriers.remove(&barrier.id);
                }
                StepKind::Mov { from, to } => {
                    let value = match from {
                        MovSource::Stack => self.stacks.get(layer.frame).value.clone(),
                        MovSource::A => self.stacks.get(layer.frame).a.clone(),
                        MovSource::B => self.stacks.get(layer.frame).b.clone(),
                        MovSource::Literal(literal) => literal.clone(),
                        MovSource::Reg(reg) => self.refs.read(node.ref_for(*reg)?)?.clone(),
                    };
                    match to {
                        MovTarget::Stack => self.stacks.get_mut(layer.frame).value = value,
                        MovTarget::A => self.stacks.get_mut(layer.frame).a = value,
                        MovTarget::B => self.stacks.get_mut(layer.frame).b = value,
                        MovTarget::Reg(reg) => self.refs.write(node.ref_for(*reg)?, value)?,
                    }
                }
                StepKind::Check(check) => {
                    let current = &self.stacks.get(layer.frame).value;
                    skip = match check {
                        Check::Defined => current.is_undefined(),
                        Check::Changed { reg } => {
                            current.same(self.refs.read(node.ref_for(*reg)?)?)
                        }
                    };
                }
                StepKind::Filter(predicate) => {
                    let value = self.stacks.get(layer.frame).value.clone();
                    let pending = RefCell::new(Vec::new());
                    let ctx = CallContext::new(
                        node.scope.as_ref(),
                        StackView::new(&self.stacks, layer.frame),
                        &pending,
                    );
                    let result = predicate(&value, &ctx);
                    drop(ctx);
                    self.adopt(pending.into_inner())?;
                    match result {
                        Ok(pass) => skip = !pass,
                        Err(err) => {
                            error!(node = %node.id, step = %step.id, %err, "filter failed");
                            return Ok(LayerExit::Failed);
                        }
                    }
                }
                StepKind::Run(func) => {
                    if stepn != layer.idx || layer.priority != Priority::Effect {
                        debug!(node = %node.id, "run deferred to effect class");
                        self.queue.enqueue(Layer {
                            idx: stepn,
                            frame: layer.frame,
                            priority: Priority::Effect,
                            id: 0,
                        });
                        return Ok(LayerExit::Suspended);
                    }
                    // At the matching cursor and class, `run` IS
                    // `compute`: the re-queue gate above is its only
                    // difference.
                    if !self.apply_compute(&node, layer.frame, step, func)? {
                        return Ok(LayerExit::Failed);
                    }
                }
                StepKind::Compute(func) => {
                    if !self.apply_compute(&node, layer.frame, step, func)? {
                        return Ok(LayerExit::Failed);
                    }
                }
            }
            if skip {
                return Ok(LayerExit::Skipped);
            }
        }
        Ok(LayerExit::Completed)
    }

    /// Run a user function against the frame's value, storing the result
    /// back. Returns false on user failure.
    fn apply_compute(
        &mut self,
        node: &NodeHandle,
        frame: FrameId,
        step: &Step,
        func: &ComputeFn,
    ) -> Result<bool> {
        let value = self.stacks.get(frame).value.clone();
        let pending = RefCell::new(Vec::new());
        let ctx = CallContext::new(
            node.scope.as_ref(),
            StackView::new(&self.stacks, frame),
            &pending,
        );
        let result = func(&value, &ctx);
        drop(ctx);
        // Seeds requested before a failure still enter the queue
        self.adopt(pending.into_inner())?;
        match result {
            Ok(next) => {
                self.stacks.get_mut(frame).value = next;
                Ok(true)
            }
            Err(err) => {
                error!(node = %node.id, step = %step.id, %err, "compute failed");
                // The effective result of a failed compute is undefined
                self.stacks.get_mut(frame).value = Value::Undefined;
                Ok(false)
            }
        }
    }

    /// Take in the seeds a user function requested. Deferred seeds only
    /// join the live queue; a non-deferred seed is a nested propagation,
    /// so the queue drains in place before the current node continues.
    fn adopt(&mut self, pending: Vec<PendingLaunch>) -> Result<()> {
        for launch in pending {
            debug!(node = %launch.node.id, defer = launch.defer, "re-entrant seed");
            self.seed(launch.node, launch.payload);
            if !launch.defer {
                self.drain()?;
            }
        }
        Ok(())
    }
}
