//! Graph nodes
//!
//! A node is an immutable record: an ordered instruction sequence, a
//! child list, a register table and an opaque scope. The opcode
//! vocabulary is a closed sum; the interpreter matches over it, so
//! unknown opcodes are unrepresentable.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, FnError};
use crate::stack::CallContext;
use crate::types::{
    BarrierId, Priority, RefId, RegId, Scope, StepId, UnitId, Value, next_step_id, next_unit_id,
};

/// User predicate for `filter` steps.
pub type FilterFn = Box<dyn Fn(&Value, &CallContext<'_>) -> Result<bool, FnError> + Send + Sync>;

/// User function for `compute` and `run` steps.
pub type ComputeFn = Box<dyn Fn(&Value, &CallContext<'_>) -> Result<Value, FnError> + Send + Sync>;

/// Source slot of a `mov`
#[derive(Debug, Clone)]
pub enum MovSource {
    Stack,
    A,
    B,
    /// Literal value baked into the step
    Literal(Value),
    /// Current value of a ref cell
    Reg(RegId),
}

/// Destination slot of a `mov`
#[derive(Debug, Clone, Copy)]
pub enum MovTarget {
    Stack,
    A,
    B,
    Reg(RegId),
}

/// Predicate applied by a `check` step
#[derive(Debug, Clone, Copy)]
pub enum Check {
    /// Skip when the stack value is undefined
    Defined,
    /// Skip when the stack value is identical to a ref cell's current value
    Changed { reg: RegId },
}

/// A checkpoint deferring the node to `priority`, coalescing on `id`
#[derive(Debug, Clone, Copy)]
pub struct Barrier {
    pub id: BarrierId,
    pub priority: Priority,
}

/// One primitive instruction
pub struct Step {
    pub id: StepId,
    pub kind: StepKind,
}

/// The closed opcode vocabulary
pub enum StepKind {
    /// Transfer a value between frame slots, a literal and ref cells
    Mov { from: MovSource, to: MovTarget },
    Check(Check),
    Filter(FilterFn),
    Compute(ComputeFn),
    /// Compute that must execute at effect priority
    Run(ComputeFn),
    Barrier(Barrier),
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Mov { from, to } => write!(f, "Mov {{ from: {from:?}, to: {to:?} }}"),
            StepKind::Check(check) => write!(f, "Check({check:?})"),
            StepKind::Filter(_) => write!(f, "Filter(..)"),
            StepKind::Compute(_) => write!(f, "Compute(..)"),
            StepKind::Run(_) => write!(f, "Run(..)"),
            StepKind::Barrier(barrier) => write!(f, "Barrier({barrier:?})"),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step {{ id: {}, kind: {:?} }}", self.id, self.kind)
    }
}

/// Shared handle to an immutable graph node
pub type NodeHandle = Arc<Node>;

/// A graph node. Immutable after construction.
pub struct Node {
    pub id: UnitId,
    /// Ordered instruction sequence
    pub seq: Vec<Step>,
    /// Children receiving the final stack value on completion
    pub next: Vec<NodeHandle>,
    /// Register table: local store ids to ref cells
    pub reg: HashMap<RegId, RefId>,
    /// Opaque record passed to user functions
    pub scope: Option<Scope>,
}

impl Node {
    /// Resolve a local register to its ref cell.
    pub(crate) fn ref_for(&self, reg: RegId) -> Result<RefId, Error> {
        self.reg
            .get(&reg)
            .copied()
            .ok_or(Error::RegisterNotFound { node: self.id, reg })
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("steps", &self.seq.len())
            .field("children", &self.next.len())
            .finish()
    }
}

/// Builder for graph nodes
pub struct NodeBuilder {
    seq: Vec<Step>,
    next: Vec<NodeHandle>,
    reg: HashMap<RegId, RefId>,
    scope: Option<Scope>,
    next_reg: u32,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            seq: Vec::new(),
            next: Vec::new(),
            reg: HashMap::new(),
            scope: None,
            next_reg: 0,
        }
    }

    /// Map a ref cell into the node's register table.
    pub fn register(&mut self, cell: RefId) -> RegId {
        let reg = RegId(self.next_reg);
        self.next_reg += 1;
        self.reg.insert(reg, cell);
        reg
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn mov(self, from: MovSource, to: MovTarget) -> Self {
        self.push(StepKind::Mov { from, to })
    }

    pub fn check_defined(self) -> Self {
        self.push(StepKind::Check(Check::Defined))
    }

    pub fn check_changed(self, reg: RegId) -> Self {
        self.push(StepKind::Check(Check::Changed { reg }))
    }

    pub fn filter(
        self,
        f: impl Fn(&Value, &CallContext<'_>) -> Result<bool, FnError> + Send + Sync + 'static,
    ) -> Self {
        self.push(StepKind::Filter(Box::new(f)))
    }

    pub fn compute(
        self,
        f: impl Fn(&Value, &CallContext<'_>) -> Result<Value, FnError> + Send + Sync + 'static,
    ) -> Self {
        self.push(StepKind::Compute(Box::new(f)))
    }

    pub fn run(
        self,
        f: impl Fn(&Value, &CallContext<'_>) -> Result<Value, FnError> + Send + Sync + 'static,
    ) -> Self {
        self.push(StepKind::Run(Box::new(f)))
    }

    /// Append a barrier deferring the node to `priority`. The coalescing
    /// id comes from the step id generator, so older barriers order
    /// before newer ones in the shared heap.
    pub fn barrier(mut self, priority: Priority) -> Self {
        let id = next_step_id();
        self.seq.push(Step {
            id,
            kind: StepKind::Barrier(Barrier {
                id: BarrierId(id.0),
                priority,
            }),
        });
        self
    }

    /// Add a child edge.
    pub fn child(mut self, node: &NodeHandle) -> Self {
        self.next.push(node.clone());
        self
    }

    fn push(mut self, kind: StepKind) -> Self {
        self.seq.push(Step {
            id: next_step_id(),
            kind,
        });
        self
    }

    pub fn build(self) -> NodeHandle {
        Arc::new(Node {
            id: next_unit_id(),
            seq: self.seq,
            next: self.next,
            reg: self.reg,
            scope: self.scope,
        })
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
