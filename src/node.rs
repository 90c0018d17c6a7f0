//! Operator interface and per-node bookkeeping.
//!
//! Every stage in a graph is a [`Node`] wrapping an object that implements
//! [`Op`]. The engine drives operators through a small event protocol:
//!
//! - `on_par` — parallel info flows forward once per run, before data.
//! - `on_pull` — roots produce batches until exhausted.
//! - `on_row` / `on_batch` — data events.
//! - `on_end` — fired when a node's pending begin-signals drain to zero;
//!   buffered operators flush here.
//!
//! Operators push output through the [`Downstream`](crate::graph::Downstream)
//! handle, which delivers to the next nodes immediately — a row emitted
//! mid-event reaches the sink before the event returns, which is what lets
//! a bridge keep its receiving side flowing while its sending side is
//! blocked.

use std::cell::{Cell, RefCell};

use anyhow::Result;

use crate::comm::Comm;
use crate::graph::Downstream;
use crate::row::Row;
use crate::sched::{Par, ProcReq};

/// What a node forwards when parallel info passes through it.
pub enum ParForward {
    /// Pass the incoming info through unchanged (plain links).
    Inherit,
    /// Forward this node's own assigned info (tasks: rises and bridges).
    Own,
    /// Stop here (sinks).
    Stop,
}

/// Per-event context handed to an operator.
pub struct OpCtx<'a> {
    /// The node's assigned parallel info, or a local single-rank default.
    pub par: Par,
    /// Outstanding begin-signals on this node.
    pub pending: u32,
    /// Whether anything is linked downstream.
    pub has_next: bool,
    /// Transport endpoint for this worker, absent in purely local runs.
    pub comm: Option<&'a Comm>,
}

/// A pipeline stage operator.
#[allow(unused_variables)]
pub trait Op {
    /// Handle one row arriving on `port`.
    fn on_row(&mut self, port: usize, row: &Row, dn: &Downstream, ctx: &OpCtx) -> Result<()>;

    /// Handle a batch; the default iterates [`Op::on_row`].
    fn on_batch(&mut self, port: usize, rows: &[Row], dn: &Downstream, ctx: &OpCtx) -> Result<()> {
        for row in rows {
            self.on_row(port, row, dn, ctx)?;
        }
        Ok(())
    }

    /// Parallel info arriving from an upstream task before data flows.
    fn on_par(&mut self, upstream: &Par, dn: &Downstream, ctx: &OpCtx) -> Result<ParForward> {
        Ok(ParForward::Inherit)
    }

    /// Root production step; returns `true` while more data may come.
    fn on_pull(&mut self, dn: &Downstream, ctx: &OpCtx) -> Result<bool> {
        Ok(false)
    }

    /// End-of-stream: flush any buffered state.
    fn on_end(&mut self, sig: i32, dn: &Downstream, ctx: &OpCtx) -> Result<()> {
        Ok(())
    }
}

/// Process-allocation request and grouping info for task nodes.
#[derive(Clone, Debug)]
pub struct TaskSpec {
    pub req: ProcReq,
    /// Task parallelism: allocate disjointly from the upstream's ranks.
    pub task: bool,
    /// Roots start allocation groups; bridges join their root's group.
    pub root: bool,
    /// A sibling task that must land on the same rank set (zip inputs).
    pub bro: Option<crate::graph::NodeId>,
}

impl TaskSpec {
    pub fn root(req: ProcReq) -> Self {
        Self {
            req,
            task: false,
            root: true,
            bro: None,
        }
    }

    pub fn bridge(req: ProcReq, task: bool) -> Self {
        Self {
            req,
            task,
            root: false,
            bro: None,
        }
    }
}

/// A graph node: operator state plus wiring and signal bookkeeping.
pub(crate) struct Node {
    pub op: RefCell<Box<dyn Op>>,
    pub prev: RefCell<Vec<crate::graph::NodeId>>,
    /// Downstream edges; the `usize` is the destination input port.
    pub next: RefCell<Vec<(crate::graph::NodeId, usize)>>,
    /// Outstanding begin-of-stream signals.
    pub pending: Cell<u32>,
    /// Parallel info assigned by the scheduler for this run.
    pub par: RefCell<Option<Par>>,
    /// Present on rises and bridges.
    pub task: RefCell<Option<TaskSpec>>,
}

impl Node {
    pub fn new(op: Box<dyn Op>, task: Option<TaskSpec>) -> Self {
        Self {
            op: RefCell::new(op),
            prev: RefCell::new(Vec::new()),
            next: RefCell::new(Vec::new()),
            pending: Cell::new(0),
            par: RefCell::new(None),
            task: RefCell::new(task),
        }
    }
}
