//! The dataflow graph: node registry, wiring, traversals and dispatch.
//!
//! A [`Graph`] is the central registry every stage handle points into. It is
//! cheaply cloneable; all clones share the same inner state. One engine
//! thread owns a graph, so interior mutability is `Rc`/`RefCell`, never
//! locks.
//!
//! Execution is push-based: rises produce rows from `pull` and every
//! operator pushes its output through a [`Downstream`] handle, which
//! delivers to the next nodes immediately. Begin/end-of-stream signals and
//! parallel info travel the same edges once per path from each root;
//! traversal cycles introduced by merge or tee shapes are broken with an
//! on-stack visited set, not by ownership tricks.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use anyhow::{Result, anyhow};

use crate::comm::Comm;
use crate::node::{Node, Op, OpCtx, ParForward, TaskSpec};
use crate::row::Row;
use crate::sched::Par;

/// Unique numeric identifier for a node in a graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn new(v: u64) -> Self {
        Self(v)
    }

    /// The underlying numeric value, mainly for debugging.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

pub(crate) struct GraphInner {
    next_id: u64,
    nodes: HashMap<NodeId, Rc<Node>>,
}

/// Shared registry of nodes and edges for one worker's pipelines.
pub struct Graph {
    inner: Rc<RefCell<GraphInner>>,
}

impl Default for Graph {
    fn default() -> Self {
        Self {
            inner: Rc::new(RefCell::new(GraphInner {
                next_id: 0,
                nodes: HashMap::new(),
            })),
        }
    }
}

impl Clone for Graph {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Per-run context threaded through dispatch.
pub(crate) struct RunCtx<'a> {
    pub comm: Option<&'a Comm>,
    pub rank: usize,
}

/// An operator's handle to the nodes linked after it.
///
/// Emitting routes immediately: by the time `row` returns, every
/// downstream operator has processed the row.
pub struct Downstream<'a> {
    graph: &'a Graph,
    node: NodeId,
    rctx: &'a RunCtx<'a>,
}

impl Downstream<'_> {
    /// Send one row to every downstream node.
    pub fn row(&self, row: &Row) -> Result<()> {
        let nexts: Vec<_> = self.graph.slot(self.node).next.borrow().clone();
        for (n, port) in nexts {
            self.graph
                .deliver(n, port, std::slice::from_ref(row), self.rctx)?;
        }
        Ok(())
    }

    /// Send a batch to every downstream node.
    pub fn batch(&self, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let nexts: Vec<_> = self.graph.slot(self.node).next.borrow().clone();
        for (n, port) in nexts {
            self.graph.deliver(n, port, rows, self.rctx)?;
        }
        Ok(())
    }
}

impl Graph {
    /// Whether two handles share the same registry.
    pub fn same_as(&self, other: &Graph) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn insert(&self, op: Box<dyn Op>, task: Option<TaskSpec>) -> NodeId {
        let mut g = self.inner.borrow_mut();
        let id = NodeId::new(g.next_id);
        g.next_id += 1;
        g.nodes.insert(id, Rc::new(Node::new(op, task)));
        id
    }

    /// Directed edge `from -> to`, delivering on input `port` of `to`.
    pub(crate) fn connect(&self, from: NodeId, to: NodeId, port: usize) {
        let (a, b) = {
            let g = self.inner.borrow();
            (Rc::clone(&g.nodes[&from]), Rc::clone(&g.nodes[&to]))
        };
        let mut next = a.next.borrow_mut();
        if !next.iter().any(|&(n, p)| n == to && p == port) {
            next.push((to, port));
            b.prev.borrow_mut().push(from);
        }
    }

    pub(crate) fn slot(&self, id: NodeId) -> Rc<Node> {
        Rc::clone(&self.inner.borrow().nodes[&id])
    }

    pub(crate) fn set_par(&self, id: NodeId, par: Par) {
        *self.slot(id).par.borrow_mut() = Some(par);
    }

    pub(crate) fn task_spec(&self, id: NodeId) -> Option<TaskSpec> {
        self.slot(id).task.borrow().clone()
    }

    pub(crate) fn par_of(&self, id: NodeId) -> Option<Par> {
        self.slot(id).par.borrow().clone()
    }

    pub(crate) fn clear_par(&self, id: NodeId) {
        *self.slot(id).par.borrow_mut() = None;
    }

    pub(crate) fn set_task_req(&self, id: NodeId, req: crate::sched::ProcReq) {
        if let Some(spec) = self.slot(id).task.borrow_mut().as_mut() {
            spec.req = req;
        }
    }

    pub(crate) fn set_bro(&self, a: NodeId, b: NodeId) {
        if let Some(spec) = self.slot(a).task.borrow_mut().as_mut() {
            spec.bro = Some(b);
        }
        if let Some(spec) = self.slot(b).task.borrow_mut().as_mut() {
            spec.bro = Some(a);
        }
    }

    // |------------|
    // | Traversals |
    // |------------|

    /// Walk upstream from `starts` to the set of root tasks, in stable
    /// first-encounter order.
    pub(crate) fn root_set(&self, starts: &[NodeId]) -> Vec<NodeId> {
        let mut roots = Vec::new();
        let mut active = HashSet::new();
        for &s in starts {
            self.roots_up(s, &mut roots, &mut active);
        }
        let mut seen = HashSet::new();
        roots.retain(|r| seen.insert(*r));
        roots
    }

    fn roots_up(&self, id: NodeId, roots: &mut Vec<NodeId>, active: &mut HashSet<NodeId>) {
        if !active.insert(id) {
            return;
        }
        let slot = self.slot(id);
        let is_root = slot
            .task
            .borrow()
            .as_ref()
            .map(|t| t.root)
            .unwrap_or(false);
        if is_root {
            roots.push(id);
        } else {
            for &p in slot.prev.borrow().iter() {
                self.roots_up(p, roots, active);
            }
        }
        active.remove(&id);
    }

    /// Walk downstream from a root collecting every task node (bridges)
    /// reachable from it, in encounter order.
    pub(crate) fn branch_tasks(&self, root: NodeId) -> Vec<NodeId> {
        let mut tasks = Vec::new();
        let mut active = HashSet::new();
        let slot = self.slot(root);
        for &(n, _) in slot.next.borrow().iter() {
            self.tasks_down(n, &mut tasks, &mut active);
        }
        tasks
    }

    fn tasks_down(&self, id: NodeId, tasks: &mut Vec<NodeId>, active: &mut HashSet<NodeId>) {
        if !active.insert(id) {
            return;
        }
        let slot = self.slot(id);
        if slot.task.borrow().is_some() {
            tasks.push(id);
        }
        for &(n, _) in slot.next.borrow().iter() {
            self.tasks_down(n, tasks, active);
        }
        active.remove(&id);
    }

    // |--------------------|
    // | Signals & par info |
    // |--------------------|

    /// Begin-of-stream from a root: every downstream node, once per path,
    /// gains a pending closer.
    pub(crate) fn pre_pull(&self, root: NodeId, rctx: &RunCtx) -> Result<()> {
        let nexts: Vec<_> = self.slot(root).next.borrow().clone();
        let mut active = HashSet::new();
        for (n, _) in nexts {
            self.signal(n, 0, rctx, &mut active)?;
        }
        Ok(())
    }

    fn signal(
        &self,
        id: NodeId,
        sig: i32,
        rctx: &RunCtx,
        active: &mut HashSet<NodeId>,
    ) -> Result<()> {
        if !active.insert(id) {
            return Ok(());
        }
        let slot = self.slot(id);
        if sig == 0 {
            slot.pending.set(slot.pending.get() + 1);
        } else {
            let p = slot.pending.get();
            if p > 0 {
                slot.pending.set(p - 1);
            }
            if slot.pending.get() == 0 {
                let dn = Downstream {
                    graph: self,
                    node: id,
                    rctx,
                };
                let ctx = self.op_ctx(&slot, rctx);
                slot.op.borrow_mut().on_end(sig, &dn, &ctx)?;
            }
        }
        let nexts: Vec<_> = slot.next.borrow().clone();
        for (n, _) in nexts {
            self.signal(n, sig, rctx, active)?;
        }
        active.remove(&id);
        Ok(())
    }

    fn forward_par(
        &self,
        id: NodeId,
        upstream: &Par,
        rctx: &RunCtx,
        active: &mut HashSet<NodeId>,
    ) -> Result<()> {
        if !active.insert(id) {
            return Ok(());
        }
        let slot = self.slot(id);
        let fwd = {
            let dn = Downstream {
                graph: self,
                node: id,
                rctx,
            };
            let ctx = self.op_ctx(&slot, rctx);
            slot.op.borrow_mut().on_par(upstream, &dn, &ctx)?
        };
        let pass = match fwd {
            ParForward::Inherit => Some(upstream.clone()),
            ParForward::Own => slot.par.borrow().clone(),
            ParForward::Stop => None,
        };
        if let Some(par) = pass {
            let nexts: Vec<_> = slot.next.borrow().clone();
            for (n, _) in nexts {
                self.forward_par(n, &par, rctx, active)?;
            }
        }
        active.remove(&id);
        Ok(())
    }

    // |----------|
    // | Dispatch |
    // |----------|

    fn op_ctx<'a>(&self, slot: &Node, rctx: &RunCtx<'a>) -> OpCtx<'a> {
        let par = slot
            .par
            .borrow()
            .clone()
            .unwrap_or_else(|| Par::local(rctx.rank));
        OpCtx {
            par,
            pending: slot.pending.get(),
            has_next: !slot.next.borrow().is_empty(),
            comm: rctx.comm,
        }
    }

    fn deliver(&self, id: NodeId, port: usize, rows: &[Row], rctx: &RunCtx) -> Result<()> {
        let slot = self.slot(id);
        let dn = Downstream {
            graph: self,
            node: id,
            rctx,
        };
        let ctx = self.op_ctx(&slot, rctx);
        let mut op = slot.op.borrow_mut();
        if rows.len() == 1 {
            op.on_row(port, &rows[0], &dn, &ctx)
        } else {
            op.on_batch(port, rows, &dn, &ctx)
        }
    }

    /// Drive one root to exhaustion: forward its parallel info, pull data
    /// while it is in range, then send end-of-stream downstream.
    pub(crate) fn pull(&self, root: NodeId, rctx: &RunCtx) -> Result<()> {
        let slot = self.slot(root);
        if slot.next.borrow().is_empty() {
            return Ok(());
        }
        let par = slot
            .par
            .borrow()
            .clone()
            .ok_or_else(|| anyhow!("root task was never assigned a process set"))?;
        {
            let nexts: Vec<_> = slot.next.borrow().clone();
            let mut active = HashSet::new();
            for (n, _) in nexts {
                self.forward_par(n, &par, rctx, &mut active)?;
            }
        }
        if par.in_range() {
            let dn = Downstream {
                graph: self,
                node: root,
                rctx,
            };
            loop {
                let more = {
                    let ctx = self.op_ctx(&slot, rctx);
                    let mut op = slot.op.borrow_mut();
                    op.on_pull(&dn, &ctx)?
                };
                if !more {
                    break;
                }
            }
        }
        let nexts: Vec<_> = slot.next.borrow().clone();
        let mut active = HashSet::new();
        for (n, _) in nexts {
            self.signal(n, 1, rctx, &mut active)?;
        }
        Ok(())
    }
}
