//! Reusable flow fragments.
//!
//! A [`Flow`] is an ordered DAG fragment with a distinguished set of
//! *first* nodes (accepting rows of some width) and *last* nodes (emitting
//! rows of some width). Flows compose — append, prepend, merge — by wiring
//! boundary nodes together inside the shared graph; a flow handle itself
//! never becomes part of the dataflow.

use anyhow::{Result, bail};

use crate::graph::{Graph, NodeId};

/// A composable fragment of a pipeline graph.
#[derive(Clone)]
pub struct Flow {
    pub(crate) graph: Graph,
    /// Nodes (and input ports) that accept this flow's input.
    pub(crate) first: Vec<(NodeId, usize)>,
    /// Nodes whose output is this flow's output.
    pub(crate) last: Vec<NodeId>,
    /// Input row width; `None` when the flow starts at a rise.
    pub(crate) in_width: Option<usize>,
    pub(crate) out_width: usize,
}

impl Flow {
    /// Row width this flow emits.
    pub fn out_width(&self) -> usize {
        self.out_width
    }

    /// Row width this flow accepts, if it accepts input at all.
    pub fn in_width(&self) -> Option<usize> {
        self.in_width
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.last.is_empty()
    }

    fn check_same_graph(&self, other: &Flow) -> Result<()> {
        if !self.graph.same_as(&other.graph) {
            bail!("flows from different graphs can not be composed");
        }
        Ok(())
    }

    /// `self >> next`: feed this flow's output into `next`'s input.
    pub fn append(self, next: Flow) -> Result<Flow> {
        self.check_same_graph(&next)?;
        if self.is_empty() {
            return Ok(next);
        }
        if next.is_empty() {
            return Ok(self);
        }
        match next.in_width {
            Some(w) if w == self.out_width => {}
            Some(w) => bail!(
                "can not append: output is {} column(s) wide, next accepts {w}",
                self.out_width
            ),
            None => bail!("can not append: the next flow accepts no input"),
        }
        for &l in &self.last {
            for &(f, port) in &next.first {
                self.graph.connect(l, f, port);
            }
        }
        Ok(Flow {
            graph: self.graph,
            first: self.first,
            last: next.last,
            in_width: self.in_width,
            out_width: next.out_width,
        })
    }

    /// `self << prev`: prepend a producer flow in front of this one.
    pub fn prepend(self, prev: Flow) -> Result<Flow> {
        prev.append(self)
    }

    /// `self + other`: union of two flows with the same input and output
    /// widths; both run side by side.
    pub fn merge(mut self, other: Flow) -> Result<Flow> {
        self.check_same_graph(&other)?;
        if other.is_empty() {
            return Ok(self);
        }
        if self.is_empty() {
            return Ok(other);
        }
        if self.in_width != other.in_width || self.out_width != other.out_width {
            bail!("can not merge flows of different shapes");
        }
        self.first.extend(other.first);
        self.last.extend(other.last);
        Ok(self)
    }
}
