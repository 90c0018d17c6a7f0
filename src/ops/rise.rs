//! Root unit: the only ingress point of a pipeline.

use anyhow::Result;

use crate::graph::Downstream;
use crate::node::{Op, OpCtx, ParForward};
use crate::row::Row;
use crate::sched::Par;

/// A producer driven by the engine's pull loop.
///
/// Before any data, [`RiseSource::init`] is called with this worker's
/// position in the assigned rank list and the full list, so the source can
/// partition its data internally. After that, [`RiseSource::next`] is
/// called until it returns `None`; every batch it returns belongs to this
/// worker.
pub trait RiseSource {
    fn init(&mut self, _pos: usize, _ranks: &[usize]) {}

    /// Produce the next batch; `None` means end-of-stream.
    fn next(&mut self) -> Result<Option<Vec<Row>>>;
}

/// Batch-closure adapter: an empty batch signals end-of-stream.
pub struct BatchFn<F: FnMut() -> Vec<Row>>(pub F);

impl<F: FnMut() -> Vec<Row>> RiseSource for BatchFn<F> {
    fn next(&mut self) -> Result<Option<Vec<Row>>> {
        let rows = (self.0)();
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows))
        }
    }
}

/// Single-row closure adapter: the flag is the continuation; a `false`
/// flag ends the stream without emitting the row.
pub struct SingleFn<F: FnMut() -> (Row, bool)>(pub F);

impl<F: FnMut() -> (Row, bool)> RiseSource for SingleFn<F> {
    fn next(&mut self) -> Result<Option<Vec<Row>>> {
        let (row, more) = (self.0)();
        if more { Ok(Some(vec![row])) } else { Ok(None) }
    }
}

pub struct Rise {
    source: Box<dyn RiseSource>,
    inited: bool,
}

impl Rise {
    pub fn new(source: Box<dyn RiseSource>) -> Self {
        Self {
            source,
            inited: false,
        }
    }
}

impl Op for Rise {
    fn on_row(&mut self, _port: usize, _row: &Row, _dn: &Downstream, _ctx: &OpCtx) -> Result<()> {
        Ok(())
    }

    fn on_pull(&mut self, dn: &Downstream, ctx: &OpCtx) -> Result<bool> {
        if !self.inited {
            self.inited = true;
            let pos = ctx.par.pos().unwrap_or(0);
            self.source.init(pos, ctx.par.ranks());
        }
        match self.source.next()? {
            Some(rows) => {
                dn.batch(&rows)?;
                Ok(true)
            }
            None => {
                self.inited = false;
                Ok(false)
            }
        }
    }

    fn on_par(&mut self, _upstream: &Par, _dn: &Downstream, _ctx: &OpCtx) -> Result<ParForward> {
        Ok(ParForward::Own)
    }
}
