//! Identity unit, used as a splice point when composing flows.

use anyhow::Result;

use crate::graph::Downstream;
use crate::node::{Op, OpCtx};
use crate::row::Row;

pub struct NoOp;

impl Op for NoOp {
    fn on_row(&mut self, _port: usize, row: &Row, dn: &Downstream, _ctx: &OpCtx) -> Result<()> {
        dn.row(row)
    }

    fn on_batch(
        &mut self,
        _port: usize,
        rows: &[Row],
        dn: &Downstream,
        _ctx: &OpCtx,
    ) -> Result<()> {
        dn.batch(rows)
    }
}
