//! Row transformation: zero, one or many output rows per input row.

use anyhow::Result;

use crate::graph::Downstream;
use crate::node::{Op, OpCtx};
use crate::ops::{MapFn, MapOut};
use crate::row::{Row, Selection, concat};

/// Applies a user function to the F-projection of each row and shapes the
/// output through O over `concat(input, result)`. Never reorders rows.
pub struct Map {
    fsel: Selection,
    osel: Selection,
    func: MapFn,
}

impl Map {
    pub fn new(fsel: Selection, osel: Selection, func: MapFn) -> Self {
        Self { fsel, osel, func }
    }
}

impl Op for Map {
    fn on_row(&mut self, _port: usize, row: &Row, dn: &Downstream, ctx: &OpCtx) -> Result<()> {
        let fin = self.fsel.project(row);
        let out = (self.func)(&fin);
        if !ctx.has_next {
            return Ok(());
        }
        match out {
            MapOut::One(res) => dn.row(&self.osel.project(&concat(row, &res))),
            MapOut::Many(rows) => {
                let res: Vec<Row> = rows
                    .into_iter()
                    .map(|r| self.osel.project(&concat(row, &r)))
                    .collect();
                dn.batch(&res)
            }
        }
    }
}
