//! Predicate unit: keeps or drops rows, reshaping kept rows through O.

use anyhow::Result;

use crate::graph::Downstream;
use crate::node::{Op, OpCtx};
use crate::ops::FilterFn;
use crate::row::{Row, Selection};

pub struct Filter {
    fsel: Selection,
    osel: Selection,
    pred: FilterFn,
}

impl Filter {
    pub fn new(fsel: Selection, osel: Selection, pred: FilterFn) -> Self {
        Self { fsel, osel, pred }
    }
}

impl Op for Filter {
    fn on_row(&mut self, _port: usize, row: &Row, dn: &Downstream, ctx: &OpCtx) -> Result<()> {
        let fin = self.fsel.project(row);
        if (self.pred)(&fin) && ctx.has_next {
            dn.row(&self.osel.project(row))?;
        }
        Ok(())
    }
}
