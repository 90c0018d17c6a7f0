//! Streaming reduction: group rows by key, folding each group as it
//! arrives.

use std::collections::HashMap;

use anyhow::Result;

use crate::graph::Downstream;
use crate::node::{Op, OpCtx};
use crate::row::{Field, Row, Selection, concat};

/// The two reducer calling conventions.
///
/// `InPlace` mutates the accumulator through a reference, so the engine
/// never copies it; `ByValue` consumes and returns it. Both see
/// `(acc, key_subrow, value_subrow)`.
pub enum ReduceFn {
    InPlace(Box<dyn FnMut(&mut Row, &[Field], &[Field])>),
    ByValue(Box<dyn FnMut(Row, &[Field], &[Field]) -> Row>),
}

/// Keyed streaming reduce.
///
/// Holds one accumulator bucket per live key. Buckets flush at
/// end-of-stream, after every update in `scan` mode, or as soon as a
/// differing key arrives in `ordered` mode (which keeps at most one bucket
/// alive when the input is pre-grouped).
pub struct Reduce {
    ksel: Selection,
    vsel: Selection,
    osel: Selection,
    init: Row,
    func: ReduceFn,
    scan: bool,
    ordered: bool,
    index: HashMap<Row, Row>,
    last_key: Option<Row>,
}

impl Reduce {
    pub fn new(
        ksel: Selection,
        vsel: Selection,
        osel: Selection,
        init: Row,
        func: ReduceFn,
        scan: bool,
        ordered: bool,
    ) -> Self {
        Self {
            ksel,
            vsel,
            osel,
            init,
            func,
            scan,
            ordered,
            index: HashMap::new(),
            last_key: None,
        }
    }

    /// Live bucket count; `ordered` mode keeps this at one.
    pub fn bucket_count(&self) -> usize {
        self.index.len()
    }

    fn emit_bucket(&self, key: &Row, acc: &Row, dn: &Downstream) -> Result<()> {
        dn.row(&self.osel.project(&concat(key, acc)))
    }
}

impl Op for Reduce {
    fn on_row(&mut self, _port: usize, row: &Row, dn: &Downstream, _ctx: &OpCtx) -> Result<()> {
        let key = self.ksel.project(row);
        let val = self.vsel.project(row);
        match &mut self.func {
            ReduceFn::InPlace(f) => {
                let acc = self
                    .index
                    .entry(key.clone())
                    .or_insert_with(|| self.init.clone());
                f(acc, &key, &val);
            }
            ReduceFn::ByValue(f) => {
                let acc = self.index.remove(&key).unwrap_or_else(|| self.init.clone());
                let acc = f(acc, &key, &val);
                self.index.insert(key.clone(), acc);
            }
        }
        if self.scan {
            let acc = self.index[&key].clone();
            self.emit_bucket(&key, &acc, dn)?;
            return Ok(());
        }
        if self.ordered {
            if let Some(prev) = self.last_key.take()
                && prev != key
            {
                if let Some(acc) = self.index.remove(&prev) {
                    self.emit_bucket(&prev, &acc, dn)?;
                }
            }
            self.last_key = Some(key);
        }
        Ok(())
    }

    fn on_end(&mut self, _sig: i32, dn: &Downstream, _ctx: &OpCtx) -> Result<()> {
        if !self.scan && !self.index.is_empty() {
            let rows: Vec<Row> = self
                .index
                .iter()
                .map(|(key, acc)| self.osel.project(&concat(key, acc)))
                .collect();
            self.index.clear();
            dn.batch(&rows)?;
        }
        self.index.clear();
        self.last_key = None;
        Ok(())
    }
}
