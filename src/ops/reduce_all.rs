//! Buffered reduction: collect a group's rows, then hand the whole buffer
//! to the user function.

use std::collections::{HashMap, VecDeque};

use anyhow::Result;

use crate::graph::Downstream;
use crate::node::{Op, OpCtx};
use crate::ops::{MapOut, ReduceAllFn};
use crate::row::{Field, Row, Selection, concat};

/// One group's buffered value rows.
#[derive(Default, Clone, Debug)]
pub struct GroupBuf {
    rows: VecDeque<Row>,
}

impl GroupBuf {
    pub fn push(&mut self, row: Row) {
        self.rows.push_back(row);
    }

    pub fn pop_front(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    /// Numeric view of one 1-based column across the buffer.
    pub fn col_nums(&self, col: usize) -> Vec<f64> {
        self.rows
            .iter()
            .filter_map(|r| r.get(col - 1).and_then(Field::as_num))
            .collect()
    }
}

/// Emission trigger for a buffered reduce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Trigger {
    /// Flush every group at end-of-stream.
    #[default]
    EndOfStream,
    /// Invoke on every `n` rows of a group, then clear the buffer. With
    /// `fixed`, partial buffers at end-of-stream are dropped.
    Bunch { n: usize, fixed: bool },
    /// Sliding window: invoke when the group reaches `n` rows, then pop
    /// only the oldest. With `fixed`, partial windows at end-of-stream are
    /// dropped; otherwise the window drains one row at a time.
    Adjacent { n: usize, fixed: bool },
}

pub struct ReduceAll {
    ksel: Selection,
    vsel: Selection,
    osel: Selection,
    func: ReduceAllFn,
    trigger: Trigger,
    ordered: bool,
    index: HashMap<Row, GroupBuf>,
    last_key: Option<Row>,
}

impl ReduceAll {
    pub fn new(
        ksel: Selection,
        vsel: Selection,
        osel: Selection,
        func: ReduceAllFn,
        trigger: Trigger,
        ordered: bool,
    ) -> Self {
        Self {
            ksel,
            vsel,
            osel,
            func,
            trigger,
            ordered,
            index: HashMap::new(),
            last_key: None,
        }
    }

    fn invoke(
        func: &mut ReduceAllFn,
        osel: &Selection,
        key: &Row,
        buf: &GroupBuf,
        dn: &Downstream,
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        match func(key, buf) {
            MapOut::One(res) => dn.row(&osel.project(&concat(key, &res))),
            MapOut::Many(rows) => {
                let out: Vec<Row> = rows
                    .into_iter()
                    .map(|res| osel.project(&concat(key, &res)))
                    .collect();
                dn.batch(&out)
            }
        }
    }

    fn drain_group(&mut self, key: &Row, dn: &Downstream) -> Result<()> {
        let Some(mut buf) = self.index.remove(key) else {
            return Ok(());
        };
        match self.trigger {
            Trigger::Adjacent { fixed: false, .. } => {
                // partial windows slide out one row at a time
                while !buf.is_empty() {
                    Self::invoke(&mut self.func, &self.osel, key, &buf, dn)?;
                    buf.pop_front();
                }
            }
            Trigger::Adjacent { fixed: true, .. } | Trigger::Bunch { fixed: true, .. } => {}
            _ => Self::invoke(&mut self.func, &self.osel, key, &buf, dn)?,
        }
        Ok(())
    }
}

impl Op for ReduceAll {
    fn on_row(&mut self, _port: usize, row: &Row, dn: &Downstream, _ctx: &OpCtx) -> Result<()> {
        let key = self.ksel.project(row);
        let val = self.vsel.project(row);
        let buf = self.index.entry(key.clone()).or_default();
        buf.push(val);

        match self.trigger {
            Trigger::Bunch { n, .. } if buf.size() >= n => {
                Self::invoke(&mut self.func, &self.osel, &key, buf, dn)?;
                buf.clear();
            }
            Trigger::Adjacent { n, .. } if buf.size() >= n => {
                Self::invoke(&mut self.func, &self.osel, &key, buf, dn)?;
                buf.pop_front();
            }
            _ => {}
        }

        if self.ordered {
            if let Some(prev) = self.last_key.take()
                && prev != key
            {
                self.drain_group(&prev, dn)?;
            }
            self.last_key = Some(key);
        }
        Ok(())
    }

    fn on_end(&mut self, _sig: i32, dn: &Downstream, _ctx: &OpCtx) -> Result<()> {
        let keys: Vec<Row> = self.index.keys().cloned().collect();
        for key in keys {
            self.drain_group(&key, dn)?;
        }
        self.index.clear();
        self.last_key = None;
        Ok(())
    }
}
