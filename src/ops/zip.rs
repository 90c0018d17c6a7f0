//! Keyed pairing of two upstream streams.

use std::collections::{HashMap, VecDeque};

use anyhow::Result;

use crate::graph::Downstream;
use crate::node::{Op, OpCtx};
use crate::row::{Row, Selection, concat};

/// Pairs rows from two inputs by key, FIFO within each key.
///
/// Port 0 is the left input, port 1 the right. When both per-key queues are
/// non-empty, `min(|left|, |right|)` pairs flush immediately. At
/// end-of-stream any remaining matched pairs flush and unpaired remainders
/// are dropped. Order within a key is preserved; across keys it is not.
pub struct Zip {
    k1: Selection,
    k2: Selection,
    osel: Selection,
    left: HashMap<Row, VecDeque<Row>>,
    right: HashMap<Row, VecDeque<Row>>,
}

impl Zip {
    pub fn new(k1: Selection, k2: Selection, osel: Selection) -> Self {
        Self {
            k1,
            k2,
            osel,
            left: HashMap::new(),
            right: HashMap::new(),
        }
    }

    fn flush_key(&mut self, key: &Row, dn: &Downstream) -> Result<()> {
        let (Some(lq), Some(rq)) = (self.left.get_mut(key), self.right.get_mut(key)) else {
            return Ok(());
        };
        let n = lq.len().min(rq.len());
        for _ in 0..n {
            let l = lq.pop_front().unwrap();
            let r = rq.pop_front().unwrap();
            dn.row(&self.osel.project(&concat(&l, &r)))?;
        }
        if lq.is_empty() {
            self.left.remove(key);
        }
        if rq.is_empty() {
            self.right.remove(key);
        }
        Ok(())
    }
}

impl Op for Zip {
    fn on_row(&mut self, port: usize, row: &Row, dn: &Downstream, _ctx: &OpCtx) -> Result<()> {
        let key = if port == 0 {
            self.k1.project(row)
        } else {
            self.k2.project(row)
        };
        let side = if port == 0 {
            &mut self.left
        } else {
            &mut self.right
        };
        side.entry(key.clone()).or_default().push_back(row.clone());
        self.flush_key(&key, dn)
    }

    fn on_end(&mut self, _sig: i32, dn: &Downstream, _ctx: &OpCtx) -> Result<()> {
        let keys: Vec<Row> = self.left.keys().cloned().collect();
        for key in keys {
            self.flush_key(&key, dn)?;
        }
        self.left.clear();
        self.right.clear();
        Ok(())
    }
}
