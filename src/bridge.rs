//! The shuffle bridge: the parallelism boundary between two process sets.
//!
//! A bridge is both a sink for the upstream task's rows and a source for
//! the downstream task's. Each row is routed to a downstream rank —
//! key-sharded, round-robin, broadcast, or passed through locally — and
//! crosses ranks on one of three wire channels per peer pair: tag 0
//! carries the end-of-stream signal, tag 1 a single row, tag 2 a batch.
//!
//! Outbound, rows accumulate per peer with at most one send in flight; a
//! throttle counter backs off multiplicatively (capped at 2^16) while a
//! send is stuck, and an eager quota lets the first messages of a run skip
//! buffering. If a peer's buffer outgrows the safe bound the bridge stops
//! accepting and drains receives until the send completes, or waits on the
//! send directly when there is nothing to receive. Inbound, the three
//! channels of every upstream peer are polled with normalized per-peer
//! counters so a starved peer rises in priority, and each poll drains at
//! most 2^10 messages so no peer monopolizes delivery. Received rows go
//! straight downstream, so the receiving side keeps flowing even while
//! the sending side is blocked.

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use tracing::warn;

use crate::comm::{Comm, SendReq};
use crate::graph::Downstream;
use crate::node::{Op, OpCtx, ParForward};
use crate::row::{Field, Row, Selection, hash_key};
use crate::sched::Par;

const MAX_COUNTER: u64 = 1 << 16;
/// Divide the send counter by this on progress.
const DEC_SEND: u64 = 4;
/// Multiply the send counter by this while a send is stuck.
const INC_SEND: u64 = 2;
const DEC_RECV: u64 = 4;
const INC_RECV: f64 = 1.5;
/// Most messages drained from one peer before yielding to the others.
const MAX_ITERS_RECV: u64 = 1 << 10;
/// Small messages allowed through before buffering kicks in.
const MAX_EAGER: u32 = 1 << 8;
/// Outbound rows per peer beyond which the bridge must stop accepting.
const MAX_SEND_BUF: usize = 1 << 30;
/// Buffer size below which exhausted-quota sends keep waiting for more.
const MIN_SEND_BUF: usize = 1 << 10;

/// Custom key hasher for `partition_by`.
pub type Partitioner = Box<dyn Fn(&[&Field]) -> u64>;

#[derive(Default)]
struct Outbound {
    buf: Vec<Row>,
    inflight: Option<SendReq>,
    counter: u64,
    tick: u64,
    eager: u32,
    sigged: bool,
    first: bool,
    pre_key: Row,
    cur_key: Row,
}

impl Outbound {
    fn fresh() -> Self {
        Self {
            counter: 1,
            first: true,
            ..Self::default()
        }
    }
}

struct Inbound {
    counter: u64,
    tick: u64,
    sig: bool,
}

impl Inbound {
    fn fresh() -> Self {
        Self {
            counter: 1,
            tick: 0,
            sig: false,
        }
    }
}

/// Key-partitioned inter-process transport with flow control.
pub struct Bridge {
    ksel: Selection,
    dupe: bool,
    ordered: bool,
    partitioner: Option<Partitioner>,
    upstream: Option<Par>,
    parred: u32,
    outs: HashMap<usize, Outbound>,
    ins: HashMap<usize, Inbound>,
    cur_roll: usize,
    min_recv_counter: u64,
    min_recv_rank: usize,
    sig: i32,
}

impl Bridge {
    pub fn new(
        ksel: Selection,
        dupe: bool,
        ordered: bool,
        partitioner: Option<Partitioner>,
    ) -> Self {
        Self {
            ksel,
            dupe,
            ordered,
            partitioner,
            upstream: None,
            parred: 0,
            outs: HashMap::new(),
            ins: HashMap::new(),
            cur_roll: 0,
            min_recv_counter: 1,
            min_recv_rank: 0,
            sig: 0,
        }
    }

    fn hash(&self, key: &[&Field]) -> u64 {
        match &self.partitioner {
            Some(p) => p(key),
            None => hash_key(key),
        }
    }

    fn data_begin(&mut self, ctx: &OpCtx) {
        let up = self.upstream.as_ref().expect("par info precedes data");
        if up.in_range() {
            for &r in ctx.par.ranks() {
                self.outs.entry(r).or_insert_with(Outbound::fresh);
            }
        }
        if ctx.par.in_range() {
            for &r in up.ranks() {
                if r != ctx.par.rank() {
                    self.ins.entry(r).or_insert_with(Inbound::fresh);
                }
            }
        }
    }

    /// Holdback for ordered mode: a key's rows stay buffered until the
    /// next differing key shows up, so they leave in one contiguous piece.
    fn ordered_pass(&mut self, target: usize) -> bool {
        if self.upstream.as_ref().map(Par::nproc) == Some(1) {
            return true;
        }
        let ob = self.outs.get_mut(&target).expect("outbound peer");
        if ob.first {
            ob.first = false;
            ob.pre_key = std::mem::take(&mut ob.cur_key);
            false
        } else if ob.pre_key == ob.cur_key {
            false
        } else {
            ob.pre_key = std::mem::take(&mut ob.cur_key);
            true
        }
    }

    /// Try to make progress on one peer's outbound channel.
    ///
    /// Returns false when there is nothing left to do for this peer until
    /// new rows arrive.
    fn send(
        &mut self,
        target: usize,
        counter_check: bool,
        dn: &Downstream,
        ctx: &OpCtx,
    ) -> Result<bool> {
        let my_rank = ctx.par.rank();
        let ob = self.outs.get_mut(&target).expect("outbound peer");
        let len = ob.buf.len();
        if len == 0 && ob.inflight.is_none() {
            return Ok(false);
        }
        if target == my_rank {
            // local slice of the shuffle: hand rows straight downstream
            let rows: Vec<Row> = ob.buf.drain(..).collect();
            dn.batch(&rows)?;
            return Ok(false);
        }
        if counter_check && ob.eager == MAX_EAGER && len < MIN_SEND_BUF {
            return Ok(false);
        }
        if counter_check {
            ob.tick += 1;
            if ob.tick < ob.counter {
                return Ok(true);
            }
            ob.tick = 0;
        }
        let comm = comm_of(ctx)?;
        let prior_done = match &mut ob.inflight {
            Some(req) => comm.test(req),
            None => true,
        };
        if prior_done {
            ob.inflight = None;
            if len == 0 {
                ob.counter = 1;
                return Ok(false);
            }
            let (tag, bytes) = if len == 1 {
                (ctx.par.tag(1), encode_row(&ob.buf[0])?)
            } else {
                (ctx.par.tag(2), encode_rows(&ob.buf)?)
            };
            ob.buf.clear();
            ob.inflight = Some(comm.isend(target, tag, bytes));
            if counter_check {
                ob.counter /= DEC_SEND;
                if ob.counter == 0 {
                    ob.counter = 1;
                }
            }
            if ob.eager < MAX_EAGER {
                ob.eager += 1;
            } else {
                ob.eager = 0;
            }
        } else if counter_check {
            ob.counter = (ob.counter * INC_SEND).min(MAX_COUNTER);
        }
        Ok(true)
    }

    /// Attempt a send and keep the inbound side drained; blocks only when
    /// the outbound buffer has crossed the safe bound.
    fn send_safe(&mut self, target: usize, dn: &Downstream, ctx: &OpCtx) -> Result<()> {
        let len = self.outs[&target].buf.len();
        let counter_check = !(self.ordered && len > MIN_SEND_BUF);
        if !self.send(target, counter_check, dn, ctx)? {
            self.recv_all(true, dn, ctx)?;
        } else if len < MAX_SEND_BUF {
            self.recv_all(true, dn, ctx)?;
        } else {
            warn!(
                "receiving process(es) are overflowing with data; allocate more \
                 processes to the receiving end than the sending end"
            );
            if self.ins.is_empty() {
                // nothing to receive while we are stuck: wait on the send
                let comm = comm_of(ctx)?;
                let ob = self.outs.get_mut(&target).expect("outbound peer");
                if let Some(mut req) = ob.inflight.take() {
                    comm.wait(&mut req)?;
                }
                let bytes = encode_rows(&ob.buf)?;
                ob.buf.clear();
                ob.inflight = Some(comm.isend(target, ctx.par.tag(2), bytes));
            } else {
                let mut check = true;
                while self.send(target, check, dn, ctx)? {
                    check = self.recv_all(true, dn, ctx)?;
                }
            }
        }
        Ok(())
    }

    /// Drain one upstream peer's channels: rows first, then batches, then
    /// the end signal (after which stray eager messages are swept up).
    fn recv(&mut self, peer: usize, max_iters: u64, dn: &Downstream, ctx: &OpCtx) -> Result<bool> {
        let comm = comm_of(ctx)?;
        let (t_sig, t_row, t_batch) = (ctx.par.tag(0), ctx.par.tag(1), ctx.par.tag(2));

        if comm.probe(peer, t_row) {
            let mut iters = 0;
            while let Some(bytes) = comm.try_recv(peer, t_row) {
                dn.row(&decode_row(&bytes)?)?;
                iters += 1;
                if iters >= max_iters {
                    break;
                }
            }
            return Ok(true);
        }
        if comm.probe(peer, t_batch) {
            let mut iters = 0;
            while let Some(bytes) = comm.try_recv(peer, t_batch) {
                dn.batch(&decode_rows(&bytes)?)?;
                iters += 1;
                if iters >= max_iters {
                    break;
                }
            }
            return Ok(true);
        }
        if comm.try_recv(peer, t_sig).is_some() {
            // peer is done; sweep any eager messages that raced the signal
            while let Some(bytes) = comm.try_recv(peer, t_row) {
                dn.row(&decode_row(&bytes)?)?;
            }
            while let Some(bytes) = comm.try_recv(peer, t_batch) {
                dn.batch(&decode_rows(&bytes)?)?;
            }
            if let Some(inb) = self.ins.get_mut(&peer) {
                inb.sig = true;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Poll every upstream peer, throttled by normalized counters.
    fn recv_all(&mut self, counter_check: bool, dn: &Downstream, ctx: &OpCtx) -> Result<bool> {
        if self.ins.is_empty() {
            return Ok(true);
        }
        let peers: Vec<usize> = self.ins.keys().copied().collect();
        let mut res = false;
        for peer in peers {
            if counter_check {
                let inb = self.ins.get_mut(&peer).expect("inbound peer");
                inb.tick += 1;
                if inb.tick < inb.counter / self.min_recv_counter.max(1) {
                    continue;
                }
                inb.tick = 0;
            }
            let got = self.recv(peer, MAX_ITERS_RECV, dn, ctx)?;
            if counter_check {
                let inb = self.ins.get_mut(&peer).expect("inbound peer");
                if got {
                    inb.counter /= DEC_RECV;
                    if inb.counter == 0 {
                        inb.counter = 1;
                    }
                    if inb.counter < self.min_recv_counter {
                        self.min_recv_counter = inb.counter;
                        self.min_recv_rank = peer;
                    }
                } else {
                    inb.counter =
                        (((inb.counter as f64) * INC_RECV).ceil() as u64).min(MAX_COUNTER);
                    if self.min_recv_rank == peer {
                        let mut min = u64::MAX;
                        let mut min_rank = peer;
                        for (&r, i) in &self.ins {
                            if i.counter < min {
                                min = i.counter;
                                min_rank = r;
                            }
                        }
                        self.min_recv_counter = min.max(1);
                        self.min_recv_rank = min_rank;
                    }
                }
            }
            if got {
                res = true;
                let comm = comm_of(ctx)?;
                let done = self.ins.get(&peer).is_some_and(|i| i.sig)
                    && !comm.probe(peer, ctx.par.tag(1))
                    && !comm.probe(peer, ctx.par.tag(2));
                if done {
                    self.ins.remove(&peer);
                }
            }
        }
        Ok(res)
    }

    /// Flush every outbound peer and follow with the end signal; true while
    /// anything is still in flight.
    fn send_all(&mut self, dn: &Downstream, ctx: &OpCtx) -> Result<bool> {
        let up_in = self.upstream.as_ref().is_some_and(Par::in_range);
        if !up_in {
            return Ok(false);
        }
        let my_rank = ctx.par.rank();
        let targets: Vec<usize> = self.outs.keys().copied().collect();
        let mut res = false;
        for target in targets {
            if target == my_rank {
                let ob = self.outs.get_mut(&target).expect("outbound peer");
                if !ob.buf.is_empty() {
                    let rows: Vec<Row> = ob.buf.drain(..).collect();
                    dn.batch(&rows)?;
                }
                continue;
            }
            if self.send(target, false, dn, ctx)? {
                res = true;
            } else {
                let ob = self.outs.get_mut(&target).expect("outbound peer");
                if !ob.sigged {
                    let comm = comm_of(ctx)?;
                    ob.inflight = Some(comm.isend(target, ctx.par.tag(0), encode_sig(self.sig)?));
                    ob.sigged = true;
                    res = true;
                }
            }
        }
        Ok(res)
    }

    fn route_one(&mut self, row: &Row, dn: &Downstream, ctx: &OpCtx) -> Result<()> {
        let par = &ctx.par;
        if par.nproc() == 1 {
            let up = self.upstream.as_ref().expect("par info precedes data");
            if up.nproc() == 1 && par.in_range() {
                return dn.row(row);
            }
            let target = par.get(0);
            self.outs
                .entry(target)
                .or_insert_with(Outbound::fresh)
                .buf
                .push(row.clone());
            if self.ordered && !self.ordered_pass(target) {
                return Ok(());
            }
            return self.send_safe(target, dn, ctx);
        }
        let target = if self.ksel.is_empty() && self.partitioner.is_none() {
            let t = par.get(self.cur_roll);
            self.cur_roll = (self.cur_roll + 1) % par.nproc();
            t
        } else {
            let key = self.ksel.project_ref(row);
            let t = par.get((self.hash(&key) as usize) % par.nproc());
            if self.ordered {
                self.outs.entry(t).or_insert_with(Outbound::fresh).cur_key =
                    self.ksel.project(row);
            }
            t
        };
        self.outs
            .entry(target)
            .or_insert_with(Outbound::fresh)
            .buf
            .push(row.clone());
        if self.ordered && !self.ordered_pass(target) {
            return Ok(());
        }
        self.send_safe(target, dn, ctx)
    }
}

impl Op for Bridge {
    fn on_par(&mut self, upstream: &Par, _dn: &Downstream, ctx: &OpCtx) -> Result<ParForward> {
        self.parred += 1;
        match &mut self.upstream {
            None => self.upstream = Some(upstream.clone()),
            Some(u) => u.absorb(upstream),
        }
        if self.parred >= ctx.pending.max(1) {
            self.data_begin(ctx);
        }
        Ok(ParForward::Own)
    }

    fn on_row(&mut self, _port: usize, row: &Row, dn: &Downstream, ctx: &OpCtx) -> Result<()> {
        let up_in = self.upstream.as_ref().is_some_and(Par::in_range);
        if !up_in {
            return Ok(());
        }
        if self.dupe {
            let targets: Vec<usize> = ctx.par.ranks().to_vec();
            for t in targets {
                self.outs
                    .entry(t)
                    .or_insert_with(Outbound::fresh)
                    .buf
                    .push(row.clone());
                self.send_safe(t, dn, ctx)?;
            }
            self.recv_all(true, dn, ctx)?;
            return Ok(());
        }
        self.route_one(row, dn, ctx)
    }

    fn on_batch(&mut self, _port: usize, rows: &[Row], dn: &Downstream, ctx: &OpCtx) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let up_in = self.upstream.as_ref().is_some_and(Par::in_range);
        if !up_in {
            return Ok(());
        }
        if self.dupe || ctx.par.nproc() == 1 {
            for row in rows {
                self.on_row(0, row, dn, ctx)?;
            }
            return Ok(());
        }
        let mut dirty: Vec<usize> = Vec::new();
        for row in rows {
            let target = if self.ksel.is_empty() && self.partitioner.is_none() {
                let t = ctx.par.get(self.cur_roll);
                self.cur_roll = (self.cur_roll + 1) % ctx.par.nproc();
                t
            } else {
                let key = self.ksel.project_ref(row);
                let t = ctx.par.get((self.hash(&key) as usize) % ctx.par.nproc());
                if self.ordered {
                    self.outs.entry(t).or_insert_with(Outbound::fresh).cur_key =
                        self.ksel.project(row);
                }
                t
            };
            self.outs
                .entry(target)
                .or_insert_with(Outbound::fresh)
                .buf
                .push(row.clone());
            if self.ordered {
                if self.ordered_pass(target) {
                    self.send_safe(target, dn, ctx)?;
                }
            } else if !dirty.contains(&target) {
                dirty.push(target);
            }
        }
        if !self.ordered {
            for t in dirty {
                self.send_safe(t, dn, ctx)?;
            }
        }
        Ok(())
    }

    fn on_end(&mut self, sig: i32, dn: &Downstream, ctx: &OpCtx) -> Result<()> {
        let Some(up) = self.upstream.as_ref() else {
            return Ok(());
        };
        self.sig = sig;
        if !ctx.par.in_range() && !up.in_range() {
            self.parred = 0;
            self.upstream = None;
            return Ok(());
        }
        let mut to_send = true;
        while to_send || !self.ins.is_empty() {
            if to_send {
                to_send = self.send_all(dn, ctx)?;
            }
            if !self.ins.is_empty() {
                self.recv_all(true, dn, ctx)?;
            }
        }
        self.cur_roll = 0;
        self.outs.clear();
        self.ins.clear();
        self.min_recv_counter = 1;
        self.min_recv_rank = 0;
        self.parred = 0;
        self.upstream = None;
        Ok(())
    }
}

fn comm_of<'a>(ctx: &OpCtx<'a>) -> Result<&'a Comm> {
    ctx.comm
        .ok_or_else(|| anyhow!("bridge spans ranks but no transport endpoint is attached"))
}

fn bincfg() -> bincode::config::Configuration {
    bincode::config::standard()
}

fn encode_row(row: &Row) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(row, bincfg()).context("encode row")
}

fn decode_row(bytes: &[u8]) -> Result<Row> {
    let (row, _) = bincode::serde::decode_from_slice(bytes, bincfg()).context("decode row")?;
    Ok(row)
}

fn encode_rows(rows: &[Row]) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(rows, bincfg()).context("encode batch")
}

fn decode_rows(bytes: &[u8]) -> Result<Vec<Row>> {
    let (rows, _) = bincode::serde::decode_from_slice(bytes, bincfg()).context("decode batch")?;
    Ok(rows)
}

fn encode_sig(sig: i32) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(sig, bincfg()).context("encode signal")
}
