//! The fluent composition surface.
//!
//! A [`Stream`] is a typed handle onto a growing flow: each call appends a
//! stage and returns a new handle carrying the row width of the stage's
//! output, so an out-of-bounds or duplicated column selection is rejected
//! at composition time, before anything runs.
//!
//! The stage most recently appended stays *pending* until the next stage
//! (or a terminator) arrives; chainers like [`Stream::prll`],
//! [`Stream::ordered`], [`Stream::cols`] and [`Stream::dump`] configure
//! the pending stage. Reducing stages are parallel by default — sealing
//! them inserts a shuffle bridge in front of the unit; `inprocess()`
//! keeps them local.

use anyhow::{Result, bail};

use crate::bridge::{Bridge, Partitioner};
use crate::flow::Flow;
use crate::graph::{Graph, NodeId};
use crate::node::TaskSpec;
use crate::ops::reduce_all::Trigger;
use crate::ops::{
    Collect, CollectHandle, Dump, Filter, Map, MapOut, NoOp, Reduce, ReduceAll, ReduceFn, Rise,
    RiseSource, Zip,
};
use crate::row::{Field, Row, Selection};
use crate::sched::{Env, ParMode, ProcReq};

/// Start a pipeline from a producer.
///
/// `width` is the number of columns in the rows the source emits.
pub fn rise(graph: &Graph, source: impl RiseSource + 'static, width: usize) -> Stream {
    let id = graph.insert(
        Box::new(Rise::new(Box::new(source))),
        Some(TaskSpec::root(ProcReq::None)),
    );
    Stream {
        graph: graph.clone(),
        first: Vec::new(),
        in_width: None,
        cur: id,
        prev: None,
        width,
        pending: None,
    }
}

/// Start a headless flow that accepts rows of `width` columns; useful for
/// building reusable fragments that are attached to a source later.
pub fn flow_of(graph: &Graph, width: usize) -> Stream {
    let id = graph.insert(Box::new(NoOp), None);
    Stream {
        graph: graph.clone(),
        first: vec![(id, 0)],
        in_width: Some(width),
        cur: id,
        prev: None,
        width,
        pending: None,
    }
}

/// Continue composing after an existing flow.
pub fn from_flow(flow: &Flow) -> Stream {
    let graph = flow.graph.clone();
    let cur = if flow.last.len() == 1 {
        flow.last[0]
    } else {
        let id = graph.insert(Box::new(NoOp), None);
        for &l in &flow.last {
            graph.connect(l, id, 0);
        }
        id
    };
    Stream {
        graph,
        first: flow.first.clone(),
        in_width: flow.in_width,
        cur,
        prev: None,
        width: flow.out_width,
        pending: None,
    }
}

/// How the output selection is derived from `concat(input, result)`.
enum OutShape {
    /// Identity over the concatenation (the default).
    Full,
    /// Result columns replace the F-selected slots in place.
    Transform,
    /// Only the result columns.
    ResultOnly,
    /// Explicit selection over the concatenation.
    Cols(Vec<usize>),
    /// Identity minus these columns of the concatenation.
    Drop(Vec<usize>),
}

enum PendKind {
    Map {
        fsel: Selection,
        res_width: usize,
        func: Box<dyn FnMut(&[Field]) -> MapOut>,
    },
    Filter {
        fsel: Selection,
        pred: Box<dyn FnMut(&[Field]) -> bool>,
    },
    Reduce {
        ksel: Selection,
        vsel: Option<Selection>,
        init: Row,
        func: ReduceFn,
        scan: bool,
    },
    ReduceAll {
        ksel: Selection,
        vsel: Option<Selection>,
        res_width: usize,
        func: Box<dyn FnMut(&[Field], &crate::ops::GroupBuf) -> MapOut>,
        trigger: Trigger,
    },
    Zip {
        other_last: NodeId,
        other_first: Vec<(NodeId, usize)>,
        other_width: usize,
        k1: Selection,
        k2: Selection,
    },
}

struct Pending {
    kind: PendKind,
    shape: OutShape,
    parallel: bool,
    req: ProcReq,
    mode: ParMode,
    ordered: bool,
    partition: Option<(Selection, Option<Partitioner>)>,
    dumps: Vec<(String, String)>,
}

impl Pending {
    fn new(kind: PendKind, parallel: bool) -> Self {
        Self {
            kind,
            shape: OutShape::Full,
            parallel,
            req: ProcReq::None,
            mode: ParMode::shard(),
            ordered: false,
            partition: None,
            dumps: Vec::new(),
        }
    }
}

/// A fluent handle onto a flow under construction.
pub struct Stream {
    graph: Graph,
    first: Vec<(NodeId, usize)>,
    in_width: Option<usize>,
    cur: NodeId,
    prev: Option<(NodeId, usize)>,
    width: usize,
    pending: Option<Pending>,
}

impl Stream {
    /// Row width at the current composition point (pending stage included).
    pub fn width(&self) -> Result<usize> {
        match &self.pending {
            None => Ok(self.width),
            Some(p) => Ok(self.pending_out_width(p)?),
        }
    }

    // |----------------|
    // | Stage builders |
    // |----------------|

    /// Transform each row with `f` over every column; the function result
    /// is `res_width` columns appended to the input (reshape with
    /// [`Stream::cols`] and friends).
    pub fn map<R, F>(self, res_width: usize, f: F) -> Result<Stream>
    where
        R: Into<MapOut>,
        F: FnMut(&[Field]) -> R + 'static,
    {
        let w = self.width()?;
        self.map_sel(Selection::identity(w), res_width, f)
    }

    /// Transform with `f` over the selected columns only.
    pub fn map_cols<R, F>(self, cols: impl Into<Vec<usize>>, res_width: usize, f: F) -> Result<Stream>
    where
        R: Into<MapOut>,
        F: FnMut(&[Field]) -> R + 'static,
    {
        let w = self.width()?;
        self.map_sel(Selection::from_spec(&cols.into(), w), res_width, f)
    }

    fn map_sel<R, F>(mut self, fsel: Selection, res_width: usize, mut f: F) -> Result<Stream>
    where
        R: Into<MapOut>,
        F: FnMut(&[Field]) -> R + 'static,
    {
        let w = self.width()?;
        fsel.check(w)?;
        self.seal()?;
        self.pending = Some(Pending::new(
            PendKind::Map {
                fsel,
                res_width,
                func: Box::new(move |r| f(r).into()),
            },
            false,
        ));
        Ok(self)
    }

    /// Keep rows satisfying `pred`.
    pub fn filter<F>(self, pred: F) -> Result<Stream>
    where
        F: FnMut(&[Field]) -> bool + 'static,
    {
        let w = self.width()?;
        self.filter_sel(Selection::identity(w), pred)
    }

    /// Keep rows whose selected columns satisfy `pred`.
    pub fn filter_cols<F>(self, cols: impl Into<Vec<usize>>, pred: F) -> Result<Stream>
    where
        F: FnMut(&[Field]) -> bool + 'static,
    {
        let w = self.width()?;
        self.filter_sel(Selection::from_spec(&cols.into(), w), pred)
    }

    fn filter_sel<F>(mut self, fsel: Selection, pred: F) -> Result<Stream>
    where
        F: FnMut(&[Field]) -> bool + 'static,
    {
        let w = self.width()?;
        fsel.check(w)?;
        self.seal()?;
        self.pending = Some(Pending::new(
            PendKind::Filter {
                fsel,
                pred: Box::new(pred),
            },
            false,
        ));
        Ok(self)
    }

    /// Streaming reduction grouped by the key columns; the value columns
    /// default to the complement of the key. `init` seeds each group's
    /// accumulator. Parallel (key-sharded) by default.
    pub fn reduce(
        mut self,
        key: impl Into<Vec<usize>>,
        init: Row,
        func: ReduceFn,
    ) -> Result<Stream> {
        let w = self.width()?;
        let ksel = Selection::from_spec(&key.into(), w);
        ksel.check(w)?;
        self.seal()?;
        self.pending = Some(Pending::new(
            PendKind::Reduce {
                ksel,
                vsel: None,
                init,
                func,
                scan: false,
            },
            true,
        ));
        Ok(self)
    }

    /// Reduction with explicit key and value selections.
    pub fn reduce_kv(
        mut self,
        key: impl Into<Vec<usize>>,
        val: impl Into<Vec<usize>>,
        init: Row,
        func: ReduceFn,
    ) -> Result<Stream> {
        let w = self.width()?;
        let ksel = Selection::from_spec(&key.into(), w);
        let vsel = Selection::from_spec(&val.into(), w);
        ksel.check(w)?;
        vsel.check(w)?;
        self.seal()?;
        self.pending = Some(Pending::new(
            PendKind::Reduce {
                ksel,
                vsel: Some(vsel),
                init,
                func,
                scan: false,
            },
            true,
        ));
        Ok(self)
    }

    /// Emit the updated bucket after every update instead of only at
    /// end-of-stream. Applies to the pending reduce.
    pub fn scan(mut self) -> Result<Stream> {
        match &mut self.pending {
            Some(Pending {
                kind: PendKind::Reduce { scan, .. },
                ..
            }) => {
                *scan = true;
                Ok(self)
            }
            _ => bail!("scan() applies to a reduce stage"),
        }
    }

    /// Buffered reduction: the user function sees a whole group at a time
    /// and returns rows of `res_width` columns.
    pub fn reduce_all<R, F>(
        self,
        key: impl Into<Vec<usize>>,
        res_width: usize,
        f: F,
    ) -> Result<Stream>
    where
        R: Into<MapOut>,
        F: FnMut(&[Field], &crate::ops::GroupBuf) -> R + 'static,
    {
        self.reduce_all_inner(key.into(), None, res_width, f)
    }

    /// Buffered reduction with explicit value columns.
    pub fn reduce_all_kv<R, F>(
        self,
        key: impl Into<Vec<usize>>,
        val: impl Into<Vec<usize>>,
        res_width: usize,
        f: F,
    ) -> Result<Stream>
    where
        R: Into<MapOut>,
        F: FnMut(&[Field], &crate::ops::GroupBuf) -> R + 'static,
    {
        self.reduce_all_inner(key.into(), Some(val.into()), res_width, f)
    }

    fn reduce_all_inner<R, F>(
        mut self,
        key: Vec<usize>,
        val: Option<Vec<usize>>,
        res_width: usize,
        mut f: F,
    ) -> Result<Stream>
    where
        R: Into<MapOut>,
        F: FnMut(&[Field], &crate::ops::GroupBuf) -> R + 'static,
    {
        let w = self.width()?;
        let ksel = Selection::from_spec(&key, w);
        ksel.check(w)?;
        let vsel = match val {
            Some(v) => {
                let s = Selection::from_spec(&v, w);
                s.check(w)?;
                Some(s)
            }
            None => None,
        };
        self.seal()?;
        self.pending = Some(Pending::new(
            PendKind::ReduceAll {
                ksel,
                vsel,
                res_width,
                func: Box::new(move |k, b| f(k, b).into()),
                trigger: Trigger::EndOfStream,
            },
            true,
        ));
        Ok(self)
    }

    /// Invoke the pending buffered reduce every `n` rows of a group.
    pub fn bunch(mut self, n: usize, fixed: bool) -> Result<Stream> {
        match &mut self.pending {
            Some(Pending {
                kind: PendKind::ReduceAll { trigger, .. },
                ..
            }) => {
                *trigger = Trigger::Bunch { n, fixed };
                Ok(self)
            }
            _ => bail!("bunch() applies to a reduceAll stage"),
        }
    }

    /// Sliding window of `n` rows over the pending buffered reduce.
    pub fn adjacent(mut self, n: usize, fixed: bool) -> Result<Stream> {
        match &mut self.pending {
            Some(Pending {
                kind: PendKind::ReduceAll { trigger, .. },
                ..
            }) => {
                *trigger = Trigger::Adjacent { n, fixed };
                Ok(self)
            }
            _ => bail!("adjacent() applies to a reduceAll stage"),
        }
    }

    /// Pair this stream with another by a shared key selection.
    pub fn zip(self, other: Stream, key: impl Into<Vec<usize>>) -> Result<Stream> {
        let k: Vec<usize> = key.into();
        self.zip_keys(other, k.clone(), k)
    }

    /// Pair with per-side key selections.
    pub fn zip_keys(
        mut self,
        mut other: Stream,
        key_left: impl Into<Vec<usize>>,
        key_right: impl Into<Vec<usize>>,
    ) -> Result<Stream> {
        if !self.graph.same_as(&other.graph) {
            bail!("zipped streams must come from the same graph");
        }
        let wl = self.width()?;
        let wr = other.width()?;
        let k1 = Selection::from_spec(&key_left.into(), wl);
        let k2 = Selection::from_spec(&key_right.into(), wr);
        k1.check(wl)?;
        k2.check(wr)?;
        if k1.len() != k2.len() {
            bail!("zip key selections must have the same number of columns");
        }
        self.seal()?;
        other.seal()?;
        self.pending = Some(Pending::new(
            PendKind::Zip {
                other_last: other.cur,
                other_first: other.first.clone(),
                other_width: other.width,
                k1,
                k2,
            },
            true,
        ));
        Ok(self)
    }

    // |------------------|
    // | Column finalizers |
    // |------------------|

    /// Shape the pending stage's output as this selection over
    /// `concat(input, result)`.
    pub fn cols(mut self, cols: impl Into<Vec<usize>>) -> Result<Stream> {
        let p = self.pending_mut()?;
        p.shape = OutShape::Cols(cols.into());
        Ok(self)
    }

    /// Drop these columns from the pending stage's default output.
    pub fn cols_drop(mut self, cols: impl Into<Vec<usize>>) -> Result<Stream> {
        let p = self.pending_mut()?;
        p.shape = OutShape::Drop(cols.into());
        Ok(self)
    }

    /// Replace the function-input columns in place with the result.
    pub fn cols_transform(mut self) -> Result<Stream> {
        let p = self.pending_mut()?;
        p.shape = OutShape::Transform;
        Ok(self)
    }

    /// Keep only the function result (plus the key, for reductions).
    pub fn cols_result(mut self) -> Result<Stream> {
        let p = self.pending_mut()?;
        p.shape = OutShape::ResultOnly;
        Ok(self)
    }

    // |-------------|
    // | Parallelism |
    // |-------------|

    /// Make the pending stage parallel with this process request. On a
    /// source stage, sets the rise's request instead.
    pub fn prll(mut self, req: ProcReq) -> Result<Stream> {
        match &mut self.pending {
            Some(p) => {
                p.parallel = true;
                p.req = req;
            }
            None => self.graph.set_task_req(self.cur, req),
        }
        Ok(self)
    }

    /// Parallel with both a request and a routing mode.
    pub fn prll_mode(mut self, req: ProcReq, mode: ParMode) -> Result<Stream> {
        match &mut self.pending {
            Some(p) => {
                p.parallel = true;
                p.req = req;
                p.mode = mode;
            }
            None => self.graph.set_task_req(self.cur, req),
        }
        Ok(self)
    }

    /// Set the routing mode of the pending stage's bridge.
    pub fn mode(mut self, mode: ParMode) -> Result<Stream> {
        let p = self.pending_mut()?;
        p.parallel = true;
        p.mode = mode;
        Ok(self)
    }

    /// Keep the pending stage in-process: no bridge, no shuffle.
    pub fn inprocess(mut self) -> Result<Stream> {
        let p = self.pending_mut()?;
        p.parallel = false;
        Ok(self)
    }

    /// Assume (and preserve) per-key grouping across the shuffle and in
    /// the reducing unit.
    pub fn ordered(mut self, flag: bool) -> Result<Stream> {
        let p = self.pending_mut()?;
        p.ordered = flag;
        Ok(self)
    }

    /// Route the pending stage's bridge by these columns, optionally with
    /// a custom hasher.
    pub fn partition_by(
        mut self,
        cols: impl Into<Vec<usize>>,
        hasher: Option<Partitioner>,
    ) -> Result<Stream> {
        let w = self.width;
        let p = self.pending_mut()?;
        p.parallel = true;
        let sel = Selection::from_spec(&cols.into(), w);
        sel.check(w)?;
        p.partition = Some((sel, hasher));
        Ok(self)
    }

    // |-----------------|
    // | Pipeline shapes |
    // |-----------------|

    /// Attach a sink branch writing rows to `name` (stdout when empty),
    /// with an optional header line.
    pub fn dump(mut self, name: impl Into<String>, header: impl Into<String>) -> Result<Stream> {
        let (name, header) = (name.into(), header.into());
        match &mut self.pending {
            Some(p) => p.dumps.push((name, header)),
            None => {
                let d = self.graph.insert(Box::new(Dump::new(name, header)), None);
                self.graph.connect(self.cur, d, 0);
            }
        }
        Ok(self)
    }

    /// Step back to the previous stage: the next stage branches off it.
    pub fn one_up(mut self) -> Result<Stream> {
        self.seal()?;
        let Some((prev, w)) = self.prev else {
            bail!("one_up() needs a previous stage to branch from");
        };
        self.cur = prev;
        self.width = w;
        self.prev = None;
        Ok(self)
    }

    /// Attach `flow` as a side branch of the current point.
    pub fn tee(mut self, flow: &Flow) -> Result<Stream> {
        self.seal()?;
        match flow.in_width {
            Some(w) if w == self.width => {}
            _ => bail!("tee flow does not accept rows of {} column(s)", self.width),
        }
        for &(f, port) in &flow.first {
            self.graph.connect(self.cur, f, port);
        }
        Ok(self)
    }

    /// Continue along `flow`: its output becomes the current point.
    pub fn pipe(mut self, flow: &Flow) -> Result<Stream> {
        self.seal()?;
        match flow.in_width {
            Some(w) if w == self.width => {}
            _ => bail!("piped flow does not accept rows of {} column(s)", self.width),
        }
        for &(f, port) in &flow.first {
            self.graph.connect(self.cur, f, port);
        }
        let next = from_flow(flow);
        self.prev = Some((self.cur, self.width));
        self.cur = next.cur;
        self.width = flow.out_width;
        Ok(self)
    }

    /// Union with another stream of the same row width.
    pub fn merge(mut self, mut other: Stream) -> Result<Stream> {
        if !self.graph.same_as(&other.graph) {
            bail!("merged streams must come from the same graph");
        }
        self.seal()?;
        other.seal()?;
        if self.width != other.width {
            bail!("can not merge streams of different widths");
        }
        let id = self.graph.insert(Box::new(NoOp), None);
        self.graph.connect(self.cur, id, 0);
        self.graph.connect(other.cur, id, 0);
        self.first.extend(other.first);
        self.prev = Some((self.cur, self.width));
        self.cur = id;
        Ok(self)
    }

    // |-------------|
    // | Terminators |
    // |-------------|

    /// Materialize every pending stage and return the flow.
    pub fn build(mut self) -> Result<Flow> {
        self.seal()?;
        Ok(Flow {
            graph: self.graph,
            first: self.first,
            last: vec![self.cur],
            in_width: self.in_width,
            out_width: self.width,
        })
    }

    /// Build and run with the pool's default process request; the flow is
    /// returned for reuse.
    pub fn run(self, env: &Env) -> Result<Flow> {
        self.run_req(env, ProcReq::None)
    }

    /// Build and run with an explicit process request.
    pub fn run_req(mut self, env: &Env, req: ProcReq) -> Result<Flow> {
        self.seal()?;
        let flow = Flow {
            graph: self.graph.clone(),
            first: self.first.clone(),
            last: vec![self.cur],
            in_width: self.in_width,
            out_width: self.width,
        };
        env.run_graph(&self.graph, &[self.cur], req)?;
        Ok(flow)
    }

    /// Build, run, and buffer the output rows that reach this worker.
    pub fn get(self, env: &Env) -> Result<Vec<Row>> {
        self.get_req(env, ProcReq::None)
    }

    pub fn get_req(mut self, env: &Env, req: ProcReq) -> Result<Vec<Row>> {
        self.seal()?;
        let handle = CollectHandle::new();
        let sink = self
            .graph
            .insert(Box::new(Collect::new(handle.clone())), None);
        self.graph.connect(self.cur, sink, 0);
        env.run_graph(&self.graph, &[self.cur], req)?;
        Ok(handle.take())
    }

    // |-----------|
    // | Internals |
    // |-----------|

    fn pending_mut(&mut self) -> Result<&mut Pending> {
        self.pending
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no stage is being composed here"))
    }

    fn pending_out_width(&self, p: &Pending) -> Result<usize> {
        let w = self.width;
        let (concat_w, default_w, res_range) = match &p.kind {
            PendKind::Map { res_width, .. } => (w + res_width, w + res_width, *res_width),
            PendKind::Filter { .. } => (w, w, 0),
            PendKind::Reduce { ksel, init, .. } => {
                (ksel.len() + init.len(), ksel.len() + init.len(), init.len())
            }
            PendKind::ReduceAll {
                ksel, res_width, ..
            } => (ksel.len() + res_width, ksel.len() + res_width, *res_width),
            PendKind::Zip { other_width, .. } => (w + other_width, w + other_width, 0),
        };
        Ok(match &p.shape {
            OutShape::Full => default_w,
            OutShape::Transform => w,
            OutShape::ResultOnly => res_range,
            OutShape::Cols(v) => Selection::from_spec(v, concat_w).len(),
            OutShape::Drop(v) => concat_w.saturating_sub(Selection::from_spec(v, concat_w).len()),
        })
    }

    /// Compute the output selection over `concat(input, result)`.
    fn out_selection(
        shape: &OutShape,
        in_width: usize,
        res_width: usize,
        fsel: Option<&Selection>,
    ) -> Result<Selection> {
        let concat_w = in_width + res_width;
        let osel = match shape {
            OutShape::Full => Selection::identity(concat_w),
            OutShape::Transform => {
                let Some(fsel) = fsel else {
                    bail!("cols_transform() applies to a map stage");
                };
                if fsel.len() != res_width {
                    bail!(
                        "cols_transform() needs the result width ({res_width}) to match \
                         the {} selected input column(s)",
                        fsel.len()
                    );
                }
                let cols: Vec<usize> = (1..=in_width)
                    .map(|i| match fsel.indices().iter().position(|&c| c == i) {
                        Some(j) => in_width + j + 1,
                        None => i,
                    })
                    .collect();
                Selection::cols(cols)
            }
            OutShape::ResultOnly => {
                Selection::cols((in_width + 1..=concat_w).collect::<Vec<usize>>())
            }
            OutShape::Cols(v) => Selection::from_spec(v, concat_w),
            OutShape::Drop(v) => {
                let drop = Selection::from_spec(v, concat_w);
                drop.check(concat_w)?;
                Selection::cols(
                    (1..=concat_w)
                        .filter(|i| !drop.indices().contains(i))
                        .collect::<Vec<usize>>(),
                )
            }
        };
        osel.check(concat_w)?;
        Ok(osel)
    }

    fn seal(&mut self) -> Result<()> {
        let Some(p) = self.pending.take() else {
            return Ok(());
        };
        let Pending {
            kind,
            shape,
            parallel,
            req,
            mode,
            ordered,
            partition,
            dumps,
        } = p;
        let w = self.width;
        let (unit, bridge_key, out_width): (Box<dyn crate::node::Op>, Selection, usize);
        match kind {
            PendKind::Map {
                fsel,
                res_width,
                func,
            } => {
                let osel = Self::out_selection(&shape, w, res_width, Some(&fsel))?;
                out_width = osel.len();
                bridge_key = Selection::empty();
                unit = Box::new(Map::new(fsel, osel, func));
            }
            PendKind::Filter { fsel, pred } => {
                let osel = Self::out_selection(&shape, w, 0, None)?;
                out_width = osel.len();
                bridge_key = Selection::empty();
                unit = Box::new(Filter::new(fsel, osel, pred));
            }
            PendKind::Reduce {
                ksel,
                vsel,
                init,
                func,
                scan,
            } => {
                let vsel = vsel.unwrap_or_else(|| ksel.complement(w));
                let osel = Self::out_selection(&shape, ksel.len(), init.len(), None)?;
                out_width = osel.len();
                bridge_key = ksel.clone();
                unit = Box::new(Reduce::new(ksel, vsel, osel, init, func, scan, ordered));
            }
            PendKind::ReduceAll {
                ksel,
                vsel,
                res_width,
                func,
                trigger,
            } => {
                let vsel = vsel.unwrap_or_else(|| ksel.complement(w));
                let osel = Self::out_selection(&shape, ksel.len(), res_width, None)?;
                out_width = osel.len();
                bridge_key = ksel.clone();
                unit = Box::new(ReduceAll::new(ksel, vsel, osel, func, trigger, ordered));
            }
            PendKind::Zip {
                other_last,
                other_first,
                other_width,
                k1,
                k2,
            } => {
                let osel = Self::out_selection(&shape, w, other_width, None)?;
                out_width = osel.len();
                let zip = self
                    .graph
                    .insert(Box::new(Zip::new(k1.clone(), k2.clone(), osel)), None);
                if parallel {
                    let left = self.graph.insert(
                        Box::new(Bridge::new(k1, mode.dupe, ordered, None)),
                        Some(TaskSpec::bridge(req.clone(), mode.task)),
                    );
                    let right = self.graph.insert(
                        Box::new(Bridge::new(k2, mode.dupe, ordered, None)),
                        Some(TaskSpec::bridge(req, mode.task)),
                    );
                    self.graph.connect(self.cur, left, 0);
                    self.graph.connect(left, zip, 0);
                    self.graph.connect(other_last, right, 0);
                    self.graph.connect(right, zip, 1);
                    self.graph.set_bro(left, right);
                } else {
                    self.graph.connect(self.cur, zip, 0);
                    self.graph.connect(other_last, zip, 1);
                }
                for (name, header) in dumps {
                    let d = self.graph.insert(Box::new(Dump::new(name, header)), None);
                    self.graph.connect(zip, d, 0);
                }
                self.first.extend(other_first);
                self.prev = Some((self.cur, self.width));
                self.cur = zip;
                self.width = out_width;
                return Ok(());
            }
        }

        let unit_id = self.graph.insert(unit, None);
        if parallel {
            let (ksel, partitioner) = match partition {
                Some((sel, hasher)) => (sel, hasher),
                None => (bridge_key, None),
            };
            let bridge = self.graph.insert(
                Box::new(Bridge::new(ksel, mode.dupe, ordered, partitioner)),
                Some(TaskSpec::bridge(req, mode.task)),
            );
            self.graph.connect(self.cur, bridge, 0);
            self.graph.connect(bridge, unit_id, 0);
        } else {
            self.graph.connect(self.cur, unit_id, 0);
        }
        for (name, header) in dumps {
            let d = self.graph.insert(Box::new(Dump::new(name, header)), None);
            self.graph.connect(unit_id, d, 0);
        }
        self.prev = Some((self.cur, self.width));
        self.cur = unit_id;
        self.width = out_width;
        Ok(())
    }
}
