//! Process allocation and run orchestration.
//!
//! [`Karta`] owns the per-worker view of the pool: how loaded each rank is,
//! and the tag counter that hands every task its three wire channels. It is
//! an explicit value (one per worker, shared through [`Env`]) rather than
//! process-global state, so nested runs are a visible, testable case
//! instead of a singleton edge case.
//!
//! A run starts from the output end of a flow: collect the reachable root
//! tasks, then the bridges below each root in first-appearance order, and
//! hand each task a process set according to its [`ProcReq`]. Allocation is
//! greedy least-loaded, with the upstream's ranks as priority so cheap
//! stages co-locate with the data they consume.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use anyhow::Result;
use tracing::{info, warn};

use crate::comm::Comm;
use crate::graph::{Graph, NodeId, RunCtx};

/// Parallel info a task carries for one run: its rank set, this worker's
/// rank and position in the set, and the three channel tags.
#[derive(Clone, Debug)]
pub struct Par {
    ranks: Vec<usize>,
    tags: [i32; 3],
    rank: usize,
    pos: Option<usize>,
}

impl Par {
    pub fn new(ranks: Vec<usize>, tags: [i32; 3], rank: usize) -> Self {
        let pos = ranks.iter().position(|&r| r == rank);
        Self {
            ranks,
            tags,
            rank,
            pos,
        }
    }

    /// Single-rank info for local runs and unassigned links.
    pub fn local(rank: usize) -> Self {
        Self {
            ranks: vec![rank],
            tags: [0; 3],
            rank,
            pos: Some(0),
        }
    }

    /// Whether this worker participates in the task.
    pub fn in_range(&self) -> bool {
        self.pos.is_some()
    }

    pub fn nproc(&self) -> usize {
        self.ranks.len()
    }

    /// This worker's absolute rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// This worker's position within the task's rank list.
    pub fn pos(&self) -> Option<usize> {
        self.pos
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn get(&self, i: usize) -> usize {
        self.ranks[i]
    }

    /// Channel tag: 0 = signal, 1 = single row, 2 = batch.
    pub fn tag(&self, i: usize) -> i32 {
        self.tags[i]
    }

    /// Union another rank set in (bridges merging several upstreams).
    pub fn absorb(&mut self, other: &Par) {
        for &r in &other.ranks {
            if !self.ranks.contains(&r) {
                self.ranks.push(r);
            }
        }
        self.pos = self.ranks.iter().position(|&r| r == self.rank);
    }
}

/// How many workers a task wants.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum ProcReq {
    /// Use whatever the pool offers.
    #[default]
    None,
    /// Exactly this many ranks (clamped to the pool).
    Count(usize),
    /// A fraction of the upstream's rank set (or of the pool for tasks).
    Ratio(f64),
    /// These ranks specifically; falls back to one auto-picked rank when
    /// none of them is in the pool.
    Ranks(Vec<usize>),
    /// Single-process run on the local rank.
    Local,
}

/// Bridge routing flavor.
///
/// The default is key-sharding; `dupe` broadcasts every row to all
/// downstream ranks, and `task` forces a disjoint worker set instead of
/// co-locating with the upstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParMode {
    pub dupe: bool,
    pub task: bool,
}

impl ParMode {
    pub fn shard() -> Self {
        Self::default()
    }

    pub fn dupe() -> Self {
        Self {
            dupe: true,
            task: false,
        }
    }

    pub fn task() -> Self {
        Self {
            dupe: false,
            task: true,
        }
    }

    pub fn and_task(mut self) -> Self {
        self.task = true;
        self
    }

    pub fn and_dupe(mut self) -> Self {
        self.dupe = true;
        self
    }
}

/// Share of the upstream rank set a reducing task gets by default.
pub const PRLL_RATIO: f64 = 0.5;

const FIRST_TAG: i32 = 1;
/// Wire tags wrap at run boundaries before reaching this.
const TAG_LIMIT: i32 = i32::MAX / 2;

struct ProcLoad {
    cur: u32,
    cum: u32,
    rank: usize,
}

/// The scheduler: pool bookkeeping and task allocation for one worker.
pub struct Karta {
    nprocs: usize,
    rank: usize,
    procs: Vec<ProcLoad>,
    cur_tag: i32,
    running: u32,
}

pub(crate) struct RunPlan {
    pub roots: Vec<NodeId>,
    pub nested_local: bool,
}

impl Karta {
    pub fn new(nprocs: usize, rank: usize) -> Self {
        let mut k = Self {
            nprocs,
            rank,
            procs: Vec::new(),
            cur_tag: FIRST_TAG,
            running: 0,
        };
        k.refresh();
        k
    }

    /// Reset the allocation table.
    pub fn refresh(&mut self) {
        self.procs = (0..self.nprocs)
            .map(|rank| ProcLoad {
                cur: 0,
                cum: 0,
                rank,
            })
            .collect();
    }

    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Allocation counts per rank as `(rank, current_run, cumulative)`,
    /// least-loaded first.
    pub fn loads(&self) -> Vec<(usize, u32, u32)> {
        self.procs.iter().map(|p| (p.rank, p.cur, p.cum)).collect()
    }

    /// Assign process sets and tags to every task reachable from `lasts`.
    pub(crate) fn allocate(
        &mut self,
        graph: &Graph,
        lasts: &[NodeId],
        req: ProcReq,
    ) -> Result<RunPlan> {
        let roots = graph.root_set(lasts);
        if roots.is_empty() {
            return Ok(RunPlan {
                roots,
                nested_local: false,
            });
        }
        // Stale info from a previous run must not leak into sibling pinning.
        for &r in &roots {
            graph.clear_par(r);
            for t in graph.branch_tasks(r) {
                graph.clear_par(t);
            }
        }
        if req == ProcReq::Local || (self.running > 0 && req == ProcReq::None) {
            self.allocate_local(graph, &roots);
            self.running += 1;
            return Ok(RunPlan {
                roots,
                nested_local: true,
            });
        }
        self.running += 1;

        let all: Vec<usize> = self.procs.iter().map(|p| p.rank).collect();
        let cur_run = match &req {
            ProcReq::Count(n) => self.pick_count(*n, &all),
            ProcReq::Ratio(r) => self.pick_count((all.len() as f64 * r) as usize, &all),
            ProcReq::Ranks(v) => self.pick_ranks(v, &all),
            _ => all,
        };

        let mut root_ranks = Vec::with_capacity(roots.len());
        for &r in &roots {
            let ranks = self.alloc_task(graph, r, &cur_run, &[]);
            root_ranks.push(ranks);
        }
        let mut seen: HashSet<NodeId> = HashSet::new();
        for (i, &r) in roots.iter().enumerate() {
            for t in graph.branch_tasks(r) {
                if seen.insert(t) {
                    self.alloc_task(graph, t, &cur_run, &root_ranks[i]);
                }
            }
        }
        Ok(RunPlan {
            roots,
            nested_local: false,
        })
    }

    fn allocate_local(&mut self, graph: &Graph, roots: &[NodeId]) {
        for &r in roots {
            graph.set_par(r, Par::local(self.rank));
            for t in graph.branch_tasks(r) {
                graph.set_par(t, Par::local(self.rank));
            }
        }
    }

    /// Close out a run: retire current-run counts into cumulative ones and
    /// wrap the tag counter if it is nearing the transport limit.
    pub(crate) fn finish(&mut self, nested_local: bool) {
        self.running = self.running.saturating_sub(1);
        if nested_local {
            return;
        }
        for p in &mut self.procs {
            p.cum += p.cur;
            p.cur = 0;
        }
        self.sort_loads();
        if self.cur_tag + 3 > TAG_LIMIT {
            self.cur_tag = FIRST_TAG;
        }
    }

    fn alloc_task(
        &mut self,
        graph: &Graph,
        id: NodeId,
        cur_run: &[usize],
        priority: &[usize],
    ) -> Vec<usize> {
        let spec = graph
            .task_spec(id)
            .expect("allocation visits only task nodes");

        // A sibling that already got its ranks pins ours (zip inputs must
        // share key affinity).
        if let Some(bro) = spec.bro
            && let Some(par) = graph.par_of(bro)
        {
            let ranks = par.ranks().to_vec();
            let tags = self.next_tags();
            graph.set_par(id, Par::new(ranks.clone(), tags, self.rank));
            self.mark_alloc(&ranks);
            return ranks;
        }

        // Candidate pool: upstream ranks first (unless task-parallel), then
        // the least-loaded of the run's ranks.
        let mut pool: Vec<usize> = if spec.task { Vec::new() } else { priority.to_vec() };
        for p in &self.procs {
            if cur_run.contains(&p.rank) && !pool.contains(&p.rank) {
                pool.push(p.rank);
            }
        }

        let ranks = match &spec.req {
            ProcReq::Count(n) => self.pick_count(*n, &pool),
            ProcReq::Ratio(r) => {
                if priority.is_empty() || spec.task {
                    self.pick_count((pool.len() as f64 * r) as usize, &pool)
                } else {
                    self.pick_count((priority.len() as f64 * r) as usize, &pool)
                }
            }
            ProcReq::Ranks(v) => self.pick_ranks(v, &pool),
            ProcReq::Local => vec![self.rank],
            ProcReq::None => {
                if priority.is_empty() {
                    pool.clone()
                } else if spec.task {
                    self.pick_count(priority.len(), &pool)
                } else {
                    self.pick_count((priority.len() as f64 * PRLL_RATIO) as usize, &pool)
                }
            }
        };
        if self.rank == 0 {
            info!(task = id.raw(), ?ranks, "assigned process set");
        }
        let tags = self.next_tags();
        graph.set_par(id, Par::new(ranks.clone(), tags, self.rank));
        self.mark_alloc(&ranks);
        ranks
    }

    fn next_tags(&mut self) -> [i32; 3] {
        let t = self.cur_tag;
        self.cur_tag += 3;
        [t, t + 1, t + 2]
    }

    fn pick_count(&self, count: usize, pool: &[usize]) -> Vec<usize> {
        let count = count.max(1);
        let mut out = Vec::new();
        for &r in pool {
            if out.len() >= count {
                break;
            }
            if !out.contains(&r) {
                out.push(r);
            }
        }
        out
    }

    fn pick_ranks(&self, want: &[usize], pool: &[usize]) -> Vec<usize> {
        let out: Vec<usize> = want.iter().copied().filter(|r| pool.contains(r)).collect();
        if out.is_empty() {
            warn!(
                "requested ranks are not in the current pool; \
                 falling back to one auto-allocated rank"
            );
            return self.pick_count(1, pool);
        }
        out
    }

    fn mark_alloc(&mut self, ranks: &[usize]) {
        let mut touched = false;
        for &r in ranks {
            if let Some(p) = self.procs.iter_mut().find(|p| p.rank == r) {
                p.cur += 1;
                touched = true;
            }
        }
        if touched {
            self.sort_loads();
        }
    }

    fn sort_loads(&mut self) {
        self.procs.sort_by_key(|p| (p.cur, p.cum, p.rank));
    }
}

struct EnvInner {
    karta: RefCell<Karta>,
    comm: Option<Comm>,
}

/// One worker's execution environment: its scheduler plus, in clustered
/// runs, its transport endpoint. Cheaply cloneable; clones share state, so
/// closures inside a pipeline can launch nested runs.
pub struct Env {
    inner: Rc<EnvInner>,
}

impl Clone for Env {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Env {
    /// A single-process environment with no transport.
    pub fn local() -> Self {
        Self {
            inner: Rc::new(EnvInner {
                karta: RefCell::new(Karta::new(1, 0)),
                comm: None,
            }),
        }
    }

    pub(crate) fn clustered(comm: Comm) -> Self {
        let karta = Karta::new(comm.nprocs(), comm.rank());
        Self {
            inner: Rc::new(EnvInner {
                karta: RefCell::new(karta),
                comm: Some(comm),
            }),
        }
    }

    pub fn rank(&self) -> usize {
        self.inner.karta.borrow().rank()
    }

    pub fn nprocs(&self) -> usize {
        self.inner.karta.borrow().nprocs()
    }

    pub fn comm(&self) -> Option<&Comm> {
        self.inner.comm.as_ref()
    }

    /// Inspect the scheduler (current loads, for tests and diagnostics).
    pub fn with_karta<R>(&self, f: impl FnOnce(&Karta) -> R) -> R {
        f(&self.inner.karta.borrow())
    }

    /// Drive every root reachable from `lasts` to exhaustion.
    pub(crate) fn run_graph(&self, graph: &Graph, lasts: &[NodeId], req: ProcReq) -> Result<()> {
        let plan = self.inner.karta.borrow_mut().allocate(graph, lasts, req)?;
        let rctx = RunCtx {
            comm: self.inner.comm.as_ref(),
            rank: self.rank(),
        };
        let result: Result<()> = (|| {
            for &r in &plan.roots {
                graph.pre_pull(r, &rctx)?;
            }
            for &r in &plan.roots {
                graph.pull(r, &rctx)?;
            }
            Ok(())
        })();
        self.inner.karta.borrow_mut().finish(plan.nested_local);
        result
    }
}
