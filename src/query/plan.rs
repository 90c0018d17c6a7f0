//! Query planning: emit a dataflow graph for a resolved query and run it.
//!
//! The source rise loads exactly the referenced file columns, laid out
//! strings-first. Each `$x = …` becomes a Map appending one numeric
//! column; each `where` becomes a Filter; each `reduce` becomes two
//! Reduce stages — an in-process partial aggregation followed by a
//! task-parallel global aggregation on the same key — plus a finalizing
//! Map when an average is involved; each `zip` plans its inner query,
//! pairs on the shared string key, and appends the inner side's numeric
//! columns.

use anyhow::{Context, Result, anyhow, bail};

use super::ast::*;
use super::eval::{PosEnv, compile_logic, compile_math, str_pos_of};
use super::parse::parse_query;
use super::repl::Session;
use super::resolve::{Binding, resolve};
use crate::graph::Graph;
use crate::io::from_file;
use crate::row::{Field, Row};
use crate::sched::{Env, ParMode, ProcReq};
use crate::stream::{Stream, rise};

/// Ranks that read files and crunch rows: everyone but rank 0 when the
/// pool is big enough, so the coordinator stays responsive.
pub fn worker_ranks(nprocs: usize) -> Vec<usize> {
    if nprocs <= 1 {
        vec![0]
    } else {
        (1..nprocs).collect()
    }
}

fn all_ranks(nprocs: usize) -> Vec<usize> {
    (0..nprocs).collect()
}

/// One aggregation compiled to accumulator updates.
enum Step {
    Add(Box<dyn Fn(&[Field]) -> f64>),
    Count,
    Min(Box<dyn Fn(&[Field]) -> f64>),
    Max(Box<dyn Fn(&[Field]) -> f64>),
    /// sum and count slots; finalized into a quotient.
    Avg(Box<dyn Fn(&[Field]) -> f64>),
}

impl Step {
    fn slots(&self) -> usize {
        match self {
            Step::Avg(_) => 2,
            _ => 1,
        }
    }

    fn init(&self, out: &mut Row) {
        match self {
            Step::Min(_) => out.push(Field::Num(f64::INFINITY)),
            Step::Max(_) => out.push(Field::Num(f64::NEG_INFINITY)),
            Step::Avg(_) => {
                out.push(Field::Num(0.0));
                out.push(Field::Num(0.0));
            }
            _ => out.push(Field::Num(0.0)),
        }
    }
}

/// Whether a partial-slot column merges by add, min or max.
#[derive(Clone, Copy)]
enum MergeKind {
    Add,
    Min,
    Max,
}

struct Planner<'a> {
    graph: Graph,
    session: &'a Session,
    workers: Vec<usize>,
}

impl<'a> Planner<'a> {
    fn plan_level(&self, q: &QueryExpr, bind: &Binding) -> Result<(Stream, PosEnv, usize)> {
        let mut env = PosEnv {
            name_num: bind.name_num.clone(),
            name_str: bind.name_str.clone(),
            consts: bind.consts.clone(),
            ..PosEnv::default()
        };
        let s_count = bind.cols.str_cols.len();
        for (i, &c) in bind.cols.str_cols.iter().enumerate() {
            env.str_pos.insert(c, i + 1);
        }
        for (i, &c) in bind.cols.num_cols.iter().enumerate() {
            env.num_pos.insert(c, s_count + i + 1);
        }
        let mut width = s_count + bind.cols.num_cols.len();

        let header_used = !bind.name_num.is_empty() || !bind.name_str.is_empty();
        let src = from_file(
            q.file.clone(),
            bind.cols.str_cols.clone(),
            bind.cols.num_cols.clone(),
        )
        .strict(self.session.strict)
        .has_header(header_used);
        let mut s = rise(&self.graph, src, width)
            .prll(ProcReq::Ranks(self.workers.clone()))?;

        let mut zip_at = 0;
        for unit in &q.units {
            match unit {
                Unit::Let { name, expr } => {
                    let f = compile_math(expr, &env)?;
                    s = s.map(1, move |row: &[Field]| vec![Field::Num(f(row))])?;
                    width += 1;
                    env.var_pos.insert(name.clone(), width);
                }
                Unit::Where(l) => {
                    let p = compile_logic(l, &env)?;
                    s = s.filter(move |row: &[Field]| p(row))?;
                }
                Unit::Reduce { keys, aggs } => {
                    let (s2, env2, w2) = self.plan_reduce(s, keys, aggs, &env, width)?;
                    s = s2;
                    env = env2;
                    width = w2;
                }
                Unit::Zip { keys, inner } => {
                    let ib = bind
                        .inner
                        .get(zip_at)
                        .ok_or_else(|| anyhow!("zip resolution out of step"))?;
                    zip_at += 1;
                    let (is, ienv, _iw) = self.plan_level(inner, ib)?;
                    let kl: Vec<usize> = keys
                        .iter()
                        .map(|k| str_pos_of(k, &env))
                        .collect::<Result<_>>()?;
                    let kr: Vec<usize> = keys
                        .iter()
                        .map(|k| str_pos_of(k, &ienv))
                        .collect::<Result<_>>()?;
                    s = s.zip_keys(is, kl, kr)?;
                    // keep the outer row whole, append the inner side's
                    // numeric columns
                    let mut inner_keep: Vec<usize> = ienv
                        .num_pos
                        .values()
                        .chain(ienv.var_pos.values())
                        .copied()
                        .chain(ienv.agg_pos.clone().unwrap_or_default())
                        .collect();
                    inner_keep.sort_unstable();
                    inner_keep.dedup();
                    let mut cols: Vec<usize> = (1..=width).collect();
                    cols.extend(inner_keep.iter().map(|p| width + p));
                    s = s.cols(cols)?;
                    width += inner_keep.len();
                }
            }
        }
        Ok((s, env, width))
    }

    fn plan_reduce(
        &self,
        s: Stream,
        keys: &[StrRef],
        aggs: &[AggExpr],
        env: &PosEnv,
        width: usize,
    ) -> Result<(Stream, PosEnv, usize)> {
        let kpos: Vec<usize> = keys
            .iter()
            .map(|k| str_pos_of(k, env))
            .collect::<Result<_>>()?;
        let m = kpos.len();

        let mut steps = Vec::with_capacity(aggs.len());
        for a in aggs {
            let arg = match &a.arg {
                Some(e) => Some(compile_math(e, env)?),
                None => None,
            };
            let step = match (a.func, arg) {
                (AggFn::Count, _) => Step::Count,
                (AggFn::Sum, Some(f)) => Step::Add(f),
                (AggFn::Min, Some(f)) => Step::Min(f),
                (AggFn::Max, Some(f)) => Step::Max(f),
                (AggFn::Avg, Some(f)) => Step::Avg(f),
                (func, None) => bail!("{func:?} needs an argument"),
            };
            steps.push(step);
        }
        let mut init = Row::new();
        let mut merge_kinds = Vec::new();
        for st in &steps {
            st.init(&mut init);
            match st {
                Step::Min(_) => merge_kinds.push(MergeKind::Min),
                Step::Max(_) => merge_kinds.push(MergeKind::Max),
                Step::Avg(_) => {
                    merge_kinds.push(MergeKind::Add);
                    merge_kinds.push(MergeKind::Add);
                }
                _ => merge_kinds.push(MergeKind::Add),
            }
        }
        let n_slots = init.len();

        // in-process partial aggregation over the full row as value
        let update = move |acc: &mut Row, _key: &[Field], val: &[Field]| {
            let mut at = 0;
            for st in &steps {
                match st {
                    Step::Add(f) => add_slot(acc, at, f(val)),
                    Step::Count => add_slot(acc, at, 1.0),
                    Step::Min(f) => min_slot(acc, at, f(val)),
                    Step::Max(f) => max_slot(acc, at, f(val)),
                    Step::Avg(f) => {
                        add_slot(acc, at, f(val));
                        add_slot(acc, at + 1, 1.0);
                    }
                }
                at += st.slots();
            }
        };
        let identity: Vec<usize> = (1..=width).collect();
        let s = s
            .reduce_kv(
                kpos.clone(),
                identity,
                init.clone(),
                crate::ops::ReduceFn::InPlace(Box::new(update)),
            )?
            .inprocess()?;

        // task-parallel global aggregation keyed the same way
        let w1 = m + n_slots;
        let kinds = merge_kinds;
        let merge = move |acc: &mut Row, _key: &[Field], val: &[Field]| {
            for (i, kind) in kinds.iter().enumerate() {
                let x = val[m + i].as_num().unwrap_or(0.0);
                match kind {
                    MergeKind::Add => add_slot(acc, i, x),
                    MergeKind::Min => min_slot(acc, i, x),
                    MergeKind::Max => max_slot(acc, i, x),
                }
            }
        };
        let gkeys: Vec<usize> = (1..=m).collect();
        let gidentity: Vec<usize> = (1..=w1).collect();
        let mut s = s
            .reduce_kv(
                gkeys,
                gidentity,
                init,
                crate::ops::ReduceFn::InPlace(Box::new(merge)),
            )?
            .prll_mode(ProcReq::Ranks(vec![0]), ParMode::task())?;

        // averages finalize into quotients; everything else passes through
        let n_aggs = aggs.len();
        let has_avg = aggs.iter().any(|a| a.func == AggFn::Avg);
        let final_width = m + n_aggs;
        if has_avg {
            let finals: Vec<(usize, bool)> = {
                let mut out = Vec::new();
                let mut at = 0;
                for a in aggs {
                    out.push((at, a.func == AggFn::Avg));
                    at += if a.func == AggFn::Avg { 2 } else { 1 };
                }
                out
            };
            s = s.map(n_aggs, move |row: &[Field]| {
                finals
                    .iter()
                    .map(|&(at, avg)| {
                        let x = row[m + at].as_num().unwrap_or(0.0);
                        Field::Num(if avg {
                            let n = row[m + at + 1].as_num().unwrap_or(0.0);
                            if n > 0.0 { x / n } else { 0.0 }
                        } else {
                            x
                        })
                    })
                    .collect::<Row>()
            })?;
            let mut cols: Vec<usize> = (1..=m).collect();
            cols.extend(w1 + 1..=w1 + n_aggs);
            s = s.cols(cols)?;
        }

        // the new layout: key strings first, aggregation results after
        let mut env2 = PosEnv {
            name_str: env.name_str.clone(),
            consts: env.consts.clone(),
            ..PosEnv::default()
        };
        for (i, k) in keys.iter().enumerate() {
            let col = match k {
                StrRef::Col(n) => *n,
                StrRef::Name(name) => *env
                    .name_str
                    .get(name)
                    .ok_or_else(|| anyhow!("'{name}' lost its binding"))?,
            };
            env2.str_pos.insert(col, i + 1);
        }
        env2.agg_pos = Some((m + 1..=m + n_aggs).collect());
        Ok((s, env2, final_width))
    }
}

fn add_slot(acc: &mut Row, i: usize, x: f64) {
    if let Field::Num(a) = &mut acc[i] {
        *a += x;
    }
}

fn min_slot(acc: &mut Row, i: usize, x: f64) {
    if let Field::Num(a) = &mut acc[i]
        && x < *a
    {
        *a = x;
    }
}

fn max_slot(acc: &mut Row, i: usize, x: f64) {
    if let Field::Num(a) = &mut acc[i]
        && x > *a
    {
        *a = x;
    }
}

/// Plan and execute one query line on this worker.
///
/// Every rank runs the same call; the planner's process requests decide
/// which ranks do what.
pub fn run_query(text: &str, env: &Env, session: &mut Session) -> Result<()> {
    let q = parse_query(text)?;

    if let Terminal::SaveQueryAs(name) = &q.terminal {
        session
            .saved_queries
            .insert(name.clone(), text.to_string());
        if env.rank() == 0 {
            println!("saved query '{name}'");
        }
        return Ok(());
    }

    // a saved query's name can stand in for a file source
    let q = match session.saved_queries.get(&q.file) {
        Some(saved) => {
            let mut base = parse_query(saved).context("re-parse saved query")?;
            base.units.extend(q.units);
            base.terminal = q.terminal;
            base
        }
        None => q,
    };

    let bind = resolve(&q, session)?;
    let (stream, out_env, _out_width) = {
        let planner = Planner {
            graph: Graph::default(),
            session,
            workers: worker_ranks(env.nprocs()),
        };
        planner.plan_level(&q, &bind)?
    };
    let all = all_ranks(env.nprocs());

    match &q.terminal {
        Terminal::SaveQueryAs(_) => unreachable!("handled above"),
        Terminal::Show { file } => {
            let s = stream.dump(file.clone().unwrap_or_default(), "")?;
            s.run_req(env, ProcReq::Ranks(all))?;
            Ok(())
        }
        Terminal::None => {
            stream.run_req(env, ProcReq::Ranks(all))?;
            Ok(())
        }
        Terminal::SaveVal(items) => {
            // broadcast the final rows so every rank's session stays in step
            let s = stream
                .map(0, |_row: &[Field]| Vec::<Field>::new())?
                .prll_mode(ProcReq::Ratio(1.0), ParMode::dupe().and_task())?;
            let rows = s.get_req(env, ProcReq::Ranks(all))?;
            let Some(row) = rows.first() else {
                bail!("the query produced no rows to save from");
            };
            for item in items {
                save_item(item, row, &out_env, session)?;
            }
            if env.rank() == 0 {
                for item in items {
                    println!("saved '{}'", item.dest);
                }
            }
            Ok(())
        }
    }
}

fn save_item(item: &SaveItem, row: &Row, env: &PosEnv, session: &mut Session) -> Result<()> {
    match &item.src {
        ValRef::NumCol(n) => {
            let pos = match &env.agg_pos {
                Some(aggs) => *aggs
                    .get(*n - 1)
                    .ok_or_else(|| anyhow!("no aggregation result ${n}"))?,
                None => {
                    // n-th numeric column of the final layout
                    let mut ps: Vec<usize> = env.num_pos.values().copied().collect();
                    ps.sort_unstable();
                    *ps.get(*n - 1)
                        .ok_or_else(|| anyhow!("no numeric column ${n}"))?
                }
            };
            let v = row
                .get(pos - 1)
                .and_then(Field::as_num)
                .ok_or_else(|| anyhow!("column ${n} is not numeric"))?;
            session.saved_nums.insert(item.dest.clone(), v);
        }
        ValRef::NumName(name) => {
            let pos = *env
                .var_pos
                .get(name)
                .ok_or_else(|| anyhow!("'{name}' used before declaration"))?;
            let v = row
                .get(pos - 1)
                .and_then(Field::as_num)
                .ok_or_else(|| anyhow!("'{name}' is not numeric"))?;
            session.saved_nums.insert(item.dest.clone(), v);
        }
        ValRef::StrCol(n) => {
            let pos = *env
                .str_pos
                .get(n)
                .ok_or_else(|| anyhow!("string column %{n} is not loaded"))?;
            let v = row
                .get(pos - 1)
                .and_then(Field::as_str)
                .ok_or_else(|| anyhow!("column %{n} is not a string"))?;
            session.saved_strs.insert(item.dest.clone(), v.to_string());
        }
        ValRef::StrName(name) => {
            bail!("'%{name}' must be saved by column index");
        }
    }
    Ok(())
}
