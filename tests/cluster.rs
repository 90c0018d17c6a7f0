//! Multi-worker runs: sharded reduction, broadcast, delivery counts,
//! end-of-stream draining and scheduler behavior.

use std::collections::HashMap;

use anyhow::Result;
use tabflow::io::from_mem;
use tabflow::row::{Field, Row};
use tabflow::stream::rise;
use tabflow::{Env, Graph, Pool, ProcReq, agg, row};

fn keyed_input() -> Vec<Row> {
    let mut rows = Vec::new();
    for i in 0..40 {
        rows.push(row![format!("key{}", i % 7), 1.0]);
    }
    rows
}

fn run_sharded_sum(env: &Env) -> Result<Vec<Row>> {
    let g = Graph::default();
    rise(&g, from_mem(keyed_input()), 2)
        .reduce([1], agg::zeros(1), agg::sum())?
        .get(env)
}

#[test]
fn partitioned_reduce_is_correct_on_four_workers() -> Result<()> {
    let per_rank = Pool::new(4).run(|env| run_sharded_sum(&env))?;
    // every key lands on exactly one worker, each exactly once
    let mut sums: HashMap<String, f64> = HashMap::new();
    for rows in &per_rank {
        for r in rows {
            let k = r[0].as_str().unwrap().to_string();
            assert!(!sums.contains_key(&k), "key {k} reduced on two workers");
            sums.insert(k, r[1].as_num().unwrap());
        }
    }
    assert_eq!(sums.len(), 7);
    // 40 rows over 7 keys: keys 0..5 get 6 rows, key 5/6 get 5
    let total: f64 = sums.values().sum();
    assert_eq!(total, 40.0);
    Ok(())
}

#[test]
fn same_results_regardless_of_worker_count() -> Result<()> {
    for n in [1usize, 2, 3] {
        let per_rank = Pool::new(n).run(|env| run_sharded_sum(&env))?;
        let total: f64 = per_rank
            .iter()
            .flatten()
            .map(|r| r[1].as_num().unwrap())
            .sum();
        let keys: usize = per_rank.iter().map(Vec::len).sum();
        assert_eq!(total, 40.0, "with {n} workers");
        assert_eq!(keys, 7, "with {n} workers");
    }
    Ok(())
}

#[test]
fn round_robin_delivers_each_row_exactly_once() -> Result<()> {
    let input: Vec<Row> = (0..30).map(|i| row![i as f64]).collect();
    let per_rank = Pool::new(3).run(move |env| {
        let g = Graph::default();
        // empty key: rows round-robin across the pool
        rise(&g, from_mem(input.clone()), 1)
            .filter(|_r: &[Field]| true)?
            .prll(ProcReq::None)?
            .get(&env)
    })?;
    let mut seen: Vec<f64> = per_rank
        .iter()
        .flatten()
        .map(|r| r[0].as_num().unwrap())
        .collect();
    seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(seen, (0..30).map(|i| i as f64).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn dupe_delivers_every_row_to_every_worker() -> Result<()> {
    let input: Vec<Row> = (0..5).map(|i| row![i as f64]).collect();
    let per_rank = Pool::new(3).run(move |env| {
        let g = Graph::default();
        rise(&g, from_mem(input.clone()), 1)
            .filter(|_r: &[Field]| true)?
            .prll_mode(ProcReq::Ratio(1.0), tabflow::ParMode::dupe().and_task())?
            .get(&env)
    })?;
    for (rank, rows) in per_rank.iter().enumerate() {
        assert_eq!(rows.len(), 5, "rank {rank} missed broadcast rows");
    }
    Ok(())
}

#[test]
fn bridges_drain_fully_at_end_of_stream() -> Result<()> {
    // chained shuffles: if any per-peer buffer kept rows, counts would drop
    let input: Vec<Row> = (0..100).map(|i| row![format!("k{}", i % 11), 1.0]).collect();
    let per_rank = Pool::new(4).run(move |env| {
        let g = Graph::default();
        rise(&g, from_mem(input.clone()), 2)
            .reduce([1], agg::zeros(1), agg::count())?
            .map(1, |r: &[Field]| row![r[1].as_num().unwrap()])?
            .cols_result()?
            .reduce_kv(Vec::<usize>::new(), [1], agg::zeros(1), agg::sum())?
            .prll_mode(ProcReq::Ranks(vec![0]), tabflow::ParMode::task())?
            .get(&env)
    })?;
    let grand: f64 = per_rank
        .iter()
        .flatten()
        .map(|r| r[0].as_num().unwrap())
        .sum();
    assert_eq!(grand, 100.0);
    Ok(())
}

#[test]
fn partition_by_overrides_the_routing_key() -> Result<()> {
    let input: Vec<Row> = (0..12).map(|i| row![format!("k{i}"), 1.0]).collect();
    let per_rank = Pool::new(3).run(move |env| {
        let g = Graph::default();
        // constant hash: every row lands on one downstream rank
        rise(&g, from_mem(input.clone()), 2)
            .filter(|_r: &[Field]| true)?
            .prll(ProcReq::None)?
            .partition_by([1], Some(Box::new(|_key: &[&Field]| 0u64)))?
            .get(&env)
    })?;
    let occupied: Vec<usize> = per_rank
        .iter()
        .enumerate()
        .filter(|(_, rows)| !rows.is_empty())
        .map(|(rank, _)| rank)
        .collect();
    assert_eq!(occupied.len(), 1);
    let total: usize = per_rank.iter().map(Vec::len).sum();
    assert_eq!(total, 12);
    Ok(())
}

#[test]
fn explicit_ranks_outside_pool_fall_back_to_one() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    // rank 7 does not exist in a 1-process pool; allocation falls back
    let out = rise(&g, from_mem(vec![row![1.0]]), 1)
        .prll(ProcReq::Ranks(vec![7]))?
        .get(&env)?;
    assert_eq!(out, vec![row![1.0]]);
    Ok(())
}

#[test]
fn scheduler_spreads_identical_tasks_evenly() -> Result<()> {
    let loads = Pool::new(4).run(|env| {
        // several identical runs; cumulative allocations should stay flat
        for _ in 0..6 {
            let g = Graph::default();
            rise(&g, from_mem(vec![row![1.0]]), 1)
                .reduce_kv(Vec::<usize>::new(), [1], agg::zeros(1), agg::sum())?
                .run(&env)?;
        }
        Ok(env.with_karta(|k| k.loads()))
    })?;
    for per_rank in &loads {
        let cums: Vec<u32> = per_rank.iter().map(|&(_, _, cum)| cum).collect();
        let max = *cums.iter().max().unwrap();
        let min = *cums.iter().min().unwrap();
        assert!(
            max - min <= 6,
            "greedy least-loaded allocation drifted: {cums:?}"
        );
    }
    Ok(())
}

#[test]
fn nested_unspecified_run_degrades_to_local() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let env2 = env.clone();
    let out = rise(&g, from_mem(vec![row![5.0]]), 1)
        .map(1, move |r: &[Field]| {
            // a run launched while another is in progress
            let g2 = Graph::default();
            let inner = rise(&g2, from_mem(vec![row![1.0], row![2.0]]), 1)
                .reduce_kv(Vec::<usize>::new(), [1], agg::zeros(1), agg::sum())
                .and_then(|s| s.get(&env2))
                .unwrap();
            row![r[0].as_num().unwrap() + inner[0][0].as_num().unwrap()]
        })?
        .get(&env)?;
    assert_eq!(out, vec![row![5.0, 8.0]]);
    Ok(())
}
