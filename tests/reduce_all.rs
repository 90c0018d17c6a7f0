//! Buffered reduction: end-of-stream flush, bunches, sliding windows,
//! ordered mode, and the statistics helpers.

use anyhow::Result;
use tabflow::io::from_mem;
use tabflow::row::{Field, Row};
use tabflow::stream::rise;
use tabflow::{Env, Graph, GroupBuf, agg, row};

fn one_key_nums(xs: &[f64]) -> Vec<Row> {
    xs.iter().map(|&x| row!["k", x]).collect()
}

fn average(_key: &[Field], buf: &GroupBuf) -> Row {
    let xs = buf.col_nums(1);
    row![xs.iter().sum::<f64>() / xs.len() as f64]
}

#[test]
fn flushes_whole_groups_at_end_of_stream() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let rows = vec![row!["a", 1.0], row!["b", 10.0], row!["a", 3.0]];
    let mut out = rise(&g, from_mem(rows), 2)
        .reduce_all([1], 1, average)?
        .get(&env)?;
    out.sort_by(|a, b| a[0].as_str().cmp(&b[0].as_str()));
    assert_eq!(out, vec![row!["a", 2.0], row!["b", 10.0]]);
    Ok(())
}

#[test]
fn adjacent_window_slides_by_one() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(one_key_nums(&[1.0, 2.0, 3.0, 4.0, 5.0])), 2)
        .reduce_all([1], 1, average)?
        .adjacent(3, false)?
        .inprocess()?
        .get(&env)?;
    let vals: Vec<f64> = out.iter().map(|r| r[1].as_num().unwrap()).collect();
    // full windows, then the partial windows drain one row at a time
    assert_eq!(vals, vec![2.0, 3.0, 4.0, 4.5, 5.0]);
    Ok(())
}

#[test]
fn adjacent_fixed_drops_partial_windows() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(one_key_nums(&[1.0, 2.0, 3.0, 4.0, 5.0])), 2)
        .reduce_all([1], 1, average)?
        .adjacent(3, true)?
        .inprocess()?
        .get(&env)?;
    let vals: Vec<f64> = out.iter().map(|r| r[1].as_num().unwrap()).collect();
    assert_eq!(vals, vec![2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn bunch_clears_after_each_invocation() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(one_key_nums(&[1.0, 2.0, 3.0, 4.0, 5.0])), 2)
        .reduce_all([1], 1, average)?
        .bunch(2, false)?
        .inprocess()?
        .get(&env)?;
    let vals: Vec<f64> = out.iter().map(|r| r[1].as_num().unwrap()).collect();
    // (1,2) (3,4) then the partial (5)
    assert_eq!(vals, vec![1.5, 3.5, 5.0]);
    Ok(())
}

#[test]
fn bunch_fixed_drops_the_partial_buffer() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(one_key_nums(&[1.0, 2.0, 3.0, 4.0, 5.0])), 2)
        .reduce_all([1], 1, average)?
        .bunch(2, true)?
        .inprocess()?
        .get(&env)?;
    let vals: Vec<f64> = out.iter().map(|r| r[1].as_num().unwrap()).collect();
    assert_eq!(vals, vec![1.5, 3.5]);
    Ok(())
}

#[test]
fn ordered_flushes_on_key_change() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let rows = vec![
        row!["x", 1.0],
        row!["x", 3.0],
        row!["y", 10.0],
        row!["z", 5.0],
    ];
    let out = rise(&g, from_mem(rows), 2)
        .reduce_all([1], 1, average)?
        .ordered(true)?
        .inprocess()?
        .get(&env)?;
    assert_eq!(out, vec![row!["x", 2.0], row!["y", 10.0], row!["z", 5.0]]);
    Ok(())
}

#[test]
fn variable_row_results_fan_out() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let rows = vec![row!["a", 1.0], row!["a", 2.0], row!["b", 3.0]];
    // echo every buffered value back out as its own row
    let out = rise(&g, from_mem(rows), 2)
        .reduce_all([1], 1, |_k: &[Field], buf: &GroupBuf| {
            buf.col_nums(1)
                .into_iter()
                .map(|x| row![x])
                .collect::<Vec<Row>>()
        })?
        .get(&env)?;
    assert_eq!(out.len(), 3);
    Ok(())
}

#[test]
fn summary_reports_count_mean_stddev_min_max() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(one_key_nums(&[2.0, 4.0, 6.0])), 2)
        .reduce_all([1], 5, agg::summary(1))?
        .get(&env)?;
    let r = &out[0];
    assert_eq!(r[0].as_str(), Some("k"));
    assert_eq!(r[1].as_num(), Some(3.0)); // count
    assert_eq!(r[2].as_num(), Some(4.0)); // mean
    assert_eq!(r[4].as_num(), Some(2.0)); // min
    assert_eq!(r[5].as_num(), Some(6.0)); // max
    Ok(())
}

#[test]
fn median_of_a_group() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(one_key_nums(&[5.0, 1.0, 3.0])), 2)
        .reduce_all([1], 1, agg::median(1))?
        .get(&env)?;
    assert_eq!(out, vec![row!["k", 3.0]]);
    Ok(())
}

#[test]
fn hist_counts_occupied_bins() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(one_key_nums(&[0.0, 0.1, 9.9])), 2)
        .reduce_all([1], 2, agg::hist(1, 2))?
        .get(&env)?;
    // two occupied bins: two small values, one large
    assert_eq!(out.len(), 2);
    let counts: f64 = out.iter().map(|r| r[2].as_num().unwrap()).sum();
    assert_eq!(counts, 3.0);
    Ok(())
}
