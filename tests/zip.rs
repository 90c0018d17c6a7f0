//! Keyed pairing across two streams.

use anyhow::Result;
use tabflow::io::from_mem;
use tabflow::row::Row;
use tabflow::stream::rise;
use tabflow::{Env, Graph, row};

#[test]
fn pairs_by_key_and_drops_unmatched() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let left = vec![row!["k1", 10.0], row!["k2", 20.0], row!["k1", 11.0]];
    let right = vec![row!["k1", 100.0], row!["k1", 200.0], row!["k3", 300.0]];
    let l = rise(&g, from_mem(left), 2);
    let r = rise(&g, from_mem(right), 2);
    let mut out = l
        .zip(r, [1])?
        .cols([1, 2, 4])?
        .get(&env)?;
    out.sort_by(|a, b| {
        a[1].as_num()
            .partial_cmp(&b[1].as_num())
            .unwrap()
    });
    assert_eq!(
        out,
        vec![row!["k1", 10.0, 100.0], row!["k1", 11.0, 200.0]]
    );
    Ok(())
}

#[test]
fn output_count_is_min_of_side_counts_per_key() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    // key k appears 3 times left, 2 times right
    let left: Vec<Row> = (0..3).map(|i| row!["k", i as f64]).collect();
    let right: Vec<Row> = (10..12).map(|i| row!["k", i as f64]).collect();
    let l = rise(&g, from_mem(left), 2);
    let r = rise(&g, from_mem(right), 2);
    let mut out = l.zip(r, [1])?.get(&env)?;
    assert_eq!(out.len(), 2);
    // the i-th left row pairs with the i-th right row
    out.sort_by(|a, b| a[1].as_num().partial_cmp(&b[1].as_num()).unwrap());
    assert_eq!(out[0][1].as_num(), Some(0.0));
    assert_eq!(out[0][3].as_num(), Some(10.0));
    assert_eq!(out[1][1].as_num(), Some(1.0));
    assert_eq!(out[1][3].as_num(), Some(11.0));
    Ok(())
}

#[test]
fn per_side_key_selections() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let left = vec![row![1.0, "a"]];
    let right = vec![row!["a", 2.0]];
    let l = rise(&g, from_mem(left), 2);
    let r = rise(&g, from_mem(right), 2);
    let out = l
        .zip_keys(r, [2], [1])?
        .cols([1, 4])?
        .get(&env)?;
    assert_eq!(out, vec![row![1.0, 2.0]]);
    Ok(())
}

#[test]
fn mismatched_key_widths_are_rejected() {
    let g = Graph::default();
    let l = rise(&g, from_mem(vec![row!["a", 1.0]]), 2);
    let r = rise(&g, from_mem(vec![row!["a", 1.0]]), 2);
    assert!(l.zip_keys(r, [1], [1, 2]).is_err());
}
