//! Streaming reduction semantics: grouping, scan, ordered mode, reducer
//! calling conventions, input-order independence.

use anyhow::Result;
use tabflow::io::from_mem;
use tabflow::row::{Field, Row};
use tabflow::stream::rise;
use tabflow::{Env, Graph, ReduceFn, agg, row};

fn keyed() -> Vec<Row> {
    vec![
        row!["a", 1.0],
        row!["b", 2.0],
        row!["a", 3.0],
        row!["a", 4.0],
        row!["b", 5.0],
    ]
}

fn sorted_by_key(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
    rows
}

#[test]
fn per_key_sums() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(keyed()), 2)
        .reduce([1], agg::zeros(1), agg::sum())?
        .get(&env)?;
    assert_eq!(
        sorted_by_key(out),
        sorted_by_key(vec![row!["a", 8.0], row!["b", 7.0]])
    );
    Ok(())
}

#[test]
fn result_is_input_order_independent() -> Result<()> {
    let mut rows = keyed();
    rows.reverse();
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(rows), 2)
        .reduce([1], agg::zeros(1), agg::sum())?
        .get(&env)?;
    assert_eq!(
        sorted_by_key(out),
        sorted_by_key(vec![row!["a", 8.0], row!["b", 7.0]])
    );
    Ok(())
}

#[test]
fn scan_emits_after_every_update() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(keyed()), 2)
        .reduce([1], agg::zeros(1), agg::sum())?
        .scan()?
        .inprocess()?
        .get(&env)?;
    let a: Vec<f64> = out
        .iter()
        .filter(|r| r[0].as_str() == Some("a"))
        .map(|r| r[1].as_num().unwrap())
        .collect();
    let b: Vec<f64> = out
        .iter()
        .filter(|r| r[0].as_str() == Some("b"))
        .map(|r| r[1].as_num().unwrap())
        .collect();
    assert_eq!(a, vec![1.0, 4.0, 8.0]);
    assert_eq!(b, vec![2.0, 7.0]);
    Ok(())
}

#[test]
fn ordered_mode_emits_groups_as_keys_change() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    // pre-grouped input; each group's result comes out in group order
    let rows = vec![
        row!["x", 1.0],
        row!["x", 2.0],
        row!["y", 10.0],
        row!["z", 100.0],
    ];
    let out = rise(&g, from_mem(rows), 2)
        .reduce([1], agg::zeros(1), agg::sum())?
        .ordered(true)?
        .inprocess()?
        .get(&env)?;
    assert_eq!(out, vec![row!["x", 3.0], row!["y", 10.0], row!["z", 100.0]]);
    Ok(())
}

#[test]
fn by_value_reducer_matches_in_place() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let by_value = ReduceFn::ByValue(Box::new(|mut acc: Row, _k: &[Field], v: &[Field]| {
        if let (Field::Num(a), Some(x)) = (&mut acc[0], v[0].as_num()) {
            *a += x;
        }
        acc
    }));
    let out = rise(&g, from_mem(keyed()), 2)
        .reduce([1], agg::zeros(1), by_value)?
        .get(&env)?;
    assert_eq!(
        sorted_by_key(out),
        sorted_by_key(vec![row!["a", 8.0], row!["b", 7.0]])
    );
    Ok(())
}

#[test]
fn global_reduction_with_empty_key() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(keyed()), 2)
        .reduce_kv(Vec::<usize>::new(), [2], agg::zeros(1), agg::sum())?
        .get(&env)?;
    assert_eq!(out, vec![row![15.0]]);
    Ok(())
}

#[test]
fn count_min_max_helpers() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(keyed()), 2)
        .reduce([1], agg::zeros(1), agg::count())?
        .get(&env)?;
    assert_eq!(
        sorted_by_key(out),
        sorted_by_key(vec![row!["a", 3.0], row!["b", 2.0]])
    );

    let out = rise(&g, from_mem(keyed()), 2)
        .reduce(
            [1],
            vec![Field::Num(f64::NEG_INFINITY)],
            agg::max_of(),
        )?
        .get(&env)?;
    assert_eq!(
        sorted_by_key(out),
        sorted_by_key(vec![row!["a", 4.0], row!["b", 5.0]])
    );
    Ok(())
}

#[test]
fn explicit_value_selection() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let rows = vec![row!["a", 1.0, 10.0], row!["a", 2.0, 20.0]];
    // aggregate only the third column
    let out = rise(&g, from_mem(rows), 3)
        .reduce_kv([1], [3], agg::zeros(1), agg::sum())?
        .get(&env)?;
    assert_eq!(out, vec![row!["a", 30.0]]);
    Ok(())
}
