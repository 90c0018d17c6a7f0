//! In-process stage behavior: map, filter, column shaping, flow
//! composition and sinks.

use std::fs;

use anyhow::Result;
use tabflow::io::from_mem;
use tabflow::row::Field;
use tabflow::stream::{flow_of, rise};
use tabflow::{Env, Graph, row};

fn nums(xs: &[f64]) -> Vec<Vec<Field>> {
    xs.iter().map(|&x| row![x]).collect()
}

#[test]
fn map_appends_result_columns() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(nums(&[1.0, 2.0])), 1)
        .map(1, |r: &[Field]| row![r[0].as_num().unwrap() * 10.0])?
        .get(&env)?;
    let mut out = out;
    out.sort_by(|a, b| a[0].as_num().partial_cmp(&b[0].as_num()).unwrap());
    assert_eq!(out, vec![row![1.0, 10.0], row![2.0, 20.0]]);
    Ok(())
}

#[test]
fn map_cols_transform_replaces_in_place() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let rows = vec![row!["k", 3.0], row!["k", 4.0]];
    let mut out = rise(&g, from_mem(rows), 2)
        .map_cols([2], 1, |r: &[Field]| row![r[0].as_num().unwrap() + 1.0])?
        .cols_transform()?
        .get(&env)?;
    out.sort_by(|a, b| a[1].as_num().partial_cmp(&b[1].as_num()).unwrap());
    assert_eq!(out, vec![row!["k", 4.0], row!["k", 5.0]]);
    Ok(())
}

#[test]
fn map_cols_result_keeps_only_the_result() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(nums(&[2.0])), 1)
        .map(2, |r: &[Field]| {
            let x = r[0].as_num().unwrap();
            row![x, x * x]
        })?
        .cols_result()?
        .get(&env)?;
    assert_eq!(out, vec![row![2.0, 4.0]]);
    Ok(())
}

#[test]
fn flat_results_multiply_rows() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(nums(&[2.0, 0.0])), 1)
        .map(1, |r: &[Field]| {
            let n = r[0].as_num().unwrap() as usize;
            (0..n).map(|i| row![i as f64]).collect::<Vec<_>>()
        })?
        .cols_result()?
        .get(&env)?;
    // 2.0 fans out to two rows, 0.0 to none
    assert_eq!(out.len(), 2);
    Ok(())
}

#[test]
fn filter_keeps_matching_rows_unchanged() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let mut out = rise(&g, from_mem(nums(&[1.0, 5.0, 3.0])), 1)
        .filter(|r: &[Field]| r[0].as_num().unwrap() > 2.0)?
        .get(&env)?;
    out.sort_by(|a, b| a[0].as_num().partial_cmp(&b[0].as_num()).unwrap());
    assert_eq!(out, vec![row![3.0], row![5.0]]);
    Ok(())
}

#[test]
fn cols_drop_removes_columns() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, from_mem(vec![row!["a", 1.0, 2.0]]), 3)
        .filter(|_r: &[Field]| true)?
        .cols_drop([2])?
        .get(&env)?;
    assert_eq!(out, vec![row!["a", 2.0]]);
    Ok(())
}

#[test]
fn invalid_selection_is_a_composition_error() {
    let g = Graph::default();
    let s = rise(&g, from_mem(nums(&[1.0])), 1);
    assert!(s.map_cols([7], 1, |_r: &[Field]| row![0.0]).is_err());

    let s = rise(&g, from_mem(nums(&[1.0])), 1);
    let err = s
        .filter(|_r: &[Field]| true)
        .and_then(|s| s.cols([1, 1]))
        .and_then(|s| s.build());
    assert!(err.is_err());
}

#[test]
fn merge_unions_two_streams() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let a = rise(&g, from_mem(nums(&[1.0])), 1);
    let b = rise(&g, from_mem(nums(&[2.0])), 1);
    let mut out = a.merge(b)?.get(&env)?;
    out.sort_by(|a, b| a[0].as_num().partial_cmp(&b[0].as_num()).unwrap());
    assert_eq!(out, vec![row![1.0], row![2.0]]);
    Ok(())
}

#[test]
fn reusable_flow_pipes_into_a_stream() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let doubler = flow_of(&g, 1)
        .map(1, |r: &[Field]| row![r[0].as_num().unwrap() * 2.0])?
        .cols_result()?
        .build()?;
    let out = rise(&g, from_mem(nums(&[4.0])), 1)
        .pipe(&doubler)?
        .get(&env)?;
    assert_eq!(out, vec![row![8.0]]);
    Ok(())
}

#[test]
fn flows_append_into_larger_flows() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let first = flow_of(&g, 1)
        .map(1, |r: &[Field]| row![r[0].as_num().unwrap() + 1.0])?
        .cols_result()?
        .build()?;
    let second = flow_of(&g, 1)
        .map(1, |r: &[Field]| row![r[0].as_num().unwrap() * 3.0])?
        .cols_result()?
        .build()?;
    let both = first.append(second)?;
    let out = rise(&g, from_mem(nums(&[1.0])), 1)
        .pipe(&both)?
        .get(&env)?;
    assert_eq!(out, vec![row![6.0]]);
    Ok(())
}

#[test]
fn dump_writes_rows_and_header() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("out.txt");
    let path_str = path.to_string_lossy().to_string();

    rise(&g, from_mem(vec![row!["a", 1.0], row!["b", 2.5]]), 2)
        .filter(|_r: &[Field]| true)?
        .dump(path_str.clone(), "name value")?
        .run(&env)?;

    let text = fs::read_to_string(&path)?;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "name value");
    assert!(lines.contains(&"a 1"));
    assert!(lines.contains(&"b 2.5"));
    Ok(())
}

#[test]
fn one_up_branches_off_the_previous_stage() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    // the second map applies to the source rows, not the first map's output
    let out = rise(&g, from_mem(nums(&[1.0])), 1)
        .map(1, |r: &[Field]| row![r[0].as_num().unwrap() + 10.0])?
        .one_up()?
        .map(1, |r: &[Field]| row![r[0].as_num().unwrap() + 100.0])?
        .get(&env)?;
    assert_eq!(out, vec![row![1.0, 101.0]]);
    Ok(())
}

#[test]
fn tee_feeds_a_side_branch() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("side.txt");
    let side = flow_of(&g, 1)
        .filter(|_r: &[Field]| true)?
        .dump(path.to_string_lossy().to_string(), "")?
        .build()?;
    let out = rise(&g, from_mem(nums(&[7.0])), 1)
        .tee(&side)?
        .map(1, |r: &[Field]| row![r[0].as_num().unwrap() + 1.0])?
        .get(&env)?;
    assert_eq!(out, vec![row![7.0, 8.0]]);
    assert_eq!(fs::read_to_string(&path)?.trim(), "7");
    Ok(())
}
