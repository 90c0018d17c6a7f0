//! Source helpers: in-memory range splitting, kick, and the thin
//! delimited-file reader.

use std::fs;

use anyhow::Result;
use tabflow::io::{from_file, from_mem, kick, read_header};
use tabflow::row::{Field, Row};
use tabflow::stream::rise;
use tabflow::{Env, Graph, Pool, row};

#[test]
fn from_mem_splits_ranges_across_ranks() -> Result<()> {
    let input: Vec<Row> = (0..10).map(|i| row![i as f64]).collect();
    let per_rank = Pool::new(3).run(move |env| {
        let g = Graph::default();
        rise(&g, from_mem(input.clone()), 1).get(&env)
    })?;
    // contiguous, disjoint, complete
    let counts: Vec<usize> = per_rank.iter().map(Vec::len).collect();
    assert_eq!(counts.iter().sum::<usize>(), 10);
    let mut all: Vec<f64> = per_rank
        .iter()
        .flatten()
        .map(|r| r[0].as_num().unwrap())
        .collect();
    all.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(all, (0..10).map(|i| i as f64).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn kick_drives_the_pipeline_n_times() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let out = rise(&g, kick(5), 0)
        .map(1, |_r: &[Field]| row![1.0])?
        .get(&env)?;
    assert_eq!(out.len(), 5);
    Ok(())
}

#[test]
fn delimited_files_parse_by_separator() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("t.csv");
    fs::write(&path, "x,1.5\ny,2.5\n")?;
    let src = from_file(path.to_string_lossy().to_string(), vec![1], vec![2]).delimiter(b',');
    let mut out = rise(&g, src, 2).get(&env)?;
    out.sort_by(|a, b| a[0].as_str().cmp(&b[0].as_str()));
    assert_eq!(out, vec![row!["x", 1.5], row!["y", 2.5]]);
    Ok(())
}

#[test]
fn strict_mode_drops_short_rows() -> Result<()> {
    let env = Env::local();
    let g = Graph::default();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("t.txt");
    fs::write(&path, "a 1\nshort\nb 2\n")?;
    let p = path.to_string_lossy().to_string();

    let out = rise(&g, from_file(p.clone(), vec![1], vec![2]).strict(true), 2).get(&env)?;
    assert_eq!(out.len(), 2);

    let out = rise(&g, from_file(p, vec![1], vec![2]), 2).get(&env)?;
    assert_eq!(out.len(), 3);
    // padded numeric cell
    assert!(out.iter().any(|r| r == &row!["short", 0.0]));
    Ok(())
}

#[test]
fn header_is_only_the_first_line() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("t.txt");
    fs::write(&path, "name price qty\n1 2 3\n")?;
    let names = read_header(&path.to_string_lossy(), None)?;
    assert_eq!(names, vec!["name", "price", "qty"]);
    Ok(())
}
