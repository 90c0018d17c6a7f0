//! Query-language surface: parsing, resolution errors, planning and
//! end-to-end execution through the engine.

use std::fs;
use std::path::Path;

use anyhow::Result;
use tabflow::Env;
use tabflow::query::{Session, run_query};

fn write_file(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path.to_string_lossy().to_string()
}

fn lines_of(path: &str) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn map_and_filter_pipeline() -> Result<()> {
    let env = Env::local();
    let mut session = Session::new(false);
    let dir = tempfile::tempdir()?;
    let input = write_file(dir.path(), "t.txt", "1 2.0\n2 5.0\n3 7.0\n");
    let out = dir.path().join("out.txt").to_string_lossy().to_string();

    run_query(
        &format!(r#"file "{input}" | $y = $1 + $2 | where $y > 4 | show "{out}""#),
        &env,
        &mut session,
    )?;

    let mut lines = lines_of(&out);
    lines.sort();
    assert_eq!(lines, vec!["2 5 7", "3 7 10"]);
    Ok(())
}

#[test]
fn reduce_sums_per_key() -> Result<()> {
    let env = Env::local();
    let mut session = Session::new(false);
    let dir = tempfile::tempdir()?;
    let input = write_file(dir.path(), "t.txt", "a 1\nb 2\na 3\na 4\nb 5\n");
    let out = dir.path().join("out.txt").to_string_lossy().to_string();

    run_query(
        &format!(r#"file "{input}" | reduce %1 sum($2) | show "{out}""#),
        &env,
        &mut session,
    )?;

    let mut lines = lines_of(&out);
    lines.sort();
    assert_eq!(lines, vec!["a 8", "b 7"]);
    Ok(())
}

#[test]
fn reduce_with_count_avg_min_max() -> Result<()> {
    let env = Env::local();
    let mut session = Session::new(false);
    let dir = tempfile::tempdir()?;
    let input = write_file(dir.path(), "t.txt", "a 1\na 3\nb 10\n");
    let out = dir.path().join("out.txt").to_string_lossy().to_string();

    run_query(
        &format!(
            r#"file "{input}" | reduce %1 count() avg($2) min($2) max($2) | show "{out}""#
        ),
        &env,
        &mut session,
    )?;

    let mut lines = lines_of(&out);
    lines.sort();
    assert_eq!(lines, vec!["a 2 2 1 3", "b 1 10 10 10"]);
    Ok(())
}

#[test]
fn zip_joins_on_the_string_key() -> Result<()> {
    let env = Env::local();
    let mut session = Session::new(false);
    let dir = tempfile::tempdir()?;
    let left = write_file(dir.path(), "l.txt", "k1 10\nk2 20\nk1 11\n");
    let right = write_file(dir.path(), "r.txt", "k1 100\nk1 200\nk3 300\n");
    let out = dir.path().join("out.txt").to_string_lossy().to_string();

    run_query(
        &format!(r#"file "{left}" | zip %1 (file "{right}") | show "{out}""#),
        &env,
        &mut session,
    )?;

    let mut lines = lines_of(&out);
    lines.sort();
    assert_eq!(lines, vec!["k1 10 100", "k1 11 200"]);
    Ok(())
}

#[test]
fn header_names_bind_to_columns() -> Result<()> {
    let env = Env::local();
    let mut session = Session::new(false);
    let dir = tempfile::tempdir()?;
    let input = write_file(dir.path(), "t.txt", "name price\nx 4\ny 9\n");
    let out = dir.path().join("out.txt").to_string_lossy().to_string();

    run_query(
        &format!(r#"file "{input}" | where $price > 5 | show "{out}""#),
        &env,
        &mut session,
    )?;

    assert_eq!(lines_of(&out), vec!["9"]);
    Ok(())
}

#[test]
fn save_val_keeps_values_for_later_queries() -> Result<()> {
    let env = Env::local();
    let mut session = Session::new(false);
    let dir = tempfile::tempdir()?;
    let input = write_file(dir.path(), "t.txt", "a 1\na 3\n");

    run_query(
        &format!(r#"file "{input}" | reduce %1 sum($2) | saveVal $1 as total"#),
        &env,
        &mut session,
    )?;
    assert_eq!(session.saved_nums.get("total"), Some(&4.0));

    // the saved value is usable as a constant afterwards
    let out = dir.path().join("out.txt").to_string_lossy().to_string();
    run_query(
        &format!(r#"file "{input}" | where $2 + $total > 6 | show "{out}""#),
        &env,
        &mut session,
    )?;
    assert_eq!(lines_of(&out), vec!["3"]);
    Ok(())
}

#[test]
fn saved_queries_are_reusable_sources() -> Result<()> {
    let env = Env::local();
    let mut session = Session::new(false);
    let dir = tempfile::tempdir()?;
    let input = write_file(dir.path(), "t.txt", "a 1\nb 2\na 3\n");

    run_query(
        &format!(r#"file "{input}" | reduce %1 sum($2) | saveQueryAs persum"#),
        &env,
        &mut session,
    )?;
    assert!(session.saved_queries.contains_key("persum"));

    let out = dir.path().join("out.txt").to_string_lossy().to_string();
    run_query(&format!(r#"file "persum" | show "{out}""#), &env, &mut session)?;
    let mut lines = lines_of(&out);
    lines.sort();
    assert_eq!(lines, vec!["a 4", "b 2"]);
    Ok(())
}

#[test]
fn lenient_mode_pads_and_strict_mode_drops() -> Result<()> {
    let env = Env::local();
    let dir = tempfile::tempdir()?;
    let input = write_file(dir.path(), "t.txt", "1 2\nbroken\n3 4\n");

    let out = dir.path().join("lenient.txt").to_string_lossy().to_string();
    let mut lenient = Session::new(false);
    run_query(
        &format!(r#"file "{input}" | where $1 >= 0 | show "{out}""#),
        &env,
        &mut lenient,
    )?;
    assert_eq!(lines_of(&out).len(), 3);

    let out = dir.path().join("strict.txt").to_string_lossy().to_string();
    let mut strict = Session::new(true);
    run_query(
        &format!(r#"file "{input}" | where $1 >= 0 | show "{out}""#),
        &env,
        &mut strict,
    )?;
    assert_eq!(lines_of(&out).len(), 2);
    Ok(())
}

#[test]
fn semantic_errors_reject_the_query() {
    let env = Env::local();
    let mut session = Session::new(false);
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "t.txt", "a 1\n");

    // variable used before declaration
    assert!(
        run_query(
            &format!(r#"file "{input}" | where $nope > 1 | show"#),
            &env,
            &mut session
        )
        .is_err()
    );
    // variable declared twice
    assert!(
        run_query(
            &format!(r#"file "{input}" | $x = $2 | $x = $2 | show"#),
            &env,
            &mut session
        )
        .is_err()
    );
    // numeric column by index after reduce committed to a key set
    assert!(
        run_query(
            &format!(r#"file "{input}" | reduce %1 sum($2) | $z = $5 | show"#),
            &env,
            &mut session
        )
        .is_err()
    );
    // dynamically loaded predicates are gated off
    assert!(
        run_query(
            &format!(r#"file "{input}" | where load "lib.so" pred | show"#),
            &env,
            &mut session
        )
        .is_err()
    );
}

#[test]
fn unopenable_file_contributes_no_rows() -> Result<()> {
    let env = Env::local();
    let mut session = Session::new(false);
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("out.txt").to_string_lossy().to_string();
    // the run itself succeeds; the worker just has nothing to read
    run_query(
        &format!(r#"file "no_such_file_anywhere" | where $1 > 0 | show "{out}""#),
        &env,
        &mut session,
    )?;
    assert!(lines_of(&out).is_empty());
    Ok(())
}
