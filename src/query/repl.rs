//! The interactive loop, built out of the engine itself.
//!
//! The REPL is a pipeline: a rise pinned to rank 0 reads stdin and
//! validates each line, a broadcast (dupe) task-parallel filter executes
//! every accepted query on every worker. Each accepted query plans and
//! runs as a nested run inside that filter, exactly like a one-shot
//! query would.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use anyhow::Result;

use super::parse::parse_query;
use super::plan::run_query;
use super::resolve::resolve;
use crate::graph::Graph;
use crate::row::Field;
use crate::sched::{Env, ParMode, ProcReq};
use crate::stream::rise;

/// Per-session state: saved queries and saved values. Kept in step on
/// every rank so later queries resolve identically everywhere.
#[derive(Clone, Debug, Default)]
pub struct Session {
    pub saved_queries: HashMap<String, String>,
    pub saved_nums: HashMap<String, f64>,
    pub saved_strs: HashMap<String, String>,
    /// Strict row parsing: drop malformed rows instead of padding them.
    pub strict: bool,
}

impl Session {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            ..Self::default()
        }
    }
}

fn read_one_line() -> Option<String> {
    print!("> ");
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

/// Run the interactive loop; returns when the user quits.
pub fn repl(env: &Env, session: Session) -> Result<Session> {
    let session = Rc::new(RefCell::new(session));
    if env.rank() == 0 {
        println!("\ntype queries, or [q or Q] to quit");
        println!("e.g.: file \"t\" | $xz = $1 + ($2 * 3) | where $xz == 5.0 * 2 | show\n");
    }

    let g = Graph::default();
    let reader_session = Rc::clone(&session);
    let reader = crate::ops::rise::SingleFn(move || {
        loop {
            let Some(line) = read_one_line() else {
                return (vec![], false);
            };
            if line.is_empty() || line.starts_with('q') || line.starts_with('Q') {
                return (vec![], false);
            }
            // validate before broadcasting so a typo costs nothing
            let ok = parse_query(&line)
                .and_then(|q| resolve(&q, &reader_session.borrow()).map(|_| q));
            match ok {
                Ok(_) => return (vec![Field::Str(line)], true),
                Err(e) => println!("error: {e:#}"),
            }
        }
    });

    let run_env = env.clone();
    let run_session = Rc::clone(&session);
    rise(&g, reader, 1)
        .prll(ProcReq::Ranks(vec![0]))?
        .filter(move |row: &[Field]| {
            let Some(line) = row[0].as_str() else {
                return false;
            };
            if line.is_empty() {
                return false;
            }
            let mut s = run_session.borrow_mut();
            if let Err(e) = run_query(line, &run_env, &mut s) {
                if run_env.rank() == 0 {
                    println!("error: {e:#}");
                }
            }
            true
        })?
        .prll_mode(ProcReq::Ratio(1.0), ParMode::dupe().and_task())?
        .run(env)?;

    let session = Rc::try_unwrap(session)
        .map(RefCell::into_inner)
        .unwrap_or_else(|rc| rc.borrow().clone());
    Ok(session)
}
