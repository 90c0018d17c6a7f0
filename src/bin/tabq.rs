//! tabq: interactive and one-shot query runner over the tabflow engine.
//!
//! With no argument, rank 0 runs a REPL and every accepted query executes
//! across the pool; with a query argument, the pool runs it once and
//! exits. Exit code 0 on success, 1 on an engine error, 2 on anything
//! unexpected.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tabflow::Pool;
use tabflow::query::{Session, repl, run_query};

#[derive(Parser, Debug)]
#[command(name = "tabq", about = "query tabular files with a dataflow pool")]
struct Cli {
    /// A query to run once; omit for the interactive loop.
    query: Option<String>,

    /// Worker pool size.
    #[arg(long)]
    workers: Option<usize>,

    /// Drop malformed rows instead of padding them.
    #[arg(long)]
    strict: bool,

    /// Log filter, e.g. "info" or "tabflow=debug".
    #[arg(long)]
    log: Option<String>,
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let pool = Pool::new(cli.workers.unwrap_or_else(num_cpus::get));
    let strict = cli.strict;
    match &cli.query {
        Some(q) => {
            let q = q.clone();
            pool.run(move |env| {
                let mut session = Session::new(strict);
                run_query(&q, &env, &mut session)
            })?;
        }
        None => {
            pool.run(move |env| repl(&env, Session::new(strict)))?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = cli
        .log
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match std::panic::catch_unwind(|| run(&cli)) {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
        Err(_) => {
            eprintln!("unknown error");
            ExitCode::from(2)
        }
    }
}
