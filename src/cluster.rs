//! The worker pool: N single-threaded engines running the same program.
//!
//! [`Pool::run`] spawns one OS thread per rank, wires every pair with
//! bounded channels, and runs the same closure on each — the closure builds
//! and runs identical pipelines everywhere, and the bridges route rows
//! between ranks. No state is shared between workers; everything crossing a
//! rank boundary goes through the [`Comm`](crate::comm::Comm) endpoint as a
//! serialized message.

use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::bounded;

use crate::comm::{CHANNEL_CAP, Comm, Message};
use crate::sched::Env;

/// A fixed-size pool of communicating workers.
pub struct Pool {
    nprocs: usize,
}

impl Pool {
    pub fn new(nprocs: usize) -> Self {
        Self {
            nprocs: nprocs.max(1),
        }
    }

    pub fn nprocs(&self) -> usize {
        self.nprocs
    }

    /// Run `f` on every rank and collect the per-rank results in rank
    /// order. The pool size is fixed for the whole call; a worker error or
    /// panic fails the run.
    pub fn run<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        F: Fn(Env) -> Result<T> + Send + Sync,
        T: Send,
    {
        let mut senders = Vec::with_capacity(self.nprocs);
        let mut inboxes = Vec::with_capacity(self.nprocs);
        for _ in 0..self.nprocs {
            let (tx, rx) = bounded::<Message>(CHANNEL_CAP);
            senders.push(tx);
            inboxes.push(rx);
        }

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.nprocs);
            for (rank, inbox) in inboxes.into_iter().enumerate() {
                let peers = senders.clone();
                let f = &f;
                handles.push(scope.spawn(move || {
                    let env = Env::clustered(Comm::new(rank, peers, inbox));
                    f(env)
                }));
            }
            drop(senders);

            let mut out = Vec::with_capacity(self.nprocs);
            for (rank, handle) in handles.into_iter().enumerate() {
                let res = match handle.join() {
                    Ok(res) => res,
                    // a panic is not an engine error; let the caller's
                    // panic handling decide what it means
                    Err(payload) => std::panic::resume_unwind(payload),
                };
                out.push(res.with_context(|| format!("worker {rank} failed"))?);
            }
            Ok(out)
        })
    }
}
