//! tabflow: a distributed dataflow engine for tabular data.
//!
//! Pipelines of typed column-transforming stages (source → map / filter /
//! reduce / reduceAll / zip → sink) run SPMD across a fixed pool of
//! message-passing workers. Rows are partitioned by key across *bridges* —
//! the inter-process shuffle — so per-key aggregation stays correct while
//! data parallelism does the heavy lifting.
//!
//! # Quick start
//!
//! ```no_run
//! use tabflow::{agg, io::from_mem, row, stream::rise, Env, Graph};
//!
//! # fn main() -> anyhow::Result<()> {
//! let env = Env::local();
//! let g = Graph::default();
//! let rows = vec![row!["a", 1.0], row!["b", 2.0], row!["a", 3.0]];
//! let out = rise(&g, from_mem(rows), 2)
//!     .reduce([1], agg::zeros(1), agg::sum())?
//!     .get(&env)?;
//! # let _ = out;
//! # Ok(())
//! # }
//! ```
//!
//! For multi-worker runs, [`Pool::run`] spawns the worker ranks and hands
//! each one an [`Env`]; the same pipeline-building code runs on every rank
//! and the bridges take care of the rest.

pub mod agg;
pub mod bridge;
pub mod cluster;
pub mod comm;
pub mod flow;
pub mod graph;
pub mod io;
pub mod node;
pub mod ops;
pub mod query;
pub mod row;
pub mod sched;
pub mod stream;

pub use cluster::Pool;
pub use flow::Flow;
pub use graph::{Graph, NodeId};
pub use ops::{GroupBuf, MapOut, ReduceFn, RiseSource};
pub use row::{Field, Row, Selection, concat};
pub use sched::{Env, Karta, Par, ParMode, ProcReq};
pub use stream::{Stream, flow_of, from_flow, rise};
