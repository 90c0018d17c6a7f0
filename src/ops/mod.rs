//! Stage operators: the units a pipeline is made of.
//!
//! Each operator implements [`Op`](crate::node::Op) and names up to three
//! column selections: F (what the user function sees), O (how the output
//! row is shaped out of `concat(input, result)`), and for grouping
//! operators K and V (key and value columns). The builder computes and
//! validates the selections; operators trust them.

pub mod dump;
pub mod filter;
pub mod map;
pub mod noop;
pub mod reduce;
pub mod reduce_all;
pub mod rise;
pub mod zip;

pub use dump::{Collect, CollectHandle, Dump};
pub use filter::Filter;
pub use map::Map;
pub use noop::NoOp;
pub use reduce::{Reduce, ReduceFn};
pub use reduce_all::{GroupBuf, ReduceAll};
pub use rise::{Rise, RiseSource};
pub use zip::Zip;

use crate::row::{Field, Row};

/// What a row-transforming user function produced.
pub enum MapOut {
    /// One output row per input row.
    One(Row),
    /// Zero or many output rows per input row.
    Many(Vec<Row>),
}

impl From<Row> for MapOut {
    fn from(r: Row) -> Self {
        MapOut::One(r)
    }
}

impl From<Vec<Row>> for MapOut {
    fn from(rs: Vec<Row>) -> Self {
        MapOut::Many(rs)
    }
}

/// Row-transforming function: sees the F-projection, returns result columns.
pub type MapFn = Box<dyn FnMut(&[Field]) -> MapOut>;

/// Predicate over the F-projection.
pub type FilterFn = Box<dyn FnMut(&[Field]) -> bool>;

/// Buffered group function: sees the key subrow and the whole group buffer.
pub type ReduceAllFn = Box<dyn FnMut(&[Field], &GroupBuf) -> MapOut>;
