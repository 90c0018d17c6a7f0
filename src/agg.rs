//! Prebuilt reduction functions.
//!
//! These are ordinary reducer values in the same canonical shapes user
//! closures take, so they drop into [`Stream::reduce`](crate::Stream) and
//! [`Stream::reduce_all`](crate::Stream) like anything hand-written.
//! Streaming reducers here are all in-place; pair them with the matching
//! `init` helpers for the accumulator seed.

use ordered_float::OrderedFloat;

use crate::ops::{GroupBuf, MapOut, ReduceFn};
use crate::row::{Field, Row};

/// Accumulator seed of `n` numeric zeros.
pub fn zeros(n: usize) -> Row {
    vec![Field::Num(0.0); n]
}

/// Count rows per key. Seed with `zeros(1)`.
pub fn count() -> ReduceFn {
    ReduceFn::InPlace(Box::new(|acc, _key, _val| {
        if let Field::Num(n) = &mut acc[0] {
            *n += 1.0;
        }
    }))
}

/// Elementwise sum of the numeric value columns. Seed with
/// `zeros(value_width)`.
pub fn sum() -> ReduceFn {
    ReduceFn::InPlace(Box::new(|acc, _key, val| {
        for (a, v) in acc.iter_mut().zip(val) {
            if let (Field::Num(a), Some(x)) = (a, v.as_num()) {
                *a += x;
            }
        }
    }))
}

/// Elementwise minimum of the numeric value columns. Seed with
/// `vec![Field::Num(f64::INFINITY); value_width]`.
pub fn min_of() -> ReduceFn {
    ReduceFn::InPlace(Box::new(|acc, _key, val| {
        for (a, v) in acc.iter_mut().zip(val) {
            if let (Field::Num(a), Some(x)) = (a, v.as_num())
                && x < *a
            {
                *a = x;
            }
        }
    }))
}

/// Elementwise maximum of the numeric value columns. Seed with
/// `vec![Field::Num(f64::NEG_INFINITY); value_width]`.
pub fn max_of() -> ReduceFn {
    ReduceFn::InPlace(Box::new(|acc, _key, val| {
        for (a, v) in acc.iter_mut().zip(val) {
            if let (Field::Num(a), Some(x)) = (a, v.as_num())
                && x > *a
            {
                *a = x;
            }
        }
    }))
}

/// Running `[sum, count]` pair for a single numeric value column; divide
/// at the end for the mean. Seed with `zeros(2)`.
pub fn mean_parts() -> ReduceFn {
    ReduceFn::InPlace(Box::new(|acc, _key, val| {
        if let Some(x) = val.first().and_then(Field::as_num) {
            if let Field::Num(s) = &mut acc[0] {
                *s += x;
            }
            if let Field::Num(n) = &mut acc[1] {
                *n += 1.0;
            }
        }
    }))
}

/// Buffered statistics over one value column:
/// `[count, mean, stddev, min, max]` per group.
pub fn summary(col: usize) -> impl FnMut(&[Field], &GroupBuf) -> MapOut {
    move |_key, buf| {
        let xs = buf.col_nums(col);
        let n = xs.len() as f64;
        if xs.is_empty() {
            return MapOut::Many(Vec::new());
        }
        let mean = xs.iter().sum::<f64>() / n;
        let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
        let min = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        MapOut::One(vec![
            Field::Num(n),
            Field::Num(mean),
            Field::Num(var.sqrt()),
            Field::Num(min),
            Field::Num(max),
        ])
    }
}

/// Buffered histogram over one value column: one `[bin_low, count]` row
/// per occupied bin.
pub fn hist(col: usize, bins: usize) -> impl FnMut(&[Field], &GroupBuf) -> MapOut {
    move |_key, buf| {
        let xs = buf.col_nums(col);
        if xs.is_empty() || bins == 0 {
            return MapOut::Many(Vec::new());
        }
        let min = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let span = if max > min { max - min } else { 1.0 };
        let mut counts = vec![0usize; bins];
        for x in &xs {
            let mut b = ((x - min) / span * bins as f64) as usize;
            if b >= bins {
                b = bins - 1;
            }
            counts[b] += 1;
        }
        MapOut::Many(
            counts
                .iter()
                .enumerate()
                .filter(|&(_, &c)| c > 0)
                .map(|(i, &c)| {
                    vec![
                        Field::Num(min + span * i as f64 / bins as f64),
                        Field::Num(c as f64),
                    ]
                })
                .collect(),
        )
    }
}

/// Buffered median of one value column.
pub fn median(col: usize) -> impl FnMut(&[Field], &GroupBuf) -> MapOut {
    move |_key, buf| {
        let mut xs: Vec<OrderedFloat<f64>> =
            buf.col_nums(col).into_iter().map(OrderedFloat).collect();
        if xs.is_empty() {
            return MapOut::Many(Vec::new());
        }
        xs.sort();
        let mid = xs.len() / 2;
        let m = if xs.len() % 2 == 0 {
            (xs[mid - 1].0 + xs[mid].0) / 2.0
        } else {
            xs[mid].0
        };
        MapOut::One(vec![Field::Num(m)])
    }
}
