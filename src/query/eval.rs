//! Expression compilation: math and predicate ASTs become closures over
//! engine rows, with every column reference resolved to a row position at
//! compile time.

use std::collections::HashMap;

use anyhow::{Result, bail};

use super::ast::*;
use crate::row::Field;

/// Row-position bindings at one point in the pipeline.
#[derive(Clone, Debug, Default)]
pub struct PosEnv {
    /// String file column → 1-based row position.
    pub str_pos: HashMap<usize, usize>,
    /// Numeric file column → 1-based row position.
    pub num_pos: HashMap<usize, usize>,
    /// Declared variable → 1-based row position.
    pub var_pos: HashMap<String, usize>,
    /// Header name → file column, per side.
    pub name_num: HashMap<String, usize>,
    pub name_str: HashMap<String, usize>,
    /// Saved-value constants.
    pub consts: HashMap<String, f64>,
    /// After a reduce: 1-based row positions of the aggregation results;
    /// `$N` then means the N-th result.
    pub agg_pos: Option<Vec<usize>>,
}

type NumFn = Box<dyn Fn(&[Field]) -> f64>;
type BoolFn = Box<dyn Fn(&[Field]) -> bool>;

fn num_at(pos: usize) -> NumFn {
    Box::new(move |row| row[pos - 1].as_num().unwrap_or(0.0))
}

/// Compile arithmetic into a closure over the current row layout.
pub fn compile_math(e: &MathExpr, env: &PosEnv) -> Result<NumFn> {
    Ok(match e {
        MathExpr::Num(n) => {
            let n = *n;
            Box::new(move |_| n)
        }
        MathExpr::NumCol(c) => match &env.agg_pos {
            Some(aggs) => match aggs.get(*c - 1) {
                Some(&pos) => num_at(pos),
                None => bail!("no aggregation result ${c}"),
            },
            None => match env.num_pos.get(c) {
                Some(&pos) => num_at(pos),
                None => bail!("numeric column ${c} is not loaded"),
            },
        },
        MathExpr::Var(name) => {
            if let Some(&pos) = env.var_pos.get(name) {
                num_at(pos)
            } else if let Some(col) = env.name_num.get(name) {
                match env.num_pos.get(col) {
                    Some(&pos) => num_at(pos),
                    None => bail!("column '{name}' is not loaded"),
                }
            } else if let Some(&v) = env.consts.get(name) {
                Box::new(move |_| v)
            } else {
                bail!("'{name}' used before declaration")
            }
        }
        MathExpr::Neg(inner) => {
            let f = compile_math(inner, env)?;
            Box::new(move |row| -f(row))
        }
        MathExpr::Bin(op, a, b) => {
            let fa = compile_math(a, env)?;
            let fb = compile_math(b, env)?;
            match op {
                BinOp::Add => Box::new(move |row| fa(row) + fb(row)),
                BinOp::Sub => Box::new(move |row| fa(row) - fb(row)),
                BinOp::Mul => Box::new(move |row| fa(row) * fb(row)),
                BinOp::Div => Box::new(move |row| fa(row) / fb(row)),
            }
        }
    })
}

/// Row position of a string-column reference.
pub fn str_pos_of(r: &StrRef, env: &PosEnv) -> Result<usize> {
    let col = match r {
        StrRef::Col(n) => *n,
        StrRef::Name(name) => match env.name_str.get(name) {
            Some(&c) => c,
            None => bail!("'{name}' is not a known string column"),
        },
    };
    match env.str_pos.get(&col) {
        Some(&pos) => Ok(pos),
        None => bail!("string column %{col} is not loaded"),
    }
}

/// Compile a predicate into a closure over the current row layout.
pub fn compile_logic(e: &LogicExpr, env: &PosEnv) -> Result<BoolFn> {
    Ok(match e {
        LogicExpr::Cmp(op, a, b) => {
            let fa = compile_math(a, env)?;
            let fb = compile_math(b, env)?;
            let op = *op;
            Box::new(move |row| {
                let (x, y) = (fa(row), fb(row));
                match op {
                    CmpOp::Eq => x == y,
                    CmpOp::Ne => x != y,
                    CmpOp::Lt => x < y,
                    CmpOp::Gt => x > y,
                    CmpOp::Le => x <= y,
                    CmpOp::Ge => x >= y,
                }
            })
        }
        LogicExpr::StrCmp(op, r, lit) => {
            let pos = str_pos_of(r, env)?;
            let lit = lit.clone();
            let negate = matches!(op, CmpOp::Ne);
            if !matches!(op, CmpOp::Eq | CmpOp::Ne) {
                bail!("string columns compare with == or != only");
            }
            Box::new(move |row| {
                let eq = row[pos - 1].as_str() == Some(lit.as_str());
                eq != negate
            })
        }
        LogicExpr::And(a, b) => {
            let fa = compile_logic(a, env)?;
            let fb = compile_logic(b, env)?;
            Box::new(move |row| fa(row) && fb(row))
        }
        LogicExpr::Or(a, b) => {
            let fa = compile_logic(a, env)?;
            let fb = compile_logic(b, env)?;
            Box::new(move |row| fa(row) || fb(row))
        }
        LogicExpr::Not(a) => {
            let fa = compile_logic(a, env)?;
            Box::new(move |row| !fa(row))
        }
        LogicExpr::LoadCmd { lib, symbol } => {
            bail!("native predicate loading ({lib}:{symbol}) is not enabled in this build")
        }
    })
}
