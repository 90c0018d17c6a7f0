//! Column resolution: one walk over the AST that decides exactly which
//! file columns the source must load, binds header names, and rejects
//! malformed queries before any graph is built.
//!
//! Rejected here:
//! - a variable referenced before its declaration
//! - a variable declared twice
//! - a numeric column referenced by index after a reduce has committed
//!   to a key-set
//! - a later reduce whose key-set is not a superset of an earlier one's
//! - a declared variable colliding with a header column name

use std::collections::{BTreeSet, HashMap};

use anyhow::{Result, bail};

use super::ast::*;
use super::repl::Session;
use crate::io::read_header;

/// The file columns one source must load, in sorted order.
#[derive(Clone, Debug, Default)]
pub struct ColIndices {
    pub str_cols: Vec<usize>,
    pub num_cols: Vec<usize>,
}

/// Everything resolution learned about one query level.
#[derive(Clone, Debug, Default)]
pub struct Binding {
    pub cols: ColIndices,
    /// Declared `$x = …` variables, in order.
    pub vars: Vec<String>,
    /// Header name → numeric file column.
    pub name_num: HashMap<String, usize>,
    /// Header name → string file column.
    pub name_str: HashMap<String, usize>,
    /// Saved-value constants referenced by name.
    pub consts: HashMap<String, f64>,
    /// One binding per `zip` unit, in order.
    pub inner: Vec<Binding>,
}

struct Resolver<'a> {
    file: String,
    session: &'a Session,
    header: Option<Vec<String>>,
    used_str: BTreeSet<usize>,
    used_num: BTreeSet<usize>,
    out: Binding,
    /// Key-set of the first reduce, once one is seen.
    committed: Option<BTreeSet<usize>>,
    /// Aggregation count of the most recent reduce.
    agg_count: usize,
}

impl<'a> Resolver<'a> {
    fn new(file: String, session: &'a Session) -> Self {
        Self {
            file,
            session,
            header: None,
            used_str: BTreeSet::new(),
            used_num: BTreeSet::new(),
            out: Binding::default(),
            committed: None,
            agg_count: 0,
        }
    }

    fn header_pos(&mut self, name: &str) -> Result<Option<usize>> {
        if self.header.is_none() {
            self.header = Some(read_header(&self.file, None).unwrap_or_default());
        }
        Ok(self
            .header
            .as_ref()
            .unwrap()
            .iter()
            .position(|h| h == name)
            .map(|i| i + 1))
    }

    fn math(&mut self, e: &MathExpr) -> Result<()> {
        match e {
            MathExpr::Num(_) => Ok(()),
            MathExpr::NumCol(n) => {
                if let Some(_keys) = &self.committed {
                    if *n == 0 || *n > self.agg_count {
                        bail!(
                            "numeric column ${n} is gone after reduce; only the {} \
                             aggregation result(s) remain",
                            self.agg_count
                        );
                    }
                    return Ok(());
                }
                self.used_num.insert(*n);
                Ok(())
            }
            MathExpr::Var(name) => {
                if self.out.vars.contains(name) {
                    return Ok(());
                }
                if self.committed.is_some() {
                    bail!("'{name}' is not available after reduce");
                }
                if let Some(col) = self.header_pos(name)? {
                    self.out.name_num.insert(name.clone(), col);
                    self.used_num.insert(col);
                    return Ok(());
                }
                if let Some(&v) = self.session.saved_nums.get(name) {
                    self.out.consts.insert(name.clone(), v);
                    return Ok(());
                }
                bail!("'{name}' used before declaration")
            }
            MathExpr::Neg(inner) => self.math(inner),
            MathExpr::Bin(_, a, b) => {
                self.math(a)?;
                self.math(b)
            }
        }
    }

    fn str_ref(&mut self, r: &StrRef) -> Result<usize> {
        let col = match r {
            StrRef::Col(n) => *n,
            StrRef::Name(name) => match self.header_pos(name)? {
                Some(col) => {
                    self.out.name_str.insert(name.clone(), col);
                    col
                }
                None => bail!("'{name}' is not a header column of {}", self.file),
            },
        };
        if let Some(keys) = &self.committed {
            if !keys.contains(&col) {
                bail!("string column %{col} was not kept by the earlier reduce");
            }
            return Ok(col);
        }
        self.used_str.insert(col);
        Ok(col)
    }

    fn logic(&mut self, e: &LogicExpr) -> Result<()> {
        match e {
            LogicExpr::Cmp(_, a, b) => {
                self.math(a)?;
                self.math(b)
            }
            LogicExpr::StrCmp(_, r, _) => {
                self.str_ref(r)?;
                Ok(())
            }
            LogicExpr::And(a, b) | LogicExpr::Or(a, b) => {
                self.logic(a)?;
                self.logic(b)
            }
            LogicExpr::Not(a) => self.logic(a),
            LogicExpr::LoadCmd { lib, symbol } => {
                bail!(
                    "native predicate loading ({lib}:{symbol}) is not enabled \
                     in this build"
                )
            }
        }
    }

    fn unit(&mut self, u: &Unit) -> Result<()> {
        match u {
            Unit::Let { name, expr } => {
                self.math(expr)?;
                if self.committed.is_some() {
                    bail!("'{name}' can not be declared after reduce");
                }
                if self.out.vars.contains(name) {
                    bail!("'{name}' declared twice");
                }
                if self.header_pos(name)?.is_some() {
                    bail!("'{name}' collides with a header column name");
                }
                self.out.vars.push(name.clone());
                Ok(())
            }
            Unit::Where(l) => self.logic(l),
            Unit::Reduce { keys, aggs } => {
                if keys.is_empty() && self.committed.is_some() {
                    bail!("a later reduce must keep the earlier key columns");
                }
                let mut key_cols = BTreeSet::new();
                for k in keys {
                    key_cols.insert(self.str_ref(k)?);
                }
                if let Some(prev) = &self.committed
                    && !prev.is_subset(&key_cols)
                {
                    bail!("a later reduce's key columns must include the earlier ones");
                }
                for a in aggs {
                    if let Some(arg) = &a.arg {
                        self.math(arg)?;
                    }
                }
                self.committed = Some(key_cols);
                self.agg_count = aggs.len();
                Ok(())
            }
            Unit::Zip { keys, inner } => {
                for k in keys {
                    self.str_ref(k)?;
                }
                // the inner source must load its side of the key columns
                // even when the inner units never mention them
                let inner_bind = resolve_with_keys(inner, self.session, keys)?;
                self.out.inner.push(inner_bind);
                Ok(())
            }
        }
    }

    /// When a query references no numeric column at all (`file "l" | zip …
    /// | show`), every column of the first data line that parses as a
    /// number is loaded, so sinks and zips still see the file's values.
    fn probe_num_cols(&self) -> Vec<usize> {
        let skip_header = !self.out.name_num.is_empty() || !self.out.name_str.is_empty();
        let Ok(f) = std::fs::File::open(&self.file) else {
            return Vec::new();
        };
        use std::io::BufRead;
        let mut lines = std::io::BufReader::new(f).lines();
        if skip_header {
            let _ = lines.next();
        }
        let Some(Ok(line)) = lines.next() else {
            return Vec::new();
        };
        line.split_whitespace()
            .enumerate()
            .filter(|(i, cell)| cell.parse::<f64>().is_ok() && !self.used_str.contains(&(i + 1)))
            .map(|(i, _)| i + 1)
            .collect()
    }

    fn finish(mut self, q: &QueryExpr) -> Result<Binding> {
        for u in &q.units {
            self.unit(u)?;
        }
        if let Terminal::SaveVal(items) = &q.terminal {
            for item in items {
                if let ValRef::NumName(name) | ValRef::StrName(name) = &item.src
                    && !self.out.vars.contains(name)
                {
                    bail!("'{name}' used before declaration");
                }
            }
        }
        if self.used_num.is_empty() {
            for c in self.probe_num_cols() {
                self.used_num.insert(c);
            }
        }
        self.out.cols.str_cols = self.used_str.iter().copied().collect();
        self.out.cols.num_cols = self.used_num.iter().copied().collect();
        if self.out.cols.str_cols.is_empty() && self.out.cols.num_cols.is_empty() {
            bail!("at least one column must be loaded from the file");
        }
        Ok(self.out)
    }
}

fn resolve_with_keys(q: &QueryExpr, session: &Session, keys: &[StrRef]) -> Result<Binding> {
    let mut r = Resolver::new(q.file.clone(), session);
    for k in keys {
        r.str_ref(k)?;
    }
    r.finish(q)
}

/// Resolve a full query against the running session.
pub fn resolve(q: &QueryExpr, session: &Session) -> Result<Binding> {
    let mut r = Resolver::new(q.file.clone(), session);
    r.finish(q)
}
