//! Sinks: write rows to a file or stdout, or buffer them in memory.

use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::rc::Rc;

use anyhow::{Context, Result};
use tracing::warn;

use crate::graph::Downstream;
use crate::node::{Op, OpCtx, ParForward};
use crate::row::{Row, format_row};
use crate::sched::Par;

/// File/stdout sink.
///
/// When the upstream task runs on more than one rank and a file name is
/// given, the name is decorated with the worker rank (`name_pN.ext`) so
/// each worker owns its own file. A non-empty header becomes the first
/// line: every worker writes it to its own file, but on stdout only the
/// position-0 worker does.
pub struct Dump {
    fname: String,
    header: String,
    writer: Option<BufWriter<std::fs::File>>,
    broken: bool,
    parred: bool,
}

impl Dump {
    pub fn new(fname: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            fname: fname.into(),
            header: header.into(),
            writer: None,
            broken: false,
            parred: false,
        }
    }

    fn decorated(&self, par: &Par) -> String {
        if par.nproc() <= 1 {
            return self.fname.clone();
        }
        let (stem, ext) = match self.fname.rfind('.') {
            Some(dot) => (&self.fname[..dot], &self.fname[dot..]),
            None => (self.fname.as_str(), ""),
        };
        format!("{stem}_p{}{ext}", par.rank())
    }
}

impl Op for Dump {
    fn on_par(&mut self, upstream: &Par, _dn: &Downstream, _ctx: &OpCtx) -> Result<ParForward> {
        if self.parred || !upstream.in_range() {
            return Ok(ParForward::Stop);
        }
        self.parred = true;
        if !self.fname.is_empty() {
            let name = self.decorated(upstream);
            match OpenOptions::new().create(true).append(true).open(&name) {
                Ok(f) => self.writer = Some(BufWriter::new(f)),
                Err(e) => {
                    warn!("can not write to file {name}: {e}");
                    self.broken = true;
                }
            }
        }
        if !self.header.is_empty()
            && !self.broken
            && (self.writer.is_some() || upstream.pos() == Some(0))
        {
            match &mut self.writer {
                Some(w) => writeln!(w, "{}", self.header).context("write header")?,
                None => println!("{}", self.header),
            }
        }
        Ok(ParForward::Stop)
    }

    fn on_row(&mut self, _port: usize, row: &Row, _dn: &Downstream, _ctx: &OpCtx) -> Result<()> {
        if self.broken {
            return Ok(());
        }
        match &mut self.writer {
            Some(w) => writeln!(w, "{}", format_row(row)).context("write row")?,
            None => println!("{}", format_row(row)),
        }
        Ok(())
    }

    fn on_end(&mut self, _sig: i32, _dn: &Downstream, _ctx: &OpCtx) -> Result<()> {
        if let Some(w) = &mut self.writer {
            w.flush().context("flush dump file")?;
        }
        self.writer = None;
        self.broken = false;
        self.parred = false;
        Ok(())
    }
}

/// Shared buffer a [`Collect`] sink fills; backs the builder's `get`.
#[derive(Clone, Default)]
pub struct CollectHandle {
    rows: Rc<RefCell<Vec<Row>>>,
}

impl CollectHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the collected rows out.
    pub fn take(&self) -> Vec<Row> {
        std::mem::take(&mut self.rows.borrow_mut())
    }
}

/// In-memory sink: buffers every row that reaches this worker.
pub struct Collect {
    handle: CollectHandle,
}

impl Collect {
    pub fn new(handle: CollectHandle) -> Self {
        Self { handle }
    }
}

impl Op for Collect {
    fn on_par(&mut self, _upstream: &Par, _dn: &Downstream, _ctx: &OpCtx) -> Result<ParForward> {
        Ok(ParForward::Stop)
    }

    fn on_row(&mut self, _port: usize, row: &Row, _dn: &Downstream, _ctx: &OpCtx) -> Result<()> {
        self.handle.rows.borrow_mut().push(row.clone());
        Ok(())
    }
}
