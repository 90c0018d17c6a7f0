//! Source helpers and the loader contract.
//!
//! The heavy file loader (character-level parsing, glob expansion,
//! byte-range division) lives outside the engine; this module defines the
//! contract it honors — [`ParseStatus`] and the `(strings, numbers)` row
//! shape — plus the sources the engine ships with: [`from_mem`] for
//! in-memory rows, [`kick`] for driving side-effecting pipelines, and a
//! deliberately thin delimited-file reader, [`FromFile`], that divides a
//! file across the assigned ranks by row ranges.

use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::{Context, Result};
use tracing::warn;

use crate::ops::RiseSource;
use crate::row::{Field, Row};

/// Verdict a loader's parse hook gives for each record it scans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseStatus {
    /// Record boundary reached; the row is complete.
    Break,
    /// Mid-record; keep feeding input.
    NoBreak,
    /// The boundary belonged to the previous record.
    PriorBreak,
    /// Skip this record entirely.
    Ignore,
    /// No more records in this range.
    EndOfData,
    /// The underlying file is exhausted.
    EndOfFile,
}

/// The row shape the loader hands the engine: string columns and numeric
/// columns, already split.
pub type LoadedRow = (Vec<String>, Vec<f64>);

/// Parse hook signature the loader honors.
pub type ParseHook = Box<dyn FnMut(&str, &mut LoadedRow) -> ParseStatus>;

/// Flatten a loaded row into engine fields: strings first, numbers after.
pub fn flatten(loaded: LoadedRow) -> Row {
    let (strs, nums) = loaded;
    let mut row = Row::with_capacity(strs.len() + nums.len());
    row.extend(strs.into_iter().map(Field::Str));
    row.extend(nums.into_iter().map(Field::Num));
    row
}

const BATCH: usize = 1 << 10;

/// In-memory source; each rank produces its own contiguous slice.
pub struct FromMem {
    rows: Vec<Row>,
    at: usize,
    end: usize,
}

/// Rows from a vector, divided across the assigned ranks.
pub fn from_mem(rows: Vec<Row>) -> FromMem {
    let end = rows.len();
    FromMem { rows, at: 0, end }
}

impl RiseSource for FromMem {
    fn init(&mut self, pos: usize, ranks: &[usize]) {
        let n = ranks.len().max(1);
        let len = self.rows.len();
        let chunk = len.div_ceil(n);
        self.at = (pos * chunk).min(len);
        self.end = ((pos + 1) * chunk).min(len);
    }

    fn next(&mut self) -> Result<Option<Vec<Row>>> {
        if self.at >= self.end {
            return Ok(None);
        }
        let upto = (self.at + BATCH).min(self.end);
        let batch = self.rows[self.at..upto].to_vec();
        self.at = upto;
        Ok(Some(batch))
    }
}

/// Invoke the downstream `times` times per rank with an empty row; useful
/// when the pipeline's work happens in its stages, not its source.
pub struct Kick {
    times: usize,
    left: usize,
}

pub fn kick(times: usize) -> Kick {
    Kick { times, left: 0 }
}

impl RiseSource for Kick {
    fn init(&mut self, _pos: usize, _ranks: &[usize]) {
        self.left = self.times;
    }

    fn next(&mut self) -> Result<Option<Vec<Row>>> {
        if self.left == 0 {
            return Ok(None);
        }
        let n = self.left.min(BATCH);
        self.left -= n;
        Ok(Some(vec![Row::new(); n]))
    }
}

/// Thin delimited-file source.
///
/// Selects the given string and numeric columns (1-based file positions)
/// out of each record, producing rows laid out strings-first. The file is
/// divided across ranks by row ranges. In strict mode a malformed row is
/// dropped; otherwise missing or unparsable cells are padded (empty
/// string, `0.0`). An unopenable file logs a warning and the worker
/// contributes no rows.
pub struct FromFile {
    path: String,
    str_cols: Vec<usize>,
    num_cols: Vec<usize>,
    strict: bool,
    delimiter: Option<u8>,
    has_header: bool,
    slice: Vec<Row>,
    at: usize,
}

pub fn from_file(
    path: impl Into<String>,
    str_cols: Vec<usize>,
    num_cols: Vec<usize>,
) -> FromFile {
    FromFile {
        path: path.into(),
        str_cols,
        num_cols,
        strict: false,
        delimiter: None,
        has_header: false,
        slice: Vec::new(),
        at: 0,
    }
}

impl FromFile {
    /// Drop malformed rows instead of padding them.
    pub fn strict(mut self, flag: bool) -> Self {
        self.strict = flag;
        self
    }

    /// Split records on this byte instead of whitespace.
    pub fn delimiter(mut self, d: u8) -> Self {
        self.delimiter = Some(d);
        self
    }

    /// Skip the first line (a header of column names).
    pub fn has_header(mut self, flag: bool) -> Self {
        self.has_header = flag;
        self
    }

    /// Number of columns rows from this source have.
    pub fn width(&self) -> usize {
        self.str_cols.len() + self.num_cols.len()
    }

    fn parse_record(&self, cells: &[&str]) -> Option<Row> {
        let mut row = Row::with_capacity(self.width());
        for &c in &self.str_cols {
            match cells.get(c - 1) {
                Some(s) => row.push(Field::Str((*s).to_string())),
                None if self.strict => return None,
                None => row.push(Field::Str(String::new())),
            }
        }
        for &c in &self.num_cols {
            match cells.get(c - 1).map(|s| s.parse::<f64>()) {
                Some(Ok(x)) => row.push(Field::Num(x)),
                _ if self.strict => return None,
                _ => row.push(Field::Num(0.0)),
            }
        }
        Some(row)
    }

    fn load_all(&self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        match self.delimiter {
            Some(d) => {
                let mut rdr = csv::ReaderBuilder::new()
                    .delimiter(d)
                    .has_headers(self.has_header)
                    .flexible(true)
                    .from_path(&self.path)
                    .with_context(|| format!("open {}", self.path))?;
                for rec in rdr.records() {
                    let rec = rec.with_context(|| format!("read record from {}", self.path))?;
                    let cells: Vec<&str> = rec.iter().map(str::trim).collect();
                    if let Some(row) = self.parse_record(&cells) {
                        rows.push(row);
                    }
                }
            }
            None => {
                let f = File::open(&self.path).with_context(|| format!("open {}", self.path))?;
                for (i, line) in BufReader::new(f).lines().enumerate() {
                    let line = line.with_context(|| format!("read {}", self.path))?;
                    if i == 0 && self.has_header {
                        continue;
                    }
                    if line.trim().is_empty() {
                        continue;
                    }
                    let cells: Vec<&str> = line.split_whitespace().collect();
                    if let Some(row) = self.parse_record(&cells) {
                        rows.push(row);
                    }
                }
            }
        }
        Ok(rows)
    }
}

impl RiseSource for FromFile {
    fn init(&mut self, pos: usize, ranks: &[usize]) {
        let all = match self.load_all() {
            Ok(rows) => rows,
            Err(e) => {
                warn!("{e:#}; this worker contributes no rows");
                Vec::new()
            }
        };
        let n = ranks.len().max(1);
        let chunk = all.len().div_ceil(n);
        let at = (pos * chunk).min(all.len());
        let end = ((pos + 1) * chunk).min(all.len());
        self.slice = all[at..end].to_vec();
        self.at = 0;
    }

    fn next(&mut self) -> Result<Option<Vec<Row>>> {
        if self.at >= self.slice.len() {
            self.slice = Vec::new();
            self.at = 0;
            return Ok(None);
        }
        let upto = (self.at + BATCH).min(self.slice.len());
        let batch = self.slice[self.at..upto].to_vec();
        self.at = upto;
        Ok(Some(batch))
    }
}

/// Read only the first line of a file and split it into column names.
pub fn read_header(path: &str, delimiter: Option<u8>) -> Result<Vec<String>> {
    let f = File::open(path).with_context(|| format!("open {path}"))?;
    let mut line = String::new();
    BufReader::new(f)
        .read_line(&mut line)
        .with_context(|| format!("read header of {path}"))?;
    let line = line.trim();
    Ok(match delimiter {
        Some(d) => line
            .split(d as char)
            .map(|s| s.trim().to_string())
            .collect(),
        None => line.split_whitespace().map(str::to_string).collect(),
    })
}
