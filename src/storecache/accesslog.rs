//! Cache access log
//!
//! A single append-only text file, `store.log`, of newline-terminated
//! cache-file relative paths, one per access. Replaying it at startup
//! reconstructs the LRU order of the previous run; a compact rewrite
//! bounds its size.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::errors::Result;

/// Growth factor past which the log is rewritten compactly.
const COMPACT_FACTOR: usize = 10;

pub(crate) struct AccessLog {
    path: PathBuf,
    file: BufWriter<File>,
    /// Lines appended since the last compact rewrite.
    appended: usize,
    /// Line count of the last compact rewrite.
    compact_base: usize,
}

impl AccessLog {
    /// Open (creating if needed) the log at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            appended: 0,
            compact_base: 0,
        })
    }

    /// All recorded accesses, oldest first. Read before any appends of
    /// the current run.
    pub fn replay(&self) -> Result<Vec<String>> {
        let mut contents = String::new();
        File::open(&self.path)?.read_to_string(&mut contents)?;
        Ok(contents
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    /// Record one access.
    pub fn append(&mut self, rel_path: &str) -> Result<()> {
        writeln!(self.file, "{rel_path}")?;
        self.appended += 1;
        Ok(())
    }

    /// True once the log has outgrown its last compact form.
    pub fn needs_compaction(&self) -> bool {
        self.appended > COMPACT_FACTOR * self.compact_base.max(1)
    }

    /// Replace the log with exactly `lines`, ordered least recently
    /// used first so that replaying reconstructs the same LRU order.
    pub fn rewrite<'a>(&mut self, lines: impl Iterator<Item = &'a str>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let mut count = 0;
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for line in lines {
                writeln!(out, "{line}")?;
                count += 1;
            }
            out.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        self.file = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        self.appended = 0;
        self.compact_base = count;
        Ok(())
    }

    /// Flush buffered appends to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}
