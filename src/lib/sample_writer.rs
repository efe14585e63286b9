//! Appends demultiplexed read pairs to the per-bucket `<bucket>_forward` / `<bucket>_reverse`
//! files.
//!
//! Files are opened in append mode whenever a bucket without open handles receives a pair, so
//! running twice over the same inputs doubles the contents of every output file.  At most a fixed
//! number of buckets hold open handles at once; the least recently written bucket is flushed and
//! closed to make room, and reopened in append mode if it receives another pair.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use ahash::AHashMap;
use anyhow::{Context, Result};
use gzp::BUFSIZE;
use log::debug;

use crate::{
    fastq::{ReadRecord, Trim},
    utils::filenames,
};

/// The default number of buckets that may have open file handles at once.
pub const DEFAULT_MAX_OPEN_BUCKETS: usize = 64;

/// The pair of buffered writers for one bucket.
#[derive(Debug)]
struct BucketWriter {
    forward_path: PathBuf,
    reverse_path: PathBuf,
    forward: BufWriter<File>,
    reverse: BufWriter<File>,
    last_used: u64,
}

impl BucketWriter {
    fn open(bucket: &str, output_dir: &Path) -> Result<Self> {
        let (forward_path, reverse_path) = filenames(bucket, output_dir);
        debug!("Opening {} and {} for appending", forward_path.display(), reverse_path.display());
        Ok(Self {
            forward: open_for_append(&forward_path)?,
            reverse: open_for_append(&reverse_path)?,
            forward_path,
            reverse_path,
            last_used: 0,
        })
    }

    fn write_pair(
        &mut self,
        forward: &ReadRecord,
        forward_trim: Trim,
        reverse: &ReadRecord,
        reverse_trim: Trim,
    ) -> Result<()> {
        forward
            .write_trimmed(&mut self.forward, forward_trim)
            .with_context(|| format!("Failed to write to {}", self.forward_path.display()))?;
        reverse
            .write_trimmed(&mut self.reverse, reverse_trim)
            .with_context(|| format!("Failed to write to {}", self.reverse_path.display()))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.forward
            .flush()
            .with_context(|| format!("Failed to flush {}", self.forward_path.display()))?;
        self.reverse
            .flush()
            .with_context(|| format!("Failed to flush {}", self.reverse_path.display()))
    }
}

fn open_for_append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Unable to open file for appending: {}", path.display()))?;
    Ok(BufWriter::with_capacity(BUFSIZE, file))
}

/// Appends pairs to bucket files, keeping at most `max_open` buckets' files open at a time.
///
/// Dropping without calling [`SampleWriters::finish`] still flushes buffered records (errors are
/// ignored in that case) since each handle is a [`BufWriter`].
#[derive(Debug)]
pub struct SampleWriters {
    output_dir: PathBuf,
    max_open: usize,
    writers: AHashMap<String, BucketWriter>,
    pairs_written: AHashMap<String, usize>,
    clock: u64,
}

impl SampleWriters {
    /// Create a new [`SampleWriters`] writing into `output_dir` with at most
    /// [`DEFAULT_MAX_OPEN_BUCKETS`] buckets open.  No files are opened yet.
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self::with_max_open(output_dir, DEFAULT_MAX_OPEN_BUCKETS)
    }

    /// Create a new [`SampleWriters`] that keeps at most `max_open` buckets (two files each) open.
    /// A `max_open` of 0 is treated as 1.
    pub fn with_max_open<P: AsRef<Path>>(output_dir: P, max_open: usize) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            max_open: max_open.max(1),
            writers: AHashMap::new(),
            pairs_written: AHashMap::new(),
            clock: 0,
        }
    }

    /// Append a pair to the bucket's files, opening them first if needed.
    pub fn write_pair(
        &mut self,
        bucket: &str,
        forward: &ReadRecord,
        forward_trim: Trim,
        reverse: &ReadRecord,
        reverse_trim: Trim,
    ) -> Result<()> {
        self.clock += 1;
        if let Some(writer) = self.writers.get_mut(bucket) {
            writer.last_used = self.clock;
            writer.write_pair(forward, forward_trim, reverse, reverse_trim)?;
        } else {
            if self.writers.len() >= self.max_open {
                self.close_least_recently_used()?;
            }
            let mut writer = BucketWriter::open(bucket, &self.output_dir)?;
            writer.last_used = self.clock;
            writer.write_pair(forward, forward_trim, reverse, reverse_trim)?;
            self.writers.insert(bucket.to_string(), writer);
        }

        if let Some(count) = self.pairs_written.get_mut(bucket) {
            *count += 1;
        } else {
            self.pairs_written.insert(bucket.to_string(), 1);
        }
        Ok(())
    }

    fn close_least_recently_used(&mut self) -> Result<()> {
        let oldest = self
            .writers
            .iter()
            .min_by_key(|(_, writer)| writer.last_used)
            .map(|(bucket, _)| bucket.clone());
        if let Some(mut writer) = oldest.and_then(|bucket| self.writers.remove(&bucket)) {
            let (fwd, rev) = (writer.forward_path.display(), writer.reverse_path.display());
            debug!("Closing {} and {}", fwd, rev);
            writer.flush()?;
        }
        Ok(())
    }

    /// The number of pairs written to `bucket` by this instance.
    pub fn pairs_written(&self, bucket: &str) -> usize {
        self.pairs_written.get(bucket).copied().unwrap_or(0)
    }

    /// The number of buckets whose files are currently open.
    pub fn open_buckets(&self) -> usize {
        self.writers.len()
    }

    /// Consumes [`Self`], flushing every open writer.
    pub fn finish(mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}
