#![forbid(unsafe_code)]
#![allow(clippy::must_use_candidate)]
//! Loading of the barcode manifest into an immutable [`BarcodeIndex`].
//!
//! The manifest is a header-less, comma-delimited file with one row per forward/reverse barcode
//! pair:
//!
//! ```text
//! <forward-barcode>,<reverse-barcode>,<sample-name>[,<forward-primer>,<reverse-primer>]
//! ```
//!
//! The primer columns are only read from the first row and must be present there.  Primers may
//! spell out degenerate positions as bracketed alternatives (e.g. `[CT]`); they are kept verbatim
//! here and compiled later by [`crate::primer::PrimerPattern`].

use std::{
    fmt::Display,
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use ahash::AHashMap;
use bstr::BString;
use csv::{ReaderBuilder, Trim};
use itertools::Itertools;
use log::debug;
use thiserror::Error;

/// The minimum number of fields on every manifest row.
const MIN_FIELDS: usize = 3;
/// The number of fields on the first manifest row, which also carries the primers.
const FIRST_ROW_FIELDS: usize = 5;

/// The line number (1-based) in the manifest where an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestLine(pub usize);

impl Display for ManifestLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}", self.0)
    }
}

/// The errors that may occur when loading the barcode manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Io error occurred")]
    Io(#[from] std::io::Error),

    #[error("Unable to parse the barcode manifest at {line}: {source}")]
    Csv { source: csv::Error, line: ManifestLine },

    #[error("The manifest row on {line} had {actual} fields, expected at least {expected}: {row}")]
    TooFewFields { actual: usize, expected: usize, line: ManifestLine, row: String },

    #[error(
        "The first manifest row ({line}) must also give the forward and reverse primers: {row}"
    )]
    MissingPrimers { line: ManifestLine, row: String },

    #[error("The barcode manifest contained no barcode records")]
    ZeroRecords,

    #[error(
        "Barcode combination {key} is assigned to both {first_sample} and {second_sample} ({line})"
    )]
    DuplicateBarcodeKey {
        key: String,
        first_sample: String,
        second_sample: String,
        line: ManifestLine,
    },
}

/// How to treat two manifest rows whose forward + reverse barcodes concatenate to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKeyPolicy {
    /// The later row silently replaces the earlier one.
    LastWriteWins,
    /// Loading fails with [`ManifestError::DuplicateBarcodeKey`].
    Strict,
}

impl Default for DuplicateKeyPolicy {
    fn default() -> Self {
        Self::LastWriteWins
    }
}

/// One row of the barcode manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodeRecord {
    pub forward_barcode: BString,
    pub reverse_barcode: BString,
    pub sample_name: String,
    /// The forward primer pattern, copied from the first row of the manifest.
    pub forward_primer_pattern: String,
    /// The reverse primer pattern, copied from the first row of the manifest.
    pub reverse_primer_pattern: String,
    /// The 1-based line number in the manifest that defined this record.
    pub line_number: usize,
}

/// An ordered set of unique barcodes.
///
/// Iteration order is the order in which each barcode was first seen in the manifest, which the
/// corrector relies on to break ties.
#[derive(Debug, Clone, Default)]
pub struct BarcodeSet {
    ordered: Vec<BString>,
    members: AHashMap<Vec<u8>, usize>,
}

impl BarcodeSet {
    /// Add a barcode if it has not been seen before.
    fn insert(&mut self, barcode: &BString) {
        if !self.members.contains_key(barcode.as_slice()) {
            self.members.insert(barcode.to_vec(), self.ordered.len());
            self.ordered.push(barcode.clone());
        }
    }

    /// Returns true if `barcode` is exactly one of the known barcodes.
    pub fn contains(&self, barcode: &[u8]) -> bool {
        self.members.contains_key(barcode)
    }

    /// The position of `barcode` in manifest order, if it is a known barcode.
    pub fn index_of(&self, barcode: &[u8]) -> Option<usize> {
        self.members.get(barcode).copied()
    }

    /// The barcode at position `index` in manifest order.
    pub fn get(&self, index: usize) -> Option<&BString> {
        self.ordered.get(index)
    }

    /// The barcodes in manifest order.
    pub fn as_slice(&self) -> &[BString] {
        &self.ordered
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

impl<S: AsRef<[u8]>> FromIterator<S> for BarcodeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = BarcodeSet::default();
        for barcode in iter {
            set.insert(&BString::from(barcode.as_ref()));
        }
        set
    }
}

/// The lookup structures derived from the manifest.  Built once and read-only thereafter.
#[derive(Debug, Clone)]
pub struct BarcodeIndex {
    /// All records, in manifest order.
    pub records: Vec<BarcodeRecord>,
    /// Unique forward barcodes in manifest order.
    pub forward_barcodes: BarcodeSet,
    /// Unique reverse barcodes in manifest order.
    pub reverse_barcodes: BarcodeSet,
    /// Forward barcode concatenated with reverse barcode to sample name.
    samples_by_key: AHashMap<BString, String>,
    /// The forward primer pattern from the first row.
    pub forward_primer_pattern: String,
    /// The reverse primer pattern from the first row.
    pub reverse_primer_pattern: String,
}

impl BarcodeIndex {
    /// Loads the manifest at `path`.
    ///
    /// # Errors
    ///
    /// See [`BarcodeIndex::from_reader`].
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        policy: DuplicateKeyPolicy,
    ) -> Result<Self, ManifestError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        Self::from_reader(reader, policy)
    }

    /// Loads a manifest from `reader`.
    ///
    /// # Errors
    ///
    /// - [`ManifestError::TooFewFields`] if a row has fewer than three fields
    /// - [`ManifestError::MissingPrimers`] if the first row does not carry both primers
    /// - [`ManifestError::ZeroRecords`] if the manifest has no rows
    /// - [`ManifestError::DuplicateBarcodeKey`] if `policy` is [`DuplicateKeyPolicy::Strict`] and
    ///   two rows share the same barcode combination
    pub fn from_reader<R: Read>(
        reader: R,
        policy: DuplicateKeyPolicy,
    ) -> Result<Self, ManifestError> {
        // Plain comma splitting: no header, no quoting, rows may have any number of fields.
        let mut reader = ReaderBuilder::new()
            .delimiter(b',')
            .has_headers(false)
            .quoting(false)
            .flexible(true)
            .trim(Trim::None)
            .from_reader(reader);

        let mut records: Vec<BarcodeRecord> = vec![];
        let mut primers: Option<(String, String)> = None;
        for (index, result) in reader.records().enumerate() {
            let fallback_line = ManifestLine(index + 1);
            let row = result.map_err(|source| ManifestError::Csv { source, line: fallback_line })?;
            let line = ManifestLine(row.position().map_or(index + 1, |p| p.line() as usize));
            let row_text = || row.iter().join(",");

            if row.len() < MIN_FIELDS {
                return Err(ManifestError::TooFewFields {
                    actual: row.len(),
                    expected: MIN_FIELDS,
                    line,
                    row: row_text(),
                });
            }

            let (forward_primer_pattern, reverse_primer_pattern) = match &primers {
                Some(primers) => primers.clone(),
                None => {
                    if row.len() < FIRST_ROW_FIELDS {
                        return Err(ManifestError::MissingPrimers { line, row: row_text() });
                    }
                    let found = (row[3].to_string(), row[4].to_string());
                    primers = Some(found.clone());
                    found
                }
            };

            records.push(BarcodeRecord {
                forward_barcode: BString::from(&row[0]),
                reverse_barcode: BString::from(&row[1]),
                sample_name: row[2].to_string(),
                forward_primer_pattern,
                reverse_primer_pattern,
                line_number: line.0,
            });
        }

        Self::from_records(records, policy)
    }

    /// Builds the index from already parsed records.
    ///
    /// # Errors
    ///
    /// - [`ManifestError::ZeroRecords`] if `records` is empty
    /// - [`ManifestError::DuplicateBarcodeKey`] under [`DuplicateKeyPolicy::Strict`]
    pub fn from_records(
        records: Vec<BarcodeRecord>,
        policy: DuplicateKeyPolicy,
    ) -> Result<Self, ManifestError> {
        if records.is_empty() {
            return Err(ManifestError::ZeroRecords);
        }

        let mut forward_barcodes = BarcodeSet::default();
        let mut reverse_barcodes = BarcodeSet::default();
        let mut samples_by_key: AHashMap<BString, String> = AHashMap::new();
        for record in &records {
            forward_barcodes.insert(&record.forward_barcode);
            reverse_barcodes.insert(&record.reverse_barcode);

            let key = Self::key(&record.forward_barcode, &record.reverse_barcode);
            if let Some(previous) = samples_by_key.insert(key.clone(), record.sample_name.clone())
            {
                if policy == DuplicateKeyPolicy::Strict {
                    return Err(ManifestError::DuplicateBarcodeKey {
                        key: key.to_string(),
                        first_sample: previous,
                        second_sample: record.sample_name.clone(),
                        line: ManifestLine(record.line_number),
                    });
                }
                debug!(
                    "Barcode combination {} reassigned from {} to {}",
                    key, previous, record.sample_name
                );
            }
        }

        let forward_primer_pattern = records[0].forward_primer_pattern.clone();
        let reverse_primer_pattern = records[0].reverse_primer_pattern.clone();
        Ok(Self {
            records,
            forward_barcodes,
            reverse_barcodes,
            samples_by_key,
            forward_primer_pattern,
            reverse_primer_pattern,
        })
    }

    /// The lookup key for a forward/reverse barcode combination.
    pub fn key(forward: &[u8], reverse: &[u8]) -> BString {
        let mut key = Vec::with_capacity(forward.len() + reverse.len());
        key.extend_from_slice(forward);
        key.extend_from_slice(reverse);
        BString::from(key)
    }

    /// Look up the sample for a forward/reverse barcode combination.
    pub fn sample_for(&self, forward: &[u8], reverse: &[u8]) -> Option<&str> {
        self.samples_by_key.get(&Self::key(forward, reverse)).map(String::as_str)
    }

    /// The distinct sample names in the order they first appear in the manifest.
    pub fn sample_names(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.sample_name.as_str()).unique().collect()
    }
}
