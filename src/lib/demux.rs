//! Routing of read pairs to sample buckets.
//!
//! For each `(forward, reverse)` pair the [`Demultiplexer`]:
//!
//! 1. extracts the candidate barcode preceding the primer on each side,
//! 2. corrects each candidate against the manifest's forward or reverse barcodes,
//! 3. looks up the sample for the corrected `forward ++ reverse` combination, and
//! 4. appends the pair to the sample's files with each barcode removed from the start of the
//!    sequence, or appends the untouched pair to the unplaced bucket.
//!
//! A missing primer or an uncorrectable barcode on either side sends the pair to the unplaced
//! bucket.  These are counted in the [`DemuxMetrics`] but are never errors.

use std::io::BufRead;

use ahash::AHashMap;
use anyhow::Result;
use log::info;

use crate::{
    barcode_table::BarcodeIndex,
    fastq::{PairedReads, ReadRecord, Trim},
    matcher::{BarcodeDecision, Corrector},
    metrics::DemuxMetrics,
    primer::BarcodeExtractor,
    sample_writer::SampleWriters,
};

/// The default name of the bucket for pairs that could not be assigned to a sample.
pub const UNPLACED_NAME: &str = "unplaced";

/// Log progress every this many pairs.
const PROGRESS_INTERVAL: usize = 1_000_000;

/// The outcome of extraction and correction for one read of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideDecision<'s, 'r> {
    /// The bases preceding the primer, `None` if the primer was not found.
    pub extracted: Option<&'r [u8]>,
    pub decision: BarcodeDecision<'s>,
}

impl<'s, 'r> SideDecision<'s, 'r> {
    pub fn is_extraction_miss(&self) -> bool {
        self.extracted.is_none()
    }

    /// True if a barcode was extracted but nothing was close enough to it.
    pub fn is_correction_miss(&self) -> bool {
        self.extracted.is_some() && self.decision.is_unknown()
    }
}

/// A sample a pair was assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement<'s> {
    pub sample_name: &'s str,
    /// Position of the sample in [`BarcodeIndex::sample_names`].
    pub ordinal: usize,
}

/// The routing decision for a read pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairDecision<'s, 'r> {
    pub forward: SideDecision<'s, 'r>,
    pub reverse: SideDecision<'s, 'r>,
    /// `None` if the pair belongs in the unplaced bucket.
    pub placement: Option<Placement<'s>>,
}

/// Routes read pairs to per-sample output files.
pub struct Demultiplexer<'a, C: Corrector> {
    index: &'a BarcodeIndex,
    forward_extractor: BarcodeExtractor,
    reverse_extractor: BarcodeExtractor,
    forward_corrector: C,
    reverse_corrector: C,
    sample_ordinals: AHashMap<&'a str, usize>,
    unplaced_name: String,
    trim_qualities: bool,
}

impl<'a, C: Corrector> Demultiplexer<'a, C> {
    /// Create a new [`Demultiplexer`].
    ///
    /// The correctors must be built over `index.forward_barcodes` and `index.reverse_barcodes`
    /// respectively.
    pub fn new(
        index: &'a BarcodeIndex,
        forward_extractor: BarcodeExtractor,
        reverse_extractor: BarcodeExtractor,
        forward_corrector: C,
        reverse_corrector: C,
        unplaced_name: impl Into<String>,
        trim_qualities: bool,
    ) -> Self {
        let sample_ordinals =
            index.sample_names().into_iter().enumerate().map(|(i, name)| (name, i)).collect();
        Self {
            index,
            forward_extractor,
            reverse_extractor,
            forward_corrector,
            reverse_corrector,
            sample_ordinals,
            unplaced_name: unplaced_name.into(),
            trim_qualities,
        }
    }

    pub fn unplaced_name(&self) -> &str {
        &self.unplaced_name
    }

    fn decide<'s, 'r>(
        extractor: &BarcodeExtractor,
        corrector: &'s C,
        sequence: &'r [u8],
    ) -> SideDecision<'s, 'r> {
        let extracted = extractor.extract(sequence);
        let decision = extracted.map_or(BarcodeDecision::Unknown, |b| corrector.correct(b));
        SideDecision { extracted, decision }
    }

    /// Decide where a pair with the given sequences belongs without writing anything.
    pub fn route<'r>(&self, forward: &'r [u8], reverse: &'r [u8]) -> PairDecision<'_, 'r> {
        let forward = Self::decide(&self.forward_extractor, &self.forward_corrector, forward);
        let reverse = Self::decide(&self.reverse_extractor, &self.reverse_corrector, reverse);
        let placement = match (forward.decision.barcode(), reverse.decision.barcode()) {
            (Some(f), Some(r)) => self.index.sample_for(f, r).and_then(|sample_name| {
                self.sample_ordinals
                    .get(sample_name)
                    .map(|&ordinal| Placement { sample_name, ordinal })
            }),
            _ => None,
        };
        PairDecision { forward, reverse, placement }
    }

    /// Route one pair, append it to its bucket, and count it.
    pub fn demultiplex_pair(
        &self,
        forward: &ReadRecord,
        reverse: &ReadRecord,
        writers: &mut SampleWriters,
        metrics: &mut DemuxMetrics,
    ) -> Result<()> {
        let decision = self.route(forward.seq(), reverse.seq());
        match decision.placement {
            Some(Placement { sample_name, ordinal }) => {
                writers.write_pair(
                    sample_name,
                    forward,
                    self.trim(&decision.forward.decision),
                    reverse,
                    self.trim(&decision.reverse.decision),
                )?;
                metrics.record_placed(
                    ordinal,
                    &decision.forward.decision,
                    &decision.reverse.decision,
                );
            }
            None => {
                writers.write_pair(
                    &self.unplaced_name,
                    forward,
                    Trim::default(),
                    reverse,
                    Trim::default(),
                )?;
                metrics.record_unplaced(&decision.forward, &decision.reverse);
            }
        }
        Ok(())
    }

    /// Removes the resolved barcode, which may differ in length from the extracted one.
    fn trim(&self, decision: &BarcodeDecision<'_>) -> Trim {
        Trim { bases: decision.barcode().map_or(0, <[u8]>::len), qualities: self.trim_qualities }
    }

    /// Demultiplex every pair, stopping at the first read or write error.
    pub fn demultiplex<F: BufRead, R: BufRead>(
        &self,
        pairs: PairedReads<F, R>,
        writers: &mut SampleWriters,
        metrics: &mut DemuxMetrics,
    ) -> Result<()> {
        for (i, pair) in pairs.enumerate() {
            let (forward, reverse) = pair?;
            self.demultiplex_pair(&forward, &reverse, writers, metrics)?;
            if (i + 1) % PROGRESS_INTERVAL == 0 {
                info!(
                    "Processed {} read pairs, {} placed",
                    i + 1,
                    metrics.run.placed_pairs
                );
            }
        }
        Ok(())
    }
}
