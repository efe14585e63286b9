//! Counters collected while demultiplexing and the TSV files they are written to.
//!
//! [`DemuxMetrics`] holds the run level counts ([`RunMetrics`]), one [`SampleMetrics`] per
//! sample in manifest order with the unplaced bucket last, and optionally an
//! [`UnplacedCounter`] tracking the most frequently observed raw barcode combinations among
//! unplaced pairs.
//!
//! The unplaced counter is bounded: each time the number of distinct combinations reaches a set
//! limit, the combinations are sorted from most to least frequent and only the top N are kept.
//!
//! Metrics files are overwritten on every run, unlike the FASTQ outputs which are appended to.

use std::path::Path;

use ahash::AHashMap;
use anyhow::Result;
use fgoxide::io::DelimFile;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{demux::SideDecision, matcher::BarcodeDecision};

/// The max number of keys the unplaced counter can retain before downsizing.
pub const DEFAULT_UNPLACED_MAX_COUNTER_SIZE: usize = 5_000_000;
/// The number of keys the unplaced counter is downsized to.
pub const DEFAULT_UNPLACED_DOWNSIZE_TO: usize = 5_000;

/// File name of the [`RunMetrics`] output.
pub const RUN_METRICS_FILE: &str = "demux_metrics.tsv";
/// File name of the per-sample metrics output.
pub const PER_SAMPLE_METRICS_FILE: &str = "per_sample_metrics.tsv";
/// File name of the most frequent unplaced barcode combinations output.
pub const MOST_FREQUENT_UNPLACED_FILE: &str = "most_frequent_unplaced.tsv";

/// Placeholder for a side whose primer was not found.
const NO_BARCODE: &[u8] = b"-";

/// Tracks the number of times each raw barcode combination was seen among unplaced pairs.
#[derive(Debug)]
pub struct UnplacedCounter {
    counter: AHashMap<Vec<u8>, i64>,
    /// The max number of keys that can be held before downsizing.
    max_counter_size: usize,
    /// The number of keys to retain when downsizing.
    downsize_to: usize,
}

impl UnplacedCounter {
    /// Create a new [`UnplacedCounter`].
    ///
    /// # Arguments
    /// - `max_counter_size` - the max number of keys the internal hashmap can contain before
    ///   downsizing.
    /// - `downsize_to` - the number of keys to retain when downsizing.
    pub fn new(max_counter_size: usize, downsize_to: usize) -> Self {
        Self { counter: AHashMap::new(), max_counter_size, downsize_to }
    }

    /// Build the `forward+reverse` key for a pair, using `-` for a side with no extracted barcode.
    pub fn key(forward: Option<&[u8]>, reverse: Option<&[u8]>) -> Vec<u8> {
        let forward = forward.unwrap_or(NO_BARCODE);
        let reverse = reverse.unwrap_or(NO_BARCODE);
        let mut key = Vec::with_capacity(forward.len() + reverse.len() + 1);
        key.extend_from_slice(forward);
        key.push(b'+');
        key.extend_from_slice(reverse);
        key
    }

    /// Count one observation of `barcode`, downsizing first if the counter is full.
    pub fn insert(&mut self, barcode: Vec<u8>) {
        // Downsize before adding one more so we never exceed max_counter_size.
        if self.counter.len() >= self.max_counter_size && !self.counter.contains_key(&barcode) {
            self.downsize();
        }
        *self.counter.entry(barcode).or_insert(0) += 1;
    }

    /// Downsize the counter to the `downsize_to` most frequent keys.
    pub fn downsize(&mut self) {
        let new = AHashMap::with_capacity(self.downsize_to);
        let previous = std::mem::replace(&mut self.counter, new);
        self.counter.extend(
            previous
                .into_iter()
                .sorted_unstable_by(|(ka, ca), (kb, cb)| cb.cmp(ca).then_with(|| ka.cmp(kb)))
                .take(self.downsize_to),
        );
    }

    pub fn len(&self) -> usize {
        self.counter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counter.is_empty()
    }

    /// The count for `barcode`, zero if it was never seen (or was dropped by downsizing).
    pub fn count(&self, barcode: &[u8]) -> i64 {
        self.counter.get(barcode).copied().unwrap_or(0)
    }

    /// The `n` most frequent combinations, most frequent first (ties broken by the combination).
    fn top(self, n: usize) -> Vec<BarcodeCount> {
        self.counter
            .into_iter()
            .sorted_unstable_by(|(ka, ca), (kb, cb)| cb.cmp(ca).then_with(|| ka.cmp(kb)))
            .take(n)
            .map(|(barcode, count)| BarcodeCount {
                barcode: String::from_utf8_lossy(&barcode).to_string(),
                count: count as isize,
            })
            .collect()
    }

    /// Write the top `n` combinations to [`MOST_FREQUENT_UNPLACED_FILE`] in `output_dir`.
    pub fn to_file<P: AsRef<Path>>(self, output_dir: P, n: usize) -> Result<()> {
        let output_path = output_dir.as_ref().join(MOST_FREQUENT_UNPLACED_FILE);
        DelimFile::default().write_tsv(&output_path, self.top(n))?;
        Ok(())
    }
}

/// The high level metrics for all read pairs that were demultiplexed.
///
/// A pair can be unplaced for more than one reason (e.g. both primers missing), so the reason
/// counts may sum to more than `unplaced_pairs`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// The total number of read pairs seen.
    pub total_pairs: usize,
    /// The number of pairs written to a sample.
    pub placed_pairs: usize,
    /// The number of pairs written to the unplaced bucket.
    pub unplaced_pairs: usize,
    /// Unplaced pairs where the forward primer was not found.
    pub forward_extraction_misses: usize,
    /// Unplaced pairs where the reverse primer was not found.
    pub reverse_extraction_misses: usize,
    /// Unplaced pairs whose forward barcode was not within the edit threshold of any barcode.
    pub forward_correction_misses: usize,
    /// Unplaced pairs whose reverse barcode was not within the edit threshold of any barcode.
    pub reverse_correction_misses: usize,
    /// Unplaced pairs where both barcodes resolved but no sample uses the combination.
    pub unknown_combinations: usize,
}

/// Per-sample counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SampleMetrics {
    /// The number of pairs attributed to this sample.
    pub pairs: usize,
    /// Pairs where both barcodes matched exactly.
    pub exact_pairs: usize,
    /// Pairs where at least one barcode needed correcting.
    pub corrected_pairs: usize,
}

impl SampleMetrics {
    /// Count a pair with the given barcode decisions.
    pub fn update_with_decisions(
        &mut self,
        forward: &BarcodeDecision<'_>,
        reverse: &BarcodeDecision<'_>,
    ) {
        self.pairs += 1;
        if forward.is_exact() && reverse.is_exact() {
            self.exact_pairs += 1;
        } else if forward.is_resolved() && reverse.is_resolved() {
            self.corrected_pairs += 1;
        }
    }

    fn as_processed(
        &self,
        sample_name: &str,
        total_pairs: usize,
        best_sample_pairs: usize,
    ) -> SampleMetricsProcessed {
        SampleMetricsProcessed {
            sample_name: sample_name.to_string(),
            pairs: self.pairs,
            exact_pairs: self.exact_pairs,
            corrected_pairs: self.corrected_pairs,
            fraction_pairs: ratio(self.pairs, total_pairs),
            ratio_this_sample_to_best_sample: ratio(self.pairs, best_sample_pairs),
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// All metrics for a run.
#[derive(Debug)]
pub struct DemuxMetrics {
    pub run: RunMetrics,
    /// One entry per sample in manifest order, followed by the unplaced bucket.
    pub per_sample: Vec<SampleMetrics>,
    pub unplaced_counter: Option<UnplacedCounter>,
}

impl DemuxMetrics {
    /// Create metrics for `num_samples` samples, optionally collecting unplaced combinations.
    pub fn new(num_samples: usize, unplaced_counter: Option<UnplacedCounter>) -> Self {
        Self {
            run: RunMetrics::default(),
            per_sample: vec![SampleMetrics::default(); num_samples + 1],
            unplaced_counter,
        }
    }

    /// Count a pair written to the sample with the given manifest ordinal.
    pub fn record_placed(
        &mut self,
        ordinal: usize,
        forward: &BarcodeDecision<'_>,
        reverse: &BarcodeDecision<'_>,
    ) {
        self.run.total_pairs += 1;
        self.run.placed_pairs += 1;
        if let Some(metrics) = self.per_sample.get_mut(ordinal) {
            metrics.update_with_decisions(forward, reverse);
        }
    }

    /// Count a pair written to the unplaced bucket, attributing the reasons it was unplaced.
    pub fn record_unplaced(
        &mut self,
        forward: &SideDecision<'_, '_>,
        reverse: &SideDecision<'_, '_>,
    ) {
        self.run.total_pairs += 1;
        self.run.unplaced_pairs += 1;
        self.run.forward_extraction_misses += usize::from(forward.is_extraction_miss());
        self.run.reverse_extraction_misses += usize::from(reverse.is_extraction_miss());
        self.run.forward_correction_misses += usize::from(forward.is_correction_miss());
        self.run.reverse_correction_misses += usize::from(reverse.is_correction_miss());
        if forward.decision.is_resolved() && reverse.decision.is_resolved() {
            self.run.unknown_combinations += 1;
        }

        if let Some(unplaced) = self.per_sample.last_mut() {
            unplaced.update_with_decisions(&forward.decision, &reverse.decision);
        }
        if let Some(counter) = self.unplaced_counter.as_mut() {
            counter.insert(UnplacedCounter::key(forward.extracted, reverse.extracted));
        }
    }

    /// The per-sample rows in output order, `sample_names` in manifest order.
    fn per_sample_rows(
        &self,
        sample_names: &[&str],
        unplaced_name: &str,
    ) -> Vec<SampleMetricsProcessed> {
        let total_pairs = self.run.total_pairs;
        // Don't include unplaced when determining the best sample.
        let best_sample_pairs = self.per_sample[..self.per_sample.len() - 1]
            .iter()
            .map(|m| m.pairs)
            .max()
            .unwrap_or(0);

        sample_names
            .iter()
            .copied()
            .chain(std::iter::once(unplaced_name))
            .zip(self.per_sample.iter())
            .map(|(name, metrics)| metrics.as_processed(name, total_pairs, best_sample_pairs))
            .collect()
    }

    /// Write [`RUN_METRICS_FILE`], [`PER_SAMPLE_METRICS_FILE`] and, if collected,
    /// [`MOST_FREQUENT_UNPLACED_FILE`] into `output_dir`.
    pub fn write_metrics_files<P: AsRef<Path>>(
        self,
        sample_names: &[&str],
        unplaced_name: &str,
        most_unplaced_to_output: usize,
        output_dir: P,
    ) -> Result<()> {
        let delim = DelimFile::default();

        let output_path = output_dir.as_ref().join(RUN_METRICS_FILE);
        delim.write_tsv(&output_path, std::iter::once(self.run))?;

        let output_path = output_dir.as_ref().join(PER_SAMPLE_METRICS_FILE);
        delim.write_tsv(&output_path, self.per_sample_rows(sample_names, unplaced_name))?;

        if let Some(counter) = self.unplaced_counter {
            counter.to_file(&output_dir, most_unplaced_to_output)?;
        }
        Ok(())
    }
}

/// A helper struct for serializing and deserializing barcode counts.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct BarcodeCount {
    /// The raw `forward+reverse` barcode combination.
    pub(crate) barcode: String,
    /// The number of unplaced pairs with this combination.
    pub(crate) count: isize,
}

/// A row of [`PER_SAMPLE_METRICS_FILE`].
#[derive(Debug, Serialize, Deserialize)]
pub struct SampleMetricsProcessed {
    /// The sample name from the manifest, or the unplaced bucket name.
    pub(crate) sample_name: String,
    /// The total number of pairs attributed to the sample.
    pub(crate) pairs: usize,
    /// The number of pairs where both barcodes matched exactly.
    pub(crate) exact_pairs: usize,
    /// The number of pairs where at least one barcode was corrected.
    pub(crate) corrected_pairs: usize,
    /// The fraction of all pairs attributed to the sample.
    pub(crate) fraction_pairs: f64,
    /// Pairs for this sample over pairs for the sample with the most pairs (unplaced excluded).
    pub(crate) ratio_this_sample_to_best_sample: f64,
}

#[cfg(test)]
mod test {
    use fgoxide::io::DelimFile;
    use tempfile::tempdir;

    use crate::{demux::SideDecision, matcher::BarcodeDecision};

    use super::{
        BarcodeCount, DemuxMetrics, RunMetrics, SampleMetrics, SampleMetricsProcessed,
        UnplacedCounter, MOST_FREQUENT_UNPLACED_FILE, PER_SAMPLE_METRICS_FILE, RUN_METRICS_FILE,
    };

    fn resolved(barcode: &[u8], edit_dist: usize) -> BarcodeDecision<'_> {
        BarcodeDecision::Resolved { barcode, edit_dist }
    }

    #[test]
    fn test_unplaced_counter_key() {
        assert_eq!(UnplacedCounter::key(Some(b"AAAA"), Some(b"CC")), b"AAAA+CC".to_vec());
        assert_eq!(UnplacedCounter::key(None, Some(b"CC")), b"-+CC".to_vec());
        assert_eq!(UnplacedCounter::key(Some(b""), None), b"+-".to_vec());
    }

    #[test]
    fn test_unplaced_counter_downsizes() {
        let mut counter = UnplacedCounter::new(3, 1);
        for barcode in ["A+A", "A+A", "A+A", "C+C", "C+C", "G+G"] {
            counter.insert(barcode.as_bytes().to_vec());
        }
        assert_eq!(counter.len(), 3);

        // A fourth distinct key triggers a downsize to the single most frequent key.
        counter.insert(b"T+T".to_vec());
        assert_eq!(counter.len(), 2);
        assert_eq!(counter.count(b"A+A"), 3);
        assert_eq!(counter.count(b"C+C"), 0);
        assert_eq!(counter.count(b"T+T"), 1);

        // Existing keys never trigger a downsize.
        let mut counter = UnplacedCounter::new(1, 0);
        counter.insert(b"A+A".to_vec());
        counter.insert(b"A+A".to_vec());
        assert_eq!(counter.count(b"A+A"), 2);
    }

    #[test]
    fn test_unplaced_counter_to_file() {
        let dir = tempdir().unwrap();
        let mut counter = UnplacedCounter::new(100, 10);
        for barcode in ["C+C", "A+A", "A+A", "G+G", "G+G", "G+G"] {
            counter.insert(barcode.as_bytes().to_vec());
        }
        counter.to_file(dir.path(), 2).unwrap();

        let rows: Vec<BarcodeCount> =
            DelimFile::default().read_tsv(&dir.path().join(MOST_FREQUENT_UNPLACED_FILE)).unwrap();
        assert_eq!(
            rows,
            vec![
                BarcodeCount { barcode: "G+G".to_string(), count: 3 },
                BarcodeCount { barcode: "A+A".to_string(), count: 2 },
            ]
        );
    }

    #[test]
    fn test_sample_metrics_update() {
        let mut metrics = SampleMetrics::default();
        metrics.update_with_decisions(&resolved(b"AAAA", 0), &resolved(b"CCCC", 0));
        metrics.update_with_decisions(&resolved(b"AAAA", 1), &resolved(b"CCCC", 0));
        metrics.update_with_decisions(&resolved(b"AAAA", 0), &resolved(b"CCCC", 1));
        assert_eq!(metrics, SampleMetrics { pairs: 3, exact_pairs: 1, corrected_pairs: 2 });
    }

    #[test]
    fn test_record_unplaced_reasons() {
        let mut metrics = DemuxMetrics::new(1, Some(UnplacedCounter::new(10, 5)));
        let extraction_miss = SideDecision { extracted: None, decision: BarcodeDecision::Unknown };
        let correction_miss =
            SideDecision { extracted: Some(&b"TTTT"[..]), decision: BarcodeDecision::Unknown };
        let hit = SideDecision { extracted: Some(&b"AAAA"[..]), decision: resolved(b"AAAA", 0) };

        metrics.record_unplaced(&extraction_miss, &hit);
        metrics.record_unplaced(&hit, &correction_miss);
        metrics.record_unplaced(&extraction_miss, &correction_miss);
        metrics.record_unplaced(&hit, &hit);
        metrics.record_placed(0, &resolved(b"AAAA", 0), &resolved(b"AAAA", 0));

        assert_eq!(
            metrics.run,
            RunMetrics {
                total_pairs: 5,
                placed_pairs: 1,
                unplaced_pairs: 4,
                forward_extraction_misses: 2,
                reverse_extraction_misses: 0,
                forward_correction_misses: 0,
                reverse_correction_misses: 2,
                unknown_combinations: 1,
            }
        );
        assert_eq!(metrics.per_sample[0].pairs, 1);
        assert_eq!(metrics.per_sample[1].pairs, 4);

        let counter = metrics.unplaced_counter.as_ref().unwrap();
        assert_eq!(counter.count(b"-+AAAA"), 1);
        assert_eq!(counter.count(b"AAAA+TTTT"), 1);
        assert_eq!(counter.count(b"-+TTTT"), 1);
        assert_eq!(counter.count(b"AAAA+AAAA"), 1);
    }

    #[test]
    fn test_write_metrics_files() {
        let dir = tempdir().unwrap();
        let mut metrics = DemuxMetrics::new(2, None);
        let miss = SideDecision { extracted: None, decision: BarcodeDecision::Unknown };
        for _ in 0..3 {
            metrics.record_placed(0, &resolved(b"AAAA", 0), &resolved(b"CCCC", 0));
        }
        metrics.record_placed(1, &resolved(b"GGGG", 1), &resolved(b"TTTT", 0));
        metrics.record_unplaced(&miss, &miss);
        metrics.record_unplaced(&miss, &miss);
        metrics.write_metrics_files(&["s1", "s2"], "unplaced", 10, dir.path()).unwrap();

        let delim = DelimFile::default();
        let run: Vec<RunMetrics> = delim.read_tsv(&dir.path().join(RUN_METRICS_FILE)).unwrap();
        assert_eq!(run.len(), 1);
        assert_eq!(run[0].total_pairs, 6);
        assert_eq!(run[0].placed_pairs, 4);
        assert_eq!(run[0].unplaced_pairs, 2);
        assert_eq!(run[0].forward_extraction_misses, 2);

        let per_sample: Vec<SampleMetricsProcessed> =
            delim.read_tsv(&dir.path().join(PER_SAMPLE_METRICS_FILE)).unwrap();
        let names: Vec<&str> = per_sample.iter().map(|m| m.sample_name.as_str()).collect();
        assert_eq!(names, vec!["s1", "s2", "unplaced"]);
        assert_eq!(per_sample[0].pairs, 3);
        assert_eq!(per_sample[0].exact_pairs, 3);
        assert!((per_sample[0].fraction_pairs - 0.5).abs() < f64::EPSILON);
        assert!((per_sample[0].ratio_this_sample_to_best_sample - 1.0).abs() < f64::EPSILON);
        assert_eq!(per_sample[1].corrected_pairs, 1);
        assert!((per_sample[2].ratio_this_sample_to_best_sample - 2.0 / 3.0).abs() < 1e-9);

        assert!(!dir.path().join(MOST_FREQUENT_UNPLACED_FILE).exists());
    }

    #[test]
    fn test_metrics_files_are_overwritten() {
        let dir = tempdir().unwrap();
        for _ in 0..2 {
            let mut metrics = DemuxMetrics::new(1, None);
            metrics.record_placed(0, &resolved(b"AAAA", 0), &resolved(b"CCCC", 0));
            metrics.write_metrics_files(&["s1"], "unplaced", 10, dir.path()).unwrap();
        }
        let run: Vec<RunMetrics> =
            DelimFile::default().read_tsv(&dir.path().join(RUN_METRICS_FILE)).unwrap();
        let expected = RunMetrics { total_pairs: 1, placed_pairs: 1, ..RunMetrics::default() };
        assert_eq!(run, vec![expected]);
    }

    #[test]
    fn test_empty_run_metrics() {
        let dir = tempdir().unwrap();
        let metrics = DemuxMetrics::new(1, Some(UnplacedCounter::new(10, 5)));
        metrics.write_metrics_files(&["s1"], "unplaced", 10, dir.path()).unwrap();
        let per_sample: Vec<SampleMetricsProcessed> =
            DelimFile::default().read_tsv(&dir.path().join(PER_SAMPLE_METRICS_FILE)).unwrap();
        assert_eq!(per_sample.len(), 2);
        assert!(per_sample.iter().all(|m| m.pairs == 0 && m.fraction_pairs == 0.0));
        assert!(dir.path().join(MOST_FREQUENT_UNPLACED_FILE).exists());
    }
}
