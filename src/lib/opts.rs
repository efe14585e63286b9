#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;

use crate::{
    barcode_table::DuplicateKeyPolicy,
    demux::UNPLACED_NAME,
    utils::built_info,
};

pub static TOOL_NAME: &str = "pedemux";

static SHORT_USAGE: &str =
    "Demultiplexes paired-end FASTQs by the barcodes preceding the forward and reverse primers.";

static LONG_USAGE: &str = "
Demultiplexes paired-end FASTQs by the barcodes preceding the forward and reverse primers.

Each read is searched for its primer and the bases before the leftmost primer match are taken as
the barcode.  Barcodes within --max-edits (Levenshtein distance) of a barcode in the manifest are
corrected to it; on ties the barcode listed first in the manifest wins.  The pair is assigned to
the sample whose forward and reverse barcodes both match, the barcodes are removed from the start
of each sequence, and the pair is appended to <sample>_forward and <sample>_reverse in the output
directory.  All other pairs are appended, untrimmed, to unplaced_forward and unplaced_reverse.

Output files are opened for appending, running twice over the same input doubles their contents.

The barcode manifest is a comma separated file with no header and one row per sample:

  forward_barcode,reverse_barcode,sample_name[,forward_primer,reverse_primer]

The first row must also give the forward and reverse primers, which apply to every row.  A primer
position written as a bracket group (e.g. [CT]) matches any one of the listed bases.

Read files may be plain text or BGZF compressed (ending in .gz or .bgz).

Example invocation:

pedemux R1.fastq R2.fastq barcodes.csv --output-dir demuxed/
";

#[derive(Parser, Debug, Clone)]
#[clap(
    name = TOOL_NAME,
    version = built_info::VERSION.as_str(),
    about = SHORT_USAGE,
    long_about = LONG_USAGE,
    term_width = 0
)]
pub struct Opts {
    /// Path to the forward (R1) FASTQ.
    #[clap(value_name = "FORWARD_READS", display_order = 1)]
    pub forward_reads: PathBuf,

    /// Path to the reverse (R2) FASTQ.
    #[clap(value_name = "REVERSE_READS", display_order = 2)]
    pub reverse_reads: PathBuf,

    /// Path to the barcode manifest.
    #[clap(value_name = "BARCODES", display_order = 3)]
    pub barcodes: PathBuf,

    /// The directory to append outputs to, the directory must exist.
    #[clap(long, short, default_value = ".", display_order = 4)]
    pub output_dir: PathBuf,

    /// Max edit (Levenshtein) distance between an observed barcode and the expected barcode.
    #[clap(long, short = 'm', default_value = "1", display_order = 11)]
    pub max_edits: usize,

    /// Treat barcodes longer than this as if the primer had not been found.
    ///
    /// [default: None]
    #[clap(long, display_order = 11)]
    pub max_barcode_length: Option<usize>,

    /// Fail if two manifest rows have the same forward and reverse barcodes.
    ///
    /// By default the later row silently wins.
    #[clap(long, display_order = 11)]
    pub strict_barcode_keys: bool,

    /// Remove the barcode from the quality line as well as the sequence line.
    ///
    /// By default only the sequence is trimmed, leaving the quality line longer than the
    /// sequence.
    #[clap(long, display_order = 21)]
    pub trim_qualities: bool,

    /// The bucket name for pairs that could not be assigned to a sample.
    #[clap(long, short = 'u', default_value = UNPLACED_NAME, display_order = 21)]
    pub unplaced_name: String,

    /// Output the most frequent unplaced barcode combinations up to this number.
    ///
    /// If set to 0 unplaced barcodes will not be collected.
    #[clap(long, short = 'U', default_value = "1000", display_order = 31)]
    pub most_unplaced_to_output: usize,

    /// Do not write the metrics files.
    #[clap(long, display_order = 31)]
    pub skip_metrics: bool,

    /// The number of threads to use for decompression for each compressed reader.
    #[clap(long, default_value = "4", display_order = 31, hide = true)]
    pub decompression_threads_per_reader: usize,

    /// The number of observed barcodes per read to remember corrections for.
    ///
    /// If set to 0 every barcode is compared against the manifest.
    #[clap(long, default_value = "100000", display_order = 31, hide = true)]
    pub corrector_cache_size: usize,

    /// The number of buckets whose output files may be open at once.
    ///
    /// The least recently written bucket is closed when another must be opened.
    #[clap(long, default_value = "64", display_order = 31, hide = true)]
    pub max_open_buckets: usize,
}

impl Opts {
    /// The policy for manifest rows that repeat a barcode combination.
    pub fn duplicate_key_policy(&self) -> DuplicateKeyPolicy {
        if self.strict_barcode_keys {
            DuplicateKeyPolicy::Strict
        } else {
            DuplicateKeyPolicy::LastWriteWins
        }
    }
}

/// Implement defaults that match the CLI options to allow for easier testing.
///
/// Note that these defaults exist only within test code.
#[cfg(test)]
impl Default for Opts {
    fn default() -> Self {
        Self {
            forward_reads: PathBuf::default(),
            reverse_reads: PathBuf::default(),
            barcodes: PathBuf::default(),
            output_dir: PathBuf::from("."),
            max_edits: crate::matcher::DEFAULT_MAX_EDITS,
            max_barcode_length: None,
            strict_barcode_keys: false,
            trim_qualities: false,
            unplaced_name: UNPLACED_NAME.to_string(),
            most_unplaced_to_output: 1_000,
            skip_metrics: false,
            decompression_threads_per_reader: 4,
            corrector_cache_size: crate::matcher::DEFAULT_CACHE_SIZE,
            max_open_buckets: crate::sample_writer::DEFAULT_MAX_OPEN_BUCKETS,
        }
    }
}

/// Parse args and set up logging / tracing
pub fn setup() -> Opts {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    Opts::parse()
}
