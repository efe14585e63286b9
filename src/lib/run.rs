use anyhow::{ensure, Context, Result};
use log::{debug, info, warn};

use crate::{
    barcode_table::BarcodeIndex,
    demux::Demultiplexer,
    fastq::{FastqReader, PairedReads},
    matcher::{CachedLevenshteinCorrector, LevenshteinCorrector},
    metrics::{
        DemuxMetrics, UnplacedCounter, DEFAULT_UNPLACED_DOWNSIZE_TO,
        DEFAULT_UNPLACED_MAX_COUNTER_SIZE,
    },
    opts::{Opts, TOOL_NAME},
    primer::{BarcodeExtractor, PrimerPattern},
    sample_writer::SampleWriters,
    utils::{built_info, open_fastq},
};

/// Run demultiplexing.
#[allow(clippy::too_many_lines)]
pub fn run(opts: Opts) -> Result<(), anyhow::Error> {
    info!("{} {}", TOOL_NAME, built_info::VERSION.as_str());

    // Preflight checks
    ensure!(
        opts.output_dir.is_dir(),
        "Output directory does not exist: {}",
        &opts.output_dir.to_string_lossy()
    );
    for (kind, path) in [
        ("Forward reads", &opts.forward_reads),
        ("Reverse reads", &opts.reverse_reads),
        ("Barcode manifest", &opts.barcodes),
    ] {
        ensure!(path.is_file(), "{} file does not exist: {}", kind, path.to_string_lossy());
    }

    info!("Loading barcode manifest");
    let index = BarcodeIndex::from_path(&opts.barcodes, opts.duplicate_key_policy())
        .with_context(|| {
            format!("Failed to load barcode manifest: {}", opts.barcodes.to_string_lossy())
        })?;
    let sample_names = index.sample_names();
    info!(
        "Loaded {} manifest rows for {} samples ({} forward and {} reverse barcodes)",
        index.records.len(),
        sample_names.len(),
        index.forward_barcodes.len(),
        index.reverse_barcodes.len()
    );
    if sample_names.contains(&opts.unplaced_name.as_str()) {
        warn!(
            "Sample {} has the same name as the unplaced bucket, their reads will share files",
            opts.unplaced_name
        );
    }

    let forward_primer = PrimerPattern::compile(&index.forward_primer_pattern)
        .context("Invalid forward primer in barcode manifest")?;
    let reverse_primer = PrimerPattern::compile(&index.reverse_primer_pattern)
        .context("Invalid reverse primer in barcode manifest")?;
    debug!("Forward primer {} spans {} bases", forward_primer, forward_primer.len());
    debug!("Reverse primer {} spans {} bases", reverse_primer, reverse_primer.len());
    let forward_extractor = BarcodeExtractor::new(forward_primer, opts.max_barcode_length);
    let reverse_extractor = BarcodeExtractor::new(reverse_primer, opts.max_barcode_length);

    info!("Opening input FASTQs");
    let threads = opts.decompression_threads_per_reader;
    let pairs = PairedReads::new(
        FastqReader::new(
            open_fastq(&opts.forward_reads, threads)?,
            opts.forward_reads.to_string_lossy(),
        ),
        FastqReader::new(
            open_fastq(&opts.reverse_reads, threads)?,
            opts.reverse_reads.to_string_lossy(),
        ),
    );

    let mut writers = SampleWriters::with_max_open(&opts.output_dir, opts.max_open_buckets);
    let unplaced_counter = (!opts.skip_metrics && opts.most_unplaced_to_output > 0).then(|| {
        UnplacedCounter::new(DEFAULT_UNPLACED_MAX_COUNTER_SIZE, DEFAULT_UNPLACED_DOWNSIZE_TO)
    });
    let mut metrics = DemuxMetrics::new(sample_names.len(), unplaced_counter);

    info!("Processing data");
    let result = if opts.corrector_cache_size > 0 {
        debug!("Using CachedLevenshteinCorrector");
        Demultiplexer::new(
            &index,
            forward_extractor,
            reverse_extractor,
            CachedLevenshteinCorrector::new(
                &index.forward_barcodes,
                opts.max_edits,
                opts.corrector_cache_size,
            ),
            CachedLevenshteinCorrector::new(
                &index.reverse_barcodes,
                opts.max_edits,
                opts.corrector_cache_size,
            ),
            opts.unplaced_name.as_str(),
            opts.trim_qualities,
        )
        .demultiplex(pairs, &mut writers, &mut metrics)
    } else {
        debug!("Using LevenshteinCorrector");
        Demultiplexer::new(
            &index,
            forward_extractor,
            reverse_extractor,
            LevenshteinCorrector::new(&index.forward_barcodes, opts.max_edits),
            LevenshteinCorrector::new(&index.reverse_barcodes, opts.max_edits),
            opts.unplaced_name.as_str(),
            opts.trim_qualities,
        )
        .demultiplex(pairs, &mut writers, &mut metrics)
    };

    // Flush what was written before reporting any processing error.
    let finished = writers.finish().context("Failed to flush and finish writing.");
    result?;
    finished?;

    info!(
        "Demultiplexed {} read pairs: {} placed, {} unplaced",
        metrics.run.total_pairs, metrics.run.placed_pairs, metrics.run.unplaced_pairs
    );

    if !opts.skip_metrics {
        info!("Writing stats");
        metrics.write_metrics_files(
            &sample_names,
            &opts.unplaced_name,
            opts.most_unplaced_to_output,
            &opts.output_dir,
        )?;
    }
    Ok(())
}
