//! A library of functionality for demultiplexing paired-end FASTQ files by primer-anchored
//! barcodes.
//!
//! # Overview
//!
//! The flow of data is as follows:
//!
//! - The [`barcode_table::BarcodeIndex`] is loaded once from the barcode manifest and holds the
//!   forward and reverse barcodes, the primers, and the sample for each barcode combination.
//! - [`fastq::PairedReads`] yields forward/reverse [`fastq::ReadRecord`] pairs in lockstep.
//! - The [`demux::Demultiplexer`] uses a [`primer::BarcodeExtractor`] and a
//!   [`matcher::Corrector`] per side to decide each pair's sample.
//! - The [`sample_writer::SampleWriters`] append each pair to its sample's (or the unplaced)
//!   files.
//! - [`metrics`] are collected along the way and written to TSV files at the end.
#![deny(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]
pub mod barcode_table;
pub mod demux;
pub mod fastq;
pub mod matcher;
pub mod metrics;
pub mod opts;
pub mod primer;
pub mod run;
pub mod sample_writer;
pub mod utils;
