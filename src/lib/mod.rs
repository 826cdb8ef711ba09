//! A library of functionality for demultiplexing dual-indexed FASTQ files and quantifying index
//! hopping.
//!
//! # Overview
//!
//! The core classifies one observed index pair at a time:
//!
//! - The [`registry::BarcodeRegistry`] holds the expected (index1, index2) pair of every sample.
//! - A [`matcher::Matcher`] classifies an observed pair as an exact match, a near match, an index
//!   hop or undetermined.
//! - The [`demux::Demultiplexer`] routes each read to a [`demux::BucketId`] and records it in the
//!   [`metrics::RunStatistics`].
//!
//! The flow of data through the command line tool is as follows:
//!
//! - The [`thread_reader::ThreadReader`]s extract chunks of reads from the R1, R2, I1 and I2
//!   FASTQs, which are zipped together for processing.
//! - Chunks are demultiplexed in parallel, each converting a [`demux::PerFastqRecordSet`] into a
//!   [`demux::DemuxedGroup`].
//! - The [`pooled_sample_writer::BucketWriters`] write each bucket's reads to its R1 and R2 files.
//! - The statistics of each chunk are merged into one [`metrics::StatisticsAggregator`] and
//!   written as [`metrics`] files at the end of the run.
#![deny(unsafe_code)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]
pub mod demux;
pub mod matcher;
pub mod metrics;
pub mod opts;
pub mod pooled_sample_writer;
pub mod registry;
pub mod run;
pub mod sample_metadata;
pub mod sample_sheet;
pub mod thread_reader;
pub mod utils;
