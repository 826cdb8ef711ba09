#![forbid(unsafe_code)]

use std::{num::NonZeroUsize, path::PathBuf};

use clap::Parser;
use env_logger::Env;

use crate::{
    matcher::MatcherKind,
    metrics::DEFAULT_MIN_MEAN_INDEX_QUALITY,
    utils::{built_info, NUM_CPU},
};

pub static TOOL_NAME: &str = "hopdemux";

static SHORT_USAGE: &str =
    "Demultiplexes dual-indexed paired-end FASTQs and quantifies index hopping.";

static LONG_USAGE: &str = "
Demultiplexes dual-indexed paired-end FASTQs and quantifies index hopping.

Four FASTQs are read in lockstep: the two template reads (R1, R2) and the two index reads
(I1, I2).  The FASTQs may be uncompressed, gzip compressed, or block compressed (BGZF).

Each read's index pair is compared to the expected pairs in the sample sheet, allowing up to
--index1-mismatches and --index2-mismatches mismatches.  A read is assigned to the sample whose
two indexes both match.  If index1 matches one sample and index2 a different sample, the read
has hopped and is written to the Hopped bucket.  All other reads are undetermined.

Per-bucket files with suffixes _R1.fastq.gz and _R2.fastq.gz are written to the output directory,
along with run_metrics.tsv, per_sample_metrics.tsv and index_hop_metrics.tsv.

The sample sheet may be a simple CSV with the columns `Sample_ID`, `Index1_Sequence` and
`Index2_Sequence`, or a sheet with a `[Data]` section holding those columns.  A sheet may also
have a `[Demux]` section of `option,value` rows that override the command line options.  The
sample IDs `Hopped` and `Undetermined` are reserved.

Example invocation:

hopdemux \\
  --read1 R1.fq.gz --read2 R2.fq.gz \\
  --index1 I1.fq.gz --index2 I2.fq.gz \\
  --sample-metadata samples.csv \\
  --output-dir demuxed-fastqs/
";

#[derive(Parser, Debug, Clone)]
#[clap(name = TOOL_NAME, version = built_info::VERSION.as_str(), about=SHORT_USAGE, long_about=LONG_USAGE, term_width=0)]
pub struct Opts {
    /// Path to the read 1 (template) FASTQ.
    #[clap(long, short = 'r', display_order = 1)]
    pub read1: PathBuf,

    /// Path to the read 2 (template) FASTQ.
    #[clap(long, short = 'R', display_order = 1)]
    pub read2: PathBuf,

    /// Path to the index 1 FASTQ.
    #[clap(long, short = 'i', display_order = 1)]
    pub index1: PathBuf,

    /// Path to the index 2 FASTQ.
    #[clap(long, short = 'I', display_order = 1)]
    pub index2: PathBuf,

    /// Path to the sample metadata.
    #[clap(long, short = 's', display_order = 2)]
    pub sample_metadata: PathBuf,

    /// The directory to write outputs.
    ///
    /// This tool will overwrite existing files.
    #[clap(long, short, display_order = 4)]
    pub output_dir: PathBuf,

    /// Number of allowed mismatches between the observed index1 and a sample's index1.
    #[clap(long, default_value = "1", display_order = 11)]
    pub index1_mismatches: usize,

    /// Number of allowed mismatches between the observed index2 and a sample's index2.
    #[clap(long, default_value = "1", display_order = 11)]
    pub index2_mismatches: usize,

    /// Reverse complement the observed index2 before matching.
    ///
    /// Use this when index2 was sequenced on the opposite strand from the sample sheet.
    #[clap(long, display_order = 11)]
    pub revcomp_index2: bool,

    /// Reads where the mean quality of either index is below this are counted as having a low
    /// quality index in the run metrics.  Routing is not affected.
    #[clap(long, default_value_t = DEFAULT_MIN_MEAN_INDEX_QUALITY, display_order = 11)]
    pub min_mean_index_quality: u8,

    /// A prefix for all output file names.
    #[clap(long, default_value = "", display_order = 21)]
    pub prefix: String,

    /// The number of reads to extract from a FASTQ at one time.
    ///
    /// A "chunk" is the unit of parallelization for all of demultiplexing and defines how many reads are operated on at one time.
    #[clap(long, short = 'c', default_value = "1000", display_order = 31, hide = true)]
    pub chunksize: NonZeroUsize,

    /// Number of threads for demultiplexing.
    ///
    /// The number of threads to use for the process of determining which input reads should be assigned to which bucket.
    #[clap(long, short = 't', default_value = NUM_CPU.as_str(), display_order = 31)]
    pub demux_threads: usize,

    /// Number of threads for compression the output reads.
    ///
    /// The number of threads to use for compressing reads that are queued for writing.
    #[clap(long, default_value = "12", display_order = 31)]
    pub compressor_threads: usize,

    /// Number of threads for writing compressed reads to output.
    ///
    /// The number of threads to have writing reads to their individual output files.
    #[clap(long, default_value = "5", display_order = 31)]
    pub writer_threads: usize,

    /// The number of threads to use for decompression for each BGZF reader.
    #[clap(long, default_value = "4", display_order = 31, hide = true)]
    pub decompression_threads_per_reader: usize,

    /// Override the matcher heuristic.
    ///
    /// If both indexes are <= 12 bp long and both mismatch budgets are <= 2, every sequence
    /// within budget of an expected index is precomputed.  Otherwise, the expected indexes are
    /// scanned for each read.
    ///
    /// This option allows for overriding that heuristic.
    ///
    /// [default: None]
    #[clap(long, possible_values=MatcherKind::possible_values(), display_order = 31)]
    pub override_matcher: Option<MatcherKind>,
}

impl Opts {
    /// The input FASTQs in R1, R2, I1, I2 order.
    pub fn fastqs(&self) -> [PathBuf; 4] {
        [self.read1.clone(), self.read2.clone(), self.index1.clone(), self.index2.clone()]
    }
}

/// Implement defaults that match the CLI options to allow for easier testing.
///
/// Note that these defaults exist only within test code.
#[cfg(test)]
impl Default for Opts {
    fn default() -> Self {
        Self {
            read1: PathBuf::default(),
            read2: PathBuf::default(),
            index1: PathBuf::default(),
            index2: PathBuf::default(),
            sample_metadata: PathBuf::default(),
            output_dir: PathBuf::default(),
            index1_mismatches: 1,
            index2_mismatches: 1,
            revcomp_index2: false,
            min_mean_index_quality: DEFAULT_MIN_MEAN_INDEX_QUALITY,
            prefix: String::new(),
            chunksize: NonZeroUsize::new(500).unwrap(),
            demux_threads: 4,
            compressor_threads: 4,
            writer_threads: 4,
            decompression_threads_per_reader: 4,
            override_matcher: None,
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
