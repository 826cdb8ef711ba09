use std::{fs::File, io::BufWriter};

use anyhow::{anyhow, ensure, Context, Result};
use gzp::BUFSIZE;
use log::{debug, info, warn};
use parking_lot::Mutex;
use pooled_writer::{bgzf::BgzfCompressor, Pool};
use rayon::prelude::*;
use seq_io::fastq::RecordSet;

use crate::{
    demux::{BucketId, CancelFlag, Demultiplexer, PerFastqRecordSet},
    matcher::{DualIndexMatcher, Matcher, MatcherKind},
    metrics::{RunStatistics, StatisticsAggregator},
    opts::Opts,
    pooled_sample_writer::BucketWriters,
    sample_sheet::SampleSheet,
    thread_reader::ThreadReader,
    utils::bucket_filenames,
};

/// Run demultiplexing.
pub fn run(opts: Opts) -> Result<()> {
    run_with_cancel(opts, &CancelFlag::new()).map(|_| ())
}

/// Run demultiplexing, stopping between chunks once `cancel` is set.
///
/// The metrics files are written whenever processing has started, including after an error or a
/// cancellation; they then cover the chunks that were fully written.  The returned statistics are
/// the ones written.
pub fn run_with_cancel(opts: Opts, cancel: &CancelFlag) -> Result<RunStatistics> {
    let SampleSheet { registry, opts } = SampleSheet::from_path(opts)?;
    info!(
        "Loaded {} samples with {} bp index1 and {} bp index2",
        registry.len(),
        registry.index1_length(),
        registry.index2_length()
    );

    // Preflight checks
    for fastq in &opts.fastqs() {
        ensure!(fastq.exists(), "Input FASTQ does not exist: {}", fastq.to_string_lossy());
    }
    std::fs::create_dir_all(&opts.output_dir).with_context(|| {
        format!("Unable to create output directory: {}", opts.output_dir.to_string_lossy())
    })?;

    let (budget1, budget2) = (opts.index1_mismatches, opts.index2_mismatches);
    let min_quality = opts.min_mean_index_quality;
    let matcher_kind =
        opts.override_matcher.unwrap_or_else(|| MatcherKind::choose(&registry, budget1, budget2));
    match matcher_kind {
        MatcherKind::PreCompute => {
            debug!("Using the precomputed matcher");
            let matcher = DualIndexMatcher::precompute(&registry, budget1, budget2);
            let demuxer = Demultiplexer::new(matcher).with_min_mean_index_quality(min_quality);
            demux_fastqs(&opts, &demuxer, cancel)
        }
        MatcherKind::Scan => {
            debug!("Using the scanning matcher");
            let matcher = DualIndexMatcher::scan(&registry, budget1, budget2);
            let demuxer = Demultiplexer::new(matcher).with_min_mean_index_quality(min_quality);
            demux_fastqs(&opts, &demuxer, cancel)
        }
    }
}

/// Demultiplex the input FASTQs into the per-bucket output FASTQs, then write the metrics.
fn demux_fastqs<M: Matcher>(
    opts: &Opts,
    demuxer: &Demultiplexer<M>,
    cancel: &CancelFlag,
) -> Result<RunStatistics> {
    let registry = demuxer.registry();
    let num_samples = registry.len();

    info!("Creating writer threads");
    let writers: Result<Vec<_>> = (0..BucketId::num_buckets(num_samples))
        .flat_map(|slot| {
            let name = BucketId::from_slot(slot, num_samples).name(registry);
            bucket_filenames(&opts.output_dir, &opts.prefix, name)
        })
        .map(|name| {
            File::create(&name)
                .with_context(|| format!("Unable to create file: {}", name.to_string_lossy()))
                .map(|f| BufWriter::with_capacity(BUFSIZE, f))
        })
        .collect();
    let (mut pool, pooled_writers) = Pool::new::<_, BgzfCompressor>(
        opts.writer_threads,
        opts.compressor_threads,
        2,
        writers?,
    )?;
    let writers = BucketWriters::new(pooled_writers, num_samples)?;

    info!("Creating reader threads");
    let readers = opts
        .fastqs()
        .into_iter()
        .map(|f| ThreadReader::new(f, opts.chunksize, opts.decompression_threads_per_reader))
        .collect::<Vec<_>>();
    let rpool = rayon::ThreadPoolBuilder::new().num_threads(opts.demux_threads).build()?;

    let aggregator: Mutex<StatisticsAggregator> = Mutex::new(demuxer.new_aggregator());

    info!("Processing data");
    let processing: Result<()> = rpool.install(|| {
        std::iter::from_fn(|| next_chunks(&readers))
            .take_while(|_| !cancel.is_cancelled())
            .par_bridge()
            .try_for_each(|per_fastq_chunks| {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let record_set = PerFastqRecordSet::new(per_fastq_chunks?)?;
                let reads = record_set.indexed_reads(opts.revcomp_index2)?;
                let mut group = demuxer.demultiplex(reads)?;
                let stats = std::mem::take(&mut group.stats);
                writers.write_group(group)?;
                aggregator.lock().merge(&stats);
                Ok(())
            })
    });

    info!("Joining reader threads");
    let reading: Result<()> = readers.into_iter().map(ThreadReader::join).collect();

    info!("Joining writer threads");
    let writing = writers
        .finish()
        .context("Failed to flush and finish writing.")
        .and_then(|()| pool.stop_pool().context("Failed to stop the writer pool."));

    let stats = aggregator.into_inner().into_statistics();
    if cancel.is_cancelled() {
        warn!(
            "Demultiplexing was cancelled, metrics cover the first {} reads",
            stats.total_reads_processed
        );
    } else if processing.is_err() || reading.is_err() {
        warn!(
            "Demultiplexing stopped early, metrics cover the first {} reads",
            stats.total_reads_processed
        );
    }

    info!("Writing stats");
    let metrics = stats.write_metrics_files(registry, &opts.output_dir, &opts.prefix);

    reading?;
    processing?;
    writing?;
    metrics?;
    info!(
        "Processed {} reads: {} matched, {} hopped, {} undetermined",
        stats.total_reads_processed,
        stats.matched_reads(),
        stats.total_hops(),
        stats.undetermined_count
    );
    Ok(stats)
}

/// Receive the next chunk from every reader, in R1, R2, I1, I2 order.
///
/// Returns `None` once every reader is done, and an error if only some of them are.
fn next_chunks(readers: &[ThreadReader]) -> Option<Result<Vec<RecordSet>>> {
    let chunks: Vec<Option<RecordSet>> = readers.iter().map(|r| r.rx.recv().ok()).collect();
    if chunks.iter().all(Option::is_none) {
        None
    } else if chunks.iter().all(Option::is_some) {
        Some(Ok(chunks.into_iter().flatten().collect()))
    } else {
        Some(Err(anyhow!("Input FASTQs have unequal numbers of reads")))
    }
}
