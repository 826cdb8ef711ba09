//! Functionality pertaining to the collection of metrics during demultiplexing.
//!
//! Every classified read is recorded in a [`RunStatistics`]: exact and near matches per sample,
//! index hops per unordered pair of samples, and undetermined reads.  Each chunk of reads that is
//! demultiplexed in parallel gets its own [`RunStatistics`], which is merged into the run's single
//! [`StatisticsAggregator`] once the chunk is done.  Merging is associative and commutative, so
//! the order in which chunks finish does not matter.
//!
//! Rates are derived from the raw counters on demand and are never stored.
//!
//! Index base qualities are tracked by an [`IndexQualityCounter`] for reporting only; they never
//! change how a read is routed.
//!
//! All metrics are writable to files.

use std::{collections::BTreeMap, path::Path};

use anyhow::Result;
use fgoxide::io::DelimFile;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    demux::IndexQualities,
    matcher::{MatchResult, ObservedIndexPair},
    registry::BarcodeRegistry,
};

/// The default minimum mean (Phred) quality of each index for a read to not be counted as having a
/// low quality index.
pub const DEFAULT_MIN_MEAN_INDEX_QUALITY: u8 = 32;

/// The offset of the ASCII encoded Phred quality scores.
const PHRED_OFFSET: u8 = 33;

/// The match counts for a single sample.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SampleCounts {
    /// The number of reads where both indexes matched the sample exactly.
    pub exact: usize,
    /// The number of reads matched to the sample with at least one mismatch.
    pub near: usize,
}

impl SampleCounts {
    /// The total number of reads attributed to this sample.
    pub fn total(&self) -> usize {
        self.exact + self.near
    }

    pub fn update_with(&mut self, other: &Self) {
        self.exact += other.exact;
        self.near += other.near;
    }
}

/// A helper object for tracking the quality scores and no-calls of index bases.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexQualityCounter {
    /// The total number of index bases with a quality score.
    pub index_bases: u64,
    /// The sum of the quality scores of those index bases.
    pub index_qual_sum: u64,
    /// The number of reads with an `N` in either index.
    pub reads_with_no_calls: u64,
    /// The number of reads where the mean quality of either index is below the minimum.
    pub reads_with_low_quality_index: u64,
}

impl IndexQualityCounter {
    /// Update the counts with one read.  Only the no-call count is updated if there are no
    /// qualities.
    pub fn update(
        &mut self,
        observed: &ObservedIndexPair,
        qualities: Option<&IndexQualities>,
        min_mean_index_quality: u8,
    ) {
        if observed.num_no_calls() > 0 {
            self.reads_with_no_calls += 1;
        }
        if let Some(qualities) = qualities {
            let mut low_quality = false;
            for quals in [&qualities.index1, &qualities.index2] {
                let sum: u64 = quals.iter().map(|q| u64::from(q.saturating_sub(PHRED_OFFSET))).sum();
                self.index_bases += quals.len() as u64;
                self.index_qual_sum += sum;
                if !quals.is_empty() && sum < u64::from(min_mean_index_quality) * quals.len() as u64 {
                    low_quality = true;
                }
            }
            if low_quality {
                self.reads_with_low_quality_index += 1;
            }
        }
    }

    /// Update self based on another instance of [`IndexQualityCounter`].
    pub fn update_with_self(&mut self, other: &Self) {
        self.index_bases += other.index_bases;
        self.index_qual_sum += other.index_qual_sum;
        self.reads_with_no_calls += other.reads_with_no_calls;
        self.reads_with_low_quality_index += other.reads_with_low_quality_index;
    }

    /// The mean quality of all index bases, 0 when no qualities were seen.
    pub fn mean_index_base_quality(&self) -> f64 {
        ratio(self.index_qual_sum as f64, self.index_bases as f64)
    }
}

/// Divide, returning zero when the denominator is zero.
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// The raw counters for a run, or for a part of a run.
///
/// Every recorded read increments exactly one of: a sample's exact count, a sample's near count, a
/// hop pair's count, or the undetermined count.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStatistics {
    /// The match counts, indexed by sample ordinal.
    pub per_sample: Vec<SampleCounts>,
    /// The hop counts, keyed by `(smaller ordinal, larger ordinal)`.
    pub hops: BTreeMap<(usize, usize), usize>,
    /// The number of reads that matched no sample.
    pub undetermined_count: usize,
    /// The number of reads recorded.
    pub total_reads_processed: usize,
    /// Index quality counters, for reporting only.
    pub index_quality: IndexQualityCounter,
}

impl RunStatistics {
    /// Create empty statistics for a registry with `num_samples` samples.
    pub fn new(num_samples: usize) -> Self {
        Self { per_sample: vec![SampleCounts::default(); num_samples], ..Self::default() }
    }

    /// Record the classification of one read.
    pub fn record(&mut self, result: &MatchResult) {
        match *result {
            MatchResult::Exact { sample } => self.sample_counts_mut(sample).exact += 1,
            MatchResult::NearMatch { sample, .. } => self.sample_counts_mut(sample).near += 1,
            MatchResult::Hopped { index1_sample, index2_sample } => {
                let key = (index1_sample.min(index2_sample), index1_sample.max(index2_sample));
                *self.hops.entry(key).or_insert(0) += 1;
            }
            MatchResult::Undetermined => self.undetermined_count += 1,
        }
        self.total_reads_processed += 1;
    }

    fn sample_counts_mut(&mut self, sample: usize) -> &mut SampleCounts {
        if sample >= self.per_sample.len() {
            self.per_sample.resize(sample + 1, SampleCounts::default());
        }
        &mut self.per_sample[sample]
    }

    /// Add the counts from `other` to these counts.
    pub fn merge(&mut self, other: &RunStatistics) {
        if other.per_sample.len() > self.per_sample.len() {
            self.per_sample.resize(other.per_sample.len(), SampleCounts::default());
        }
        for (s, o) in self.per_sample.iter_mut().zip(other.per_sample.iter()) {
            s.update_with(o);
        }
        for (key, count) in &other.hops {
            *self.hops.entry(*key).or_insert(0) += count;
        }
        self.undetermined_count += other.undetermined_count;
        self.total_reads_processed += other.total_reads_processed;
        self.index_quality.update_with_self(&other.index_quality);
    }

    /// The match counts for a sample.
    pub fn sample_counts(&self, sample: usize) -> SampleCounts {
        self.per_sample.get(sample).copied().unwrap_or_default()
    }

    /// The number of hops between two samples, in either direction.
    pub fn hop_count(&self, a: usize, b: usize) -> usize {
        self.hops.get(&(a.min(b), a.max(b))).copied().unwrap_or(0)
    }

    /// The number of hops involving the given sample.
    pub fn sample_hop_count(&self, sample: usize) -> usize {
        self.hops.iter().filter(|((a, b), _)| *a == sample || *b == sample).map(|(_, c)| c).sum()
    }

    pub fn total_exact(&self) -> usize {
        self.per_sample.iter().map(|c| c.exact).sum()
    }

    pub fn total_near(&self) -> usize {
        self.per_sample.iter().map(|c| c.near).sum()
    }

    pub fn total_hops(&self) -> usize {
        self.hops.values().sum()
    }

    /// The number of reads attributed to a sample.
    pub fn matched_reads(&self) -> usize {
        self.total_exact() + self.total_near()
    }

    /// The sum over every counter; equal to `total_reads_processed`.
    pub fn counted_reads(&self) -> usize {
        self.matched_reads() + self.total_hops() + self.undetermined_count
    }

    /// Hops involving the sample over all reads.
    pub fn sample_hop_rate(&self, sample: usize) -> f64 {
        ratio(self.sample_hop_count(sample) as f64, self.total_reads_processed as f64)
    }

    /// All hops over all reads.
    pub fn index_hopping_rate(&self) -> f64 {
        ratio(self.total_hops() as f64, self.total_reads_processed as f64)
    }

    /// All near matches over all reads.
    pub fn barcode_error_rate(&self) -> f64 {
        ratio(self.total_near() as f64, self.total_reads_processed as f64)
    }

    /// Write the metrics files for these statistics.
    ///
    /// This will create `run_metrics.tsv`, `per_sample_metrics.tsv`, and `index_hop_metrics.tsv`
    /// files, each prefixed by `prefix`, in the provided `output_dir`.
    pub fn write_metrics_files<P: AsRef<Path>>(
        &self,
        registry: &BarcodeRegistry,
        output_dir: P,
        prefix: &str,
    ) -> Result<()> {
        let delim = DelimFile::default();
        let total = self.total_reads_processed as f64;

        let run_metrics = RunMetrics {
            total_reads: self.total_reads_processed,
            matched_reads: self.matched_reads(),
            exact_matches: self.total_exact(),
            near_matches: self.total_near(),
            hopped_reads: self.total_hops(),
            undetermined_reads: self.undetermined_count,
            index_hopping_rate: self.index_hopping_rate(),
            barcode_error_rate: self.barcode_error_rate(),
            mean_index_base_quality: self.index_quality.mean_index_base_quality(),
            reads_with_no_calls: self.index_quality.reads_with_no_calls,
            reads_with_low_quality_index: self.index_quality.reads_with_low_quality_index,
        };
        let output_path = output_dir.as_ref().join(format!("{}run_metrics.tsv", prefix));
        delim.write_tsv(&output_path, std::iter::once(run_metrics))?;

        let per_sample_metrics = registry.samples().iter().map(|sample| {
            let counts = self.sample_counts(sample.ordinal);
            SampleMetrics {
                sample_id: sample.sample_id.clone(),
                index1: sample.index1.to_string(),
                index2: sample.index2.to_string(),
                templates: counts.total(),
                exact_matches: counts.exact,
                near_matches: counts.near,
                hopped_reads: self.sample_hop_count(sample.ordinal),
                fraction_matches: ratio(counts.total() as f64, total),
                hop_rate: self.sample_hop_rate(sample.ordinal),
            }
        });
        let output_path = output_dir.as_ref().join(format!("{}per_sample_metrics.tsv", prefix));
        delim.write_tsv(&output_path, per_sample_metrics)?;

        let hop_metrics = self
            .hops
            .iter()
            .map(|(&(a, b), &count)| {
                let (a, b) = if registry.cmp_samples(a, b).is_gt() { (b, a) } else { (a, b) };
                let (sample_a, sample_b) = (registry.sample(a), registry.sample(b));
                IndexHopMetrics {
                    sample_a: sample_a.sample_id.clone(),
                    sample_b: sample_b.sample_id.clone(),
                    barcode_a: sample_a.barcode_pair(),
                    barcode_b: sample_b.barcode_pair(),
                    count,
                    fraction_of_reads: ratio(count as f64, total),
                }
            })
            .sorted_by(|x, y| {
                y.count
                    .cmp(&x.count)
                    .then_with(|| x.sample_a.cmp(&y.sample_a))
                    .then_with(|| x.sample_b.cmp(&y.sample_b))
            });
        let output_path = output_dir.as_ref().join(format!("{}index_hop_metrics.tsv", prefix));
        delim.write_tsv(&output_path, hop_metrics)?;

        Ok(())
    }
}

/// The single owner of a run's [`RunStatistics`].
///
/// Workers record into private partial statistics that are merged here; the snapshot is valid at
/// any point between merges.
#[derive(Debug, Clone)]
pub struct StatisticsAggregator {
    stats: RunStatistics,
    min_mean_index_quality: u8,
}

impl StatisticsAggregator {
    pub fn new(num_samples: usize) -> Self {
        Self::with_min_mean_index_quality(num_samples, DEFAULT_MIN_MEAN_INDEX_QUALITY)
    }

    pub fn with_min_mean_index_quality(num_samples: usize, min_mean_index_quality: u8) -> Self {
        Self { stats: RunStatistics::new(num_samples), min_mean_index_quality }
    }

    /// Record the classification of one read.
    pub fn record(&mut self, result: &MatchResult) {
        self.stats.record(result);
    }

    /// Record the classification of one read along with its index quality metrics.
    pub fn record_read(
        &mut self,
        result: &MatchResult,
        observed: &ObservedIndexPair,
        qualities: Option<&IndexQualities>,
    ) {
        self.stats.record(result);
        self.stats.index_quality.update(observed, qualities, self.min_mean_index_quality);
    }

    /// Merge a partial result into the run's statistics.
    pub fn merge(&mut self, partial: &RunStatistics) {
        self.stats.merge(partial);
    }

    /// A copy of the current statistics.
    pub fn snapshot(&self) -> RunStatistics {
        self.stats.clone()
    }

    pub fn statistics(&self) -> &RunStatistics {
        &self.stats
    }

    pub fn into_statistics(self) -> RunStatistics {
        self.stats
    }

    pub fn min_mean_index_quality(&self) -> u8 {
        self.min_mean_index_quality
    }
}

/// The high level metrics for all reads that were demuxed.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunMetrics {
    /// The total number of reads classified.
    pub(crate) total_reads: usize,
    /// The number of reads attributed to a sample.
    pub(crate) matched_reads: usize,
    /// The number of reads with both indexes matching a sample exactly.
    pub(crate) exact_matches: usize,
    /// The number of reads matched to a sample with at least one mismatch.
    pub(crate) near_matches: usize,
    /// The number of reads whose indexes identified two different samples.
    pub(crate) hopped_reads: usize,
    /// The number of reads with no sample within budget for either index.
    pub(crate) undetermined_reads: usize,
    /// Hopped reads over all reads.
    pub(crate) index_hopping_rate: f64,
    /// Near matches over all reads.
    pub(crate) barcode_error_rate: f64,
    /// The mean quality of index bases.
    pub(crate) mean_index_base_quality: f64,
    /// The number of reads with an `N` in either index.
    pub(crate) reads_with_no_calls: u64,
    /// The number of reads where the mean quality of either index is below the minimum.
    pub(crate) reads_with_low_quality_index: u64,
}

/// The per-sample metrics.
#[derive(Debug, Serialize, Deserialize)]
pub struct SampleMetrics {
    pub(crate) sample_id: String,
    pub(crate) index1: String,
    pub(crate) index2: String,
    /// The total number of reads attributed to this sample.
    pub(crate) templates: usize,
    pub(crate) exact_matches: usize,
    pub(crate) near_matches: usize,
    /// The number of hopped reads where one index identified this sample.
    pub(crate) hopped_reads: usize,
    /// The fraction of all reads attributed to this sample.
    pub(crate) fraction_matches: f64,
    /// Hopped reads involving this sample over all reads.
    pub(crate) hop_rate: f64,
}

/// The number of hops between a pair of samples.  `sample_a` sorts before `sample_b`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexHopMetrics {
    pub(crate) sample_a: String,
    pub(crate) sample_b: String,
    /// The index pair of `sample_a`, as `index1+index2`.
    pub(crate) barcode_a: String,
    /// The index pair of `sample_b`, as `index1+index2`.
    pub(crate) barcode_b: String,
    pub(crate) count: usize,
    /// The count over all reads.
    pub(crate) fraction_of_reads: f64,
}
