//! Functionality directly related to routing classified reads to their output buckets.
//!
//! Each read carries its [`ObservedIndexPair`] and an opaque payload.  The [`Demultiplexer`]
//! classifies the pair with a [`Matcher`], sends the payload to exactly one [`BucketId`], and
//! records exactly one counter for it.  A read whose index lengths differ from the registry's
//! stops processing with [`BarcodeError::LengthMismatch`] before anything is counted.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{ensure, Context, Result};
use bstr::ByteSlice;
use itertools::Itertools;
use seq_io::{
    fastq::{OwnedRecord, Record, RecordSet},
    BaseRecord,
};

use crate::{
    matcher::{MatchResult, Matcher, ObservedIndexPair},
    metrics::{RunStatistics, StatisticsAggregator, DEFAULT_MIN_MEAN_INDEX_QUALITY},
    registry::{BarcodeError, BarcodeRegistry},
    utils::MultiZip,
};

/// The name of the bucket for reads whose indexes identify two different samples.
pub const HOPPED_NAME: &str = "Hopped";

/// The name of the bucket for reads that match no sample.
pub const UNDETERMINED_NAME: &str = "Undetermined";

/// The Phred+33 quality scores of the two index reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQualities {
    pub index1: Vec<u8>,
    pub index2: Vec<u8>,
}

/// A read to demultiplex: its observed indexes and the payload to route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedRead<P> {
    pub observed: ObservedIndexPair,
    /// Index qualities, used for metrics only.
    pub qualities: Option<IndexQualities>,
    pub payload: P,
}

impl<P> IndexedRead<P> {
    pub fn new(observed: ObservedIndexPair, payload: P) -> Self {
        Self { observed, qualities: None, payload }
    }

    #[must_use]
    pub fn with_qualities(mut self, qualities: IndexQualities) -> Self {
        self.qualities = Some(qualities);
        self
    }
}

/// The template reads of one read, as written to the output FASTQs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPair {
    pub r1: OwnedRecord,
    pub r2: OwnedRecord,
}

impl ReadPair {
    /// Build an [`IndexedRead`] from the R1, R2, I1 and I2 records of one read.
    ///
    /// The read names must agree up to the first space.  The output headers have the observed
    /// `index1+index2` set as the sample barcode.  If `revcomp_index2` is true the index2 bases are
    /// reverse complemented (and its qualities reversed) before matching.
    pub fn from_records<R: Record>(
        records: &[R],
        revcomp_index2: bool,
    ) -> Result<IndexedRead<ReadPair>> {
        ensure!(
            records.len() == 4,
            "Expected four records (R1, R2, I1, I2) per read, found {}",
            records.len()
        );
        check_read_names(records)?;

        let (index1, index2) = (&records[2], &records[3]);
        let mut observed = ObservedIndexPair::new(index1.seq(), index2.seq());
        let mut index2_quals = index2.qual().to_vec();
        if revcomp_index2 {
            observed = observed.with_index2_reverse_complemented();
            index2_quals.reverse();
        }
        let qualities = IndexQualities { index1: index1.qual().to_vec(), index2: index2_quals };

        let barcode = observed.to_string();
        let r1 = annotated_record(&records[0], barcode.as_bytes());
        let r2 = annotated_record(&records[1], barcode.as_bytes());

        Ok(IndexedRead::new(observed, ReadPair { r1, r2 }).with_qualities(qualities))
    }
}

/// Ensure the read names match across all records, up to the first space.
fn check_read_names<R: Record>(records: &[R]) -> Result<()> {
    let first_head = records[0].head();
    let end_index = first_head.find_byte(b' ').unwrap_or(first_head.len());
    for read in records.iter().dropping(1) {
        let cur_head = read.head();
        let ok = cur_head.len() == end_index
            || (cur_head.len() > end_index && cur_head[end_index] == b' ');
        let ok = ok && first_head[0..end_index] == cur_head[0..end_index];
        ensure!(
            ok,
            "Read names did not match: {:?} != {:?}",
            String::from_utf8_lossy(first_head),
            String::from_utf8_lossy(cur_head)
        );
    }
    Ok(())
}

/// Copy a record, setting its sample barcode.
fn annotated_record<R: Record>(record: &R, barcode: &[u8]) -> OwnedRecord {
    OwnedRecord {
        head: annotate_header(record.head(), barcode),
        seq: record.seq().to_vec(),
        qual: record.qual().to_vec(),
    }
}

/// Set the sample barcode field of an Illumina style comment (`1:N:0:ATCACG`) to `barcode`.
///
/// When there is no comment, or the comment is in another form, the barcode is appended to the
/// header as a new space separated field.
fn annotate_header(head: &[u8], barcode: &[u8]) -> Vec<u8> {
    let sample_field_start = head.find_byte(b' ').and_then(|space| {
        let comment = &head[space + 1..];
        if comment.split(|b| *b == b':').count() == 4 {
            comment.rfind_byte(b':').map(|colon| space + colon + 2)
        } else {
            None
        }
    });

    let mut annotated = Vec::with_capacity(head.len() + barcode.len() + 1);
    match sample_field_start {
        Some(start) => annotated.extend_from_slice(&head[..start]),
        None => {
            annotated.extend_from_slice(head);
            annotated.push(b' ');
        }
    }
    annotated.extend_from_slice(barcode);
    annotated
}

/// A [`PerFastqRecordSet`] is a collection of [`RecordSet`]s, one each from the R1, R2, I1 and I2
/// FASTQs, holding the same reads.
#[derive(Debug)]
pub struct PerFastqRecordSet {
    per_fastq_reads: Vec<RecordSet>,
}

impl PerFastqRecordSet {
    /// Create a new [`PerFastqRecordSet`] from the record sets in R1, R2, I1, I2 order.
    ///
    /// Each record set must contain the same number of reads.
    pub fn new(per_fastq_reads: Vec<RecordSet>) -> Result<Self> {
        ensure!(
            per_fastq_reads.len() == 4,
            "Expected record sets from four FASTQs, found {}",
            per_fastq_reads.len()
        );
        ensure!(
            per_fastq_reads.iter().all(|s| s.len() == per_fastq_reads[0].len()),
            "Unequal number of reads in each record set (likely uneven input FASTQs)"
        );
        Ok(Self { per_fastq_reads })
    }

    /// The number of reads in each record set.
    pub fn len(&self) -> usize {
        self.per_fastq_reads[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zip the record sets into one [`IndexedRead`] per read.
    pub fn indexed_reads(&self, revcomp_index2: bool) -> Result<Vec<IndexedRead<ReadPair>>> {
        let iterators = self.per_fastq_reads.iter().map(IntoIterator::into_iter).collect();
        MultiZip::new(iterators)
            .map(|records| ReadPair::from_records(&records, revcomp_index2))
            .collect()
    }
}

/// The output destination of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketId {
    /// A sample, by registry ordinal.
    Sample(usize),
    Hopped,
    Undetermined,
}

impl BucketId {
    /// The bucket for a classification.  Hopped reads never go to either sample.
    pub fn from_match(result: &MatchResult) -> Self {
        match *result {
            MatchResult::Exact { sample } | MatchResult::NearMatch { sample, .. } => {
                Self::Sample(sample)
            }
            MatchResult::Hopped { .. } => Self::Hopped,
            MatchResult::Undetermined => Self::Undetermined,
        }
    }

    /// The position of this bucket when samples come first, then hopped, then undetermined.
    pub fn slot(&self, num_samples: usize) -> usize {
        match *self {
            Self::Sample(ordinal) => ordinal,
            Self::Hopped => num_samples,
            Self::Undetermined => num_samples + 1,
        }
    }

    /// The inverse of [`BucketId::slot`].
    pub fn from_slot(slot: usize, num_samples: usize) -> Self {
        if slot < num_samples {
            Self::Sample(slot)
        } else if slot == num_samples {
            Self::Hopped
        } else {
            Self::Undetermined
        }
    }

    /// The number of buckets for a registry with `num_samples` samples.
    pub fn num_buckets(num_samples: usize) -> usize {
        num_samples + 2
    }

    /// The name used for the bucket's output files.
    pub fn name<'a>(&self, registry: &'a BarcodeRegistry) -> &'a str {
        match *self {
            Self::Sample(ordinal) => &registry.sample(ordinal).sample_id,
            Self::Hopped => HOPPED_NAME,
            Self::Undetermined => UNDETERMINED_NAME,
        }
    }
}

/// Receives routed payloads.
pub trait BucketSink<P> {
    fn accept(&mut self, bucket: BucketId, payload: P) -> Result<()>;
}

impl<P> BucketSink<P> for Vec<(BucketId, P)> {
    fn accept(&mut self, bucket: BucketId, payload: P) -> Result<()> {
        self.push((bucket, payload));
        Ok(())
    }
}

/// A flag shared between the caller and the workers, checked between reads and between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a call to [`Demultiplexer::process`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Cancelled,
}

/// Classifies reads and routes them to buckets.
///
/// This implementation is generic over the [`Matcher`] that is used.
pub struct Demultiplexer<M: Matcher> {
    matcher: M,
    /// Reads with a mean index quality below this are counted as low quality.
    min_mean_index_quality: u8,
}

impl<M: Matcher> Demultiplexer<M> {
    pub fn new(matcher: M) -> Self {
        Self { matcher, min_mean_index_quality: DEFAULT_MIN_MEAN_INDEX_QUALITY }
    }

    #[must_use]
    pub fn with_min_mean_index_quality(mut self, min_mean_index_quality: u8) -> Self {
        self.min_mean_index_quality = min_mean_index_quality;
        self
    }

    pub fn registry(&self) -> &BarcodeRegistry {
        self.matcher.registry()
    }

    /// An empty aggregator for this demultiplexer's registry.
    pub fn new_aggregator(&self) -> StatisticsAggregator {
        StatisticsAggregator::with_min_mean_index_quality(
            self.registry().len(),
            self.min_mean_index_quality,
        )
    }

    /// Classify one read without routing or counting it.
    pub fn classify_read<P>(
        &self,
        read: &IndexedRead<P>,
    ) -> Result<(BucketId, MatchResult), BarcodeError> {
        self.registry().check_lengths(&read.observed)?;
        let result = self.matcher.classify(&read.observed);
        Ok((BucketId::from_match(&result), result))
    }

    /// Demultiplex a chunk of reads into per-bucket payloads and the chunk's statistics.
    ///
    /// On error nothing from the chunk should be written or counted.
    pub fn demultiplex<P, I>(&self, reads: I) -> Result<DemuxedGroup<P>>
    where
        I: IntoIterator<Item = IndexedRead<P>>,
    {
        let num_samples = self.registry().len();
        let mut per_bucket_reads: Vec<Vec<P>> =
            (0..BucketId::num_buckets(num_samples)).map(|_| vec![]).collect();
        let mut partial = self.new_aggregator();

        for read in reads {
            let (bucket, result) = self
                .classify_read(&read)
                .with_context(|| format!("Failed to classify index pair {}", read.observed))?;
            partial.record_read(&result, &read.observed, read.qualities.as_ref());
            per_bucket_reads[bucket.slot(num_samples)].push(read.payload);
        }

        Ok(DemuxedGroup { per_bucket_reads, stats: partial.into_statistics() })
    }

    /// Classify reads one at a time, sending each payload to `sink` and recording it in
    /// `aggregator`.
    ///
    /// `cancel` is checked before each read.  On cancellation or error the aggregator holds the
    /// counts of every read that was routed.
    pub fn process<P, I, S>(
        &self,
        reads: I,
        sink: &mut S,
        aggregator: &mut StatisticsAggregator,
        cancel: &CancelFlag,
    ) -> Result<ProcessOutcome>
    where
        I: IntoIterator<Item = IndexedRead<P>>,
        S: BucketSink<P>,
    {
        for read in reads {
            if cancel.is_cancelled() {
                return Ok(ProcessOutcome::Cancelled);
            }
            let (bucket, result) = self
                .classify_read(&read)
                .with_context(|| format!("Failed to classify index pair {}", read.observed))?;
            let IndexedRead { observed, qualities, payload } = read;
            sink.accept(bucket, payload)?;
            aggregator.record_read(&result, &observed, qualities.as_ref());
        }
        Ok(ProcessOutcome::Completed)
    }
}

/// A chunk of demultiplexed reads with the statistics for that chunk.
#[derive(Debug)]
pub struct DemuxedGroup<P> {
    /// The payloads for each bucket, indexed by [`BucketId::slot`].
    pub per_bucket_reads: Vec<Vec<P>>,
    pub stats: RunStatistics,
}

impl<P> DemuxedGroup<P> {
    /// The payloads routed to the given bucket.
    pub fn bucket_reads(&self, bucket: BucketId) -> &[P] {
        let num_samples = self.num_samples();
        self.per_bucket_reads.get(bucket.slot(num_samples)).map_or(&[][..], Vec::as_slice)
    }

    fn num_samples(&self) -> usize {
        self.per_bucket_reads.len().saturating_sub(2)
    }

    /// Consume the group, yielding each bucket with its payloads.
    pub fn into_buckets(self) -> impl Iterator<Item = (BucketId, Vec<P>)> {
        let num_samples = self.num_samples();
        self.per_bucket_reads
            .into_iter()
            .enumerate()
            .map(move |(slot, reads)| (BucketId::from_slot(slot, num_samples), reads))
    }
}
