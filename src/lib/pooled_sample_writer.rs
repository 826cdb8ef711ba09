//! Writers that orchestrate writing demultiplexed read pairs to a set of [`PooledWriter`]s.
//!
//! Every bucket (each sample, hopped and undetermined) has an R1 and an R2 writer.  Compression
//! happens on the pool's threads; the writers here only queue bytes.

use anyhow::{ensure, Context, Result};
use parking_lot::Mutex;
use pooled_writer::PooledWriter;
use seq_io::BaseRecord;

use crate::demux::{BucketId, BucketSink, DemuxedGroup, ReadPair};

/// A struct that holds onto the R1 and R2 [`PooledWriter`]s for one bucket.
#[derive(Debug)]
pub struct PooledBucketWriter {
    r1: PooledWriter,
    r2: PooledWriter,
    pub reads_seen: usize,
}

impl PooledBucketWriter {
    /// Create a new [`PooledBucketWriter`].
    pub fn new(r1: PooledWriter, r2: PooledWriter) -> Self {
        Self { r1, r2, reads_seen: 0 }
    }

    /// Write the read pairs to the R1 and R2 FASTQs.
    pub fn write_records(&mut self, reads: Vec<ReadPair>) -> Result<()> {
        for pair in &reads {
            pair.r1.write(&mut self.r1)?;
            pair.r2.write(&mut self.r2)?;
        }
        self.reads_seen += reads.len();
        Ok(())
    }

    /// Consumes [`Self`], closing both writers to flush them.
    pub fn finish(self) -> Result<()> {
        self.r1.close()?;
        self.r2.close()?;
        Ok(())
    }
}

/// The writers for every bucket, in [`BucketId::slot`] order.
///
/// Each bucket is locked separately so that workers writing to different buckets do not wait
/// on each other.
#[derive(Debug)]
pub struct BucketWriters {
    writers: Vec<Mutex<PooledBucketWriter>>,
    num_samples: usize,
}

impl BucketWriters {
    /// Create the writers from the pooled writers for each bucket's R1 and R2 file, in slot order.
    pub fn new(pooled_writers: Vec<PooledWriter>, num_samples: usize) -> Result<Self> {
        let expected = BucketId::num_buckets(num_samples) * 2;
        ensure!(
            pooled_writers.len() == expected,
            "Expected {} writers for {} samples, found {}",
            expected,
            num_samples,
            pooled_writers.len()
        );
        let mut writers = Vec::with_capacity(expected / 2);
        let mut pooled_writers = pooled_writers.into_iter();
        while let (Some(r1), Some(r2)) = (pooled_writers.next(), pooled_writers.next()) {
            writers.push(Mutex::new(PooledBucketWriter::new(r1, r2)));
        }
        Ok(Self { writers, num_samples })
    }

    /// Write reads to the given bucket.
    pub fn write_bucket(&self, bucket: BucketId, reads: Vec<ReadPair>) -> Result<()> {
        if reads.is_empty() {
            return Ok(());
        }
        let slot = bucket.slot(self.num_samples);
        let writer = self
            .writers
            .get(slot)
            .with_context(|| format!("No writer for bucket {:?}", bucket))?;
        writer
            .lock()
            .write_records(reads)
            .with_context(|| format!("Failed to write reads to bucket: {:?}", bucket))
    }

    /// Write every bucket of a demultiplexed chunk.
    pub fn write_group(&self, group: DemuxedGroup<ReadPair>) -> Result<()> {
        for (bucket, reads) in group.into_buckets() {
            self.write_bucket(bucket, reads)?;
        }
        Ok(())
    }

    /// The number of read pairs written to a bucket so far.
    pub fn reads_seen(&self, bucket: BucketId) -> usize {
        self.writers.get(bucket.slot(self.num_samples)).map_or(0, |w| w.lock().reads_seen)
    }

    /// Consumes [`Self`], flushing and closing every writer.
    pub fn finish(self) -> Result<()> {
        for writer in self.writers {
            writer.into_inner().finish()?;
        }
        Ok(())
    }
}

impl BucketSink<ReadPair> for BucketWriters {
    fn accept(&mut self, bucket: BucketId, payload: ReadPair) -> Result<()> {
        self.write_bucket(bucket, vec![payload])
    }
}

#[cfg(test)]
mod test {
    use std::{fs::File, io::BufWriter};

    use pooled_writer::{bgzf::BgzfCompressor, Pool};
    use seq_io::fastq::OwnedRecord;
    use tempfile::tempdir;

    use crate::{
        demux::{BucketId, BucketSink, ReadPair},
        utils::test_commons::{generate_reads, slurp_fastq},
    };

    use super::BucketWriters;

    fn pairs(sample_number: usize, num_reads: usize) -> Vec<ReadPair> {
        generate_reads(sample_number, "R1", num_reads)
            .into_iter()
            .zip(generate_reads(sample_number, "R2", num_reads))
            .map(|(r1, r2)| ReadPair { r1, r2 })
            .collect()
    }

    #[test]
    fn test_bucket_writers() {
        let dir = tempdir().unwrap();
        // One sample, then hopped, then undetermined
        let files = vec![
            dir.path().join("s1_R1.fastq.gz"),
            dir.path().join("s1_R2.fastq.gz"),
            dir.path().join("hopped_R1.fastq.gz"),
            dir.path().join("hopped_R2.fastq.gz"),
            dir.path().join("undetermined_R1.fastq.gz"),
            dir.path().join("undetermined_R2.fastq.gz"),
        ];
        let raw_writers =
            files.iter().map(|name| BufWriter::new(File::create(name).unwrap())).collect();
        let (mut pool, pooled_writers) =
            Pool::new::<_, BgzfCompressor>(1, 1, 2, raw_writers).unwrap();
        let mut writers = BucketWriters::new(pooled_writers, 1).unwrap();

        let sample_reads = pairs(1, 2000);
        let hopped_reads = pairs(2, 10);
        writers.write_bucket(BucketId::Sample(0), sample_reads[..1000].to_vec()).unwrap();
        writers.write_bucket(BucketId::Sample(0), sample_reads[1000..].to_vec()).unwrap();
        for pair in &hopped_reads {
            writers.accept(BucketId::Hopped, pair.clone()).unwrap();
        }

        assert_eq!(writers.reads_seen(BucketId::Sample(0)), 2000);
        assert_eq!(writers.reads_seen(BucketId::Hopped), 10);
        assert_eq!(writers.reads_seen(BucketId::Undetermined), 0);
        writers.finish().unwrap();
        pool.stop_pool().unwrap();

        let expected: [Vec<OwnedRecord>; 4] = [
            sample_reads.iter().map(|p| p.r1.clone()).collect(),
            sample_reads.iter().map(|p| p.r2.clone()).collect(),
            hopped_reads.iter().map(|p| p.r1.clone()).collect(),
            hopped_reads.iter().map(|p| p.r2.clone()).collect(),
        ];
        for (file, expected) in files.iter().zip(expected.iter()) {
            assert_eq!(&slurp_fastq(file), expected);
        }
        assert!(slurp_fastq(&files[4]).is_empty());
        assert!(slurp_fastq(&files[5]).is_empty());
    }
}
