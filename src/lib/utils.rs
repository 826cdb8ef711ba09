//! Utility functions.
use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use gzp::{deflate::Bgzf, par::decompress::ParDecompressBuilder, BlockFormatSpec, BUFSIZE};
use lazy_static::lazy_static;

lazy_static! {
    /// Return the number of cpus as a String
    pub static ref NUM_CPU: String = num_cpus::get().to_string();
}

pub mod built_info {
    use lazy_static::lazy_static;
    include!(concat!(env!("OUT_DIR"), "/built.rs"));

    /// Get a software version string including
    ///   - Git commit hash
    ///   - Git dirty info (whether the repo had uncommitted changes)
    ///   - Cargo package version if no git info found
    fn get_software_version() -> String {
        let prefix = if let Some(s) = GIT_COMMIT_HASH {
            format!("{}-{}", PKG_VERSION, s[0..8].to_owned())
        } else {
            PKG_VERSION.to_string()
        };
        let suffix = match GIT_DIRTY {
            Some(true) => "-dirty",
            _ => "",
        };
        format!("{}{}", prefix, suffix)
    }

    lazy_static! {
        /// Version of the software with git hash
        pub static ref VERSION: String = get_software_version();
    }
}

/// Reverse complement a DNA sequence.  Anything other than `A`, `C`, `G` or `T` becomes an `N`.
pub fn reverse_complement(bases: &[u8]) -> Vec<u8> {
    bases
        .iter()
        .rev()
        .map(|b| match b.to_ascii_uppercase() {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            _ => b'N',
        })
        .collect()
}

/// The R1 and R2 output paths for a bucket, `{prefix}{name}_R1.fastq.gz` and
/// `{prefix}{name}_R2.fastq.gz`.
pub fn bucket_filenames<P: AsRef<Path>>(output_dir: P, prefix: &str, name: &str) -> [PathBuf; 2] {
    [1, 2].map(|read| output_dir.as_ref().join(format!("{}{}_R{}.fastq.gz", prefix, name, read)))
}

/// A `MultiZip` object allows for zipping over N items.
///
/// For example, if you have a `Vec` of length 10 of `Vec`s this will pull one item from
/// each of the 10 inner vecs and return a `Vec` of length 10 with those items.
///
/// This will stop iteration as soon as the first of the inner vecs runs out of items.
pub struct MultiZip<T>(Vec<T>);

impl<T> MultiZip<T> {
    /// Create a new [`MultiZip`] iterator over a `Vec` of items.
    #[must_use]
    pub fn new(items: Vec<T>) -> Self {
        Self(items)
    }
}

impl<T> Iterator for MultiZip<T>
where
    T: Iterator,
{
    type Item = Vec<T::Item>;
    fn next(&mut self) -> Option<Self::Item> {
        self.0.iter_mut().map(Iterator::next).collect()
    }
}

/// The compression of an input FASTQ, sniffed from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// Block compressed (e.g. with `bgzip`); decompressed in parallel.
    Bgzf,
    /// Plain GZIP, possibly with multiple members.
    Gzip,
    /// Anything else is read as uncompressed text.
    Plain,
}

impl InputFormat {
    /// Determine the format of the given file from its header.
    pub fn detect(file: &Path) -> Result<Self> {
        let reader = File::open(file)
            .with_context(|| format!("Failed to open {}", file.to_string_lossy()))?;
        let mut bytes = Vec::with_capacity(Bgzf::HEADER_SIZE);
        reader
            .take(Bgzf::HEADER_SIZE as u64)
            .read_to_end(&mut bytes)
            .with_context(|| format!("Error reading from: {}", file.to_string_lossy()))?;
        Ok(Self::from_header(&bytes))
    }

    fn from_header(bytes: &[u8]) -> Self {
        if bytes.len() < 3 || bytes[0] != 31 || bytes[1] != 139 || bytes[2] != 8 {
            Self::Plain
        } else if bytes.len() >= 14 && bytes[3] & 4 == 4 && bytes[12] == b'B' && bytes[13] == b'C' {
            Self::Bgzf
        } else {
            Self::Gzip
        }
    }
}

/// Open a FASTQ for reading, decompressing it if needed.
///
/// BGZF input is decompressed with `decompression_threads` threads.
pub fn open_fastq(file: &Path, decompression_threads: usize) -> Result<Box<dyn Read>> {
    let format = InputFormat::detect(file)?;
    let reader = BufReader::with_capacity(
        BUFSIZE,
        File::open(file).with_context(|| format!("Failed to open {}", file.to_string_lossy()))?,
    );
    let reader: Box<dyn Read> = match format {
        InputFormat::Bgzf => Box::new(
            ParDecompressBuilder::<Bgzf>::new()
                .num_threads(decompression_threads)
                .with_context(|| {
                    format!(
                        "Error in setting threads when creating decompressor for {}",
                        file.to_string_lossy()
                    )
                })?
                .from_reader(reader),
        ),
        InputFormat::Gzip => Box::new(MultiGzDecoder::new(reader)),
        InputFormat::Plain => Box::new(reader),
    };
    Ok(reader)
}

#[cfg(not(tarpaulin_include))]
#[cfg(test)]
pub mod test_commons {
    //! Common utility methods for testing demultiplexing.

    use std::{
        fs::File,
        io::{BufReader, BufWriter, Write},
        path::{Path, PathBuf},
    };

    use bgzf::CompressionLevel;
    use seq_io::fastq::{OwnedRecord, Reader, RecordSet};
    use tempfile::NamedTempFile;

    use crate::registry::BarcodeRegistry;

    pub const SAMPLE1_INDEXES: (&[u8], &[u8]) = (b"AAAAAAAA", b"CCCCCCCC");
    pub const SAMPLE2_INDEXES: (&[u8], &[u8]) = (b"GGGGGGGG", b"TTTTTTTT");
    pub const SAMPLE3_INDEXES: (&[u8], &[u8]) = (b"ACGTACGT", b"TGCATGCA");

    /// Helper method to write the three preset samples to a metadata file.
    pub fn create_preset_sample_metadata_file(dir: impl AsRef<Path>) -> PathBuf {
        let file_contents = format!(
            "Sample_ID,Index1_Sequence,Index2_Sequence\n\
            Sample1,{},{}\n\
            Sample2,{},{}\n\
            Sample3,{},{}\n",
            String::from_utf8_lossy(SAMPLE1_INDEXES.0),
            String::from_utf8_lossy(SAMPLE1_INDEXES.1),
            String::from_utf8_lossy(SAMPLE2_INDEXES.0),
            String::from_utf8_lossy(SAMPLE2_INDEXES.1),
            String::from_utf8_lossy(SAMPLE3_INDEXES.0),
            String::from_utf8_lossy(SAMPLE3_INDEXES.1),
        );

        let output = dir.as_ref().join("sample_metadata.csv");
        std::fs::write(&output, file_contents).expect("Failed to write sample metadata to file.");
        output
    }

    /// The registry of the three preset samples.
    pub fn create_preset_registry() -> BarcodeRegistry {
        BarcodeRegistry::from_pairs([
            ("Sample1", SAMPLE1_INDEXES.0, SAMPLE1_INDEXES.1),
            ("Sample2", SAMPLE2_INDEXES.0, SAMPLE2_INDEXES.1),
            ("Sample3", SAMPLE3_INDEXES.0, SAMPLE3_INDEXES.1),
        ])
        .unwrap()
    }

    /// Configuration struct for creating a FASTQ read
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Fq<'a> {
        pub name: &'a str,
        pub bases: &'a [u8],
        pub quals: Option<&'a [u8]>,
        pub comment: Option<&'a str>,
    }

    impl<'a> Fq<'a> {
        /// Convert the configuration into an [`OwnedRecord`].
        pub fn to_owned_record(&self) -> OwnedRecord {
            let head = match self.comment {
                Some(comment) => format!("{} {}", self.name, comment),
                None => self.name.to_string(),
            };
            let qual = if let Some(qual) = self.quals {
                assert_eq!(qual.len(), self.bases.len());
                qual.to_vec()
            } else {
                vec![b'I'; self.bases.len()]
            };
            OwnedRecord { head: head.into_bytes(), seq: self.bases.to_vec(), qual }
        }
    }

    /// One read's worth of records across the R1, R2, I1 and I2 FASTQs.
    #[derive(Debug, Clone, Copy)]
    pub struct ReadQuad<'a> {
        pub name: &'a str,
        pub index1: &'a [u8],
        pub index2: &'a [u8],
    }

    impl<'a> ReadQuad<'a> {
        pub fn new(name: &'a str, index1: &'a [u8], index2: &'a [u8]) -> Self {
            Self { name, index1, index2 }
        }

        /// The R1, R2, I1 and I2 records, with a distinct template per read.
        pub fn to_owned_records(&self) -> [OwnedRecord; 4] {
            [
                Fq { name: self.name, bases: b"ACGTACGTAC", comment: Some("1:N:0:1"), ..Fq::default() }
                    .to_owned_record(),
                Fq { name: self.name, bases: b"TTGGCCAATT", comment: Some("2:N:0:1"), ..Fq::default() }
                    .to_owned_record(),
                Fq { name: self.name, bases: self.index1, ..Fq::default() }.to_owned_record(),
                Fq { name: self.name, bases: self.index2, ..Fq::default() }.to_owned_record(),
            ]
        }
    }

    /// Write the reads to `R1`, `R2`, `I1` and `I2` FASTQs in `dir`, returning their paths in
    /// that order.  The files are BGZF compressed when `extension` ends with `gz`.
    pub fn write_read_quads(
        dir: impl AsRef<Path>,
        reads: &[ReadQuad],
        extension: &str,
    ) -> [PathBuf; 4] {
        let paths = ["R1", "R2", "I1", "I2"]
            .map(|name| dir.as_ref().join(format!("{}.{}", name, extension)));
        let records: Vec<[OwnedRecord; 4]> = reads.iter().map(ReadQuad::to_owned_records).collect();
        for (i, path) in paths.iter().enumerate() {
            write_reads_to_file(records.iter().map(|quad| quad[i].clone()), path);
        }
        paths
    }

    /// Write a set of fastq reads to a file, returning the number of reads written.
    ///
    /// If the file extension is `gz` the reads will be compressed
    pub fn write_reads_to_file(
        reads: impl Iterator<Item = OwnedRecord>,
        file: impl AsRef<Path>,
    ) -> usize {
        let mut num_written = 0;
        let mut writer: Box<dyn Write> =
            if file.as_ref().extension().map_or(false, |ext| ext == "gz") {
                Box::new(bgzf::Writer::new(
                    BufWriter::new(File::create(file).unwrap()),
                    CompressionLevel::new(3).unwrap(),
                ))
            } else {
                Box::new(BufWriter::new(File::create(file).unwrap()))
            };
        for read in reads {
            read.write(&mut writer).unwrap();
            num_written += 1;
        }
        writer.flush().unwrap();
        num_written
    }

    /// Load the reads into a single [`RecordSet`], as a reader thread would produce.
    pub fn reads_to_record_set(reads: impl Iterator<Item = OwnedRecord>) -> RecordSet {
        let file = NamedTempFile::new().unwrap();
        let num_written = write_reads_to_file(reads, file.path());
        let mut reader = Reader::from_path(file.path()).unwrap();
        let mut record_set = RecordSet::default();
        reader.read_record_set_exact(&mut record_set, num_written).unwrap();
        record_set
    }

    /// Slurp all records out of a BGZF FASTQ file
    pub fn slurp_fastq(file: impl AsRef<Path>) -> Vec<OwnedRecord> {
        let reader = bgzf::Reader::new(BufReader::new(
            File::open(&file).unwrap_or_else(|_| panic!("Unable to open {:?}", &file.as_ref())),
        ));
        let mut reader = Reader::new(reader);
        let mut records = vec![];
        for r in reader.records() {
            let r = r.unwrap();
            records.push(r);
        }
        records
    }

    /// A more generic way to create reads that allows for unique name for each read
    pub fn generate_reads(
        sample_num: usize,
        read_name: &str,
        num_reads: usize,
    ) -> Vec<OwnedRecord> {
        let mut reads = vec![];
        for i in 1..=num_reads {
            let name = format!("s{}_read_{}_of_{}_{}", sample_num, i, num_reads, read_name);
            reads.push(OwnedRecord {
                head: name.as_bytes().to_vec(),
                seq: vec![b'A'; 150],
                qual: vec![b'!'; 150],
            });
        }
        reads
    }
}
