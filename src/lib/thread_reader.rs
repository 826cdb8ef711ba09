//! A [`ThreadReader`] allows for pushing the reading of a FASTQ file onto a separate thread.
//!
//! The file may be plain, gzip or BGZF compressed; BGZF input is decompressed by a pool of
//! threads.  Records are parsed into chunks of N records and sent over a bounded channel.

use std::{num::NonZeroUsize, path::PathBuf, thread::JoinHandle};

use anyhow::{Context, Result};
use flume::{bounded, Receiver};
use gzp::BUFSIZE;
use seq_io::fastq::{self, RecordSet};

use crate::utils::open_fastq;

/// The number of chunks to allow in the reader channel at one time.
const READER_CHANNEL_SIZE: usize = 100;

/// A struct to hold onto the handle for a thread that is reading chunks of FASTQ from a file.
pub struct ThreadReader {
    /// The [`JoinHandle`] for the thread that is reading.
    pub handle: JoinHandle<Result<()>>,
    /// The channel that will be receiving [`RecordSet`]s.
    pub rx: Receiver<RecordSet>,
}

impl ThreadReader {
    /// Create a new [`ThreadReader`] for a given file that will read `chunksize` records at a time.
    ///
    /// Errors opening or parsing the file are returned when the thread is joined.  The thread stops
    /// early, without error, if the receiver is dropped.
    // Chunksize can't be zero or `seq_io` would try to read the whole file into one record set.
    pub fn new(
        file: PathBuf,
        chunksize: NonZeroUsize,
        decompression_threads_per_reader: usize,
    ) -> Self {
        let (tx, rx) = bounded(READER_CHANNEL_SIZE);
        let handle = std::thread::spawn(move || {
            let reader = open_fastq(&file, decompression_threads_per_reader)?;
            let mut reader = fastq::Reader::with_capacity(reader, BUFSIZE);

            loop {
                let mut record_set = RecordSet::default();
                let filled_set = reader
                    .read_record_set_exact(&mut record_set, usize::from(chunksize))
                    .with_context(|| {
                        format!("Failed reading record set from {}", file.to_string_lossy())
                    })?;
                if !filled_set || tx.send(record_set).is_err() {
                    break;
                }
            }
            Ok(())
        });

        Self { handle, rx }
    }

    /// Wait for the reading thread to finish, returning any error it hit.
    pub fn join(self) -> Result<()> {
        drop(self.rx);
        match self.handle.join() {
            Ok(result) => result,
            Err(e) => std::panic::resume_unwind(e),
        }
    }
}
