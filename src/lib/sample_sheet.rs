use std::fmt::Display;

use clap::Parser;
use csv::{ReaderBuilder, StringRecord, Trim};
use fgoxide::io::Io;
use itertools::Itertools;
use thiserror::Error;

use crate::{
    demux::{HOPPED_NAME, UNDETERMINED_NAME},
    opts::{Opts, TOOL_NAME},
    registry::{BarcodeError, BarcodeRegistry},
    sample_metadata::SampleMetadata,
};

/// The optional line number from the [`SampleMetadata`] file where an error ocurred.
#[derive(Debug)]
pub struct ErrorLine(pub Option<usize>);

impl Display for ErrorLine {
    /// Writes the line number if present, nothing if it is not None.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(number) => write!(f, "Line {}", number),
            None => Ok(()),
        }
    }
}

/// The reason that a barcode has been deemed invalid.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReasonBarcodeInvalid {
    EmptyString,
    InvalidBase(char),
}

impl Display for ReasonBarcodeInvalid {
    /// Proper error wording for each reason a barcode is invalid.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyString => write!(f, "Barcode is an empty string"),
            Self::InvalidBase(base) => write!(f, "Barcode has an invalid base `{}`", base),
        }
    }
}

/// The error that may occur when parsing the [`SampleSheet`].
#[derive(Error, Debug)]
pub enum SampleSheetError {
    #[error("Io error occurred")]
    FgError(#[from] fgoxide::FgError),

    #[error("The sample sheet was empty")]
    Empty,

    #[error("Could not parse the demultiplexing options, {kind}: {args}")]
    DemuxOptionsParsing { kind: String, args: String },

    #[error("The '[Data]' section is missing")]
    NoData,

    #[error("The '[Data]' section is missing samples")]
    NoSamples,

    #[error("The header line in the '[Data]' section is missing")]
    NoDataHeader,

    #[error("The sample on line {line_number} had {actual} fields, expected {expected} fields, for line: {line}")]
    SampleInvalidNumberOfColumns { actual: usize, expected: usize, line_number: usize, line: String },

    #[error("Unable to parse the sample info line number {line}: {source}")]
    SampleInvalidLine { source: csv::Error, line: usize },

    #[error(transparent)]
    Deserialize(#[from] csv::Error),

    #[error("Unable to deserialize line number {line}")]
    DeserializeRecord { source: csv::Error, line: usize },

    #[error("The Sample_ID `{id}` on line {line} is reserved for reads that match no single sample")]
    ReservedSampleId { id: String, line: usize },

    #[error(transparent)]
    Barcode(#[from] BarcodeError),
}

/// The samples and the command line options, as updated by a sample sheet.
#[derive(Debug, Clone)]
pub struct SampleSheet {
    pub registry: BarcodeRegistry,
    pub opts: Opts,
}

impl SampleSheet {
    /// Builds a `SampleSheet` from the CSV at `opts.sample_metadata`.
    ///
    /// The CSV may be a sample sheet, with the optional `[Demux]` section first and required
    /// `[Data]` section next, or a simple CSV file with headers.
    ///
    /// # Sample Sheet
    ///
    /// The given command line options are updated using the first two columns in the `[Demux]`
    /// section.  The keys must be specified in the first column and be the long-form of the
    /// corresponding command line option (e.g. `index1-mismatches` for the command line option
    /// `--index1-mismatches`).  The value(s) must be specified in the second column.
    ///
    /// The `[Data]` section must have `Sample_ID`, `Index1_Sequence`, and `Index2_Sequence`
    /// headers (or `sample_id`, `index1` and `index2`).  Each subsequent row corresponds to a
    /// single sample.
    pub fn from_path(opts: Opts) -> Result<Self, SampleSheetError> {
        // Read in all the lines so we can check if we have a simple CSV file or a full-fledged
        // Sample Sheet.
        let io = Io::default();
        let lines = io.read_lines(&opts.sample_metadata)?;

        if lines.iter().all(|l| l.trim().is_empty()) {
            return Err(SampleSheetError::Empty);
        }

        let is_sample_sheet: bool =
            lines.iter().any(|l| l.starts_with("[Demux]") || l.starts_with("[Data]"));

        let data = lines.join("\n");
        let reader = data.as_bytes();
        if is_sample_sheet {
            SampleSheet::from_sample_sheet_reader(reader, opts)
        } else {
            SampleSheet::from_metadata_csv_reader(reader, opts)
        }
    }

    /// Reads sample metadata and command line options from a sample sheet.
    fn from_sample_sheet_reader<R: std::io::Read>(
        reader: R,
        opts: Opts,
    ) -> Result<Self, SampleSheetError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b',')
            .has_headers(false)
            .quoting(true)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader);

        let records = reader.records().collect::<Result<Vec<StringRecord>, _>>()?;
        SampleSheet::from_sample_sheet_string_records(&records, opts)
    }

    /// Reads sample metadata from a simple CSV.  No command line options are able to be specified
    /// in this format; use a sample sheet in that case.
    fn from_metadata_csv_reader<R: std::io::Read>(
        reader: R,
        opts: Opts,
    ) -> Result<Self, SampleSheetError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .delimiter(b',')
            .trim(Trim::All)
            .from_reader(reader);

        let mut samples = vec![];
        for (ordinal, record) in reader.deserialize().enumerate() {
            // Note that line numbers a +2 to account for the header and convert to 1-based counting
            let record: SampleMetadata = record.map_err(|e| {
                SampleSheetError::DeserializeRecord { source: e, line: ordinal + 2 }
            })?;
            samples.push(record.update_with_and_sanitize(ordinal, Some(ordinal + 2))?);
        }
        if samples.is_empty() {
            return Err(SampleSheetError::NoSamples);
        }

        Ok(SampleSheet { registry: Self::validate_samples(samples)?, opts })
    }

    /// Checks that no sample uses a reserved bucket name, then builds the registry.
    fn validate_samples(samples: Vec<SampleMetadata>) -> Result<BarcodeRegistry, SampleSheetError> {
        if let Some(sample) = samples
            .iter()
            .find(|s| s.sample_id == HOPPED_NAME || s.sample_id == UNDETERMINED_NAME)
        {
            return Err(SampleSheetError::ReservedSampleId {
                id: sample.sample_id.clone(),
                line: sample.line_number.unwrap_or_default(),
            });
        }
        Ok(BarcodeRegistry::load(samples)?)
    }

    /// Finds the start and end line index (0-based inclusive) of the section with the given key
    /// (e.g.  "[Header]", "[Demux]", "[Data]"), returning `None` if the key wasn't found.  The key
    /// must occur in the first column.  The end of the section is identified by the first column
    ///  starting with "[".  The line with the header key is not returned.
    fn find_section(records: &[StringRecord], section_key: &str) -> Option<(usize, usize)> {
        let mut start_line_index = 0;
        while start_line_index < records.len() {
            let record = &records[start_line_index];
            start_line_index += 1;
            if !record.is_empty() && &record[0] == section_key {
                break;
            }
        }
        if start_line_index == records.len() {
            return None;
        }
        let mut end_line_index = start_line_index;
        while end_line_index < records.len() {
            let record = &records[end_line_index];
            if !record.is_empty() && record[0].starts_with('[') {
                break;
            }
            end_line_index += 1;
        }
        Some((start_line_index, end_line_index - 1))
    }

    /// Parses the demultiplexing options from the given `[Demux]` records and updates the given
    /// command line options.
    ///
    /// The option names must be the same name as on the command line, with the leading `--`
    /// omitted.  If the value is empty, the command line option is assumed to be a flag.
    fn parse_and_update_demux_options(
        records: &[StringRecord],
        mut opts: Opts,
    ) -> Result<Opts, SampleSheetError> {
        if records.is_empty() || records.iter().all(csv::StringRecord::is_empty) {
            return Ok(opts);
        }
        let mut argv: Vec<String> = vec![TOOL_NAME.to_string()];
        for record in records {
            if record.len() >= 2 {
                // Arguments and their values are checked when the opts are updated below
                argv.push(format!("--{}", &record[0]));

                // For boolean options, only the presence of a key and the value is ignored.  Thus,
                // when an empty value is given, assume the argument is a boolean.
                if !record[1].is_empty() {
                    argv.extend(record[1].split(' ').map(str::to_string));
                }
            }
        }

        match opts.try_update_from(argv.into_iter()) {
            Ok(()) => Ok(opts),
            Err(err) => {
                let kind = err
                    .kind()
                    .as_str()
                    .map_or_else(|| format!("Bug: unknown kind: {:?}", err.kind()), str::to_string);
                let args = err
                    .info
                    .iter()
                    .map(|string| string.split(' ').next().unwrap_or(string).to_string())
                    .join(", ");
                Err(SampleSheetError::DemuxOptionsParsing { kind, args })
            }
        }
    }

    /// Converts the given string records from a `[Data]` section to samples.  Assumes a header,
    /// and all rows have the same number of columns.  No validation is performed across samples.
    ///
    /// `header_line_index` is the 0-based index of the header in the sample sheet, used for line
    /// numbers when the records carry no position.
    fn slurp_samples(
        records: &[StringRecord],
        header_line_index: usize,
    ) -> Result<Vec<SampleMetadata>, SampleSheetError> {
        if records.is_empty() || records[0].iter().all(str::is_empty) {
            return Err(SampleSheetError::NoDataHeader);
        }

        let header = &records[0];
        let mut samples: Vec<SampleMetadata> = vec![];
        for (offset, record) in records[1..].iter().enumerate() {
            // allow an empty line
            if record.iter().all(str::is_empty) {
                continue;
            }
            let line_number = record
                .position()
                .map_or(header_line_index + offset + 2, |p| usize::try_from(p.line()).unwrap_or(0));

            if header.len() != record.len() {
                return Err(SampleSheetError::SampleInvalidNumberOfColumns {
                    actual: record.len(),
                    expected: header.len(),
                    line_number,
                    line: record.into_iter().join(","),
                });
            }

            let sample: SampleMetadata = record
                .deserialize(Some(header))
                .map_err(|e| SampleSheetError::SampleInvalidLine { source: e, line: line_number })?;
            samples.push(sample.update_with_and_sanitize(samples.len(), Some(line_number))?);
        }
        if samples.is_empty() {
            return Err(SampleSheetError::NoSamples);
        }

        Ok(samples)
    }

    /// Reads from a sample sheet represented as a vector of `StringRecord`s: the optional
    /// `[Demux]` section updates the command line options and the `[Data]` section gives the
    /// samples.
    fn from_sample_sheet_string_records(
        records: &[StringRecord],
        opts: Opts,
    ) -> Result<Self, SampleSheetError> {
        if records.is_empty() {
            return Err(SampleSheetError::Empty);
        }

        let opts: Opts = match SampleSheet::find_section(records, "[Demux]") {
            None => opts,
            Some((start, end)) => {
                SampleSheet::parse_and_update_demux_options(&records[start..=end], opts)?
            }
        };

        let (start, end) = SampleSheet::find_section(records, "[Data]").ok_or(SampleSheetError::NoData)?;
        let samples = SampleSheet::slurp_samples(&records[start..=end], start)?;

        Ok(SampleSheet { registry: Self::validate_samples(samples)?, opts })
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use bstr::BString;
    use clap::error::ErrorKind::UnknownArgument;
    use csv::StringRecord;

    use crate::{
        opts::Opts,
        registry::BarcodeError,
        sample_sheet::{SampleSheet, SampleSheetError},
        utils::test_commons::create_preset_sample_metadata_file,
    };

    fn write_sheet(contents: &str) -> (tempfile::TempDir, Opts) {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("sample_metadata.csv");
        std::fs::write(&output, contents).expect("Failed to write sample metadata to file.");
        let opts = Opts { sample_metadata: output, ..Opts::default() };
        (dir, opts)
    }

    #[test]
    fn test_find_section_not_found_empty_records() {
        assert_eq!(SampleSheet::find_section(&[], "[Hello]"), None);
    }

    #[test]
    fn test_find_section_not_found_empty_section() {
        let records: Vec<StringRecord> = vec![StringRecord::from(vec!["[Hello]"])];
        assert_eq!(SampleSheet::find_section(&records, "[Hello]"), None);
    }

    #[test]
    fn test_find_section_non_empty_section() {
        let records: Vec<StringRecord> = vec![
            StringRecord::from(vec!["[Header]"]),
            StringRecord::from(vec!["Date", "Today"]),
            StringRecord::from(vec!["Run Name", "Foo"]),
            StringRecord::from(vec!["[Demux]"]),
            StringRecord::from(vec!["index1-mismatches", "0"]),
            StringRecord::from(vec!["revcomp-index2", ""]),
            StringRecord::from(vec!["[Data]"]),
            StringRecord::from(vec!["unknown", ""]),
            StringRecord::from(vec!["[End]"]),
        ];
        assert_eq!(SampleSheet::find_section(&records, "[Header]"), Some((1, 2)));
        assert_eq!(SampleSheet::find_section(&records, "[Demux]"), Some((4, 5)));
        assert_eq!(SampleSheet::find_section(&records, "[Data]"), Some((7, 7)));
        assert_eq!(SampleSheet::find_section(&records, "[End]"), None);
        assert_eq!(SampleSheet::find_section(&records, "[Hello]"), None);
    }

    #[test]
    fn test_parse_and_update_demux_options_ok() {
        let records: Vec<StringRecord> = vec![
            StringRecord::from(vec!["index1-mismatches", "0"]),
            StringRecord::from(vec!["index2-mismatches", "2"]),
            StringRecord::from(vec!["revcomp-index2", ""]),
            StringRecord::from(vec!["prefix", "run1."]),
        ];
        let opts = SampleSheet::parse_and_update_demux_options(&records, Opts::default()).unwrap();
        assert_eq!(opts.index1_mismatches, 0);
        assert_eq!(opts.index2_mismatches, 2);
        assert!(opts.revcomp_index2);
        assert_eq!(opts.prefix, "run1.");
    }

    #[test]
    fn test_demux_options_keep_existing_values() {
        let opts = Opts { read1: PathBuf::from("/dev/null"), ..Opts::default() };
        let records: Vec<StringRecord> =
            vec![StringRecord::from(vec!["min-mean-index-quality", "20"])];
        let opts = SampleSheet::parse_and_update_demux_options(&records, opts).unwrap();
        assert_eq!(opts.read1, PathBuf::from("/dev/null"));
        assert_eq!(opts.min_mean_index_quality, 20);
    }

    #[test]
    fn test_unknown_demux_option_flag() {
        let records: Vec<StringRecord> = vec![
            StringRecord::from(vec!["index1-mismatches", "0"]),
            StringRecord::from(vec!["unknown", ""]),
        ];

        let result = SampleSheet::parse_and_update_demux_options(&records, Opts::default());
        match result {
            Err(SampleSheetError::DemuxOptionsParsing { kind, args }) => {
                assert_eq!(kind, UnknownArgument.as_str().unwrap());
                assert_eq!(args, "--unknown".to_string());
            }
            other => panic!("Expected a DemuxOptionsParsing error, found {:?}", other),
        }
    }

    #[test]
    fn test_unknown_demux_option_with_value() {
        let records: Vec<StringRecord> = vec![StringRecord::from(vec!["unknown", "value"])];
        let result = SampleSheet::parse_and_update_demux_options(&records, Opts::default());
        assert!(matches!(result, Err(SampleSheetError::DemuxOptionsParsing { .. })));
    }

    #[test]
    fn test_slurp_samples_no_header() {
        let result = SampleSheet::slurp_samples(&[], 12);
        assert!(matches!(result, Err(SampleSheetError::NoDataHeader)));
    }

    #[test]
    fn test_slurp_samples_ok() {
        let records = vec![
            StringRecord::from(vec!["Sample_ID", "Index1_Sequence", "Index2_Sequence"]),
            StringRecord::from(vec!["S1", "AAAA", "CCCC"]),
            StringRecord::from(vec!["S2", "gggg", "TTTT"]),
        ];
        let samples = SampleSheet::slurp_samples(&records, 12).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].sample_id, "S1");
        assert_eq!(samples[0].index1, BString::from("AAAA"));
        assert_eq!(samples[0].index2, BString::from("CCCC"));
        assert_eq!(samples[0].ordinal, 0);
        assert_eq!(samples[0].line_number, Some(14));
        assert_eq!(samples[1].sample_id, "S2");
        assert_eq!(samples[1].index1, BString::from("GGGG"));
        assert_eq!(samples[1].index2, BString::from("TTTT"));
        assert_eq!(samples[1].ordinal, 1);
        assert_eq!(samples[1].line_number, Some(15));
    }

    #[test]
    fn test_slurp_samples_lowercase_headers() {
        let records = vec![
            StringRecord::from(vec!["sample_id", "index1", "index2"]),
            StringRecord::from(vec!["S1", "AAAA", "CCCC"]),
        ];
        let samples = SampleSheet::slurp_samples(&records, 0).unwrap();
        assert_eq!(samples[0].sample_id, "S1");
        assert_eq!(samples[0].index2, BString::from("CCCC"));
    }

    #[test]
    fn test_slurp_samples_wrong_number_of_columns() {
        let records = vec![
            StringRecord::from(vec!["Sample_ID", "Index1_Sequence", "Index2_Sequence"]),
            StringRecord::from(vec!["S1", "AAAA", "CCCC"]),
            StringRecord::from(vec!["S2", "TTTT"]),
            StringRecord::from(vec!["S3", "AGAG", "TCTC"]),
        ];
        match SampleSheet::slurp_samples(&records, 12) {
            Err(SampleSheetError::SampleInvalidNumberOfColumns {
                actual,
                expected,
                line_number,
                line,
            }) => {
                assert_eq!(actual, 2);
                assert_eq!(expected, 3);
                assert_eq!(line_number, 15);
                assert_eq!(line, "S2,TTTT");
            }
            other => panic!("Expected a SampleInvalidNumberOfColumns error, found {:?}", other),
        }
    }

    #[test]
    fn test_slurp_samples_missing_index_column() {
        let records = vec![
            StringRecord::from(vec!["Sample_ID", "Index1_Sequence"]),
            StringRecord::from(vec!["S1", "AAAA"]),
        ];
        let result = SampleSheet::slurp_samples(&records, 0);
        assert!(matches!(result, Err(SampleSheetError::SampleInvalidLine { line: 2, .. })));
    }

    #[test]
    fn test_sample_sheet_empty() {
        let records: Vec<StringRecord> = vec![];
        assert!(matches!(
            SampleSheet::from_sample_sheet_string_records(&records, Opts::default()),
            Err(SampleSheetError::Empty)
        ));
    }

    #[test]
    fn test_sample_sheet_no_data() {
        let records: Vec<StringRecord> = vec![
            StringRecord::from(vec!["[Header]"]),
            StringRecord::from(vec!["Date", "Today"]),
            StringRecord::from(vec!["Run Name", "Foo"]),
        ];
        assert!(matches!(
            SampleSheet::from_sample_sheet_string_records(&records, Opts::default()),
            Err(SampleSheetError::NoData)
        ));
    }

    #[test]
    fn test_ok_sample_sheet() {
        let (_dir, opts) = write_sheet(
            "[Header]\n\
            Date,Today\n\
            Run Name,Foo\n\
            [Demux]\n\
            index2-mismatches,0\n\
            revcomp-index2,\n\
            [Data]\n\
            Sample_ID,Index1_Sequence,Index2_Sequence,Project\n\
            S1,AAAA,CCCC,P1\n\
            S2,GGGG,TTTT,P1\n\
            S3,ATTA,GCCG,P2\n",
        );
        let sample_sheet = SampleSheet::from_path(opts).unwrap();

        assert_eq!(sample_sheet.opts.index2_mismatches, 0);
        assert!(sample_sheet.opts.revcomp_index2);
        assert_eq!(sample_sheet.registry.len(), 3);
        assert_eq!(sample_sheet.registry.sample(2).sample_id, "S3");
        assert_eq!(sample_sheet.registry.sample(2).line_number, Some(11));
    }

    #[test]
    fn test_ok_metadata_csv() {
        let dir = tempfile::tempdir().unwrap();
        let sample_metadata = create_preset_sample_metadata_file(dir.path());
        let opts = Opts { sample_metadata, ..Opts::default() };

        let sample_sheet = SampleSheet::from_path(opts).unwrap();
        assert_eq!(sample_sheet.registry.len(), 3);
        assert_eq!(sample_sheet.registry.sample(0).sample_id, "Sample1");
        assert_eq!(sample_sheet.registry.sample(0).line_number, Some(2));
        assert_eq!(sample_sheet.registry.index1_length(), 8);
    }

    #[test]
    fn test_empty_file() {
        let (_dir, opts) = write_sheet("");
        assert!(matches!(SampleSheet::from_path(opts), Err(SampleSheetError::Empty)));
    }

    #[test]
    fn test_metadata_csv_header_only() {
        let (_dir, opts) = write_sheet("Sample_ID,Index1_Sequence,Index2_Sequence\n");
        assert!(matches!(SampleSheet::from_path(opts), Err(SampleSheetError::NoSamples)));
    }

    #[test]
    fn test_metadata_csv_duplicate_pair() {
        let (_dir, opts) = write_sheet(
            "Sample_ID,Index1_Sequence,Index2_Sequence\n\
            S1,AAAA,CCCC\n\
            S2,AAAA,CCCC\n",
        );
        assert!(matches!(
            SampleSheet::from_path(opts),
            Err(SampleSheetError::Barcode(BarcodeError::DuplicatePair { .. }))
        ));
    }

    #[test]
    fn test_metadata_csv_invalid_barcode_reports_line() {
        let (_dir, opts) = write_sheet(
            "Sample_ID,Index1_Sequence,Index2_Sequence\n\
            S1,AAAA,CCCC\n\
            S2,AAXA,GGGG\n",
        );
        let err = SampleSheet::from_path(opts).unwrap_err();
        assert!(err.to_string().ends_with("Line 3"), "{}", err);
    }

    #[test]
    fn test_reserved_sample_id() {
        let (_dir, opts) = write_sheet(
            "Sample_ID,Index1_Sequence,Index2_Sequence\n\
            S1,AAAA,CCCC\n\
            Hopped,GGGG,TTTT\n",
        );
        assert!(matches!(
            SampleSheet::from_path(opts),
            Err(SampleSheetError::ReservedSampleId { id, line: 3 }) if id == "Hopped"
        ));
    }
}
