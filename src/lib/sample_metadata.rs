#![forbid(unsafe_code)]
#![allow(clippy::must_use_candidate)]

use bstr::{BStr, BString, ByteSlice};
use serde::{Deserialize, Serialize};

use crate::{
    registry::{BarcodeError, IndexRead},
    sample_sheet::{ErrorLine, ReasonBarcodeInvalid},
};

/// The bases that are allowed in the [`SampleMetadata::index1`] and [`SampleMetadata::index2`].
pub const ALLOWED_BASES: &[u8] = &[b'A', b'C', b'G', b'T', b'N'];

/// Metadata about a sample.
///
/// Metadata is derived from a simple CSV file or from the `[Data]` section of a sample sheet.
/// See `update_with_and_sanitize()` for the clean up that happens after deserializing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Hash, Eq)]
pub struct SampleMetadata {
    /// The unique identifier for the sample.
    #[serde(alias = "Sample_ID", rename(serialize = "Sample_ID"))]
    pub sample_id: String,

    /// The sample barcode in the index1 read
    #[serde(alias = "Index1_Sequence", rename(serialize = "Index1_Sequence"))]
    pub index1: BString,

    /// The sample barcode in the index2 read
    #[serde(alias = "Index2_Sequence", rename(serialize = "Index2_Sequence"))]
    pub index2: BString,

    /// The number of the sample in the sample sheet, starts at 0.
    #[serde(skip)]
    pub ordinal: usize,

    /// The line number in the sample sheet (1-based) if read from a file.
    #[serde(skip)]
    pub line_number: Option<usize>,
}

impl SampleMetadata {
    /// Create a new [`SampleMetadata`] object, sanitizing and validating both indexes.
    ///
    /// # Errors
    ///
    /// - [`BarcodeError::InvalidBarcode`] if either index is invalid
    pub fn new(
        sample_id: String,
        index1: BString,
        index2: BString,
        ordinal: usize,
        line_number: Option<usize>,
    ) -> Result<Self, BarcodeError> {
        Self { sample_id, index1, index2, ordinal, line_number }
            .update_with_and_sanitize(ordinal, line_number)
    }

    /// Sets the ordinal and line number, then sanitizes and validates both indexes.
    ///
    /// Used on records fresh from the deserializer, whose `#[serde(skip)]` fields are defaults.
    pub fn update_with_and_sanitize(
        mut self,
        ordinal: usize,
        line_number: Option<usize>,
    ) -> Result<Self, BarcodeError> {
        self.ordinal = ordinal;
        self.line_number = line_number;
        self.index1 = Self::sanitize_barcode(self.index1.as_bstr());
        self.index2 = Self::sanitize_barcode(self.index2.as_bstr());
        Self::validate_barcode(self.index1.as_bstr(), IndexRead::Index1, &self.sample_id, line_number)?;
        Self::validate_barcode(self.index2.as_bstr(), IndexRead::Index2, &self.sample_id, line_number)?;
        Ok(self)
    }

    /// The sequence of the given index.
    pub fn index(&self, which: IndexRead) -> &[u8] {
        match which {
            IndexRead::Index1 => self.index1.as_slice(),
            IndexRead::Index2 => self.index2.as_slice(),
        }
    }

    /// The index pair as it is written in metrics, `index1+index2`.
    pub fn barcode_pair(&self) -> String {
        format!("{}+{}", self.index1, self.index2)
    }

    /// Run a set of validations on a barcode to ensure that it is well formed.
    ///
    /// # Errors
    ///
    /// - [`BarcodeError::InvalidBarcode`] if the barcode is empty or has a base outside `ACGTN`
    pub fn validate_barcode(
        barcode: &BStr,
        which: IndexRead,
        id: &str,
        line_number: Option<usize>,
    ) -> Result<(), BarcodeError> {
        let reason = if barcode.is_empty() {
            Some(ReasonBarcodeInvalid::EmptyString)
        } else {
            barcode
                .iter()
                .find(|b| !ALLOWED_BASES.contains(b))
                .map(|b| ReasonBarcodeInvalid::InvalidBase(char::from(*b)))
        };
        match reason {
            None => Ok(()),
            Some(reason) => Err(BarcodeError::InvalidBarcode {
                id: id.to_owned(),
                barcode: barcode.to_string(),
                which,
                reason,
                line: ErrorLine(line_number),
            }),
        }
    }

    /// Upper-case a barcode and remove whitespace and `-` separators.
    pub fn sanitize_barcode(raw_barcode: &BStr) -> BString {
        raw_barcode
            .to_ascii_uppercase()
            .into_iter()
            .filter(|b| !b.is_ascii_whitespace() && *b != b'-')
            .collect::<Vec<u8>>()
            .into()
    }
}

/// Implementation of AsRef trait for [`SampleMetadata`] to convert `SampleMetadata` to `&SampleMetadata`.
impl AsRef<SampleMetadata> for SampleMetadata {
    fn as_ref(&self) -> &SampleMetadata {
        self
    }
}
