//! The registry of expected dual-index barcodes, one (index1, index2) pair per sample.
//!
//! The [`BarcodeRegistry`] is built once before any reads are classified and is read-only
//! afterwards, so it may be shared across demultiplexing threads without synchronization.
//!
//! Two lookups are provided:
//!
//! - [`BarcodeRegistry::lookup_exact`] is keyed on the exact index sequence, one hash map per
//!   index read.
//! - [`BarcodeRegistry::candidates_within`] enumerates every sample whose index is within a given
//!   hamming distance of an observed index, ordered by mismatches and then `sample_id`.

use std::{cmp::Ordering, fmt::Display};

use ahash::{AHashMap, AHashSet};
use bstr::ByteSlice;
use thiserror::Error;

use crate::{
    matcher::ObservedIndexPair,
    sample_metadata::SampleMetadata,
    sample_sheet::{ErrorLine, ReasonBarcodeInvalid},
};

/// Identifies one of the two index reads of a dual-indexed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexRead {
    Index1,
    Index2,
}

impl Display for IndexRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index1 => write!(f, "index1"),
            Self::Index2 => write!(f, "index2"),
        }
    }
}

/// Structural errors in the expected or observed barcodes.
///
/// These are never raised for reads that simply fail to match a sample; those are counted as
/// undetermined or hopped.
#[derive(Error, Debug)]
pub enum BarcodeError {
    #[error("Sample metadata must include at least one sample")]
    NoSamples,

    #[error("Duplicate Sample_ID found: {id}")]
    DuplicateSampleId { id: String },

    #[error("Invalid {which} sequence for {id} `{barcode}` - {reason}. {line}")]
    InvalidBarcode {
        id: String,
        barcode: String,
        which: IndexRead,
        reason: ReasonBarcodeInvalid,
        line: ErrorLine,
    },

    #[error("{sample_a} and {sample_b} have the same index pair {index1}+{index2}")]
    DuplicatePair { sample_a: String, sample_b: String, index1: String, index2: String },

    #[error("The {which} length of {origin} was {actual} (`{sequence}`), expected {expected}")]
    LengthMismatch {
        which: IndexRead,
        origin: String,
        sequence: String,
        expected: usize,
        actual: usize,
    },
}

/// A sample whose index is within some hamming distance of an observed index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Candidate {
    /// The ordinal of the sample in the [`BarcodeRegistry`].
    pub sample: usize,
    /// The hamming distance from the observed index to the sample's index.
    pub mismatches: usize,
}

/// The expected samples for a run and their index pairs.
#[derive(Debug, Clone)]
pub struct BarcodeRegistry {
    /// The samples, where each sample's `ordinal` is its position in this vec.
    samples: Vec<SampleMetadata>,
    /// The length of every index1 sequence in the run.
    index1_length: usize,
    /// The length of every index2 sequence in the run.
    index2_length: usize,
    /// A lookup of index1 to the samples that use that index1.
    index1_map: AHashMap<Vec<u8>, Vec<usize>>,
    /// A lookup of index2 to the samples that use that index2.
    index2_map: AHashMap<Vec<u8>, Vec<usize>>,
}

impl BarcodeRegistry {
    /// Build the registry from a collection of samples.
    ///
    /// The samples' ordinals are reset to their position in `samples`.
    ///
    /// # Errors
    ///
    /// - [`BarcodeError::NoSamples`] if `samples` is empty
    /// - [`BarcodeError::DuplicateSampleId`] if two samples share a `sample_id`
    /// - [`BarcodeError::InvalidBarcode`] if an index is empty or has a base outside `ACGTN`
    /// - [`BarcodeError::LengthMismatch`] if the index1 (or index2) lengths are not uniform
    /// - [`BarcodeError::DuplicatePair`] if two samples share both index sequences
    pub fn load(samples: Vec<SampleMetadata>) -> Result<Self, BarcodeError> {
        if samples.is_empty() {
            return Err(BarcodeError::NoSamples);
        }

        let index1_length = samples[0].index1.len();
        let index2_length = samples[0].index2.len();

        let mut ids = AHashSet::with_capacity(samples.len());
        let mut pairs: AHashMap<(&[u8], &[u8]), &str> = AHashMap::with_capacity(samples.len());
        for sample in &samples {
            if !ids.insert(sample.sample_id.as_str()) {
                return Err(BarcodeError::DuplicateSampleId { id: sample.sample_id.clone() });
            }
            for (which, expected) in
                [(IndexRead::Index1, index1_length), (IndexRead::Index2, index2_length)]
            {
                let index = sample.index(which);
                SampleMetadata::validate_barcode(
                    index.as_bstr(),
                    which,
                    &sample.sample_id,
                    sample.line_number,
                )?;
                if index.len() != expected {
                    return Err(BarcodeError::LengthMismatch {
                        which,
                        origin: format!("sample {}", sample.sample_id),
                        sequence: index.to_str_lossy().to_string(),
                        expected,
                        actual: index.len(),
                    });
                }
            }
            let key = (sample.index1.as_slice(), sample.index2.as_slice());
            if let Some(other) = pairs.insert(key, &sample.sample_id) {
                return Err(BarcodeError::DuplicatePair {
                    sample_a: other.to_string(),
                    sample_b: sample.sample_id.clone(),
                    index1: sample.index1.to_string(),
                    index2: sample.index2.to_string(),
                });
            }
        }

        let samples: Vec<SampleMetadata> = samples
            .into_iter()
            .enumerate()
            .map(|(ordinal, mut sample)| {
                sample.ordinal = ordinal;
                sample
            })
            .collect();

        let mut index1_map = AHashMap::with_capacity(samples.len());
        let mut index2_map = AHashMap::with_capacity(samples.len());
        for sample in &samples {
            index1_map
                .entry(sample.index1.to_vec())
                .or_insert_with(Vec::new)
                .push(sample.ordinal);
            index2_map
                .entry(sample.index2.to_vec())
                .or_insert_with(Vec::new)
                .push(sample.ordinal);
        }

        Ok(Self { samples, index1_length, index2_length, index1_map, index2_map })
    }

    /// Build the registry from `(sample_id, index1, index2)` tuples, in registration order.
    pub fn from_pairs<I, S, B>(pairs: I) -> Result<Self, BarcodeError>
    where
        I: IntoIterator<Item = (S, B, B)>,
        S: Into<String>,
        B: AsRef<[u8]>,
    {
        let samples = pairs
            .into_iter()
            .enumerate()
            .map(|(ordinal, (id, index1, index2))| {
                SampleMetadata::new(
                    id.into(),
                    index1.as_ref().into(),
                    index2.as_ref().into(),
                    ordinal,
                    None,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::load(samples)
    }

    /// The samples, ordered by ordinal.
    pub fn samples(&self) -> &[SampleMetadata] {
        &self.samples
    }

    /// The sample with the given ordinal.
    ///
    /// # Panics
    ///
    /// Panics if `ordinal` is not a valid sample ordinal.
    pub fn sample(&self, ordinal: usize) -> &SampleMetadata {
        &self.samples[ordinal]
    }

    /// The number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if there are no samples, which [`BarcodeRegistry::load`] never allows.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn index1_length(&self) -> usize {
        self.index1_length
    }

    pub fn index2_length(&self) -> usize {
        self.index2_length
    }

    /// The expected length of the given index read.
    pub fn index_length(&self, which: IndexRead) -> usize {
        match which {
            IndexRead::Index1 => self.index1_length,
            IndexRead::Index2 => self.index2_length,
        }
    }

    /// Check the observed index lengths against the run's index lengths.
    ///
    /// # Errors
    ///
    /// - [`BarcodeError::LengthMismatch`] naming the first index with the wrong length
    pub fn check_lengths(&self, observed: &ObservedIndexPair) -> Result<(), BarcodeError> {
        for which in [IndexRead::Index1, IndexRead::Index2] {
            let seq = observed.index(which);
            let expected = self.index_length(which);
            if seq.len() != expected {
                return Err(BarcodeError::LengthMismatch {
                    which,
                    origin: "an observed read".to_string(),
                    sequence: seq.to_str_lossy().to_string(),
                    expected,
                    actual: seq.len(),
                });
            }
        }
        Ok(())
    }

    /// The ordinals of the samples whose `which` index is exactly `seq`.
    pub fn lookup_exact(&self, seq: &[u8], which: IndexRead) -> &[usize] {
        let map = match which {
            IndexRead::Index1 => &self.index1_map,
            IndexRead::Index2 => &self.index2_map,
        };
        map.get(seq).map_or(&[][..], Vec::as_slice)
    }

    /// Every sample whose `which` index is within `budget` mismatches of `seq`.
    ///
    /// This is a scan over all samples.  The candidates are sorted by
    /// [`BarcodeRegistry::sort_candidates`].
    pub fn candidates_within(&self, seq: &[u8], which: IndexRead, budget: usize) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self
            .samples
            .iter()
            .filter_map(|sample| {
                let mismatches = hamming_distance(seq, sample.index(which));
                (mismatches <= budget).then(|| Candidate { sample: sample.ordinal, mismatches })
            })
            .collect();
        self.sort_candidates(&mut candidates);
        candidates
    }

    /// Sort candidates by ascending mismatches, breaking ties by ascending `sample_id`.
    pub fn sort_candidates(&self, candidates: &mut [Candidate]) {
        candidates.sort_by(|a, b| {
            a.mismatches.cmp(&b.mismatches).then_with(|| self.cmp_samples(a.sample, b.sample))
        });
    }

    /// Order two samples by their `sample_id`.
    pub fn cmp_samples(&self, a: usize, b: usize) -> Ordering {
        self.samples[a].sample_id.cmp(&self.samples[b].sample_id)
    }
}

/// Hamming distance on slices of bytes.
///
/// Any position where either sequence has an `N` is a mismatch, including `N` against `N`.
/// Positions past the end of the shorter sequence are counted as mismatches.
pub fn hamming_distance(alpha: &[u8], beta: &[u8]) -> usize {
    let overhang = alpha.len().abs_diff(beta.len());
    alpha
        .iter()
        .zip(beta.iter())
        .filter(|(a, b)| a != b || **a == b'N' || **b == b'N')
        .count()
        + overhang
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::{hamming_distance, BarcodeError, BarcodeRegistry, Candidate, IndexRead};
    use crate::matcher::ObservedIndexPair;

    fn two_sample_registry() -> BarcodeRegistry {
        BarcodeRegistry::from_pairs([("S1", "AACC", "GGTT"), ("S2", "TTGG", "CCAA")]).unwrap()
    }

    #[test]
    fn test_hamming_dist_no_mismatches() {
        assert_eq!(hamming_distance(b"GATTACA", b"GATTACA"), 0);
    }

    #[test]
    fn test_hamming_dist_two_mismatches() {
        assert_eq!(hamming_distance(b"GATTACA", b"GACCACA"), 2);
    }

    #[test]
    fn test_hamming_dist_all_mismatches() {
        assert_eq!(hamming_distance(b"GATTACA", b"CTAATGT"), 7);
    }

    #[rstest]
    #[case(b"GATTACN", b"GATTACA", 1)]
    #[case(b"GATTACA", b"GATTACN", 1)]
    #[case(b"GATTACN", b"GATTACN", 1)]
    #[case(b"NNNNNNN", b"NNNNNNN", 7)]
    #[case(b"GANNACA", b"GATTACA", 2)]
    fn test_hamming_dist_no_calls_always_mismatch(
        #[case] alpha: &[u8],
        #[case] beta: &[u8],
        #[case] expected: usize,
    ) {
        assert_eq!(hamming_distance(alpha, beta), expected);
        assert_eq!(hamming_distance(beta, alpha), expected, "distance is symmetric");
    }

    #[test]
    fn test_hamming_dist_unequal_lengths() {
        assert_eq!(hamming_distance(b"GATT", b"GATTACA"), 3);
        assert_eq!(hamming_distance(b"GATTACA", b"GATT"), 3);
    }

    #[test]
    fn test_load_assigns_lengths_and_ordinals() {
        let registry = two_sample_registry();
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_empty());
        assert_eq!(registry.index1_length(), 4);
        assert_eq!(registry.index2_length(), 4);
        assert_eq!(registry.sample(0).sample_id, "S1");
        assert_eq!(registry.sample(1).ordinal, 1);
    }

    #[test]
    fn test_load_lowercase_barcodes_are_uppercased() {
        let registry = BarcodeRegistry::from_pairs([("S1", "aacc", "ggtt")]).unwrap();
        assert_eq!(registry.lookup_exact(b"AACC", IndexRead::Index1), &[0]);
    }

    #[test]
    fn test_load_fails_on_duplicate_pair() {
        let result = BarcodeRegistry::from_pairs([
            ("S1", "AACC", "GGTT"),
            ("S2", "TTGG", "CCAA"),
            ("S3", "AACC", "GGTT"),
        ]);
        match result {
            Err(BarcodeError::DuplicatePair { sample_a, sample_b, .. }) => {
                assert_eq!(sample_a, "S1");
                assert_eq!(sample_b, "S3");
            }
            other => panic!("Expected a DuplicatePair error, found {:?}", other),
        }
    }

    #[test]
    fn test_load_allows_shared_single_index() {
        // Combinatorial designs re-use each index across samples; only the pair must be unique.
        let registry = BarcodeRegistry::from_pairs([
            ("S1", "AACC", "GGTT"),
            ("S2", "AACC", "CCAA"),
            ("S3", "TTGG", "GGTT"),
        ])
        .unwrap();
        assert_eq!(registry.lookup_exact(b"AACC", IndexRead::Index1), &[0, 1]);
        assert_eq!(registry.lookup_exact(b"GGTT", IndexRead::Index2), &[0, 2]);
    }

    #[rstest]
    #[case(IndexRead::Index1, [("S1", "AACC", "GGTT"), ("S2", "AAC", "CCAA")])]
    #[case(IndexRead::Index2, [("S1", "AACC", "GGTT"), ("S2", "TTGG", "CCAAT")])]
    fn test_load_fails_on_inconsistent_lengths(
        #[case] expected_which: IndexRead,
        #[case] pairs: [(&str, &str, &str); 2],
    ) {
        match BarcodeRegistry::from_pairs(pairs) {
            Err(BarcodeError::LengthMismatch { which, .. }) => assert_eq!(which, expected_which),
            other => panic!("Expected a LengthMismatch error, found {:?}", other),
        }
    }

    #[test]
    fn test_load_fails_on_duplicate_sample_id() {
        let result =
            BarcodeRegistry::from_pairs([("S1", "AACC", "GGTT"), ("S1", "TTGG", "CCAA")]);
        assert!(matches!(result, Err(BarcodeError::DuplicateSampleId { id }) if id == "S1"));
    }

    #[test]
    fn test_load_fails_on_empty() {
        let result = BarcodeRegistry::from_pairs(Vec::<(&str, &str, &str)>::new());
        assert!(matches!(result, Err(BarcodeError::NoSamples)));
    }

    #[test]
    fn test_load_fails_on_invalid_base() {
        let result = BarcodeRegistry::from_pairs([("S1", "AXCC", "GGTT")]);
        assert!(matches!(
            result,
            Err(BarcodeError::InvalidBarcode { which: IndexRead::Index1, .. })
        ));
    }

    #[test]
    fn test_lookup_exact() {
        let registry = two_sample_registry();
        assert_eq!(registry.lookup_exact(b"AACC", IndexRead::Index1), &[0]);
        assert_eq!(registry.lookup_exact(b"CCAA", IndexRead::Index2), &[1]);
        assert!(registry.lookup_exact(b"CCAA", IndexRead::Index1).is_empty());
        assert!(registry.lookup_exact(b"AACT", IndexRead::Index1).is_empty());
    }

    #[test]
    fn test_candidates_within() {
        let registry = two_sample_registry();
        assert_eq!(
            registry.candidates_within(b"AACT", IndexRead::Index1, 1),
            vec![Candidate { sample: 0, mismatches: 1 }]
        );
        assert!(registry.candidates_within(b"AACT", IndexRead::Index1, 0).is_empty());
        assert_eq!(
            registry.candidates_within(b"TTGC", IndexRead::Index1, 4),
            vec![Candidate { sample: 1, mismatches: 1 }, Candidate { sample: 0, mismatches: 3 }]
        );
    }

    #[test]
    fn test_candidates_within_ties_broken_by_sample_id() {
        // Registered out of name order, both samples are one mismatch from the observed index.
        let registry =
            BarcodeRegistry::from_pairs([("zeta", "AAAT", "GGGG"), ("alpha", "AAAC", "CCCC")])
                .unwrap();
        let found = registry.candidates_within(b"AAAG", IndexRead::Index1, 1);
        assert_eq!(
            found,
            vec![Candidate { sample: 1, mismatches: 1 }, Candidate { sample: 0, mismatches: 1 }]
        );
    }

    #[test]
    fn test_candidates_within_no_call_is_mismatch() {
        let registry = two_sample_registry();
        assert!(registry.candidates_within(b"NACC", IndexRead::Index1, 0).is_empty());
        assert_eq!(
            registry.candidates_within(b"NACC", IndexRead::Index1, 1),
            vec![Candidate { sample: 0, mismatches: 1 }]
        );
    }

    #[test]
    fn test_check_lengths() {
        let registry = two_sample_registry();
        assert!(registry.check_lengths(&ObservedIndexPair::new(b"AACC", b"GGTT")).is_ok());
        match registry.check_lengths(&ObservedIndexPair::new(b"AAC", b"GGTT")) {
            Err(BarcodeError::LengthMismatch { which, expected, actual, .. }) => {
                assert_eq!(which, IndexRead::Index1);
                assert_eq!(expected, 4);
                assert_eq!(actual, 3);
            }
            other => panic!("Expected a LengthMismatch error, found {:?}", other),
        }
        assert!(matches!(
            registry.check_lengths(&ObservedIndexPair::new(b"AACC", b"GGTTA")),
            Err(BarcodeError::LengthMismatch { which: IndexRead::Index2, .. })
        ));
    }
}
