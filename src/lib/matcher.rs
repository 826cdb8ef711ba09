//! Classify an observed index pair against the expected samples in a [`BarcodeRegistry`].
//!
//! Each index is searched independently for the samples within its mismatch budget.  A sample
//! found by both searches is a match; if the two searches find only different samples, the read
//! is an index hop; otherwise the read is undetermined.
//!
//! The per-index search is behind the [`CandidateSearch`] trait with two implementations, a scan
//! over the registry ([`ScanSearch`]) and a lookup table of every sequence within budget of an
//! expected index ([`PreComputeSearch`]).  Both give identical results.

use std::{
    borrow::Cow,
    cell::RefCell,
    fmt::Display,
    sync::atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use anyhow::anyhow;
use bstr::ByteSlice;
use cached::SizedCache;
use clap::{ArgEnum, PossibleValue};
use itertools::Itertools;

use crate::{
    registry::{hamming_distance, BarcodeRegistry, Candidate, IndexRead},
    sample_metadata::ALLOWED_BASES,
    utils::reverse_complement,
};

/// The longest index for which [`MatcherKind::PreCompute`] is picked by default.
pub const MAX_PRECOMPUTE_INDEX_LENGTH: usize = 12;

/// The largest mismatch budget for which [`MatcherKind::PreCompute`] is picked by default.
pub const MAX_PRECOMPUTE_MISMATCHES: usize = 2;

thread_local! (
    /// The match cache used by the [`DualIndexMatcher`], keyed by the matcher's cache id.
    static CACHE: RefCell<SizedCache<(usize, ObservedIndexPair), MatchResult>> =
    RefCell::new(SizedCache::with_size(100_000))
);

/// Source of the per-matcher ids that keep matchers from sharing cache entries.
static NEXT_CACHE_ID: AtomicUsize = AtomicUsize::new(0);

/// The index sequences read from a single read.
///
/// Bases are upper-cased and anything other than `A`, `C`, `G` or `T` becomes an `N`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObservedIndexPair {
    pub index1: Vec<u8>,
    pub index2: Vec<u8>,
}

impl ObservedIndexPair {
    pub fn new(index1: &[u8], index2: &[u8]) -> Self {
        Self { index1: Self::normalize(index1), index2: Self::normalize(index2) }
    }

    fn normalize(bases: &[u8]) -> Vec<u8> {
        bases
            .iter()
            .map(|b| match b.to_ascii_uppercase() {
                base @ (b'A' | b'C' | b'G' | b'T') => base,
                _ => b'N',
            })
            .collect()
    }

    /// The observed sequence of the given index.
    pub fn index(&self, which: IndexRead) -> &[u8] {
        match which {
            IndexRead::Index1 => &self.index1,
            IndexRead::Index2 => &self.index2,
        }
    }

    /// Reverse complements the index2 sequence, for runs where index2 is read on the opposite
    /// strand from the sample sheet.
    #[must_use]
    pub fn with_index2_reverse_complemented(mut self) -> Self {
        self.index2 = reverse_complement(&self.index2);
        self
    }

    /// The number of no-calls (`N`s) across both indexes.
    pub fn num_no_calls(&self) -> usize {
        bytecount::count(&self.index1, b'N') + bytecount::count(&self.index2, b'N')
    }
}

impl Display for ObservedIndexPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.index1.as_bstr(), self.index2.as_bstr())
    }
}

/// The outcome of classifying one [`ObservedIndexPair`].  Samples are registry ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchResult {
    /// Both indexes equal the sample's indexes.
    Exact { sample: usize },
    /// Both indexes are within budget of the sample's indexes, and at least one is not exact.
    NearMatch { sample: usize, mismatches1: usize, mismatches2: usize },
    /// Index1 matches one sample and index2 another, and no sample matches both.
    Hopped { index1_sample: usize, index2_sample: usize },
    /// Index1 or index2 has no sample within budget.
    Undetermined,
}

impl MatchResult {
    /// True for [`MatchResult::Exact`] and [`MatchResult::NearMatch`].
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Exact { .. } | Self::NearMatch { .. })
    }

    pub fn is_hop(&self) -> bool {
        matches!(self, Self::Hopped { .. })
    }

    /// The matched sample, if any.
    pub fn sample(&self) -> Option<usize> {
        match self {
            Self::Exact { sample } | Self::NearMatch { sample, .. } => Some(*sample),
            Self::Hopped { .. } | Self::Undetermined => None,
        }
    }
}

#[derive(ArgEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    Scan,
    PreCompute,
}

impl MatcherKind {
    pub fn possible_values<'a>() -> impl Iterator<Item = PossibleValue<'a>> {
        MatcherKind::value_variants().iter().filter_map(ArgEnum::to_possible_value)
    }

    /// Pick the search strategy for a registry and budgets.
    ///
    /// The lookup table grows with the number of sequences within budget of each expected index,
    /// so it is only used for short indexes and small budgets.
    pub fn choose(registry: &BarcodeRegistry, budget1: usize, budget2: usize) -> Self {
        let short = registry.index1_length().max(registry.index2_length())
            <= MAX_PRECOMPUTE_INDEX_LENGTH;
        let small = budget1.max(budget2) <= MAX_PRECOMPUTE_MISMATCHES;
        if short && small {
            Self::PreCompute
        } else {
            Self::Scan
        }
    }
}

impl std::str::FromStr for MatcherKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for variant in Self::value_variants() {
            if variant.to_possible_value().map_or(false, |v| v.matches(s, false)) {
                return Ok(*variant);
            }
        }
        Err(anyhow!("Invalid variant: {}", s))
    }
}

/// Finds the samples within a mismatch budget of one observed index.
pub trait CandidateSearch: Send + Sync {
    fn registry(&self) -> &BarcodeRegistry;

    /// The mismatch budget for the given index.
    fn budget(&self, which: IndexRead) -> usize;

    /// The samples whose `which` index is within budget of `seq`, sorted by
    /// [`BarcodeRegistry::sort_candidates`].
    fn candidates(&self, seq: &[u8], which: IndexRead) -> Cow<'_, [Candidate]>;
}

/// Searches by scanning every sample in the registry.
pub struct ScanSearch<'a> {
    registry: &'a BarcodeRegistry,
    budget1: usize,
    budget2: usize,
}

impl<'a> ScanSearch<'a> {
    pub fn new(registry: &'a BarcodeRegistry, budget1: usize, budget2: usize) -> Self {
        Self { registry, budget1, budget2 }
    }
}

impl<'a> CandidateSearch for ScanSearch<'a> {
    fn registry(&self) -> &BarcodeRegistry {
        self.registry
    }

    fn budget(&self, which: IndexRead) -> usize {
        match which {
            IndexRead::Index1 => self.budget1,
            IndexRead::Index2 => self.budget2,
        }
    }

    fn candidates(&self, seq: &[u8], which: IndexRead) -> Cow<'_, [Candidate]> {
        let budget = self.budget(which);
        if budget == 0 {
            // A no-call never matches, so skip the hash lookup
            if seq.contains(&b'N') {
                return Cow::Borrowed(&[]);
            }
            let mut exact: Vec<Candidate> = self
                .registry
                .lookup_exact(seq, which)
                .iter()
                .map(|&sample| Candidate { sample, mismatches: 0 })
                .collect();
            self.registry.sort_candidates(&mut exact);
            Cow::Owned(exact)
        } else {
            Cow::Owned(self.registry.candidates_within(seq, which, budget))
        }
    }
}

/// Searches a table of every sequence within budget of an expected index.
pub struct PreComputeSearch<'a> {
    registry: &'a BarcodeRegistry,
    budget1: usize,
    budget2: usize,
    index1_lookup: AHashMap<Vec<u8>, Vec<Candidate>>,
    index2_lookup: AHashMap<Vec<u8>, Vec<Candidate>>,
}

impl<'a> PreComputeSearch<'a> {
    pub fn new(registry: &'a BarcodeRegistry, budget1: usize, budget2: usize) -> Self {
        let index1_lookup = Self::build_map(registry, IndexRead::Index1, budget1);
        let index2_lookup = Self::build_map(registry, IndexRead::Index2, budget2);
        Self { registry, budget1, budget2, index1_lookup, index2_lookup }
    }

    /// Build a map of every observable sequence within `budget` of some sample's `which` index
    /// to the sorted candidates for that sequence.
    pub fn build_map(
        registry: &BarcodeRegistry,
        which: IndexRead,
        budget: usize,
    ) -> AHashMap<Vec<u8>, Vec<Candidate>> {
        let mut map: AHashMap<Vec<u8>, Vec<Candidate>> = AHashMap::new();
        for sample in registry.samples() {
            for (seq, mismatches) in Self::all_permutations(sample.index(which), budget) {
                map.entry(seq)
                    .or_insert_with(Vec::new)
                    .push(Candidate { sample: sample.ordinal, mismatches });
            }
        }
        for candidates in map.values_mut() {
            registry.sort_candidates(candidates);
        }
        map
    }

    /// Generate every sequence over [`ALLOWED_BASES`] within `max_mismatches` of `barcode`,
    /// along with its hamming distance to `barcode`.
    fn all_permutations(
        barcode: &[u8],
        max_mismatches: usize,
    ) -> impl Iterator<Item = (Vec<u8>, usize)> + '_ {
        // xs.iter().combinations(n) returns [] if n > xs.len();
        let max_mismatches = max_mismatches.min(barcode.len());
        (0..barcode.len())
            .combinations(max_mismatches) // generate positions to insert mismatches
            .flat_map(move |locations| {
                let mut this_barcode = barcode.iter().map(|c| vec![*c]).collect::<Vec<Vec<u8>>>();
                for location in locations {
                    this_barcode[location] = ALLOWED_BASES.to_vec();
                }
                this_barcode.into_iter().multi_cartesian_product()
            })
            .sorted()
            .dedup()
            .filter_map(move |bc| {
                let dist = hamming_distance(barcode, &bc);
                (dist <= max_mismatches).then(|| (bc, dist))
            })
    }
}

impl<'a> CandidateSearch for PreComputeSearch<'a> {
    fn registry(&self) -> &BarcodeRegistry {
        self.registry
    }

    fn budget(&self, which: IndexRead) -> usize {
        match which {
            IndexRead::Index1 => self.budget1,
            IndexRead::Index2 => self.budget2,
        }
    }

    fn candidates(&self, seq: &[u8], which: IndexRead) -> Cow<'_, [Candidate]> {
        let lookup = match which {
            IndexRead::Index1 => &self.index1_lookup,
            IndexRead::Index2 => &self.index2_lookup,
        };
        Cow::Borrowed(lookup.get(seq).map_or(&[][..], Vec::as_slice))
    }
}

/// The base trait for classifying observed index pairs.
pub trait Matcher: Send + Sync {
    fn registry(&self) -> &BarcodeRegistry;

    fn classify(&self, observed: &ObservedIndexPair) -> MatchResult;
}

/// Classifies index pairs with a [`CandidateSearch`], memoising results per thread.
pub struct DualIndexMatcher<S> {
    search: S,
    cache_id: usize,
}

impl<S: CandidateSearch> DualIndexMatcher<S> {
    pub fn new(search: S) -> Self {
        Self { search, cache_id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed) }
    }

    /// Classify without consulting or filling the cache.
    pub fn classify_uncached(&self, observed: &ObservedIndexPair) -> MatchResult {
        let index1 = self.search.candidates(&observed.index1, IndexRead::Index1);
        let index2 = self.search.candidates(&observed.index2, IndexRead::Index2);
        resolve(self.search.registry(), &index1, &index2)
    }
}

impl<'a> DualIndexMatcher<ScanSearch<'a>> {
    pub fn scan(registry: &'a BarcodeRegistry, budget1: usize, budget2: usize) -> Self {
        Self::new(ScanSearch::new(registry, budget1, budget2))
    }
}

impl<'a> DualIndexMatcher<PreComputeSearch<'a>> {
    pub fn precompute(registry: &'a BarcodeRegistry, budget1: usize, budget2: usize) -> Self {
        Self::new(PreComputeSearch::new(registry, budget1, budget2))
    }
}

impl<S: CandidateSearch> Matcher for DualIndexMatcher<S> {
    fn registry(&self) -> &BarcodeRegistry {
        self.search.registry()
    }

    fn classify(&self, observed: &ObservedIndexPair) -> MatchResult {
        CACHE.with(|cache| {
            // check the cache
            let c = &mut *cache.borrow_mut();
            let key = (self.cache_id, observed.clone());
            if let Some(res) = cached::Cached::cache_get(c, &key) {
                return *res;
            }

            let result = self.classify_uncached(observed);
            cached::Cached::cache_set(c, key, result);
            result
        })
    }
}

/// Classify a single index pair by scanning the registry.
pub fn classify(
    registry: &BarcodeRegistry,
    observed: &ObservedIndexPair,
    budget1: usize,
    budget2: usize,
) -> MatchResult {
    let search = ScanSearch::new(registry, budget1, budget2);
    let index1 = search.candidates(&observed.index1, IndexRead::Index1);
    let index2 = search.candidates(&observed.index2, IndexRead::Index2);
    resolve(registry, &index1, &index2)
}

/// Combine the sorted candidates for each index into a [`MatchResult`].
fn resolve(registry: &BarcodeRegistry, index1: &[Candidate], index2: &[Candidate]) -> MatchResult {
    if index1.is_empty() || index2.is_empty() {
        return MatchResult::Undetermined;
    }

    let mut best: Option<(Candidate, Candidate)> = None;
    for c1 in index1 {
        for c2 in index2.iter().filter(|c2| c2.sample == c1.sample) {
            let better = match best {
                None => true,
                Some((b1, b2)) => {
                    let total = c1.mismatches + c2.mismatches;
                    let best_total = b1.mismatches + b2.mismatches;
                    total < best_total
                        || (total == best_total
                            && registry.cmp_samples(c1.sample, b1.sample).is_lt())
                }
            };
            if better {
                best = Some((*c1, *c2));
            }
        }
    }

    match best {
        Some((c1, c2)) if c1.mismatches == 0 && c2.mismatches == 0 => {
            MatchResult::Exact { sample: c1.sample }
        }
        Some((c1, c2)) => MatchResult::NearMatch {
            sample: c1.sample,
            mismatches1: c1.mismatches,
            mismatches2: c2.mismatches,
        },
        None => MatchResult::Hopped { index1_sample: index1[0].sample, index2_sample: index2[0].sample },
    }
}
