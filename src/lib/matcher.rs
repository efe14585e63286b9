//! Correct observed barcodes against the set of expected barcodes using Levenshtein (edit)
//! distance.
//!
//! An observed barcode that is exactly one of the expected barcodes resolves to itself without
//! computing any distances.  Otherwise the expected barcode with the smallest edit distance is
//! chosen, provided that distance is no more than the allowed number of edits.  When several
//! expected barcodes share the smallest distance the one listed first in the manifest wins.

use std::cell::RefCell;

use cached::{Cached, SizedCache};

use crate::barcode_table::BarcodeSet;

/// The default number of edits allowed between an observed and an expected barcode.
pub const DEFAULT_MAX_EDITS: usize = 1;

/// The default number of observed barcodes remembered by the [`CachedLevenshteinCorrector`].
pub const DEFAULT_CACHE_SIZE: usize = 100_000;

/// The outcome of correcting one observed barcode.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub enum BarcodeDecision<'a> {
    /// The observed barcode was replaced by this expected barcode.
    Resolved { barcode: &'a [u8], edit_dist: usize },
    /// No expected barcode was close enough, or there was no barcode to correct.
    Unknown,
}

impl<'a> BarcodeDecision<'a> {
    /// The resolved barcode, if any.
    pub fn barcode(&self) -> Option<&'a [u8]> {
        match self {
            BarcodeDecision::Resolved { barcode, .. } => Some(barcode),
            BarcodeDecision::Unknown => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    pub fn is_unknown(&self) -> bool {
        !self.is_resolved()
    }

    /// True if the barcode was resolved without any edits.
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Resolved { edit_dist: 0, .. })
    }
}

/// The base trait for all barcode correction algorithms.
pub trait Corrector {
    /// Correct the observed `candidate` barcode.
    fn correct(&self, candidate: &[u8]) -> BarcodeDecision<'_>;
}

/// Corrects barcodes by scanning all expected barcodes on every call.
pub struct LevenshteinCorrector<'a> {
    pub known: &'a BarcodeSet,
    pub max_edits: usize,
}

impl<'a> LevenshteinCorrector<'a> {
    pub fn new(known: &'a BarcodeSet, max_edits: usize) -> Self {
        Self { known, max_edits }
    }

    /// Find the `(index, edit distance)` of the best expected barcode, if within `max_edits`.
    fn find(&self, candidate: &[u8]) -> Option<(usize, usize)> {
        if let Some(index) = self.known.index_of(candidate) {
            return Some((index, 0));
        }
        find_closest(candidate, self.known, self.max_edits)
    }

    fn decision(&self, found: Option<(usize, usize)>) -> BarcodeDecision<'a> {
        match found.and_then(|(index, dist)| self.known.get(index).map(|b| (b, dist))) {
            Some((barcode, edit_dist)) => {
                BarcodeDecision::Resolved { barcode: barcode.as_slice(), edit_dist }
            }
            None => BarcodeDecision::Unknown,
        }
    }
}

impl<'a> Corrector for LevenshteinCorrector<'a> {
    fn correct(&self, candidate: &[u8]) -> BarcodeDecision<'_> {
        self.decision(self.find(candidate))
    }
}

/// Corrects barcodes like [`LevenshteinCorrector`] but remembers the outcome for recently seen
/// observed barcodes.
pub struct CachedLevenshteinCorrector<'a> {
    inner: LevenshteinCorrector<'a>,
    cache: RefCell<SizedCache<Vec<u8>, Option<(usize, usize)>>>,
}

impl<'a> CachedLevenshteinCorrector<'a> {
    pub fn new(known: &'a BarcodeSet, max_edits: usize, cache_size: usize) -> Self {
        Self {
            inner: LevenshteinCorrector::new(known, max_edits),
            cache: RefCell::new(SizedCache::with_size(cache_size.max(1))),
        }
    }
}

impl<'a> Corrector for CachedLevenshteinCorrector<'a> {
    fn correct(&self, candidate: &[u8]) -> BarcodeDecision<'_> {
        // Exact matches are cheaper to look up than to cache.
        if let Some(index) = self.inner.known.index_of(candidate) {
            return self.inner.decision(Some((index, 0)));
        }

        let cache = &mut *self.cache.borrow_mut();
        let found = match cache.cache_get(&candidate.to_vec()) {
            Some(found) => *found,
            None => {
                let found = find_closest(candidate, self.inner.known, self.inner.max_edits);
                cache.cache_set(candidate.to_vec(), found);
                found
            }
        };
        self.inner.decision(found)
    }
}

/// Finds the first expected barcode (in manifest order) with the smallest edit distance to
/// `candidate`, returning its index and distance if that distance is at most `max_edits`.
fn find_closest(candidate: &[u8], known: &BarcodeSet, max_edits: usize) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for (index, barcode) in known.as_slice().iter().enumerate() {
        let bound = best.map_or(max_edits, |(_, dist)| dist);
        if let Some(dist) = bounded_levenshtein_distance(candidate, barcode, bound) {
            if best.map_or(true, |(_, best_dist)| dist < best_dist) {
                best = Some((index, dist));
                if dist == 0 {
                    break;
                }
            }
        }
    }
    best
}

/// Levenshtein distance on slices of bytes: insertions, deletions, and substitutions all cost 1.
pub fn levenshtein_distance(alpha: &[u8], beta: &[u8]) -> usize {
    bounded_levenshtein_distance(alpha, beta, usize::MAX).unwrap_or(usize::MAX)
}

/// Levenshtein distance that gives up as soon as the distance is known to exceed `max`.
///
/// Returns `None` if the distance is greater than `max`.
pub fn bounded_levenshtein_distance(alpha: &[u8], beta: &[u8], max: usize) -> Option<usize> {
    if alpha.len().abs_diff(beta.len()) > max {
        return None;
    }
    if alpha.is_empty() || beta.is_empty() {
        return Some(alpha.len().max(beta.len()));
    }

    let mut prev: Vec<usize> = (0..=beta.len()).collect();
    let mut curr: Vec<usize> = vec![0; beta.len() + 1];
    for (i, a) in alpha.iter().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];
        for (j, b) in beta.iter().enumerate() {
            let substitution = prev[j] + usize::from(a != b);
            let deletion = prev[j + 1] + 1;
            let insertion = curr[j] + 1;
            curr[j + 1] = substitution.min(deletion).min(insertion);
            row_min = row_min.min(curr[j + 1]);
        }
        // Every later row is at least the smallest value in this one.
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let dist = prev[beta.len()];
    if dist <= max {
        Some(dist)
    } else {
        None
    }
}
