#![forbid(unsafe_code)]
//! Compile primer sequences into a [`PrimerPattern`] and use them to locate the barcode at the
//! 5' end of a read.
//!
//! # Grammar
//!
//! ```text
//! <pattern>      ::= <position>+
//! <position>     ::= <literal> | "[" <literal>+ "]"
//! <literal>      ::= any byte other than "[" or "]"
//! ```
//!
//! A bracketed group matches exactly one base drawn from its members, which is how degenerate
//! bases are written (e.g. `Y` is spelled `[CT]`).  No other byte is special: `.`, `*`, `+` and
//! friends match themselves.  Matching is case sensitive.
//!
//! # Usage
//!
//! ```rust
//! use pedemux_lib::primer::PrimerPattern;
//! let pattern = PrimerPattern::compile("AT[GC]C").unwrap();
//! assert_eq!(pattern.extract(b"TTGGCCATGCGATCGATCG"), Some(&b"TTGGCC"[..]));
//! assert_eq!(pattern.extract(b"TTTTTTTT"), None);
//! ```

use std::fmt::Display;

use thiserror::Error;

/// The errors that can occur when compiling a primer pattern.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PrimerPatternError {
    #[error("Primer pattern is empty")]
    Empty,

    #[error("Primer pattern `{pattern}` has an empty bracket group at offset {offset}")]
    EmptyAlternatives { pattern: String, offset: usize },

    #[error("Primer pattern `{pattern}` has an unterminated bracket group at offset {offset}")]
    Unterminated { pattern: String, offset: usize },

    #[error("Primer pattern `{pattern}` has a nested bracket group at offset {offset}")]
    Nested { pattern: String, offset: usize },

    #[error("Primer pattern `{pattern}` has an unmatched `]` at offset {offset}")]
    UnmatchedClose { pattern: String, offset: usize },
}

/// A single position in a [`PrimerPattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum Position {
    /// Matches exactly this byte.
    Literal(u8),
    /// Matches any one of these bytes (sorted, no duplicates).
    OneOf(Vec<u8>),
}

impl Position {
    #[inline]
    fn matches(&self, base: u8) -> bool {
        match self {
            Position::Literal(b) => *b == base,
            Position::OneOf(bases) => bases.contains(&base),
        }
    }
}

/// A compiled primer: a fixed-length run of literal and single-position alternative positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimerPattern {
    /// The pattern text as given.
    source: String,
    positions: Vec<Position>,
}

impl PrimerPattern {
    /// Compile the pattern text.
    ///
    /// # Errors
    ///
    /// - [`PrimerPatternError::Empty`] if there are no positions
    /// - [`PrimerPatternError::EmptyAlternatives`] for `[]`
    /// - [`PrimerPatternError::Unterminated`] for a `[` with no closing `]`
    /// - [`PrimerPatternError::Nested`] for a `[` inside a bracket group
    /// - [`PrimerPatternError::UnmatchedClose`] for a `]` outside a bracket group
    pub fn compile(pattern: &str) -> Result<Self, PrimerPatternError> {
        let bytes = pattern.as_bytes();
        let mut positions = Vec::with_capacity(bytes.len());
        let mut offset = 0;
        while offset < bytes.len() {
            match bytes[offset] {
                b'[' => {
                    let open = offset;
                    let mut members = vec![];
                    offset += 1;
                    loop {
                        match bytes.get(offset) {
                            None => {
                                return Err(PrimerPatternError::Unterminated {
                                    pattern: pattern.to_string(),
                                    offset: open,
                                })
                            }
                            Some(b']') => break,
                            Some(b'[') => {
                                return Err(PrimerPatternError::Nested {
                                    pattern: pattern.to_string(),
                                    offset,
                                })
                            }
                            Some(b) => members.push(*b),
                        }
                        offset += 1;
                    }
                    if members.is_empty() {
                        return Err(PrimerPatternError::EmptyAlternatives {
                            pattern: pattern.to_string(),
                            offset: open,
                        });
                    }
                    members.sort_unstable();
                    members.dedup();
                    positions.push(if members.len() == 1 {
                        Position::Literal(members[0])
                    } else {
                        Position::OneOf(members)
                    });
                }
                b']' => {
                    return Err(PrimerPatternError::UnmatchedClose {
                        pattern: pattern.to_string(),
                        offset,
                    })
                }
                b => positions.push(Position::Literal(b)),
            }
            offset += 1;
        }

        if positions.is_empty() {
            return Err(PrimerPatternError::Empty);
        }
        Ok(Self { source: pattern.to_string(), positions })
    }

    /// The number of read bases a match spans.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Always false, a compiled pattern has at least one position.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The pattern text this was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if the pattern matches `sequence` starting at `start`.
    #[inline]
    fn matches_at(&self, sequence: &[u8], start: usize) -> bool {
        self.positions.iter().zip(&sequence[start..]).all(|(p, b)| p.matches(*b))
    }

    /// The offset of the leftmost match of the pattern in `sequence`, if any.
    pub fn find(&self, sequence: &[u8]) -> Option<usize> {
        if sequence.len() < self.positions.len() {
            return None;
        }
        (0..=sequence.len() - self.positions.len()).find(|&start| self.matches_at(sequence, start))
    }

    /// Returns the bases strictly before the leftmost match of the pattern (the putative
    /// barcode), or `None` if the pattern does not occur in `sequence`.
    ///
    /// A match at the very start of the read yields an empty barcode.
    pub fn extract<'s>(&self, sequence: &'s [u8]) -> Option<&'s [u8]> {
        self.find(sequence).map(|start| &sequence[..start])
    }
}

impl Display for PrimerPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Extracts candidate barcodes using a primer, optionally rejecting overly long candidates.
#[derive(Debug, Clone)]
pub struct BarcodeExtractor {
    primer: PrimerPattern,
    max_barcode_length: Option<usize>,
}

impl BarcodeExtractor {
    pub fn new(primer: PrimerPattern, max_barcode_length: Option<usize>) -> Self {
        Self { primer, max_barcode_length }
    }

    pub fn primer(&self) -> &PrimerPattern {
        &self.primer
    }

    /// Extract the candidate barcode preceding the primer.
    ///
    /// Returns `None` if the primer is not found or the candidate is longer than the configured
    /// maximum barcode length.
    pub fn extract<'s>(&self, sequence: &'s [u8]) -> Option<&'s [u8]> {
        match (self.primer.extract(sequence), self.max_barcode_length) {
            (Some(barcode), Some(max)) if barcode.len() > max => None,
            (found, _) => found,
        }
    }
}
