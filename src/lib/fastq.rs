//! Line-oriented FASTQ reading and the paired forward/reverse record iterator.
//!
//! Records are kept as the raw lines they were read from, line endings included, so that they
//! can be appended to the output files verbatim.  A record starts at the next line that looks
//! like a sequencer header (see [`is_header`]); any other lines before it are skipped.

use std::io::{BufRead, Write};

use lazy_static::lazy_static;
use regex::bytes::Regex;
use thiserror::Error;

lazy_static! {
    /// A header starts with `@` and has at least two colon delimited segments.
    static ref HEADER_RE: Regex = Regex::new(r"^@.+:.+:").expect("header regex is valid");
}

/// Returns true if `line` should start a new FASTQ record.
///
/// Quality lines may incidentally start with `@`, but rarely contain two `:`s.
pub fn is_header(line: &[u8]) -> bool {
    HEADER_RE.is_match(line)
}

/// The errors that can occur while reading FASTQ records.
#[derive(Error, Debug)]
pub enum FastqError {
    #[error("Error reading from {name}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Truncated FASTQ record in {name}: header on line {line} lacks the 3 lines after it")]
    TruncatedRecord { name: String, line: usize },

    #[error("{ended} ended after {pairs} records while {other} still has records")]
    PairedStream { ended: String, other: String, pairs: usize },
}

/// Split a line into its content and its line ending (`\n`, `\r\n` or nothing).
pub fn split_line_ending(line: &[u8]) -> (&[u8], &[u8]) {
    let content_len = match line {
        [.., b'\r', b'\n'] => line.len() - 2,
        [.., b'\n'] => line.len() - 1,
        _ => line.len(),
    };
    line.split_at(content_len)
}

/// One 4-line FASTQ record.  Every line keeps its original line ending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadRecord {
    pub header: Vec<u8>,
    pub sequence: Vec<u8>,
    pub plus: Vec<u8>,
    pub quality: Vec<u8>,
}

impl ReadRecord {
    /// The read bases without the line ending.
    pub fn seq(&self) -> &[u8] {
        split_line_ending(&self.sequence).0
    }

    /// The quality string without the line ending.
    pub fn qual(&self) -> &[u8] {
        split_line_ending(&self.quality).0
    }

    /// Write the record, removing the first `trim.bases` bases from the sequence line (and from
    /// the quality line too if `trim.qualities` is set).
    pub fn write_trimmed<W: Write>(&self, writer: &mut W, trim: Trim) -> std::io::Result<()> {
        writer.write_all(&self.header)?;
        write_trimmed_line(writer, &self.sequence, trim.bases)?;
        writer.write_all(&self.plus)?;
        write_trimmed_line(writer, &self.quality, if trim.qualities { trim.bases } else { 0 })
    }

    /// Write the record exactly as it was read.
    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.write_trimmed(writer, Trim::default())
    }
}

fn write_trimmed_line<W: Write>(writer: &mut W, line: &[u8], n: usize) -> std::io::Result<()> {
    let (content, ending) = split_line_ending(line);
    writer.write_all(&content[n.min(content.len())..])?;
    writer.write_all(ending)
}

/// How many leading bases to remove from a record when writing it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trim {
    pub bases: usize,
    /// Also remove `bases` characters from the quality line.
    pub qualities: bool,
}

/// Reads [`ReadRecord`]s one at a time from a line-oriented source.
pub struct FastqReader<R: BufRead> {
    reader: R,
    name: String,
    line_number: usize,
}

impl<R: BufRead> FastqReader<R> {
    /// Create a reader.  `name` (usually the file path) is used in error messages.
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self { reader, name: name.into(), line_number: 0 }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the next line into `buffer`, returning false at end of input.
    ///
    /// A final line with no line ending is given `\n` so that it can be appended to an output
    /// file without merging with the next record.
    fn read_line(&mut self, buffer: &mut Vec<u8>) -> Result<bool, FastqError> {
        buffer.clear();
        let read = self
            .reader
            .read_until(b'\n', buffer)
            .map_err(|source| FastqError::Io { name: self.name.clone(), source })?;
        if read == 0 {
            return Ok(false);
        }
        if buffer.last() != Some(&b'\n') {
            buffer.push(b'\n');
        }
        self.line_number += 1;
        Ok(true)
    }

    /// Read the next record, skipping any lines before the next header.
    ///
    /// Returns `Ok(None)` when the input is exhausted.
    pub fn next_record(&mut self) -> Result<Option<ReadRecord>, FastqError> {
        let mut record = ReadRecord::default();
        loop {
            if !self.read_line(&mut record.header)? {
                return Ok(None);
            }
            if is_header(&record.header) {
                break;
            }
        }

        let header_line = self.line_number;
        for line in [&mut record.sequence, &mut record.plus, &mut record.quality] {
            if !self.read_line(line)? {
                return Err(FastqError::TruncatedRecord {
                    name: self.name.clone(),
                    line: header_line,
                });
            }
        }
        Ok(Some(record))
    }
}

impl<R: BufRead> Iterator for FastqReader<R> {
    type Item = Result<ReadRecord, FastqError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Yields `(forward, reverse)` record pairs from two readers in lockstep.
///
/// Iteration stops when the forward reader is exhausted.  If either reader runs out of records
/// before the other a [`FastqError::PairedStream`] is returned, and after any error the iterator
/// yields nothing further.
pub struct PairedReads<F: BufRead, R: BufRead> {
    forward: FastqReader<F>,
    reverse: FastqReader<R>,
    pairs: usize,
    done: bool,
}

impl<F: BufRead, R: BufRead> PairedReads<F, R> {
    pub fn new(forward: FastqReader<F>, reverse: FastqReader<R>) -> Self {
        Self { forward, reverse, pairs: 0, done: false }
    }

    /// The number of pairs yielded so far.
    pub fn pairs(&self) -> usize {
        self.pairs
    }

    fn next_pair(&mut self) -> Result<Option<(ReadRecord, ReadRecord)>, FastqError> {
        match (self.forward.next_record()?, self.reverse.next_record()?) {
            (Some(forward), Some(reverse)) => {
                self.pairs += 1;
                Ok(Some((forward, reverse)))
            }
            (None, None) => Ok(None),
            (None, Some(_)) => Err(FastqError::PairedStream {
                ended: self.forward.name().to_string(),
                other: self.reverse.name().to_string(),
                pairs: self.pairs,
            }),
            (Some(_), None) => Err(FastqError::PairedStream {
                ended: self.reverse.name().to_string(),
                other: self.forward.name().to_string(),
                pairs: self.pairs,
            }),
        }
    }
}

impl<F: BufRead, R: BufRead> Iterator for PairedReads<F, R> {
    type Item = Result<(ReadRecord, ReadRecord), FastqError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.next_pair();
        if !matches!(result, Ok(Some(_))) {
            self.done = true;
        }
        result.transpose()
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use matches::assert_matches;
    use rstest::rstest;

    use crate::utils::test_commons::Fq;

    use super::{
        is_header, split_line_ending, FastqError, FastqReader, PairedReads, ReadRecord, Trim,
    };

    fn reader(text: &str, name: &str) -> FastqReader<Cursor<Vec<u8>>> {
        FastqReader::new(Cursor::new(text.as_bytes().to_vec()), name)
    }

    fn records(fqs: &[Fq]) -> String {
        fqs.iter().map(Fq::to_text).collect()
    }

    #[rstest]
    #[case("@H00233:4:AAAFGW3HV:1:1101:59586:1000\n", true)]
    #[case("@a:b:\n", true)]
    #[case("@a:b\n", false)]
    #[case("@::\n", false)]
    #[case("@IIII:II\n", false)]
    #[case("H00233:4:AAAFGW3HV\n", false)]
    #[case("+\n", false)]
    #[case("", false)]
    fn test_is_header(#[case] line: &str, #[case] expected: bool) {
        assert_eq!(is_header(line.as_bytes()), expected);
    }

    #[rstest]
    #[case("ACGT\n", "ACGT", "\n")]
    #[case("ACGT\r\n", "ACGT", "\r\n")]
    #[case("ACGT", "ACGT", "")]
    #[case("\n", "", "\n")]
    #[case("", "", "")]
    fn test_split_line_ending(#[case] line: &str, #[case] content: &str, #[case] ending: &str) {
        let (actual_content, actual_ending) = split_line_ending(line.as_bytes());
        assert_eq!(actual_content, content.as_bytes());
        assert_eq!(actual_ending, ending.as_bytes());
    }

    #[test]
    fn test_read_records() {
        let text = records(&[
            Fq { name: "r:1:1", bases: "ACGT", ..Fq::default() },
            Fq { name: "r:1:2", bases: "GGCC", quals: Some("@@@@"), ..Fq::default() },
        ]);
        let actual: Vec<ReadRecord> = reader(&text, "r1.fq").map(Result::unwrap).collect();
        assert_eq!(actual.len(), 2);
        assert_eq!(actual[0].header, b"@r:1:1\n");
        assert_eq!(actual[0].seq(), b"ACGT");
        assert_eq!(actual[0].plus, b"+\n");
        assert_eq!(actual[0].qual(), b"IIII");
        assert_eq!(actual[1].seq(), b"GGCC");
        assert_eq!(actual[1].qual(), b"@@@@");
    }

    #[test]
    fn test_leading_noise_is_skipped() {
        let record = Fq { bases: "ACGT", ..Fq::default() }.to_text();
        let text = format!("junk\n@not-a-header\n{}", record);
        let actual: Vec<ReadRecord> = reader(&text, "r1.fq").map(Result::unwrap).collect();
        assert_eq!(actual.len(), 1);
        assert_eq!(actual[0].seq(), b"ACGT");
    }

    #[test]
    fn test_quality_line_starting_with_at_is_not_a_header() {
        let text = records(&[
            Fq { name: "r:1:1", bases: "ACGT", quals: Some("@III"), ..Fq::default() },
            Fq { name: "r:1:2", bases: "TTTT", ..Fq::default() },
        ]);
        let actual: Vec<ReadRecord> = reader(&text, "r1.fq").map(Result::unwrap).collect();
        assert_eq!(actual.len(), 2);
        assert_eq!(actual[0].qual(), b"@III");
    }

    #[test]
    fn test_crlf_line_endings_are_preserved() {
        let text = "@r:1:1\r\nACGT\r\n+\r\nIIII\r\n";
        let record = reader(text, "r1.fq").next().unwrap().unwrap();
        assert_eq!(record.seq(), b"ACGT");
        assert_eq!(record.sequence, b"ACGT\r\n");

        let mut out = vec![];
        record.write(&mut out).unwrap();
        assert_eq!(out, text.as_bytes());
    }

    #[test]
    fn test_missing_final_newline_is_added() {
        let record = reader("@r:1:1\nACGT\n+\nIIII", "r1.fq").next().unwrap().unwrap();
        assert_eq!(record.quality, b"IIII\n");
    }

    #[test]
    fn test_truncated_record() {
        let mut reader = reader("@r:1:1\nACGT\n+\n", "r1.fq");
        assert_matches!(
            reader.next_record(),
            Err(FastqError::TruncatedRecord { name, line: 1 }) if name == "r1.fq"
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(reader("", "r1.fq").next().is_none());
        assert!(reader("\n\nnoise\n", "r1.fq").next().is_none());
    }

    #[rstest]
    #[case(Trim { bases: 0, qualities: false }, "ACGTAC", "IIIIII")]
    #[case(Trim { bases: 2, qualities: false }, "GTAC", "IIIIII")]
    #[case(Trim { bases: 2, qualities: true }, "GTAC", "IIII")]
    #[case(Trim { bases: 10, qualities: true }, "", "")]
    fn test_write_trimmed(#[case] trim: Trim, #[case] bases: &str, #[case] quals: &str) {
        let record =
            reader(&Fq { name: "r:1:1", bases: "ACGTAC", ..Fq::default() }.to_text(), "r1.fq")
                .next()
                .unwrap()
                .unwrap();
        let mut out = vec![];
        record.write_trimmed(&mut out, trim).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), format!("@r:1:1\n{}\n+\n{}\n", bases, quals));
    }

    #[test]
    fn test_paired_reads() {
        let forward = records(&[
            Fq { name: "r:1:1", bases: "AAAA", ..Fq::default() },
            Fq { name: "r:1:2", bases: "CCCC", ..Fq::default() },
        ]);
        let reverse = records(&[
            Fq { name: "r:1:1", bases: "GGGG", ..Fq::default() },
            Fq { name: "r:1:2", bases: "TTTT", ..Fq::default() },
        ]);
        let mut pairs = PairedReads::new(reader(&forward, "r1.fq"), reader(&reverse, "r2.fq"));
        let actual: Vec<(ReadRecord, ReadRecord)> = pairs.by_ref().map(Result::unwrap).collect();
        assert_eq!(pairs.pairs(), 2);
        assert_eq!(actual.len(), 2);
        assert_eq!(actual[0].0.seq(), b"AAAA");
        assert_eq!(actual[0].1.seq(), b"GGGG");
        assert_eq!(actual[1].0.seq(), b"CCCC");
        assert_eq!(actual[1].1.seq(), b"TTTT");
    }

    #[test]
    fn test_paired_reads_reverse_ends_first() {
        let forward = records(&[
            Fq { name: "r:1:1", bases: "AAAA", ..Fq::default() },
            Fq { name: "r:1:2", bases: "CCCC", ..Fq::default() },
        ]);
        let reverse = records(&[Fq { name: "r:1:1", bases: "GGGG", ..Fq::default() }]);
        let mut pairs = PairedReads::new(reader(&forward, "r1.fq"), reader(&reverse, "r2.fq"));
        assert!(pairs.next().unwrap().is_ok());
        assert_matches!(
            pairs.next(),
            Some(Err(FastqError::PairedStream { ended, other, pairs: 1 }))
                if ended == "r2.fq" && other == "r1.fq"
        );
        assert!(pairs.next().is_none());
    }

    #[test]
    fn test_paired_reads_forward_ends_first() {
        let forward = records(&[Fq { name: "r:1:1", bases: "AAAA", ..Fq::default() }]);
        let reverse = records(&[
            Fq { name: "r:1:1", bases: "GGGG", ..Fq::default() },
            Fq { name: "r:1:2", bases: "TTTT", ..Fq::default() },
        ]);
        let mut pairs = PairedReads::new(reader(&forward, "r1.fq"), reader(&reverse, "r2.fq"));
        assert!(pairs.next().unwrap().is_ok());
        assert_matches!(
            pairs.next(),
            Some(Err(FastqError::PairedStream { ended, pairs: 1, .. })) if ended == "r1.fq"
        );
        assert!(pairs.next().is_none());
    }

    #[test]
    fn test_paired_reads_fused_after_truncation() {
        let forward = "@r:1:1\nAAAA\n";
        let reverse = records(&[Fq { name: "r:1:1", bases: "GGGG", ..Fq::default() }]);
        let mut pairs = PairedReads::new(reader(forward, "r1.fq"), reader(&reverse, "r2.fq"));
        assert_matches!(pairs.next(), Some(Err(FastqError::TruncatedRecord { .. })));
        assert!(pairs.next().is_none());
    }
}
