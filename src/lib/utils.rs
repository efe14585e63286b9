//! Utility functions.
use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use core::fmt::Display;
use gzp::{
    deflate::Bgzf, par::decompress::ParDecompressBuilder, BlockFormatSpec, GzpError, BUFSIZE,
};

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
            // This shouldn't happen
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

/// The suffix appended to a bucket name for the file holding forward reads.
pub const FORWARD_SUFFIX: &str = "_forward";
/// The suffix appended to a bucket name for the file holding reverse reads.
pub const REVERSE_SUFFIX: &str = "_reverse";

/// Determine the `(forward, reverse)` output paths for a bucket (a sample name or the unplaced
/// bucket name).
pub fn filenames<P: AsRef<Path>>(bucket: &str, output_dir: P) -> (PathBuf, PathBuf) {
    let dir = output_dir.as_ref();
    (
        dir.join(format!("{}{}", bucket, FORWARD_SUFFIX)),
        dir.join(format!("{}{}", bucket, REVERSE_SUFFIX)),
    )
}

/// Returns true if the path looks like a block-compressed FASTQ based on its extension.
pub fn is_compressed(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz" || ext == "bgz")
}

/// Opens a FASTQ for line-oriented reading.
///
/// Plain text files are read directly.  Files ending in `.gz` or `.bgz` must be BGZF and are
/// decompressed on `decompression_threads` background threads.
pub fn open_fastq(
    file: &Path,
    decompression_threads: usize,
) -> Result<Box<dyn BufRead>, anyhow::Error> {
    let reader = BufReader::with_capacity(
        BUFSIZE,
        File::open(file).with_context(|| format!("Failed to open {}", file.to_string_lossy()))?,
    );

    if is_compressed(file) {
        check_bgzf(file)?;
        let decompressor = ParDecompressBuilder::<Bgzf>::new()
            .num_threads(decompression_threads)
            .with_context(|| {
                format!(
                    "Error in setting threads when creating decompressor for {}",
                    file.to_string_lossy()
                )
            })?
            .from_reader(reader);
        Ok(Box::new(BufReader::with_capacity(BUFSIZE, decompressor)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Checks if the file is a BGZF file
pub fn check_bgzf(file: &Path) -> Result<(), anyhow::Error> {
    let mut reader = match File::open(&file) {
        Ok(f) => BufReader::with_capacity(BUFSIZE, f),
        Err(error) => {
            return Err(error).with_context(|| format!("Failed to open {}", file.to_string_lossy()))
        }
    };
    let mut bytes = vec![0; Bgzf::HEADER_SIZE];
    match reader.read_exact(&mut bytes) {
        Err(error) => {
            // not enough bytes read
            let message =
                format!("Error reading from: {}\nIs it truncated?", file.to_string_lossy());
            Err(anyhow!(message).context(error))
        }
        Ok(()) => {
            if bytes[0] != 31 || bytes[1] != 139 || bytes[2] != 8 {
                // not a valid GZIP file
                report_bgzf_error(file, GzpError::InvalidHeader("Header not in GZIP format"), false)
            } else if bytes[3] & 4 != 4 || bytes[12] != b'B' || bytes[13] != b'C' {
                // non-BGZF GZIP file
                report_bgzf_error(
                    file,
                    GzpError::InvalidHeader("Header in GZIP but not BGZF format"),
                    true,
                )
            } else {
                Ok(())
            }
        }
    }
}

/// Creates an error message when the file does not look like a BGZF file.
fn report_bgzf_error<C>(file: &Path, context: C, is_gzip: bool) -> Result<(), anyhow::Error>
where
    C: Display + Send + Sync + 'static,
{
    let filename = file.to_string_lossy();
    let format = if is_gzip { "gzip" } else { "unknown" };
    let message = format!(
        "
Error reading from: {}

Compressed input must be in BGZF (bgzip) format!

The input was found in a {} format.

To re-compress a GZIP file with bgzip:
  1. install with `conda install -c bioconda htslib`
     or from http://www.htslib.org/download/
  2. `gunzip -c {} > tmp.fastq`
  3. `bgzip --stdout --threads 4 tmp.fastq > {}`

Alternatively decompress it and pass the plain text FASTQ.
",
        filename, format, filename, filename,
    );
    Err(anyhow!(message).context(context))
}


#[cfg(test)]
mod test {
    use std::{
        fs::File,
        io::{BufWriter, Read, Write},
        path::PathBuf,
    };

    use gzp::{BgzfSyncWriter, Compression, MgzipSyncWriter};
    use tempfile::tempdir;

    use super::{check_bgzf, filenames, is_compressed, open_fastq};

    #[test]
    fn test_filenames() {
        let (fwd, rev) = filenames("Sample1", "/tmp");
        assert_eq!(fwd, PathBuf::from("/tmp/Sample1_forward"));
        assert_eq!(rev, PathBuf::from("/tmp/Sample1_reverse"));

        let (fwd, rev) = filenames("unplaced", ".");
        assert_eq!(fwd, PathBuf::from("./unplaced_forward"));
        assert_eq!(rev, PathBuf::from("./unplaced_reverse"));
    }

    #[test]
    fn test_is_compressed() {
        assert!(is_compressed(&PathBuf::from("reads.fastq.gz")));
        assert!(is_compressed(&PathBuf::from("reads.fastq.bgz")));
        assert!(!is_compressed(&PathBuf::from("reads.fastq")));
        assert!(!is_compressed(&PathBuf::from("reads")));
    }

    #[test]
    fn test_check_bgzf_path_does_not_exist_fail() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("does_not_exist.txt");
        assert!(check_bgzf(&file).is_err());
    }

    #[test]
    fn test_check_bgzf_on_plaintext_fail() {
        let dir = tempdir().unwrap();

        let file = dir.path().join("plaintext.txt");
        let mut writer = BufWriter::new(File::create(&file).unwrap());
        writer.write_all(b"@NAME\nGATTACA\n+\nIIIIIII\n").unwrap();
        drop(writer);

        assert!(check_bgzf(&file).is_err());
    }

    #[test]
    fn test_check_bgzf_on_gzip_fail() {
        let dir = tempdir().unwrap();

        let file = dir.path().join("fastq.gz");
        let writer = BufWriter::new(File::create(&file).unwrap());
        let mut gz_writer = MgzipSyncWriter::new(writer, Compression::new(3));
        gz_writer.write_all(b"@NAME\nGATTACA\n+\nIIIIIII\n").unwrap();
        gz_writer.flush().unwrap();
        drop(gz_writer);

        assert!(check_bgzf(&file).is_err());
        assert!(open_fastq(&file, 1).is_err());
    }

    #[test]
    fn test_open_fastq_bgzf_and_plain() {
        let dir = tempdir().unwrap();
        let contents = b"@NAME:1:2\nGATTACA\n+\nIIIIIII\n";

        let compressed = dir.path().join("fastq.gz");
        let writer = BufWriter::new(File::create(&compressed).unwrap());
        let mut gz_writer = BgzfSyncWriter::new(writer, Compression::new(3));
        gz_writer.write_all(contents).unwrap();
        gz_writer.flush().unwrap();
        drop(gz_writer);

        let plain = dir.path().join("reads.fastq");
        std::fs::write(&plain, contents).unwrap();

        for path in [compressed, plain] {
            let mut reader = open_fastq(&path, 1).unwrap();
            let mut actual = vec![];
            reader.read_to_end(&mut actual).unwrap();
            assert_eq!(actual, contents.to_vec());
        }
    }
}
