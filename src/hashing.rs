//! Streaming content fingerprints.
//!
//! A [`Fingerprint`] is the `(sha256, byte length)` pair that identifies a
//! file globally. The reader is consumed in fixed-size chunks so memory use
//! does not depend on file size.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// Lower-case hex SHA-256 digest.
    pub sha256: String,
    pub size_bytes: u64,
}

/// Hash a reader to completion. Either returns a full digest and length or
/// the I/O error that stopped the scan.
pub fn fingerprint_reader<R: Read>(reader: &mut R) -> std::io::Result<Fingerprint> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut size_bytes: u64 = 0;

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
        size_bytes += bytes_read as u64;
    }

    Ok(Fingerprint {
        sha256: hex::encode(hasher.finalize()),
        size_bytes,
    })
}

/// Fingerprint the file at `path`.
pub fn fingerprint_file(path: &Path) -> Result<Fingerprint> {
    let metadata = std::fs::metadata(path).map_err(|e| Error::io(path, e))?;
    if !metadata.is_file() {
        return Err(Error::io(
            path,
            std::io::Error::new(ErrorKind::InvalidInput, "not a regular file"),
        ));
    }
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    fingerprint_reader(&mut file).map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn known_digest() {
        let fp = fingerprint_reader(&mut Cursor::new(b"Hello, World!")).unwrap();
        assert_eq!(
            fp.sha256,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
        assert_eq!(fp.size_bytes, 13);
    }

    #[test]
    fn empty_input() {
        let fp = fingerprint_reader(&mut Cursor::new(Vec::<u8>::new())).unwrap();
        assert_eq!(
            fp.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(fp.size_bytes, 0);
    }

    #[test]
    fn spans_many_chunks() {
        let data = vec![b'A'; 1024 * 1024];
        let fp = fingerprint_reader(&mut Cursor::new(&data)).unwrap();
        assert_eq!(
            fp.sha256,
            "4e29ad18ab9f42d7c233500771a39d7c852b200baf328fd00fbbe3fecea1eb56"
        );
        assert_eq!(fp.size_bytes, 1024 * 1024);
    }

    struct FailingReader {
        served: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.served {
                Err(std::io::Error::new(ErrorKind::Other, "device gone"))
            } else {
                self.served = true;
                buf[0] = b'x';
                Ok(1)
            }
        }
    }

    #[test]
    fn mid_stream_failure_is_an_error() {
        let err = fingerprint_reader(&mut FailingReader { served: false }).unwrap_err();
        assert_eq!(err.to_string(), "device gone");
    }

    #[test]
    fn missing_file_and_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            fingerprint_file(&tmp.path().join("absent.txt")),
            Err(Error::Io { .. })
        ));
        assert!(matches!(fingerprint_file(tmp.path()), Err(Error::Io { .. })));
    }
}
