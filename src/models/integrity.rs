use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Compute the lower-case hex SHA-256 of a file, reading it in chunks
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Check a file against an expected hex digest (case-insensitive).
///
/// A missing or unreadable file is a failed check, not an error: callers
/// respond to either by fetching the file again.
#[must_use]
pub fn verify(path: &Path, expected_hex: &str) -> bool {
    match sha256_file(path) {
        Ok(actual) => {
            let matches = actual.eq_ignore_ascii_case(expected_hex.trim());
            if !matches {
                tracing::warn!(
                    path = %path.display(),
                    expected = %expected_hex,
                    actual = %actual,
                    "Checksum mismatch"
                );
            }
            matches
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "Cannot hash file: {e}");
            false
        }
    }
}
