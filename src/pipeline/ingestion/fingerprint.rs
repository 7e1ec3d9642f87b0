use crate::error::{EtlError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Identifies one physical source file across runs.
///
/// Canonical path, byte length and modification time; an edited or replaced
/// extract gets a new fingerprint and therefore a fresh facts checkpoint.
pub fn source_fingerprint(path: &Path) -> Result<String> {
    let unavailable = |e: std::io::Error| EtlError::SourceUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let canonical = path.canonicalize().map_err(unavailable)?;
    let meta = std::fs::metadata(&canonical).map_err(unavailable)?;
    let modified_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    Ok(compute_fingerprint(
        &canonical.to_string_lossy(),
        meta.len(),
        modified_ns,
    ))
}

pub fn compute_fingerprint(canonical_path: &str, byte_len: u64, modified_ns: u128) -> String {
    let mut s = String::new();
    s.push_str(canonical_path);
    s.push('|');
    s.push_str(&byte_len.to_string());
    s.push('|');
    s.push_str(&modified_ns.to_string());

    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fingerprint_is_stable_for_unchanged_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"session_id,track_id\n").unwrap();
        file.flush().unwrap();

        let a = source_fingerprint(file.path()).unwrap();
        let b = source_fingerprint(file.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_length() {
        let a = compute_fingerprint("/data/x.csv", 10, 1);
        let b = compute_fingerprint("/data/x.csv", 11, 1);
        assert_ne!(a, b);
    }
}
