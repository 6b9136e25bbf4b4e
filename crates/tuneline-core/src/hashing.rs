use crate::error::PipelineResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read buffer used when streaming files through the hasher.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Identity of a file on disk: newline count, byte size and content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    /// Number of `\n` bytes. Not the number of decodable records.
    pub newline_count: u64,
    pub bytes: u64,
    pub sha256: String,
}

pub fn sha256_file(path: &Path) -> PipelineResult<String> {
    Ok(count_lines_bytes_sha(path)?.sha256)
}

#[must_use]
pub fn sha256_text(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub fn count_lines_bytes_sha(path: &Path) -> PipelineResult<FileDigest> {
    count_lines_bytes_sha_with_chunk(path, DEFAULT_CHUNK_SIZE)
}

/// Stream `path` in `chunk_size` reads, never holding the whole file in memory.
pub fn count_lines_bytes_sha_with_chunk(path: &Path, chunk_size: usize) -> PipelineResult<FileDigest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut newline_count = 0u64;
    let mut bytes = 0u64;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        newline_count += chunk.iter().filter(|&&b| b == b'\n').count() as u64;
        bytes += n as u64;
        hasher.update(chunk);
    }

    Ok(FileDigest { newline_count, bytes, sha256: hex::encode(hasher.finalize()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_counts_newlines_not_records() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.jsonl");
        std::fs::write(&path, "{\"text\":\"a\"}\n\n{\"text\":\"b\"}").unwrap();

        let digest = count_lines_bytes_sha(&path).unwrap();
        assert_eq!(digest.newline_count, 2);
        assert_eq!(digest.bytes, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_known_digest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.txt");
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sha256_text("abc"), sha256_file(&path).unwrap());
    }

    #[test]
    fn test_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.jsonl");
        std::fs::write(&path, "").unwrap();
        let digest = count_lines_bytes_sha(&path).unwrap();
        assert_eq!(digest.newline_count, 0);
        assert_eq!(digest.bytes, 0);
    }

    proptest! {
        #[test]
        fn prop_chunk_size_does_not_change_result(
            content in proptest::collection::vec(prop_oneof![Just(b'\n'), any::<u8>()], 0..4096),
            chunk in 1usize..700,
        ) {
            let temp = TempDir::new().unwrap();
            let path = temp.path().join("blob.bin");
            std::fs::write(&path, &content).unwrap();

            let small = count_lines_bytes_sha_with_chunk(&path, chunk).unwrap();
            let large = count_lines_bytes_sha(&path).unwrap();
            prop_assert_eq!(&small, &large);
            prop_assert_eq!(small.bytes, content.len() as u64);
            prop_assert_eq!(small.newline_count, content.iter().filter(|&&b| b == b'\n').count() as u64);
        }
    }
}
