/// Content Hashing Utilities
///
/// Packages in the ecosystem are addressed by the lowercase hex SHA-256 of
/// their full contents. These helpers cover the two shapes the engine needs:
/// hashing an in-memory buffer after chunk assembly, and streaming a reader
/// through the digest when importing blobs into the cache.
use anyhow::Result;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Stream a reader through SHA-256, returning the hex digest and the number
/// of bytes consumed.
pub async fn sha256_reader<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

/// True iff `s` looks like a content hash: exactly 64 lowercase hex chars.
pub fn is_valid_hash(s: &str) -> bool {
    s.len() == 64
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_vectors() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn reader_digest_matches_slice_digest() {
        let data = vec![0xabu8; 200_000];
        let mut cursor = std::io::Cursor::new(data.clone());
        let (digest, len) = sha256_reader(&mut cursor).await.unwrap();
        assert_eq!(digest, sha256_hex(&data));
        assert_eq!(len, data.len() as u64);
    }

    #[test]
    fn hash_validation() {
        assert!(is_valid_hash(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        ));
        assert!(!is_valid_hash("e3b0c442"));
        assert!(!is_valid_hash(&"E".repeat(64)));
        assert!(!is_valid_hash(&"z".repeat(64)));
    }

    proptest! {
        #[test]
        fn reader_and_slice_agree(buf in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let mut cursor = std::io::Cursor::new(buf.clone());
            let (digest, len) = tokio_test::block_on(sha256_reader(&mut cursor)).unwrap();
            prop_assert_eq!(digest, sha256_hex(&buf));
            prop_assert_eq!(len, buf.len() as u64);
        }
    }
}
