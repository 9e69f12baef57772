//! SHA-256 content digests guarding recovery records against corruption.

use sha2::{Digest, Sha256};

/// Lower-case hex SHA-256 of `content`.
pub fn digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `true` iff `checksum` is the digest of `content`.
pub fn verify(checksum: &str, content: &str) -> bool {
    digest(content).eq_ignore_ascii_case(checksum)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "",
        "hello",
        "# Notes\n\n- one\n- two\n",
        "unicode: naïve café ✓",
    ];

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            digest("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(digest("").len(), 64);
    }

    #[test]
    fn verify_accepts_own_digest() {
        for content in SAMPLES {
            assert!(verify(&digest(content), content), "{content:?}");
        }
    }

    #[test]
    fn any_single_bit_flip_fails_verification() {
        for content in SAMPLES.iter().filter(|c| !c.is_empty()) {
            let checksum = digest(content);
            let bytes = content.as_bytes();
            for index in 0..bytes.len() {
                for bit in 0..8 {
                    let mut mutated = bytes.to_vec();
                    mutated[index] ^= 1 << bit;
                    // Flips that break UTF-8 can never be stored as content.
                    if let Ok(mutated) = String::from_utf8(mutated) {
                        assert!(
                            !verify(&checksum, &mutated),
                            "flip of bit {bit} at byte {index} in {content:?} went undetected"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn corrupted_checksum_fails_verification() {
        let mut checksum = digest("hello");
        let first = if checksum.starts_with('0') { "1" } else { "0" };
        checksum.replace_range(0..1, first);
        assert!(!verify(&checksum, "hello"));
    }
}
