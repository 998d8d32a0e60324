use md5::{Digest, Md5};
use russh::keys::{PublicKey, PublicKeyBase64};

use crate::{Key, OrcaError, Result};

/// MD5 fingerprint of a public key, formatted as colon-separated hex pairs
/// (`ab:cd:...`).
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Md5::digest(key.public_key_bytes());
    let hexed = hex::encode(digest);
    hexed
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}

/// The KV index form of a fingerprint: colons stripped.
pub fn fingerprint_index(fp: &str) -> String {
    fp.replace(':', "")
}

/// Canonical armored (authorized_keys) form, without the comment.
pub fn armored(key: &PublicKey) -> String {
    format!("{} {}", key.algorithm(), key.public_key_base64())
}

/// Parse an armored public key line into a [`Key`] record. The key id is
/// taken from the comment when present.
pub fn parse_armored_key(line: &str) -> Result<Key> {
    let key = PublicKey::from_openssh(line.trim())
        .map_err(|e| OrcaError::ProtocolError(format!("invalid public key: {e}")))?;
    Ok(Key {
        id: key.comment().to_string(),
        value: armored(&key),
        fingerprint: fingerprint(&key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_LINE: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIB3Q4+bJrHjbAJsIwejTMV0kwWfzCB3BN9BMVNytC5+P test@example";

    #[test]
    fn fingerprint_format() {
        let key = PublicKey::from_openssh(ED25519_LINE).unwrap();
        let fp = fingerprint(&key);
        let pairs: Vec<&str> = fp.split(':').collect();
        assert_eq!(pairs.len(), 16);
        assert!(pairs
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit())));
        assert_eq!(fingerprint(&key), fp);
    }

    #[test]
    fn index_strips_colons() {
        assert_eq!(fingerprint_index("ab:cd:ef"), "abcdef");
    }

    #[test]
    fn parses_armored_line() {
        let key = parse_armored_key(&format!("  {ED25519_LINE}\n")).unwrap();
        assert_eq!(key.id, "test@example");
        assert!(key.value.starts_with("ssh-ed25519 "));
        assert!(!key.value.contains("test@example"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_armored_key("not a key").is_err());
    }
}
