//! Content identity hashing for [`Stat`] records
//!
//! The identity covers mode, ownership, device numbers, link target and the
//! retained extended attributes. Name, size and modification time are left
//! out; callers mix in file content through [`ContentHasher::hash_with_content`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;
use crate::stat::Stat;

/// Hash algorithms supported for identity hashes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// SHA-256 hash
    #[default]
    Sha256,
    /// Blake3 hash (faster)
    Blake3,
}

enum Hasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => format!("{:x}", h.finalize()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// Computes identity hashes with a chosen algorithm
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher {
    algorithm: HashAlgorithm,
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hex digest of the metadata identity of `stat`
    pub fn hash_stat(&self, stat: &Stat) -> String {
        let mut hasher = Hasher::new(self.algorithm);
        feed_stat(&mut hasher, stat);
        hasher.finalize_hex()
    }

    /// Hex digest of the metadata identity followed by the content bytes
    pub async fn hash_with_content<R>(&self, stat: &Stat, mut content: R) -> Result<String>
    where
        R: AsyncRead + Unpin,
    {
        let mut hasher = Hasher::new(self.algorithm);
        feed_stat(&mut hasher, stat);

        let mut buffer = vec![0; 8192];
        loop {
            let bytes_read = content.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finalize_hex())
    }
}

/// SHA-256 identity hash of `stat`
pub fn hash_of(stat: &Stat) -> String {
    ContentHasher::default().hash_stat(stat)
}

fn feed_stat(hasher: &mut Hasher, stat: &Stat) {
    hasher.update(&stat.mode.to_le_bytes());
    hasher.update(&u64::from(stat.uid).to_le_bytes());
    hasher.update(&u64::from(stat.gid).to_le_bytes());
    hasher.update(&stat.devmajor.to_le_bytes());
    hasher.update(&stat.devminor.to_le_bytes());

    hasher.update(b"\0");
    hasher.update(stat.linkname.as_bytes());
    hasher.update(b"\0");

    let mut keys: Vec<&String> = stat.xattrs.keys().filter(|k| retain_xattr(k)).collect();
    keys.sort();
    for key in keys {
        hasher.update(b"\0");
        hasher.update(key.as_bytes());
        hasher.update(&stat.xattrs[key]);
        hasher.update(b"\0");
    }
}

fn retain_xattr(key: &str) -> bool {
    if key.starts_with("system.") {
        return false;
    }
    if key.starts_with("security.") {
        return key == "security.capability";
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::{S_IFLNK, S_IFREG};
    use std::collections::HashMap;

    fn file_stat() -> Stat {
        Stat {
            path: "foo".to_string(),
            mode: S_IFREG | 0o644,
            uid: 1000,
            gid: 1000,
            size: 12,
            mod_time: 42,
            ..Default::default()
        }
    }

    #[test]
    fn test_name_size_and_mtime_do_not_matter() {
        let a = file_stat();
        let mut b = file_stat();
        b.path = "bar/baz".to_string();
        b.size = 9999;
        b.mod_time = 7;

        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_mode_owner_and_link_change_hash() {
        let base = hash_of(&file_stat());

        let mut mode = file_stat();
        mode.mode = S_IFREG | 0o755;
        let mut owner = file_stat();
        owner.gid = 0;
        let mut link = file_stat();
        link.mode = S_IFLNK | 0o777;
        link.linkname = "target".to_string();

        assert_ne!(base, hash_of(&mode));
        assert_ne!(base, hash_of(&owner));
        assert_ne!(base, hash_of(&link));
    }

    #[test]
    fn test_xattr_filtering_and_order() {
        let mut a = file_stat();
        a.xattrs = HashMap::from([
            ("user.a".to_string(), b"1".to_vec()),
            ("user.b".to_string(), b"2".to_vec()),
            ("security.capability".to_string(), b"cap".to_vec()),
        ]);

        let mut b = a.clone();
        b.xattrs.insert("system.posix_acl_access".to_string(), b"acl".to_vec());
        b.xattrs.insert("security.selinux".to_string(), b"ctx".to_vec());
        assert_eq!(hash_of(&a), hash_of(&b));

        let mut c = a.clone();
        c.xattrs.remove("security.capability");
        assert_ne!(hash_of(&a), hash_of(&c));
    }

    #[test]
    fn test_known_digest_layout() {
        let stat = file_stat();
        let mut expected = Sha256::new();
        expected.update((S_IFREG | 0o644).to_le_bytes());
        expected.update(1000u64.to_le_bytes());
        expected.update(1000u64.to_le_bytes());
        expected.update(0u64.to_le_bytes());
        expected.update(0u64.to_le_bytes());
        expected.update(b"\0\0");

        assert_eq!(hash_of(&stat), format!("{:x}", expected.finalize()));
    }

    #[tokio::test]
    async fn test_content_changes_hash() {
        let hasher = ContentHasher::new(HashAlgorithm::Blake3);
        let stat = file_stat();

        let one = hasher.hash_with_content(&stat, &b"hello"[..]).await.unwrap();
        let two = hasher.hash_with_content(&stat, &b"world"[..]).await.unwrap();

        assert_ne!(one, two);
        assert_ne!(one, hasher.hash_stat(&stat));
    }
}
