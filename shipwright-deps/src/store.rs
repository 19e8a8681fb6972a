//! Build cache: one rootfs + export root per reconstructed dependency recipe,
//! keyed by the recipe text's content digest.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::Digest as _;

const ROOTFS_DIR: &str = "rootfs";
const EXPORT_DIR: &str = "export";
const SAVE_DIR: &str = "save";

/// Build cache rooted at a configured directory.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Opens (creating if absent) a store rooted at `root`.
    pub fn open(root: &Path) -> crate::Result<Self> {
        fs::create_dir_all(root.join(ROOTFS_DIR))?;
        fs::create_dir_all(root.join(EXPORT_DIR))?;
        fs::create_dir_all(root.join(SAVE_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Directory a stage's built image is extracted into, keyed by digest.
    #[must_use]
    pub fn rootfs_path(&self, digest: &str) -> PathBuf {
        self.root.join(ROOTFS_DIR).join(digest)
    }

    /// Directory copies of exported `COPY --from=` paths are written to.
    #[must_use]
    pub fn export_root(&self, digest: &str) -> PathBuf {
        self.root.join(EXPORT_DIR).join(digest)
    }

    /// Scratch path for a `docker save` archive, keyed by digest.
    #[must_use]
    pub fn save_path(&self, digest: &str) -> PathBuf {
        self.root.join(SAVE_DIR).join(format!("{digest}.tar"))
    }
}

/// Computes the `sha256:<hex>` digest of a byte slice.
#[must_use]
pub fn content_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(sha2::Sha256::digest(data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        assert_eq!(content_digest(b"hello"), content_digest(b"hello"));
        assert_ne!(content_digest(b"hello"), content_digest(b"world"));
    }
}
