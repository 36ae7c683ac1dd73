//! Bucketed path layout for the content-addressed store.

use std::path::PathBuf;

/// Root-relative layout for the four store subdirectories, bucketing
/// digests two hex characters deep to keep any one directory's entry
/// count manageable.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreLayout { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn pkgs_dir(&self) -> PathBuf {
        self.root.join("pkgs")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    /// `pkgs/<algorithm>/<first two hex>/<remaining hex>`
    pub fn package_path(&self, algorithm: &str, digest_hex: &str) -> PathBuf {
        bucketed(&self.pkgs_dir(), algorithm, digest_hex)
    }

    /// `files/<algorithm>/<first two>/<remaining hex>`
    pub fn file_path(&self, algorithm: &str, digest_hex: &str) -> PathBuf {
        bucketed(&self.files_dir(), algorithm, digest_hex)
    }

    /// Sidecar manifest path for a package entry: `<package-dir>.manifest`.
    pub fn manifest_path(&self, algorithm: &str, digest_hex: &str) -> PathBuf {
        manifest_sibling(&self.package_path(algorithm, digest_hex))
    }

    /// Last-access marker path for a package entry under `meta/`.
    pub fn last_access_path(&self, algorithm: &str, digest_hex: &str) -> PathBuf {
        bucketed(&self.meta_dir(), algorithm, digest_hex)
    }

    pub fn new_tmp_path(&self) -> PathBuf {
        self.tmp_dir().join(random_name())
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.pkgs_dir())?;
        std::fs::create_dir_all(self.files_dir())?;
        std::fs::create_dir_all(self.tmp_dir())?;
        std::fs::create_dir_all(self.meta_dir())?;
        Ok(())
    }
}

fn bucketed(base: &std::path::Path, algorithm: &str, digest_hex: &str) -> PathBuf {
    let split = digest_hex.len().min(2);
    let (p1, p2) = digest_hex.split_at(split);
    base.join(algorithm).join(p1).join(p2)
}

/// `.manifest` sidecar sitting next to (not inside) the package directory.
fn manifest_sibling(package_dir: &std::path::Path) -> PathBuf {
    let mut p = package_dir.to_path_buf();
    let file_name = p
        .file_name()
        .map(|n| format!("{}.manifest", n.to_string_lossy()))
        .unwrap_or_else(|| "unknown.manifest".to_string());
    p.set_file_name(file_name);
    p
}

fn random_name() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let pid = std::process::id();
    format!(".staging-{pid}-{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_two_hex_chars_deep() {
        let layout = StoreLayout::new("/store");
        let p = layout.package_path("sha512", "abcdef0123");
        assert_eq!(p, PathBuf::from("/store/pkgs/sha512/ab/cdef0123"));
    }

    #[test]
    fn short_digest_does_not_panic() {
        let layout = StoreLayout::new("/store");
        let p = layout.file_path("sha256", "a");
        assert_eq!(p, PathBuf::from("/store/files/sha256/a"));
    }

    #[test]
    fn manifest_sits_beside_package_dir() {
        let layout = StoreLayout::new("/store");
        let m = layout.manifest_path("sha512", "abcdef0123");
        assert_eq!(
            m,
            PathBuf::from("/store/pkgs/sha512/ab/cdef0123.manifest")
        );
    }
}
