use std::path::{Component, Path, PathBuf};

use crate::sandbox::error::SandboxError;

/// Path containment for files copied out of a sandbox onto the host.
///
/// Every write is validated to stay within `root`. This is NOT a chroot;
/// it only guards against `..` traversal in names reported by the guest.
#[derive(Debug, Clone)]
pub struct FsJail {
    root: PathBuf,
}

impl FsJail {
    /// Create a new jail rooted at `root`. Creates the directory if needed.
    pub fn create(root: PathBuf) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&root).map_err(|e| {
            SandboxError::Backend(format!(
                "failed to create host dir {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    /// Resolve a guest-relative path to an absolute host path, rejecting
    /// anything that would escape the root.
    pub fn resolve(&self, guest_path: &str) -> Result<PathBuf, SandboxError> {
        let guest = Path::new(guest_path);
        let relative = guest.strip_prefix("/").unwrap_or(guest);

        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(seg) => normalized.push(seg),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SandboxError::Exec(format!(
                            "path escapes workspace: {guest_path}"
                        )));
                    }
                }
                _ => {}
            }
        }

        if normalized.as_os_str().is_empty() {
            return Err(SandboxError::Exec(format!("empty path: {guest_path:?}")));
        }

        Ok(self.root.join(normalized))
    }

    /// Write `bytes` at a guest-relative path, creating parents.
    pub fn put_file(&self, guest_path: &str, bytes: &[u8]) -> Result<PathBuf, SandboxError> {
        let path = self.resolve(guest_path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_strips_leading_slash() {
        let tmp = tempfile::tempdir().unwrap();
        let jail = FsJail::create(tmp.path().to_path_buf()).unwrap();
        let path = jail.resolve("/out/result.txt").unwrap();
        assert_eq!(path, tmp.path().join("out/result.txt"));
    }

    #[test]
    fn resolve_allows_inner_parent_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let jail = FsJail::create(tmp.path().to_path_buf()).unwrap();
        let path = jail.resolve("a/b/../c.txt").unwrap();
        assert_eq!(path, tmp.path().join("a/c.txt"));
    }

    #[test]
    fn resolve_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let jail = FsJail::create(tmp.path().to_path_buf()).unwrap();
        assert!(jail.resolve("../../etc/passwd").is_err());
        assert!(jail.resolve("a/../../x").is_err());
    }

    #[test]
    fn resolve_rejects_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let jail = FsJail::create(tmp.path().to_path_buf()).unwrap();
        assert!(jail.resolve("/").is_err());
    }

    #[test]
    fn put_file_creates_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let jail = FsJail::create(tmp.path().join("sync")).unwrap();
        let path = jail.put_file("nested/dir/out.txt", b"data").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"data");
    }
}
