use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One file in a sandbox workspace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceEntry {
    /// Path relative to the workspace root, `/`-separated
    pub path: String,
    pub size: u64,
    pub modified_at: Option<SystemTime>,
}

/// A sandbox's private directory tree with path-confined file access
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the workspace directory
    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        info!("[SANDBOX] Created workspace: {:?}", self.root);
        Ok(())
    }

    /// Write `data` to `relative`, creating parent directories.
    ///
    /// The bytes land in a temp file next to the target and are renamed into place,
    /// so code running in the sandbox never observes a partially written file.
    pub fn upload(&self, relative: &str, data: &[u8]) -> Result<PathBuf> {
        let target = self.confine(relative)?;
        let parent = target
            .parent()
            .ok_or_else(|| SandboxError::PathRejected(relative.to_string()))?
            .to_path_buf();

        self.check_existing_ancestor(&parent, relative)?;
        fs::create_dir_all(&parent)?;
        // Re-check now that every component exists.
        self.check_within_root(&parent, relative)?;
        if target.is_dir() {
            return Err(SandboxError::PathRejected(format!(
                "{} is a directory",
                relative
            )));
        }

        let mut staged = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(&parent)?;
        staged.write_all(data)?;
        staged.as_file().sync_all()?;
        staged
            .persist(&target)
            .map_err(|e| SandboxError::IoError(e.error))?;

        debug!(
            "[SANDBOX] Uploaded {} bytes to {:?}",
            data.len(),
            target
        );
        Ok(target)
    }

    /// Read the file at `relative`
    pub fn download(&self, relative: &str) -> Result<Vec<u8>> {
        let target = self.confine(relative)?;
        let resolved = match fs::canonicalize(&target) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SandboxError::FileNotFound(relative.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if !resolved.starts_with(self.canonical_root()?) {
            warn!(
                "[SANDBOX] Rejected download escaping workspace: {} -> {:?}",
                relative, resolved
            );
            return Err(SandboxError::PathRejected(relative.to_string()));
        }
        if !resolved.is_file() {
            return Err(SandboxError::FileNotFound(relative.to_string()));
        }
        Ok(fs::read(&resolved)?)
    }

    /// All regular files in the workspace, sorted by path. Symlinks are not followed.
    pub fn list(&self) -> Result<Vec<WorkspaceEntry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let meta = entry.metadata().map_err(std::io::Error::from)?;
            entries.push(WorkspaceEntry {
                path: relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
                size: meta.len(),
                modified_at: meta.modified().ok(),
            });
        }
        // Walk order is per directory; callers get one flat ordering by path.
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Remove the whole tree; removing an absent workspace succeeds
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                info!("[SANDBOX] Cleaned up workspace: {:?}", self.root);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lexically normalize `relative` and join it under the root.
    ///
    /// Absolute paths, drive prefixes, empty paths and `..` that climbs out of
    /// the root are rejected.
    fn confine(&self, relative: &str) -> Result<PathBuf> {
        let rejected = || SandboxError::PathRejected(relative.to_string());
        if relative.trim().is_empty() || relative.contains('\0') {
            return Err(rejected());
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(rejected());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(rejected()),
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(rejected());
        }
        Ok(self.root.join(normalized))
    }

    fn canonical_root(&self) -> Result<PathBuf> {
        Ok(fs::canonicalize(&self.root)?)
    }

    /// The deepest ancestor of `path` that already exists must resolve inside the root
    fn check_existing_ancestor(&self, path: &Path, relative: &str) -> Result<()> {
        let mut ancestor = path;
        loop {
            if ancestor.symlink_metadata().is_ok() {
                return self.check_within_root(ancestor, relative);
            }
            match ancestor.parent() {
                Some(parent) if parent.starts_with(&self.root) => ancestor = parent,
                _ => return Err(SandboxError::PathRejected(relative.to_string())),
            }
        }
    }

    fn check_within_root(&self, path: &Path, relative: &str) -> Result<()> {
        let resolved = fs::canonicalize(path)?;
        if resolved.starts_with(self.canonical_root()?) {
            Ok(())
        } else {
            warn!(
                "[SANDBOX] Rejected path escaping workspace: {} -> {:?}",
                relative, resolved
            );
            Err(SandboxError::PathRejected(relative.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().join("workspace"));
        ws.create().unwrap();
        (dir, ws)
    }

    #[test]
    fn test_upload_then_download_returns_same_bytes() {
        let (_dir, ws) = workspace();
        let data = b"\x00\x01binary\xffpayload".to_vec();
        ws.upload("f.txt", &data).unwrap();
        assert_eq!(ws.download("f.txt").unwrap(), data);
    }

    #[test]
    fn test_upload_creates_parents_and_overwrites() {
        let (_dir, ws) = workspace();
        ws.upload("data/raw/input.csv", b"a,b\n").unwrap();
        ws.upload("data/raw/input.csv", b"c,d\n").unwrap();
        assert_eq!(ws.download("data/raw/input.csv").unwrap(), b"c,d\n");
        assert_eq!(ws.download("./data/../data/raw/input.csv").unwrap(), b"c,d\n");
    }

    #[test]
    fn test_traversal_is_rejected_and_nothing_written() {
        let (dir, ws) = workspace();
        let err = ws.upload("../outside.txt", b"nope").unwrap_err();
        assert!(matches!(err, SandboxError::PathRejected(_)));
        assert!(!dir.path().join("outside.txt").exists());

        assert!(matches!(
            ws.upload("a/../../outside.txt", b"nope"),
            Err(SandboxError::PathRejected(_))
        ));
        assert!(matches!(
            ws.upload("/etc/passwd", b"nope"),
            Err(SandboxError::PathRejected(_))
        ));
        assert!(matches!(ws.upload("", b"nope"), Err(SandboxError::PathRejected(_))));
        assert!(matches!(ws.download("../x"), Err(SandboxError::PathRejected(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_rejected() {
        let (dir, ws) = workspace();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.txt"), b"secret").unwrap();
        std::os::unix::fs::symlink(&outside, ws.root().join("link")).unwrap();

        assert!(matches!(
            ws.upload("link/planted.txt", b"x"),
            Err(SandboxError::PathRejected(_))
        ));
        assert!(!outside.join("planted.txt").exists());
        assert!(matches!(
            ws.download("link/secret.txt"),
            Err(SandboxError::PathRejected(_))
        ));
    }

    #[test]
    fn test_download_missing_is_not_found() {
        let (_dir, ws) = workspace();
        assert!(matches!(
            ws.download("missing.txt"),
            Err(SandboxError::FileNotFound(_))
        ));
        fs::create_dir_all(ws.root().join("subdir")).unwrap();
        assert!(matches!(
            ws.download("subdir"),
            Err(SandboxError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_list_is_sorted_and_relative() {
        let (_dir, ws) = workspace();
        ws.upload("b.txt", b"bb").unwrap();
        ws.upload("a/z.txt", b"z").unwrap();
        ws.upload("a.txt", b"a").unwrap();

        let entries = ws.list().unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "a/z.txt", "b.txt"]);
        assert_eq!(entries[2].size, 2);
        assert!(!paths.iter().any(|p| p.contains(".upload-")));
    }

    #[cfg(unix)]
    #[test]
    fn test_list_does_not_follow_symlinks() {
        let (dir, ws) = workspace();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.txt"), b"secret").unwrap();
        std::os::unix::fs::symlink(&outside, ws.root().join("link")).unwrap();
        ws.upload("nested/real.txt", b"r").unwrap();

        let paths: Vec<_> = ws.list().unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["nested/real.txt"]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_dir, ws) = workspace();
        ws.upload("f.txt", b"x").unwrap();
        ws.remove().unwrap();
        ws.remove().unwrap();
        assert!(!ws.root().exists());
        assert!(ws.list().unwrap().is_empty());
    }
}
