use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use marketplace_security::Sha256Stream;
use tokio_util::sync::CancellationToken;

pub(crate) async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn remove_dir_all_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn current_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

pub fn modified_age(path: &Path) -> io::Result<Duration> {
    let modified = fs::symlink_metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}

/// Mirrors `src` into `dst`, preserving symlinks. Checks `cancel` before every entry.
pub(crate) fn copy_tree(src: &Path, dst: &Path, cancel: &CancellationToken) -> Result<u64> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    let mut copied = 0_u64;
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        if cancel.is_cancelled() {
            return Err(anyhow!("copy of {} cancelled", src.display()));
        }
        let entry = entry.with_context(|| format!("failed to read {}", src.display()))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", from.display()))?;

        if file_type.is_dir() {
            copied += copy_tree(&from, &to, cancel)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
            copied += 1;
        } else {
            fs::copy(&from, &to).with_context(|| {
                format!("failed to copy {} to {}", from.display(), to.display())
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target =
        fs::read_link(from).with_context(|| format!("failed to read link {}", from.display()))?;
    std::os::unix::fs::symlink(&target, to)
        .with_context(|| format!("failed to link {} -> {}", to.display(), target.display()))
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)
        .map(|_| ())
        .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDigest {
    pub files: u64,
    pub bytes: u64,
    pub sha256: String,
}

/// Hashes relative paths, entry kinds and contents in sorted order so two trees with the same
/// files produce the same digest regardless of directory iteration order.
pub fn tree_digest(root: &Path, exclude: &[&str]) -> Result<TreeDigest> {
    let mut entries = Vec::new();
    collect_tree_entries(root, root, &mut entries)?;
    entries.sort();

    let mut hasher = Sha256Stream::new();
    let mut files = 0_u64;
    let mut bytes = 0_u64;
    for rel in entries {
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if exclude.iter().any(|excluded| *excluded == rel_str) {
            continue;
        }

        let path = root.join(&rel);
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if metadata.is_dir() {
            hasher.update(format!("d:{rel_str}\n").as_bytes());
            continue;
        }
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&path)
                .with_context(|| format!("failed to read symlink {}", path.display()))?;
            hasher.update(format!("l:{rel_str}->{}\n", target.to_string_lossy()).as_bytes());
            files += 1;
            continue;
        }
        if !metadata.is_file() {
            return Err(anyhow!("unsupported file type in tree: {}", path.display()));
        }

        hasher.update(format!("f:{rel_str}:{}\n", metadata.len()).as_bytes());
        let mut file =
            fs::File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut buffer = [0_u8; 64 * 1024];
        loop {
            let read = file
                .read(&mut buffer)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        files += 1;
        bytes += metadata.len();
    }

    Ok(TreeDigest {
        files,
        bytes,
        sha256: hasher.finalize_hex(),
    })
}

fn collect_tree_entries(root: &Path, current: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in
        fs::read_dir(current).with_context(|| format!("failed to read {}", current.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .with_context(|| format!("failed to relativize {}", path.display()))?
            .to_path_buf();
        let metadata = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        out.push(rel);
        if metadata.is_dir() {
            collect_tree_entries(root, &path, out)?;
        }
    }
    Ok(())
}
