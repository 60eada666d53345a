use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use marketplace_core::{AppManifest, ArchiveFormat, MANIFEST_FILE_NAME};
use tar::EntryType;

use crate::receipts::RECEIPT_FILE_NAME;

fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let mut header = [0_u8; 512];
    let read = {
        let mut file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        read_up_to(&mut file, &mut header)
            .with_context(|| format!("failed to read {}", path.display()))?
    };
    let format = ArchiveFormat::sniff(&header[..read])
        .ok_or_else(|| anyhow!("artifact is not a tar or tar.gz archive: {}", path.display()))?;

    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(BufReader::new(file))),
        ArchiveFormat::Tar => Box::new(BufReader::new(file)),
    };
    Ok(tar::Archive::new(reader))
}

fn read_up_to(reader: &mut impl Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = reader.read(&mut buffer[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Walks every entry, rejecting unsafe ones, and returns the parsed root manifest.
pub(crate) fn inspect_archive(path: &Path) -> Result<AppManifest> {
    let mut archive = open_archive(path)?;
    let mut checker = EntryChecker::default();
    let mut manifest = None;
    for entry in archive
        .entries()
        .with_context(|| format!("failed to read archive {}", path.display()))?
    {
        let mut entry = entry.context("failed to read archive entry")?;
        let Some(rel) = checker.check(&entry)? else {
            continue;
        };
        if rel == Path::new(RECEIPT_FILE_NAME) {
            return Err(anyhow!("archive must not contain {RECEIPT_FILE_NAME}"));
        }
        if rel == Path::new(MANIFEST_FILE_NAME) && entry.header().entry_type().is_file() {
            let mut raw = String::new();
            entry
                .read_to_string(&mut raw)
                .context("failed to read app manifest from archive")?;
            manifest = Some(AppManifest::from_toml_str(&raw)?);
        }
    }

    manifest.ok_or_else(|| anyhow!("archive has no root {MANIFEST_FILE_NAME}"))
}

pub(crate) fn unpack_archive(path: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    let mut archive = open_archive(path)?;
    let mut checker = EntryChecker::default();
    for entry in archive
        .entries()
        .with_context(|| format!("failed to read archive {}", path.display()))?
    {
        let mut entry = entry.context("failed to read archive entry")?;
        let Some(rel) = checker.check(&entry)? else {
            continue;
        };
        let unpacked = entry
            .unpack_in(dst)
            .with_context(|| format!("failed to unpack {}", dst.join(&rel).display()))?;
        if !unpacked {
            return Err(anyhow!("archive entry escapes the package: {}", rel.display()));
        }
    }
    Ok(())
}

/// Tracks the symlinks seen so far so that no later entry is written through one.
#[derive(Default)]
struct EntryChecker {
    symlinks: HashSet<PathBuf>,
}

impl EntryChecker {
    fn check<R: Read>(&mut self, entry: &tar::Entry<'_, R>) -> Result<Option<PathBuf>> {
        let raw = entry.path().context("archive entry has an unreadable path")?;
        let Some(rel) = normalized_entry_path(&raw)? else {
            return Ok(None);
        };
        if let Some(link) = self.symlink_on_path(&rel) {
            return Err(anyhow!(
                "archive entry {} passes through symlink {}",
                rel.display(),
                link.display()
            ));
        }

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous | EntryType::Directory => {}
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .context("symlink entry has an unreadable target")?
                    .ok_or_else(|| anyhow!("symlink entry has no target: {}", raw.display()))?;
                ensure_link_stays_inside(&rel, &target)?;
                self.symlinks.insert(rel.clone());
            }
            EntryType::Link => {
                return Err(anyhow!(
                    "hard link entries are not allowed: {}",
                    raw.display()
                ))
            }
            other => {
                return Err(anyhow!(
                    "unsupported archive entry type {other:?}: {}",
                    raw.display()
                ))
            }
        }
        Ok(Some(rel))
    }

    fn symlink_on_path<'a>(&self, rel: &'a Path) -> Option<&'a Path> {
        rel.ancestors()
            .filter(|ancestor| !ancestor.as_os_str().is_empty())
            .find(|ancestor| self.symlinks.contains(*ancestor))
    }
}

fn normalized_entry_path(raw: &Path) -> Result<Option<PathBuf>> {
    let mut normalized = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(anyhow!("archive entry escapes the package: {}", raw.display()))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("archive entry is absolute: {}", raw.display()))
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(normalized))
}

/// `..` is only accepted as a leading run, so the climb happens through real directories of the
/// entry path and every later component descends.
fn ensure_link_stays_inside(entry: &Path, target: &Path) -> Result<()> {
    let outside = || {
        anyhow!(
            "symlink {} points outside the package: {}",
            entry.display(),
            target.display()
        )
    };
    if target.is_absolute() {
        return Err(outside());
    }

    let mut depth = entry.components().count().saturating_sub(1) as isize;
    let mut descended = false;
    for component in target.components() {
        match component {
            Component::Normal(_) => {
                depth += 1;
                descended = true;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if descended {
                    return Err(anyhow!(
                        "symlink {} climbs back out of a descended path: {}",
                        entry.display(),
                        target.display()
                    ));
                }
                depth -= 1;
                if depth < 0 {
                    return Err(outside());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(outside()),
        }
    }
    Ok(())
}
