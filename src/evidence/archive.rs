//! Zip packing and hardened extraction of evidence bundles.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::CollectionError;
use crate::utils::enclosed_join;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Zip the contents of `dir` into `archive`. Members are stored relative to
/// `dir`, in sorted order. Returns the number of files written.
pub fn pack(dir: &Path, archive: &Path) -> Result<usize, CollectionError> {
    let file = fs::File::create(archive)?;
    let mut zip = ZipWriter::new(file);
    let count = add_directory(&mut zip, dir, dir)?;
    zip.finish()?;
    tracing::debug!("Packed {} files into {}", count, archive.display());
    Ok(count)
}

fn add_directory<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    dir: &Path,
    base: &Path,
) -> Result<usize, CollectionError> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    entries.sort();

    let mut count = 0;
    for path in entries {
        let Ok(name) = path.strip_prefix(base) else {
            continue;
        };
        let name = name.to_string_lossy().replace('\\', "/");
        let meta = fs::symlink_metadata(&path)?;

        if meta.is_file() {
            let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            zip.start_file(name, options)?;
            let mut buffer = Vec::new();
            fs::File::open(&path)?.read_to_end(&mut buffer)?;
            zip.write_all(&buffer)?;
            count += 1;
        } else if meta.is_dir() {
            count += add_directory(zip, &path, base)?;
        }
    }
    Ok(count)
}

/// Directory an archive extracts into: its own name without `.zip`, next to it.
pub fn extraction_dir(archive: &Path) -> Result<PathBuf, CollectionError> {
    let stem = archive
        .file_stem()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CollectionError::Archive(format!("{} has no file name", archive.display())))?;
    Ok(archive.with_file_name(stem))
}

/// Extract `archive` into [`extraction_dir`]. Every member is checked before
/// anything is written; a single unsafe member rejects the whole archive.
pub fn unpack(archive: &Path) -> Result<PathBuf, CollectionError> {
    let dest = extraction_dir(archive)?;
    if dest.exists() {
        return Err(CollectionError::BundleExists(dest.display().to_string()));
    }

    let file = fs::File::open(archive)?;
    let mut zip = ZipArchive::new(file)?;

    let mut plan = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let member = zip.by_index(i)?;
        let name = member.name().to_string();

        let is_symlink = member
            .unix_mode()
            .map(|mode| mode & S_IFMT == S_IFLNK)
            .unwrap_or(false);
        let target = if is_symlink { None } else { enclosed_join(&dest, &name) };

        match target {
            Some(target) => plan.push((i, target, member.is_dir())),
            None => {
                return Err(CollectionError::UnsafeMember {
                    member: name,
                    destination: dest.display().to_string(),
                })
            }
        }
    }

    fs::create_dir(&dest)?;
    if let Err(e) = extract(&mut zip, &plan) {
        fs::remove_dir_all(&dest).ok();
        return Err(e);
    }

    tracing::info!("Extracted {} members into {}", plan.len(), dest.display());
    Ok(dest)
}

fn extract(
    zip: &mut ZipArchive<fs::File>,
    plan: &[(usize, PathBuf, bool)],
) -> Result<(), CollectionError> {
    for (index, target, is_dir) in plan {
        if *is_dir {
            fs::create_dir_all(target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut member = zip.by_index(*index)?;
        let mut out = fs::File::create(target)?;
        std::io::copy(&mut member, &mut out)?;
    }
    Ok(())
}
