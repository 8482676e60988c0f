//! Zip packing and unpacking for the decompile-only and assemble endpoints.

use crate::error::{PatchError, PatchResult};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Packs every file under `dirs` (stored, no compression), named relative to
/// `base`. Returns the archive and the number of files in it.
pub fn zip_dirs(base: &Path, dirs: &[PathBuf]) -> PatchResult<(Vec<u8>, usize)> {
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let mut count = 0;

    for dir in dirs {
        for file in walk_files(dir)? {
            let rel = file.strip_prefix(base).unwrap_or(&file);
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let body = std::fs::read(&file)
                .map_err(|e| PatchError::io(format!("read {}", file.display()), e))?;
            writer.start_file(name, options).map_err(zip_error)?;
            writer
                .write_all(&body)
                .map_err(|e| PatchError::io("write zip entry", e))?;
            count += 1;
        }
    }

    let bytes = writer.finish().map_err(zip_error)?.into_inner();
    debug!(files = count, bytes = bytes.len(), "packed archive");
    Ok((bytes, count))
}

/// Unpacks an uploaded archive into `dest`. Entries escaping `dest` and
/// unreadable archives are the caller's fault. Returns the files written.
pub fn extract_zip(bytes: &[u8], dest: &Path) -> PatchResult<Vec<PathBuf>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PatchError::InvalidInput(format!("unreadable archive: {e}")))?;
    std::fs::create_dir_all(dest)
        .map_err(|e| PatchError::io(format!("create {}", dest.display()), e))?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| PatchError::InvalidInput(format!("archive entry {i}: {e}")))?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(PatchError::InvalidInput(format!(
                "archive entry escapes its directory: {}",
                entry.name()
            )));
        };
        let target = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| PatchError::io(format!("create {}", target.display()), e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PatchError::io(format!("create {}", parent.display()), e))?;
        }
        let mut body = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        entry
            .read_to_end(&mut body)
            .map_err(|e| PatchError::InvalidInput(format!("archive entry {}: {e}", entry.name())))?;
        std::fs::write(&target, body)
            .map_err(|e| PatchError::io(format!("write {}", target.display()), e))?;
        written.push(target);
    }
    Ok(written)
}

fn walk_files(dir: &Path) -> PatchResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| PatchError::io(format!("read_dir {}", dir.display()), e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(walk_files(&path)?);
        } else {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn zip_error(e: zip::result::ZipError) -> PatchError {
    PatchError::io("zip", std::io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_tree_unpacks_to_the_same_files() {
        let src = tempfile::tempdir().unwrap();
        let smali = src.path().join("smali/com/example");
        std::fs::create_dir_all(&smali).unwrap();
        std::fs::write(smali.join("A.smali"), ".class public Lcom/example/A;\n").unwrap();
        std::fs::write(src.path().join("apktool.yml"), "version: 2").unwrap();

        let (bytes, count) = zip_dirs(src.path(), &[src.path().join("smali")]).unwrap();
        assert_eq!(count, 1);

        let dest = tempfile::tempdir().unwrap();
        let written = extract_zip(&bytes, dest.path()).unwrap();
        assert_eq!(written, vec![dest.path().join("smali/com/example/A.smali")]);
        assert!(!dest.path().join("apktool.yml").exists());
    }

    #[test]
    fn traversal_entries_are_rejected() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("../../etc/evil.smali", FileOptions::default())
            .unwrap();
        writer.write_all(b"x").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let dest = tempfile::tempdir().unwrap();
        let err = extract_zip(&bytes, &dest.path().join("in")).unwrap_err();
        assert!(matches!(err, PatchError::InvalidInput(_)));
    }
}
