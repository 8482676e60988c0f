use crate::error::{PatchError, PatchResult};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Cheap structural facts about an uploaded container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApkProbe {
    pub file_bytes: u64,
    pub entries: usize,
    pub dex_files: Vec<String>,
    pub has_manifest: bool,
}

/// Rejects uploads that are not an APK before any tool is started.
pub fn probe_apk(bytes: &[u8], max_bytes: usize) -> PatchResult<ApkProbe> {
    if bytes.is_empty() {
        return Err(PatchError::InvalidInput("empty upload".into()));
    }
    if bytes.len() > max_bytes {
        return Err(PatchError::InvalidInput(format!(
            "upload exceeds {max_bytes} bytes"
        )));
    }
    if !bytes.starts_with(ZIP_MAGIC) {
        return Err(PatchError::InvalidInput("not a zip container".into()));
    }

    let archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| PatchError::InvalidInput(format!("unreadable container: {e}")))?;

    let mut dex_files: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("classes") && name.ends_with(".dex"))
        .map(str::to_string)
        .collect();
    dex_files.sort();
    let has_manifest = archive.file_names().any(|name| name == "AndroidManifest.xml");

    if dex_files.is_empty() {
        return Err(PatchError::InvalidInput("no classes*.dex in container".into()));
    }
    if !has_manifest {
        return Err(PatchError::InvalidInput("no AndroidManifest.xml in container".into()));
    }

    Ok(ApkProbe {
        file_bytes: bytes.len() as u64,
        entries: archive.len(),
        dex_files,
        has_manifest,
    })
}
