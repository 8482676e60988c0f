//! Writes the payload class into a decompiled tree and wires it into the
//! application's entry point.
//!
//! All checks run before the first write, and each write goes through a
//! temp-file + rename, so the recompiler never sees a half-written class.

pub mod manifest;
pub mod smali;

use crate::config::Injection;
use crate::error::{PatchError, PatchResult};
use crate::payload::PayloadAsset;
use crate::util::write_atomic;
use serde::Serialize;
use smali::{InsertError, Insertion};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const PRIMARY_SMALI_ROOT: &str = "smali";
const MANIFEST_FILE: &str = "AndroidManifest.xml";

#[derive(Debug, Clone, Serialize)]
pub struct InjectionReport {
    /// Payload location relative to the tree root.
    pub payload_path: PathBuf,
    /// An earlier injection had already placed the payload.
    pub payload_replaced: bool,
    pub entry_class: String,
    pub entry_file: PathBuf,
    /// False when the entry method already called the payload.
    pub call_inserted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_class_set: Option<bool>,
}

/// Injects `payload` into the tree rooted at `tree`.
pub fn inject(tree: &Path, payload: &PayloadAsset, cfg: &Injection) -> PatchResult<InjectionReport> {
    let smali_root = tree.join(PRIMARY_SMALI_ROOT);
    if !smali_root.is_dir() {
        return Err(PatchError::InjectionTargetMissing(format!(
            "no {PRIMARY_SMALI_ROOT}/ directory under {}",
            tree.display()
        )));
    }

    let manifest_path = tree.join(MANIFEST_FILE);
    let manifest = match std::fs::read_to_string(&manifest_path) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(PatchError::io(format!("read {}", manifest_path.display()), e)),
    };

    let entry_class = resolve_entry_class(&cfg.entry_class, manifest.as_deref())?;
    let entry_file = find_class_file(tree, &entry_class)?
        .ok_or_else(|| PatchError::EntryPointNotFound(format!("class {entry_class} not in tree")))?;

    let entry_source = std::fs::read_to_string(&entry_file)
        .map_err(|e| PatchError::io(format!("read {}", entry_file.display()), e))?;
    let call_target = payload.call_target();
    let insertion = smali::insert_first_instruction(
        &entry_source,
        &cfg.entry_method,
        &payload.invoke_statement(),
        &call_target,
    )
    .map_err(|e| match e {
        InsertError::MethodNotFound => PatchError::EntryPointNotFound(format!(
            "{entry_class} has no method {}",
            cfg.entry_method
        )),
        InsertError::NoBody => PatchError::EntryPointNotFound(format!(
            "{entry_class}->{} has no code",
            cfg.entry_method
        )),
    })?;

    let manifest_edit = match (&manifest, cfg.set_application_class.trim()) {
        (_, "") => None,
        (None, _) => {
            return Err(PatchError::InjectionTargetMissing(format!(
                "{MANIFEST_FILE} missing from tree"
            )));
        }
        (Some(text), class) => Some(manifest::set_application_class(text, class)),
    };

    // Checks done; start writing.
    let payload_rel = payload.relative_path();
    let payload_path = smali_root.join(&payload_rel);
    if let Some(dir) = payload_path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| PatchError::io(format!("create {}", dir.display()), e))?;
    }
    let payload_replaced = payload_path.exists();
    write_atomic(&payload_path, payload.source().as_bytes())
        .map_err(|e| PatchError::io(format!("write {}", payload_path.display()), e))?;
    info!(path = %payload_path.display(), replaced = payload_replaced, "payload written");

    let call_inserted = match insertion {
        Insertion::Inserted(patched) => {
            write_atomic(&entry_file, patched.as_bytes())
                .map_err(|e| PatchError::io(format!("write {}", entry_file.display()), e))?;
            info!(class = %entry_class, method = %cfg.entry_method, "entry point patched");
            true
        }
        Insertion::AlreadyPresent => {
            info!(class = %entry_class, "entry point already calls payload");
            false
        }
    };

    let application_class_set = match manifest_edit {
        None => None,
        Some(manifest::ApplicationEdit::Updated(text)) => {
            write_atomic(&manifest_path, text.as_bytes())
                .map_err(|e| PatchError::io(format!("write {}", manifest_path.display()), e))?;
            Some(true)
        }
        Some(manifest::ApplicationEdit::AlreadySet(existing)) => {
            if existing != cfg.set_application_class.trim() {
                warn!(existing = %existing, "application class already set; left unchanged");
            }
            Some(false)
        }
        Some(manifest::ApplicationEdit::NoApplication) => {
            warn!("manifest has no <application> element");
            Some(false)
        }
    };

    Ok(InjectionReport {
        payload_path: Path::new(PRIMARY_SMALI_ROOT).join(payload_rel),
        payload_replaced,
        entry_class,
        entry_file: entry_file
            .strip_prefix(tree)
            .map(Path::to_path_buf)
            .unwrap_or(entry_file.clone()),
        call_inserted,
        application_class_set,
    })
}

fn resolve_entry_class(configured: &str, manifest: Option<&str>) -> PatchResult<String> {
    let configured = configured.trim();
    if !configured.is_empty() && !configured.eq_ignore_ascii_case("auto") {
        return Ok(manifest::to_descriptor(configured));
    }
    let manifest = manifest.ok_or_else(|| {
        PatchError::EntryPointNotFound(format!("no {MANIFEST_FILE} to resolve launcher activity"))
    })?;
    let class = manifest::launcher_activity(manifest).ok_or_else(|| {
        PatchError::EntryPointNotFound("manifest declares no launcher activity".into())
    })?;
    Ok(manifest::to_descriptor(&class))
}

fn find_class_file(tree: &Path, descriptor: &str) -> PatchResult<Option<PathBuf>> {
    let internal = descriptor.trim_start_matches('L').trim_end_matches(';');
    let mut rel: PathBuf = internal.split('/').collect();
    rel.set_extension("smali");

    Ok(smali_roots(tree)?
        .into_iter()
        .map(|root| root.join(&rel))
        .find(|candidate| candidate.is_file()))
}

/// Every `smali*` root of a decoded tree (one per dex), primary root first.
pub fn smali_roots(tree: &Path) -> PatchResult<Vec<PathBuf>> {
    let mut roots: Vec<PathBuf> = std::fs::read_dir(tree)
        .map_err(|e| PatchError::io(format!("read_dir {}", tree.display()), e))?
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name == PRIMARY_SMALI_ROOT || name.starts_with("smali_")
        })
        .map(|e| e.path())
        .collect();
    roots.sort_by_key(|p| (p.file_name().map(|n| n != PRIMARY_SMALI_ROOT), p.clone()));
    Ok(roots)
}
