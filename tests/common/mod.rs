#![allow(dead_code)]

use apkpatch::config::Config;
use apkpatch::error::{PatchError, PatchResult};
use apkpatch::job::JobStage;
use apkpatch::payload::PayloadAsset;
use apkpatch::pipeline::Pipeline;
use apkpatch::sign::Signer;
use apkpatch::transform::{ToolDiag, Transformer};
use apkpatch::workspace::Workspace;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="no"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.app">
    <application android:label="@string/app_name">
        <activity android:name=".MainActivity" android:exported="true">
            <intent-filter>
                <action android:name="android.intent.action.MAIN"/>
                <category android:name="android.intent.category.LAUNCHER"/>
            </intent-filter>
        </activity>
    </application>
</manifest>
"#;

pub const MAIN_ACTIVITY: &str = r#".class public Lcom/example/app/MainActivity;
.super Landroid/app/Activity;
.source "MainActivity.java"


# direct methods
.method public constructor <init>()V
    .locals 0

    invoke-direct {p0}, Landroid/app/Activity;-><init>()V

    return-void
.end method


# virtual methods
.method protected onCreate(Landroid/os/Bundle;)V
    .locals 1
    .param p1, "savedInstanceState"    # Landroid/os/Bundle;

    invoke-super {p0, p1}, Landroid/app/Activity;->onCreate(Landroid/os/Bundle;)V

    const v0, 0x7f0b001c

    invoke-virtual {p0, v0}, Lcom/example/app/MainActivity;->setContentView(I)V

    return-void
.end method
"#;

pub fn payload() -> Arc<PayloadAsset> {
    let source = include_str!("../../assets/payload/Init.smali").to_string();
    Arc::new(PayloadAsset::from_source(source, "init()V").expect("payload parses"))
}

pub fn test_config(scratch: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.paths.scratch_root = scratch.display().to_string();
    cfg.limits.job_deadline_seconds = 0;
    cfg
}

/// A container the fake tools understand: the files of a decoded tree,
/// plus a `classes.dex` so it passes the upload check.
pub fn sample_apk(extra: &[(&str, &str)]) -> Vec<u8> {
    let mut files = vec![
        ("AndroidManifest.xml", MANIFEST),
        ("smali/com/example/app/MainActivity.smali", MAIN_ACTIVITY),
        ("classes.dex", "dex\n035\0"),
    ];
    files.extend_from_slice(extra);
    zip_files(&files)
}

pub fn zip_files(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in files {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .expect("start file");
        writer.write_all(body.as_bytes()).expect("write file");
    }
    writer.finish().expect("finish zip").into_inner()
}

pub fn read_entry(apk: &[u8], name: &str) -> Option<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(apk)).ok()?;
    let mut file = archive.by_name(name).ok()?;
    let mut out = String::new();
    file.read_to_string(&mut out).ok()?;
    Some(out)
}

/// Unzips the input into the tree and zips the tree back up.
#[derive(Default)]
pub struct ZipTransformer {
    /// Fail decompile with this diagnostic.
    pub reject_with: Option<String>,
    /// Sleep this long in recompile, polling for cancellation.
    pub recompile_delay: Option<Duration>,
}

impl Transformer for ZipTransformer {
    fn doctor(&self) -> ToolDiag {
        ToolDiag {
            name: "transform".into(),
            program: "zip-fake".into(),
            ok: true,
            version: Some("1".into()),
            error: None,
        }
    }

    fn decompile(
        &self,
        input: &Path,
        workspace: &Workspace,
        _cancel: &CancellationToken,
    ) -> PatchResult<PathBuf> {
        if let Some(diag) = &self.reject_with {
            return Err(PatchError::TransformFailed {
                stage: JobStage::Decompiling,
                diagnostics: diag.clone(),
            });
        }
        let bytes = std::fs::read(input).map_err(|e| PatchError::io("read input", e))?;
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| {
            PatchError::TransformFailed {
                stage: JobStage::Decompiling,
                diagnostics: e.to_string(),
            }
        })?;
        let tree = workspace.tree_dir();
        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|e| PatchError::io("zip entry", std::io::Error::other(e)))?;
            let dest = tree.join(file.name());
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| PatchError::io("mkdir", e))?;
            }
            let mut body = Vec::new();
            file.read_to_end(&mut body)
                .map_err(|e| PatchError::io("read entry", e))?;
            std::fs::write(&dest, body).map_err(|e| PatchError::io("write entry", e))?;
        }
        Ok(tree)
    }

    fn recompile(
        &self,
        tree: &Path,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> PatchResult<PathBuf> {
        if let Some(delay) = self.recompile_delay {
            let until = std::time::Instant::now() + delay;
            while std::time::Instant::now() < until {
                if cancel.is_cancelled() {
                    return Err(PatchError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        let mut files = Vec::new();
        collect_files(tree, tree, &mut files);
        files.sort();
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in files {
            writer
                .start_file(name, zip::write::FileOptions::default())
                .map_err(|e| PatchError::io("zip", std::io::Error::other(e)))?;
            writer
                .write_all(&body)
                .map_err(|e| PatchError::io("zip", e))?;
        }
        let bytes = writer
            .finish()
            .map_err(|e| PatchError::io("zip", std::io::Error::other(e)))?
            .into_inner();
        let out = workspace.unsigned_apk();
        std::fs::write(&out, bytes).map_err(|e| PatchError::io("write unsigned", e))?;
        Ok(out)
    }

    /// Writes a dex magic followed by the relative path of every source.
    fn assemble(
        &self,
        smali_dir: &Path,
        workspace: &Workspace,
        _cancel: &CancellationToken,
    ) -> PatchResult<PathBuf> {
        let mut files = Vec::new();
        collect_files(smali_dir, smali_dir, &mut files);
        files.sort();
        let mut dex = b"dex\n035\0".to_vec();
        for (name, _) in files {
            dex.extend_from_slice(name.as_bytes());
            dex.push(b'\n');
        }
        let out = workspace.dex_output();
        std::fs::write(&out, dex).map_err(|e| PatchError::io("write dex", e))?;
        Ok(out)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) {
    for entry in std::fs::read_dir(dir).expect("read_dir").flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else {
            let name = path
                .strip_prefix(root)
                .expect("under root")
                .to_string_lossy()
                .replace('\\', "/");
            out.push((name, std::fs::read(&path).expect("read file")));
        }
    }
}

/// "Signs" by copying the unsigned container to the signed path.
#[derive(Default)]
pub struct CopySigner {
    pub fail: bool,
}

impl Signer for CopySigner {
    fn doctor(&self) -> Vec<ToolDiag> {
        Vec::new()
    }

    fn sign(
        &self,
        unsigned: &Path,
        workspace: &Workspace,
        _cancel: &CancellationToken,
    ) -> PatchResult<PathBuf> {
        if self.fail {
            return Err(PatchError::SigningFailed("keystore was tampered with".into()));
        }
        let signed = workspace.signed_apk();
        std::fs::copy(unsigned, &signed).map_err(|e| PatchError::io("copy", e))?;
        Ok(signed)
    }
}

pub fn fake_pipeline(cfg: &Config) -> Pipeline<ZipTransformer, CopySigner> {
    Pipeline::new(cfg, ZipTransformer::default(), CopySigner::default(), payload())
}

pub fn scratch_entries(root: &Path) -> Vec<String> {
    std::fs::read_dir(root)
        .map(|rd| {
            rd.flatten()
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| n.starts_with(apkpatch::workspace::WORKSPACE_PREFIX))
                .collect()
        })
        .unwrap_or_default()
}
