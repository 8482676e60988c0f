//! Alignment and signature of the recompiled container.

use crate::config::{Config, Signing};
use crate::error::{PatchError, PatchResult};
use crate::process::{run_tool, ToolCommand, ToolError};
use crate::transform::ToolDiag;
use crate::util::{sha256_hex, tail_lossy};
use crate::workspace::Workspace;
use anyhow::{anyhow, Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Child-process variable apksigner reads the password from, so it never
/// appears on a command line.
const PASSWORD_CHILD_ENV: &str = "APKPATCH_KS_PASS";

pub trait Signer: Send + Sync {
    fn doctor(&self) -> Vec<ToolDiag>;
    fn sign(
        &self,
        unsigned: &Path,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> PatchResult<PathBuf>;
}

/// Keystore, alias and password, loaded once at startup.
pub struct SigningCredential {
    keystore: PathBuf,
    alias: String,
    password: SecretString,
    fingerprint: String,
}

impl std::fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCredential")
            .field("keystore", &self.keystore)
            .field("alias", &self.alias)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl SigningCredential {
    pub fn load(cfg: &Signing) -> Result<Self> {
        let password = std::env::var(&cfg.password_env)
            .with_context(|| format!("keystore password env {} not set", cfg.password_env))?;
        Self::new(Path::new(&cfg.keystore), &cfg.key_alias, password)
    }

    pub fn new(keystore: &Path, alias: &str, password: String) -> Result<Self> {
        let bytes = std::fs::read(keystore)
            .with_context(|| format!("reading keystore: {}", keystore.display()))?;
        if bytes.is_empty() {
            return Err(anyhow!("keystore is empty: {}", keystore.display()));
        }
        if alias.trim().is_empty() {
            return Err(anyhow!("signing key alias is empty"));
        }
        if password.is_empty() {
            return Err(anyhow!("keystore password is empty"));
        }
        let keystore = keystore
            .canonicalize()
            .with_context(|| format!("canonicalize keystore: {}", keystore.display()))?;
        Ok(Self {
            keystore,
            alias: alias.to_string(),
            password: SecretString::new(password),
            fingerprint: sha256_hex(&bytes),
        })
    }

    pub fn keystore(&self) -> &Path {
        &self.keystore
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// SHA-256 of the keystore file, safe to log.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// `zipalign` followed by `apksigner sign`.
pub struct ApkSigner {
    cfg: Signing,
    credential: std::sync::Arc<SigningCredential>,
    max_diagnostic_bytes: usize,
}

impl ApkSigner {
    pub fn new(cfg: &Config, credential: std::sync::Arc<SigningCredential>) -> Self {
        Self {
            cfg: cfg.signing.clone(),
            credential,
            max_diagnostic_bytes: cfg.limits.max_diagnostic_bytes,
        }
    }

    fn run(
        &self,
        program: &str,
        args: Vec<String>,
        env: &[(String, String)],
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> PatchResult<()> {
        let cmd = ToolCommand {
            program,
            args: &args,
            cwd: workspace.path(),
            env,
            timeout: Duration::from_secs(self.cfg.timeout_seconds),
        };
        let output = run_tool(&cmd, cancel).map_err(|e| match e {
            ToolError::Cancelled { .. } => PatchError::Cancelled,
            other => PatchError::SigningFailed(other.to_string()),
        })?;
        if !output.status.success() {
            return Err(PatchError::SigningFailed(format!(
                "{program} {}: {}",
                output.status,
                tail_lossy(output.diagnostics(), self.max_diagnostic_bytes)
            )));
        }
        Ok(())
    }
}

impl Signer for ApkSigner {
    fn doctor(&self) -> Vec<ToolDiag> {
        doctor_tools(&self.cfg)
    }

    fn sign(
        &self,
        unsigned: &Path,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> PatchResult<PathBuf> {
        let aligned = workspace.aligned_apk();
        let signed = workspace.signed_apk();

        self.run(
            &self.cfg.zipalign,
            vec![
                "-f".into(),
                "-p".into(),
                "4".into(),
                unsigned.display().to_string(),
                aligned.display().to_string(),
            ],
            &[],
            workspace,
            cancel,
        )?;

        let env = [(
            PASSWORD_CHILD_ENV.to_string(),
            self.credential.password.expose_secret().to_string(),
        )];
        self.run(
            &self.cfg.apksigner,
            vec![
                "sign".into(),
                "--ks".into(),
                self.credential.keystore.display().to_string(),
                "--ks-key-alias".into(),
                self.credential.alias.clone(),
                "--ks-pass".into(),
                format!("env:{PASSWORD_CHILD_ENV}"),
                "--out".into(),
                signed.display().to_string(),
                aligned.display().to_string(),
            ],
            &env,
            workspace,
            cancel,
        )?;

        match std::fs::metadata(&signed) {
            Ok(meta) if meta.len() > 0 => {
                info!(bytes = meta.len(), "signed");
                Ok(signed)
            }
            _ => Err(PatchError::SigningFailed(format!(
                "apksigner produced no output at {}",
                signed.display()
            ))),
        }
    }
}

/// Checks that the alignment and signing tools can be launched.
pub fn doctor_tools(cfg: &Signing) -> Vec<ToolDiag> {
    let cwd = std::env::temp_dir();
    [
        ("zipalign", cfg.zipalign.as_str(), Vec::<String>::new()),
        ("apksigner", cfg.apksigner.as_str(), vec!["--version".to_string()]),
    ]
    .into_iter()
    .map(|(name, program, args)| {
        let cmd = ToolCommand {
            program,
            args: &args,
            cwd: &cwd,
            env: &[],
            timeout: Duration::from_secs(15),
        };
        match run_tool(&cmd, &CancellationToken::new()) {
            // zipalign prints usage and exits non-zero without arguments;
            // getting that far is enough to know it is installed.
            Ok(out) => ToolDiag {
                name: name.into(),
                program: program.into(),
                ok: name == "zipalign" || out.status.success(),
                version: Some(tail_lossy(
                    if out.stdout.is_empty() { &out.stderr } else { &out.stdout },
                    256,
                )),
                error: None,
            },
            Err(e) => ToolDiag {
                name: name.into(),
                program: program.into(),
                ok: false,
                version: None,
                error: Some(e.to_string()),
            },
        }
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_rejects_empty_keystore_and_hides_password() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.keystore");
        std::fs::write(&empty, b"").unwrap();
        assert!(SigningCredential::new(&empty, "k", "pw".into()).is_err());

        let ks = dir.path().join("release.keystore");
        std::fs::write(&ks, b"not really a keystore").unwrap();
        let cred = SigningCredential::new(&ks, "k", "hunter2".into()).unwrap();
        assert_eq!(cred.fingerprint().len(), 64);
        assert!(!format!("{cred:?}").contains("hunter2"));
        assert!(SigningCredential::new(&ks, "k", String::new()).is_err());
    }
}
