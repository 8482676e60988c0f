use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub injection: Injection,
    #[serde(default)]
    pub signing: Signing,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub debug: Debug,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    /// Applies the `PORT` environment override to the bind address.
    pub fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            let port = port.trim();
            if port.parse::<u16>().is_ok() {
                let host = self
                    .server
                    .bind
                    .rsplit_once(':')
                    .map(|(h, _)| h.to_string())
                    .unwrap_or_else(|| "0.0.0.0".into());
                self.server.bind = format!("{host}:{port}");
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub bind: String,
    pub max_upload_bytes: usize,
    pub output_filename: String,
}
impl Default for Server {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            max_upload_bytes: 100 * 1024 * 1024,
            output_filename: "patched.apk".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    /// Scratch root holding one `apkjob_<id>` directory per running job.
    pub scratch_root: String,
    pub payload_smali: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir().join("apkpatch").display().to_string(),
            payload_smali: "assets/payload/Init.smali".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    pub max_concurrent_jobs: usize,
    /// How long an upload may wait for a free slot; 0 rejects immediately.
    pub queue_wait_seconds: u64,
    pub job_deadline_seconds: u64,
    pub max_diagnostic_bytes: usize,
}
impl Default for Limits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            queue_wait_seconds: 0,
            job_deadline_seconds: 600,
            max_diagnostic_bytes: 8 * 1024,
        }
    }
}

/// External decompile/recompile/assemble tools. Arguments may use `{input}`,
/// `{tree}` and `{output}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transform {
    pub program: String,
    pub decompile_args: Vec<String>,
    pub recompile_args: Vec<String>,
    /// Smali directory (`{tree}`) to a single dex file (`{output}`).
    #[serde(default = "default_assemble_args")]
    pub assemble_args: Vec<String>,
    pub version_args: Vec<String>,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
}
impl Default for Transform {
    fn default() -> Self {
        let jar = "/usr/local/bin/apktool.jar";
        Self {
            program: "java".into(),
            decompile_args: vec![
                "-jar".into(),
                jar.into(),
                "d".into(),
                "-f".into(),
                "-o".into(),
                "{tree}".into(),
                "{input}".into(),
            ],
            recompile_args: vec![
                "-jar".into(),
                jar.into(),
                "b".into(),
                "-o".into(),
                "{output}".into(),
                "{tree}".into(),
            ],
            assemble_args: default_assemble_args(),
            version_args: vec!["-jar".into(), jar.into(), "--version".into()],
            timeout_seconds: 120,
            env: Default::default(),
        }
    }
}

fn default_assemble_args() -> Vec<String> {
    ["-jar", "/usr/local/bin/smali.jar", "a", "{tree}", "-o", "{output}"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Injection {
    /// Entry class descriptor (`Lcom/example/app/MainActivity;`) or `auto`
    /// to use the manifest launcher activity.
    pub entry_class: String,
    pub entry_method: String,
    /// Static no-arg method on the payload class invoked from the entry point.
    pub initializer: String,
    /// Sets `<application android:name>` when the manifest has none. Empty
    /// disables the manifest edit.
    pub set_application_class: String,
}
impl Default for Injection {
    fn default() -> Self {
        Self {
            entry_class: "auto".into(),
            entry_method: "onCreate(Landroid/os/Bundle;)V".into(),
            initializer: "init()V".into(),
            set_application_class: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signing {
    pub zipalign: String,
    pub apksigner: String,
    pub keystore: String,
    pub key_alias: String,
    /// Environment variable holding the keystore password.
    pub password_env: String,
    pub timeout_seconds: u64,
}
impl Default for Signing {
    fn default() -> Self {
        Self {
            zipalign: "zipalign".into(),
            apksigner: "apksigner".into(),
            keystore: "keys/release.keystore".into(),
            key_alias: "apkpatch".into(),
            password_env: "APKPATCH_KS_PASS".into(),
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debug {
    pub log_tool_stderr: bool,
    pub dump_effective_config: bool,
}
impl Default for Debug {
    fn default() -> Self {
        Self {
            log_tool_stderr: true,
            dump_effective_config: false,
        }
    }
}
