//! The payload class injected into every APK.
//!
//! Loaded once at startup and shared read-only across jobs. Its identity
//! (class descriptor, file location inside the tree) comes from the payload's
//! own `.class` directive, never from the APK being patched.

use crate::util::sha256_hex;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct PayloadAsset {
    source: String,
    class_descriptor: String,
    initializer: String,
    sha256: String,
}

impl PayloadAsset {
    pub fn load(path: &Path, initializer: &str) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading payload: {}", path.display()))?;
        Self::from_source(source, initializer)
            .with_context(|| format!("invalid payload: {}", path.display()))
    }

    pub fn from_source(source: String, initializer: &str) -> Result<Self> {
        let class_descriptor = parse_class_descriptor(&source)
            .ok_or_else(|| anyhow!("no .class directive found"))?;

        let (name, rest) = initializer
            .split_once('(')
            .ok_or_else(|| anyhow!("initializer is not a method signature: {initializer}"))?;
        if !rest.starts_with(')') {
            return Err(anyhow!("initializer must take no arguments: {initializer}"));
        }
        if !declares_static_method(&source, initializer) {
            return Err(anyhow!(
                "payload {class_descriptor} declares no static method {initializer}"
            ));
        }
        if name.is_empty() {
            return Err(anyhow!("initializer has no name"));
        }

        let sha256 = sha256_hex(source.as_bytes());
        Ok(Self {
            source,
            class_descriptor,
            initializer: initializer.to_string(),
            sha256,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn class_descriptor(&self) -> &str {
        &self.class_descriptor
    }

    pub fn internal_name(&self) -> &str {
        self.class_descriptor
            .trim_start_matches('L')
            .trim_end_matches(';')
    }

    pub fn relative_path(&self) -> PathBuf {
        let mut path: PathBuf = self.internal_name().split('/').collect();
        path.set_extension("smali");
        path
    }

    pub fn call_target(&self) -> String {
        format!("{}->{}", self.class_descriptor, self.initializer)
    }

    pub fn invoke_statement(&self) -> String {
        format!("invoke-static {{}}, {}", self.call_target())
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }
}

/// Descriptor from the `.class` directive (`.class public final Lx/y/Z;`).
pub fn parse_class_descriptor(source: &str) -> Option<String> {
    let re = Regex::new(r"(?m)^\s*\.class\s+(?:[\w-]+\s+)*(L[^;\s]+;)\s*$").ok()?;
    re.captures(source).map(|c| c[1].to_string())
}

fn declares_static_method(source: &str, signature: &str) -> bool {
    source.lines().any(|line| {
        let line = line.trim();
        let Some(rest) = line.strip_prefix(".method ") else {
            return false;
        };
        let mut words: Vec<&str> = rest.split_whitespace().collect();
        words.pop() == Some(signature) && words.contains(&"static")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = include_str!("../assets/payload/Init.smali");

    #[test]
    fn bundled_payload_parses() {
        let p = PayloadAsset::from_source(PAYLOAD.to_string(), "init()V").unwrap();
        assert_eq!(p.class_descriptor(), "Lcom/payload/Init;");
        assert_eq!(p.relative_path(), PathBuf::from("com/payload/Init.smali"));
        assert_eq!(
            p.invoke_statement(),
            "invoke-static {}, Lcom/payload/Init;->init()V"
        );
    }

    #[test]
    fn rejects_missing_or_non_static_initializer() {
        let err = PayloadAsset::from_source(PAYLOAD.to_string(), "boot()V").unwrap_err();
        assert!(err.to_string().contains("boot()V"));

        let src = ".class public Lx/Y;\n.super Ljava/lang/Object;\n.method public init()V\n.end method\n";
        assert!(PayloadAsset::from_source(src.to_string(), "init()V").is_err());
        assert!(PayloadAsset::from_source(src.to_string(), "init(I)V").is_err());
    }
}
