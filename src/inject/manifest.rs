//! Queries and edits against the decoded (text) `AndroidManifest.xml`.

use regex::Regex;
use std::sync::OnceLock;

const ACTION_MAIN: &str = "android.intent.action.MAIN";
const CATEGORY_LAUNCHER: &str = "android.intent.category.LAUNCHER";

fn component_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<(activity-alias|activity)\b([^>]*?)(?:/>|>(.*?)</(?:activity|activity-alias)>)").ok()
    })
    .as_ref()
}

fn intent_filter_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<intent-filter\b[^>]*>(.*?)</intent-filter>").ok())
        .as_ref()
}

/// True when a single `<intent-filter>` carries both MAIN and LAUNCHER.
fn has_launcher_filter(component_body: &str) -> bool {
    let Some(re) = intent_filter_re() else {
        return false;
    };
    re.captures_iter(component_body).any(|c| {
        let filter = &c[1];
        filter.contains(ACTION_MAIN) && filter.contains(CATEGORY_LAUNCHER)
    })
}

fn attr(attrs: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r#"\b{}\s*=\s*"([^"]*)""#, regex::escape(name))).ok()?;
    re.captures(attrs).map(|c| c[1].to_string())
}

/// Package declared on the `<manifest>` element.
pub fn package_name(manifest: &str) -> Option<String> {
    let re = Regex::new(r"(?s)<manifest\b([^>]*)>").ok()?;
    let attrs = re.captures(manifest)?.get(1)?.as_str().to_string();
    attr(&attrs, "package")
}

/// Fully qualified class name of the launcher activity, following
/// `activity-alias` to its target.
pub fn launcher_activity(manifest: &str) -> Option<String> {
    let package = package_name(manifest).unwrap_or_default();
    component_re()?.captures_iter(manifest).find_map(|c| {
        let body = c.get(3).map(|m| m.as_str()).unwrap_or("");
        if !has_launcher_filter(body) {
            return None;
        }
        let attrs = &c[2];
        let name = if &c[1] == "activity-alias" {
            attr(attrs, "android:targetActivity")?
        } else {
            attr(attrs, "android:name")?
        };
        Some(qualify(&package, &name))
    })
}

/// Expands `.Main` / `Main` relative names against the manifest package.
pub fn qualify(package: &str, name: &str) -> String {
    if let Some(rest) = name.strip_prefix('.') {
        format!("{package}.{rest}")
    } else if !name.contains('.') && !package.is_empty() {
        format!("{package}.{name}")
    } else {
        name.to_string()
    }
}

/// `com.example.App` or `Lcom/example/App;` to `Lcom/example/App;`.
pub fn to_descriptor(class: &str) -> String {
    if class.starts_with('L') && class.ends_with(';') {
        class.to_string()
    } else {
        format!("L{};", class.replace('.', "/"))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ApplicationEdit {
    Updated(String),
    AlreadySet(String),
    NoApplication,
}

/// Sets `android:name` on `<application>` unless one is already present.
pub fn set_application_class(manifest: &str, class: &str) -> ApplicationEdit {
    let Ok(re) = Regex::new(r"(?s)<application\b([^>]*)>") else {
        return ApplicationEdit::NoApplication;
    };
    let Some(caps) = re.captures(manifest) else {
        return ApplicationEdit::NoApplication;
    };
    if let Some(existing) = attr(&caps[1], "android:name") {
        return ApplicationEdit::AlreadySet(existing);
    }
    let Some(tag) = caps.get(0) else {
        return ApplicationEdit::NoApplication;
    };
    let insert_at = tag.start() + "<application".len();
    let mut out = String::with_capacity(manifest.len() + class.len() + 16);
    out.push_str(&manifest[..insert_at]);
    out.push_str(&format!(" android:name=\"{class}\""));
    out.push_str(&manifest[insert_at..]);
    ApplicationEdit::Updated(out)
}
