mod common;

use apkpatch::config::Injection;
use apkpatch::error::PatchError;
use apkpatch::inject::inject;
use common::{payload, MAIN_ACTIVITY, MANIFEST};
use std::path::Path;

fn write_tree(root: &Path, manifest: &str) {
    let activity = root.join("smali/com/example/app/MainActivity.smali");
    std::fs::create_dir_all(activity.parent().unwrap()).unwrap();
    std::fs::write(&activity, MAIN_ACTIVITY).unwrap();
    std::fs::write(root.join("AndroidManifest.xml"), manifest).unwrap();
}

#[test]
fn auto_entry_resolves_launcher_activity() {
    let tree = tempfile::tempdir().unwrap();
    write_tree(tree.path(), MANIFEST);

    let report = inject(tree.path(), &payload(), &Injection::default()).unwrap();
    assert_eq!(report.entry_class, "Lcom/example/app/MainActivity;");
    assert_eq!(
        report.entry_file,
        Path::new("smali/com/example/app/MainActivity.smali")
    );
    assert!(report.call_inserted);
    assert!(!report.payload_replaced);
    assert!(tree.path().join("smali/com/payload/Init.smali").is_file());
}

#[test]
fn entry_class_in_secondary_dex_root_is_found() {
    let tree = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tree.path().join("smali")).unwrap();
    let activity = tree.path().join("smali_classes2/com/example/app/MainActivity.smali");
    std::fs::create_dir_all(activity.parent().unwrap()).unwrap();
    std::fs::write(&activity, MAIN_ACTIVITY).unwrap();
    std::fs::write(tree.path().join("AndroidManifest.xml"), MANIFEST).unwrap();

    let report = inject(tree.path(), &payload(), &Injection::default()).unwrap();
    assert_eq!(
        report.entry_file,
        Path::new("smali_classes2/com/example/app/MainActivity.smali")
    );
    let patched = std::fs::read_to_string(&activity).unwrap();
    assert!(patched.contains("invoke-static {}, Lcom/payload/Init;->init()V"));
    // The payload always lands in the primary root.
    assert!(tree.path().join("smali/com/payload/Init.smali").is_file());
}

#[test]
fn missing_method_leaves_tree_untouched() {
    let tree = tempfile::tempdir().unwrap();
    write_tree(tree.path(), MANIFEST);
    let cfg = Injection {
        entry_method: "onResume()V".into(),
        ..Injection::default()
    };

    let err = inject(tree.path(), &payload(), &cfg).unwrap_err();
    assert!(matches!(err, PatchError::EntryPointNotFound(_)));
    assert!(!tree.path().join("smali/com/payload").exists());
    let activity =
        std::fs::read_to_string(tree.path().join("smali/com/example/app/MainActivity.smali"))
            .unwrap();
    assert_eq!(activity, MAIN_ACTIVITY);
}

#[test]
fn manifest_without_launcher_is_entry_point_not_found() {
    let tree = tempfile::tempdir().unwrap();
    let manifest = MANIFEST.replace("android.intent.category.LAUNCHER", "android.intent.category.DEFAULT");
    write_tree(tree.path(), &manifest);

    let err = inject(tree.path(), &payload(), &Injection::default()).unwrap_err();
    assert!(matches!(err, PatchError::EntryPointNotFound(_)));
}

#[test]
fn tree_without_smali_root_is_injection_target_missing() {
    let tree = tempfile::tempdir().unwrap();
    std::fs::write(tree.path().join("AndroidManifest.xml"), MANIFEST).unwrap();

    let err = inject(tree.path(), &payload(), &Injection::default()).unwrap_err();
    assert!(matches!(err, PatchError::InjectionTargetMissing(_)));
}

#[test]
fn application_class_is_set_when_configured() {
    let tree = tempfile::tempdir().unwrap();
    write_tree(tree.path(), MANIFEST);
    let cfg = Injection {
        entry_class: "com.example.app.MainActivity".into(),
        set_application_class: "com.payload.App".into(),
        ..Injection::default()
    };

    let report = inject(tree.path(), &payload(), &cfg).unwrap();
    assert_eq!(report.application_class_set, Some(true));
    let manifest = std::fs::read_to_string(tree.path().join("AndroidManifest.xml")).unwrap();
    assert!(manifest.contains(r#"<application android:name="com.payload.App" android:label"#));

    let again = inject(tree.path(), &payload(), &cfg).unwrap();
    assert_eq!(again.application_class_set, Some(false));
    assert!(!again.call_inserted);
}

#[test]
fn unreadable_manifest_is_a_service_error_not_a_missing_entry() {
    let tree = tempfile::tempdir().unwrap();
    write_tree(tree.path(), MANIFEST);
    // A directory in place of the manifest fails the read with something
    // other than NotFound.
    std::fs::remove_file(tree.path().join("AndroidManifest.xml")).unwrap();
    std::fs::create_dir(tree.path().join("AndroidManifest.xml")).unwrap();

    let err = inject(tree.path(), &payload(), &Injection::default()).unwrap_err();
    assert!(matches!(err, PatchError::Io { .. }), "{err}");
}

#[test]
fn main_and_launcher_must_share_one_intent_filter() {
    let tree = tempfile::tempdir().unwrap();
    let manifest = MANIFEST.replace(
        r#"                <category android:name="android.intent.category.LAUNCHER"/>
            </intent-filter>"#,
        r#"            </intent-filter>
            <intent-filter>
                <category android:name="android.intent.category.LAUNCHER"/>
            </intent-filter>"#,
    );
    assert_ne!(manifest, MANIFEST);
    write_tree(tree.path(), &manifest);

    let err = inject(tree.path(), &payload(), &Injection::default()).unwrap_err();
    assert!(matches!(err, PatchError::EntryPointNotFound(_)));
}
