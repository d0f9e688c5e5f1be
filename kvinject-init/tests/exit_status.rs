//! Run the real `kvinject-init` binary and check how it reports failure.

use std::process::Command;

#[test]
fn malformed_secret_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("env");
    let output = Command::new(env!("CARGO_BIN_EXE_kvinject-init"))
        .arg("--role=billing")
        .arg("--address=http://127.0.0.1:1")
        .arg("--path")
        .arg(&output_path)
        .arg("--secret=PGPASSWORD:sql/billing")
        .output()
        .expect("could not run kvinject-init");

    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("ERROR: error parsing --secret flags"),
        "unexpected stderr: {}",
        stderr,
    );
    assert!(stderr.contains("caused by:"), "unexpected stderr: {}", stderr);
    assert!(!output_path.exists());
}
