#[test]
fn deepsurf_version_contract() {
    let bin = assert_cmd::cargo::cargo_bin!("deepsurf");
    let out = std::process::Command::new(bin)
        .args(["version"])
        // Keep env-file loading out of this contract.
        .env_remove("DEEPSURF_ENV_FILE")
        .output()
        .expect("run deepsurf version");

    assert!(out.status.success(), "deepsurf version failed");
    let s = String::from_utf8_lossy(&out.stdout);
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse version json");

    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["name"].as_str(), Some("deepsurf"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());

    let text = std::process::Command::new(bin)
        .args(["version", "--output", "text"])
        .output()
        .expect("run deepsurf version --output text");
    assert!(String::from_utf8_lossy(&text.stdout).starts_with("deepsurf "));
}
