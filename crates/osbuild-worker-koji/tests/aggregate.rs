//! RPM aggregation over a two-pipeline osbuild result.

use osbuild_worker_api::osbuild::OsbuildResult;
use osbuild_worker_koji::rpm;
use serde_json::json;

fn package(name: &str, version: &str, epoch: Option<&str>) -> serde_json::Value {
    json!({
        "name": name,
        "version": version,
        "release": "1.fc40",
        "epoch": epoch,
        "arch": "x86_64",
        "sigmd5": "a1b2",
        "sigpgp": "pgp",
        "siggpg": "gpg",
    })
}

fn result() -> OsbuildResult {
    serde_json::from_value(json!({
        "type": "result",
        "success": true,
        "log": {},
        "metadata": {
            "build": {
                "org.osbuild.rpm": {
                    "packages": [
                        package("python38", "3.8.8", None),
                        package("python38", "3.8.8", None),
                        package("unique", "1.90", None),
                    ]
                }
            },
            "os": {
                "org.osbuild.rpm": {
                    "packages": [
                        package("vim-minimal", "8.0.1763", Some("2")),
                        package("vim-minimal", "8.0.1763", Some("2")),
                        package("dupename", "1", None),
                        package("dupename", "2", None),
                    ]
                }
            }
        }
    }))
    .unwrap()
}

#[test]
fn test_build_and_payload_components_are_deduplicated() {
    let result = result();

    let build = rpm::components(&result, ["build"]);
    let names: Vec<String> = build.iter().map(|r| r.nevra()).collect();
    assert_eq!(names, ["python38-3.8.8-1.fc40.x86_64", "unique-1.90-1.fc40.x86_64"]);

    let payload = rpm::components(&result, ["os"]);
    let names: Vec<String> = payload.iter().map(|r| r.nevra()).collect();
    assert_eq!(names, [
        "vim-minimal-2:8.0.1763-1.fc40.x86_64",
        "dupename-1-1.fc40.x86_64",
        "dupename-2-1.fc40.x86_64",
    ]);
    assert!(payload.iter().all(|r| r.signature.as_deref() == Some("gpg") && r.kind == "rpm"));
}

#[test]
fn test_missing_pipeline_has_no_components() {
    assert!(rpm::components(&result(), ["no-such-pipeline"]).is_empty());
}
