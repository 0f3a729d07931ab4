//! Result document emitted by the osbuild engine with `--json`.

use std::collections::BTreeMap;
use std::io;
use std::io::Write;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::value::RawValue;

/// Stage type that carries RPM package metadata.
pub const RPM_STAGE: &str = "org.osbuild.rpm";

/// Top-level osbuild result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsbuildResult {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Box<RawValue>>,
    #[serde(default)]
    pub log: BTreeMap<String, Vec<StageResult>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, BTreeMap<String, Value>>,
    /// Manifest validation errors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationError>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
}

/// Result of a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub output: String,
    /// Absent means the stage succeeded.
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, alias = "string", skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn default_true() -> bool {
    true
}

/// One manifest validation error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub message: String,
    #[serde(default)]
    pub path: Vec<Value>,
}

impl ValidationError {
    /// Dotted path with array indices rendered as `[n]`.
    pub fn path_string(&self) -> String {
        self.path
            .iter()
            .map(|p| match p {
                Value::Number(n) => format!("[{n}]"),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Metadata of the `org.osbuild.rpm` stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpmStageMetadata {
    #[serde(default)]
    pub packages: Vec<RpmPackageMetadata>,
}

/// One installed package as reported by the rpm stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmPackageMetadata {
    pub name: String,
    pub version: String,
    pub release: String,
    #[serde(default)]
    pub epoch: Option<String>,
    pub arch: String,
    #[serde(default)]
    pub sigmd5: String,
    #[serde(default)]
    pub sigpgp: Option<String>,
    #[serde(default)]
    pub siggpg: Option<String>,
}

impl OsbuildResult {
    /// First failed stage across the given pipelines, in the given order.
    pub fn failed_stage<'a>(&'a self, pipelines: impl IntoIterator<Item = &'a str>) -> Option<&'a StageResult> {
        pipelines
            .into_iter()
            .filter_map(|name| self.log.get(name))
            .flat_map(|stages| stages.iter())
            .find(|stage| !stage.success)
    }

    /// First failed stage in any pipeline.
    pub fn any_failed_stage(&self) -> Option<&StageResult> {
        self.log.values().flat_map(|stages| stages.iter()).find(|stage| !stage.success)
    }

    /// RPM packages of one pipeline. Missing or undecodable metadata yields an empty list.
    pub fn rpm_packages(&self, pipeline: &str) -> Vec<RpmPackageMetadata> {
        self.metadata
            .get(pipeline)
            .and_then(|stages| stages.get(RPM_STAGE))
            .and_then(|md| serde_json::from_value::<RpmStageMetadata>(md.clone()).ok())
            .map(|md| md.packages)
            .unwrap_or_default()
    }

    /// RPM packages of several pipelines, concatenated in order.
    pub fn rpm_packages_of<'a>(&self, pipelines: impl IntoIterator<Item = &'a str>) -> Vec<RpmPackageMetadata> {
        pipelines.into_iter().flat_map(|name| self.rpm_packages(name)).collect()
    }

    /// Render the plain-text build log uploaded next to images.
    pub fn write_text<W: Write>(&self, mut w: W) -> io::Result<()> {
        if !self.errors.is_empty() {
            writeln!(w, "Error {}", self.title)?;
            for err in &self.errors {
                writeln!(w, "{}: {}", err.path_string(), err.message)?;
            }
        }

        if self.log.is_empty() {
            writeln!(w, "The compose result is empty.")?;
            return Ok(());
        }

        for (pipeline, stages) in &self.log {
            writeln!(w, "Pipeline: {pipeline}")?;
            let metadata = self.metadata.get(pipeline);
            for stage in stages {
                writeln!(w, "Stage: {}", stage.kind)?;
                writeln!(w, "Output:\n{}", stage.output)?;
                if let Some(md) = metadata.and_then(|m| m.get(&stage.kind)) {
                    writeln!(w, "Metadata:")?;
                    serde_json::to_writer_pretty(&mut w, md)?;
                    writeln!(w)?;
                }
                writeln!(w)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULT: &str = r#"{
        "type": "result",
        "success": false,
        "log": {
            "build": [{"id": "a", "type": "org.osbuild.rpm", "output": "ok"}],
            "os": [
                {"id": "b", "type": "org.osbuild.rpm", "output": "ok", "success": true},
                {"id": "c", "type": "org.osbuild.selinux", "output": "boom", "success": false}
            ]
        },
        "metadata": {
            "build": {"org.osbuild.rpm": {"packages": [
                {"name": "bash", "version": "5.1", "release": "1", "epoch": null, "arch": "x86_64", "sigmd5": "aa"}
            ]}},
            "os": {"org.osbuild.rpm": {"packages": [
                {"name": "vim-minimal", "version": "8.2", "release": "3", "epoch": "2", "arch": "x86_64", "sigmd5": "bb", "siggpg": "gg"}
            ]}}
        }
    }"#;

    #[test]
    fn test_stage_success_defaults_to_true() {
        let result: OsbuildResult = serde_json::from_str(RESULT).unwrap();
        assert!(result.log["build"][0].success);
        assert!(!result.log["os"][1].success);
    }

    #[test]
    fn test_failed_stage_follows_pipeline_order() {
        let result: OsbuildResult = serde_json::from_str(RESULT).unwrap();
        let stage = result.failed_stage(["build", "os"]).unwrap();
        assert_eq!(stage.kind, "org.osbuild.selinux");
        assert!(result.failed_stage(["build"]).is_none());
        assert_eq!(result.any_failed_stage().unwrap().id, "c");
    }

    #[test]
    fn test_rpm_packages() {
        let result: OsbuildResult = serde_json::from_str(RESULT).unwrap();
        let pkgs = result.rpm_packages("os");
        assert_eq!(pkgs.len(), 1);
        assert_eq!(pkgs[0].epoch.as_deref(), Some("2"));
        assert_eq!(pkgs[0].siggpg.as_deref(), Some("gg"));
        assert!(result.rpm_packages("missing").is_empty());
        assert_eq!(result.rpm_packages_of(["build", "os"]).len(), 2);
    }

    #[test]
    fn test_write_text() {
        let result: OsbuildResult = serde_json::from_str(RESULT).unwrap();
        let mut out = Vec::new();
        result.write_text(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Pipeline: build\nStage: org.osbuild.rpm\n"));
        assert!(text.contains("Stage: org.osbuild.selinux\nOutput:\nboom\n"));
        assert!(text.contains("Metadata:\n"));

        let mut out = Vec::new();
        OsbuildResult::default().write_text(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "The compose result is empty.\n");
    }
}
