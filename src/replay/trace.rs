use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fs, path::Path};

/// One observation of the visibility source, `at` ms after replay start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub at: u64,
    pub visibility: f64,
    /// Toggles the model's readiness gate before sampling.
    #[serde(default)]
    pub ready: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayTrace {
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub samples: Vec<Sample>,
    /// Keep the model alive until this offset so pending re-checks can run.
    #[serde(default)]
    pub until: Option<u64>,
}

impl ReplayTrace {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read trace from {}", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("Failed to parse trace {}", path.display()))
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let mut trace: ReplayTrace = serde_json::from_str(contents)?;
        trace.samples.sort_by_key(|sample| sample.at);
        Ok(trace)
    }

    /// Offset of the last event the replay has to wait for.
    pub fn end_offset(&self) -> u64 {
        let last_sample = self.samples.last().map_or(0, |sample| sample.at);
        self.until.map_or(last_sample, |until| until.max(last_sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn loads_and_orders_samples() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "spec": {{"totalTimeMin": 1000}},
                "samples": [
                    {{"at": 500, "visibility": 0.6}},
                    {{"at": 0, "visibility": 0.5, "ready": true}}
                ],
                "until": 1500
            }}"#
        )
        .unwrap();

        let trace = ReplayTrace::load(file.path()).unwrap();
        assert_eq!(trace.spec, json!({"totalTimeMin": 1000}));
        assert_eq!(trace.samples[0].at, 0);
        assert_eq!(trace.samples[0].ready, Some(true));
        assert_eq!(trace.samples[1].visibility, 0.6);
        assert_eq!(trace.end_offset(), 1500);
    }

    #[test]
    fn end_offset_defaults_to_last_sample() {
        let trace = ReplayTrace::from_json(r#"{"samples": [{"at": 40, "visibility": 1}]}"#).unwrap();
        assert_eq!(trace.spec, Value::Null);
        assert_eq!(trace.end_offset(), 40);

        let trace = ReplayTrace::from_json(r#"{"samples": [{"at": 40, "visibility": 1}], "until": 10}"#)
            .unwrap();
        assert_eq!(trace.end_offset(), 40);
    }

    #[test]
    fn reports_missing_files_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let err = ReplayTrace::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("missing.json"));
    }
}
