//! Write-only experiment tracking.
//!
//! A run is identified by an opaque id. The coordinator creates it on a
//! fresh start, stores it in every checkpoint, and hands it back to the sink
//! on resume so the metric stream continues instead of forking.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::error::{config_error, IoResultExt, TrainResult};

pub const RUN_FILE: &str = "run.json";
pub const METRICS_FILE: &str = "metrics.jsonl";

/// Scalar metric sink.
pub trait MetricsSink {
    /// Start a new run, or continue `resume_id`. Returns the run id.
    fn init_run(&mut self, resume_id: Option<&str>) -> TrainResult<String>;

    fn log(&mut self, step: usize, metrics: &BTreeMap<String, f64>) -> TrainResult<()>;

    fn finish(&mut self) -> TrainResult<()> {
        Ok(())
    }
}

/// Drops every record but still hands out a run id.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn init_run(&mut self, resume_id: Option<&str>) -> TrainResult<String> {
        Ok(resume_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()))
    }

    fn log(&mut self, _step: usize, _metrics: &BTreeMap<String, f64>) -> TrainResult<()> {
        Ok(())
    }
}

/// `run.json` contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub name: Option<String>,
    pub project: String,
    pub created_at: String,
    #[serde(default)]
    pub resumed_at: Vec<String>,
}

#[derive(Serialize)]
struct MetricRecord<'a> {
    step: usize,
    time: String,
    #[serde(flatten)]
    metrics: &'a BTreeMap<String, f64>,
}

/// Appends one JSON object per log call to
/// `<root>/<project>/<run_id>/metrics.jsonl`.
pub struct JsonlMetricsSink {
    project_dir: PathBuf,
    project: String,
    run_name: Option<String>,
    writer: Option<BufWriter<File>>,
}

impl JsonlMetricsSink {
    pub fn new(root: &Path, project: &str, run_name: Option<String>) -> Self {
        Self {
            project_dir: root.join(project),
            project: project.to_string(),
            run_name,
            writer: None,
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.project_dir.join(run_id)
    }

    fn open_stream(&mut self, run_dir: &Path) -> TrainResult<()> {
        let path = run_dir.join(METRICS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_path(&path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn init_run(&mut self, resume_id: Option<&str>) -> TrainResult<String> {
        let now = chrono::Utc::now().to_rfc3339();
        let run_id = match resume_id {
            Some(id) => {
                let run_dir = self.run_dir(id);
                let run_file = run_dir.join(RUN_FILE);
                // Resuming must continue an existing stream, never fork a new one.
                if !run_file.exists() {
                    return Err(config_error(format!(
                        "cannot resume run '{}': {} does not exist",
                        id,
                        run_file.display()
                    )));
                }
                let raw = std::fs::read_to_string(&run_file).with_path(&run_file)?;
                let mut info: RunInfo = serde_json::from_str(&raw)?;
                info.resumed_at.push(now);
                std::fs::write(&run_file, serde_json::to_string_pretty(&info)?).with_path(&run_file)?;
                self.open_stream(&run_dir)?;
                tracing::info!(run_id = id, path = %run_dir.display(), "Resumed metrics run");
                id.to_string()
            }
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                let run_dir = self.run_dir(&id);
                std::fs::create_dir_all(&run_dir).with_path(&run_dir)?;
                let info = RunInfo {
                    run_id: id.clone(),
                    name: self.run_name.clone(),
                    project: self.project.clone(),
                    created_at: now,
                    resumed_at: Vec::new(),
                };
                let run_file = run_dir.join(RUN_FILE);
                std::fs::write(&run_file, serde_json::to_string_pretty(&info)?).with_path(&run_file)?;
                self.open_stream(&run_dir)?;
                tracing::info!(run_id = %id, path = %run_dir.display(), "Started metrics run");
                id
            }
        };
        Ok(run_id)
    }

    fn log(&mut self, step: usize, metrics: &BTreeMap<String, f64>) -> TrainResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| config_error("metrics sink used before init_run"))?;
        let record = MetricRecord {
            step,
            time: chrono::Utc::now().to_rfc3339(),
            metrics,
        };
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> TrainResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Sink selected by `metrics_dir`.
pub fn build_sink(config: &TrainConfig) -> Box<dyn MetricsSink> {
    match &config.metrics_dir {
        Some(root) => Box::new(JsonlMetricsSink::new(
            root,
            &config.project_name,
            config.run_name.clone(),
        )),
        None => Box::new(NullSink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(loss: f64) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("loss".to_string(), loss);
        m.insert("perplexity".to_string(), loss.exp());
        m
    }

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_new_run_then_resume_appends_same_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = JsonlMetricsSink::new(tmp.path(), "proj", Some("demo".to_string()));
        let id = sink.init_run(None).unwrap();
        sink.log(10, &metrics(2.0)).unwrap();
        sink.finish().unwrap();

        let mut resumed = JsonlMetricsSink::new(tmp.path(), "proj", Some("demo".to_string()));
        assert_eq!(resumed.init_run(Some(&id)).unwrap(), id);
        resumed.log(20, &metrics(1.5)).unwrap();
        resumed.finish().unwrap();

        let run_dir = tmp.path().join("proj").join(&id);
        let lines = read_lines(&run_dir.join(METRICS_FILE));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["step"], 10);
        assert_eq!(lines[1]["step"], 20);
        assert_eq!(lines[1]["loss"], 1.5);

        let info: RunInfo =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join(RUN_FILE)).unwrap()).unwrap();
        assert_eq!(info.run_id, id);
        assert_eq!(info.name.as_deref(), Some("demo"));
        assert_eq!(info.resumed_at.len(), 1);
    }

    #[test]
    fn test_resume_unknown_run_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = JsonlMetricsSink::new(tmp.path(), "proj", None);
        assert!(sink.init_run(Some("missing")).is_err());
    }

    #[test]
    fn test_log_before_init_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = JsonlMetricsSink::new(tmp.path(), "proj", None);
        assert!(sink.log(1, &metrics(1.0)).is_err());
    }

    #[test]
    fn test_null_sink_keeps_identity() {
        let mut sink = NullSink;
        assert_eq!(sink.init_run(Some("abc")).unwrap(), "abc");
        let fresh = sink.init_run(None).unwrap();
        assert_eq!(fresh.len(), 32);
        sink.log(1, &metrics(1.0)).unwrap();
    }
}
