use crate::error::ConfigError;
use crate::pipeline::annotate::ColorMode;
use crate::pipeline::detection::DetectorBackend;
use crate::pipeline::detection_worker::WorkerSettings;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_WORKERS: usize = 3;
pub const DEFAULT_OUTPUT_FPS: f64 = 30.0;
pub const DEFAULT_CONFIDENCE: f32 = 0.4;
pub const DEFAULT_OVERLAP: f32 = 0.3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Everything a `Pipeline` needs, resolved from CLI flags and environment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory backing the durable work queue.
    pub queue_dir: PathBuf,
    /// Root of the per-run frame store directories.
    pub store_root: PathBuf,
    /// Where the reassembled video is written.
    pub output_path: PathBuf,
    pub workers: usize,
    pub output_fps: f64,
    pub confidence: f32,
    pub overlap: f32,
    pub color_mode: ColorMode,
    /// Fixed delay between retries of queue and detector connections.
    pub retry_delay: Duration,
    pub poll_interval: Duration,
    pub backend: DetectorBackend,
}

impl PipelineConfig {
    /// Defaults with every path under `root`.
    pub fn with_root(root: &Path) -> Self {
        Self {
            queue_dir: root.join("queue"),
            store_root: root.join("frames"),
            output_path: root.join("output").join("processed_video.mp4"),
            workers: DEFAULT_WORKERS,
            output_fps: DEFAULT_OUTPUT_FPS,
            confidence: DEFAULT_CONFIDENCE,
            overlap: DEFAULT_OVERLAP,
            color_mode: ColorMode::Class,
            retry_delay: DEFAULT_RETRY_DELAY,
            poll_interval: Duration::from_millis(500),
            backend: DetectorBackend::Model {
                model_path: "models/rtdetr.onnx".to_string(),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if !(self.output_fps.is_finite() && self.output_fps > 0.0) {
            return Err(ConfigError::InvalidFps(self.output_fps));
        }
        for (name, value) in [("confidence", self.confidence), ("overlap", self.overlap)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        match &self.backend {
            DetectorBackend::Model { model_path } if model_path.is_empty() => {
                Err(ConfigError::Missing("model path"))
            }
            DetectorBackend::Remote(remote) if remote.endpoint.is_empty() => {
                Err(ConfigError::Missing("remote endpoint"))
            }
            DetectorBackend::Remote(remote) if remote.api_key.is_empty() => {
                Err(ConfigError::Missing("API key"))
            }
            _ => Ok(()),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            confidence: self.confidence,
            overlap: self.overlap,
            color_mode: self.color_mode,
            retry_delay: self.retry_delay,
            poll_interval: self.poll_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::remote::RemoteConfig;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::with_root(Path::new("/tmp/relay"));
        config.validate().unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.output_fps, 30.0);
        assert_eq!(config.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_bad_values() {
        let base = PipelineConfig::with_root(Path::new("/tmp/relay"));

        let mut c = base.clone();
        c.workers = 0;
        assert!(matches!(c.validate(), Err(ConfigError::NoWorkers)));

        let mut c = base.clone();
        c.output_fps = 0.0;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidFps(_))));

        let mut c = base.clone();
        c.overlap = 1.5;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::InvalidThreshold {
                name: "overlap",
                ..
            })
        ));

        let mut c = base;
        c.backend = DetectorBackend::Remote(RemoteConfig {
            endpoint: "https://detect.example.com/model/1".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
        });
        assert!(matches!(c.validate(), Err(ConfigError::Missing("API key"))));
    }
}
