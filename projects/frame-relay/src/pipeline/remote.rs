// Hosted object detection over HTTP
//
// The frame is posted as a JPEG multipart `file`; thresholds travel as integer
// percentages in the query string next to the API key.

use crate::error::DetectionError;
use crate::pipeline::detection::Detector;
use crate::pipeline::types::Detection;
use anyhow::Result;
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use reqwest::blocking::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Full model URL, e.g. `https://detect.example.com/football-players/3`.
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    class: String,
    confidence: f32,
}

pub struct RemoteDetector {
    client: reqwest::blocking::Client,
    config: RemoteConfig,
}

impl RemoteDetector {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

fn percent(value: f32) -> String {
    ((value * 100.0).round() as u32).to_string()
}

impl Detector for RemoteDetector {
    fn predict(
        &mut self,
        image: &Mat,
        confidence: f32,
        overlap: f32,
    ) -> Result<Vec<Detection>, DetectionError> {
        let mut jpeg = Vector::<u8>::new();
        imgcodecs::imencode(".jpg", image, &mut jpeg, &Vector::new())
            .map_err(|e| DetectionError::Transport(format!("JPEG encoding failed: {}", e)))?;

        let part = Part::bytes(jpeg.to_vec())
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| DetectionError::Transport(e.to_string()))?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(&self.config.endpoint)
            .query(&[
                ("api_key", self.config.api_key.clone()),
                ("confidence", percent(confidence)),
                ("overlap", percent(overlap)),
            ])
            .multipart(form)
            .send()
            .map_err(|e| DetectionError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DetectionError::Status(status.as_u16()));
        }

        let body: PredictionResponse = response
            .json()
            .map_err(|e| DetectionError::Decode(e.to_string()))?;

        Ok(body
            .predictions
            .into_iter()
            .filter(|p| p.confidence >= confidence)
            .map(|p| Detection {
                x: p.x,
                y: p.y,
                width: p.width,
                height: p.height,
                class_label: p.class,
                confidence: p.confidence,
            })
            .collect())
    }
}
