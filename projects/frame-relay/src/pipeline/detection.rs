use crate::error::DetectionError;
use crate::pipeline::remote::{RemoteConfig, RemoteDetector};
use crate::pipeline::types::Detection;
use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use usls::models::RTDETR;
use usls::{Config, Image};

/// The detection capability: boxes for one frame, in pixel coordinates.
pub trait Detector: Send {
    fn predict(
        &mut self,
        image: &Mat,
        confidence: f32,
        overlap: f32,
    ) -> Result<Vec<Detection>, DetectionError>;
}

/// Builds one detector per worker. Detectors are never shared between threads.
pub trait DetectorFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Detector>>;
}

/// Blanket implementation so any closure with the right signature
/// automatically implements DetectorFactory.
impl<F> DetectorFactory for F
where
    F: Fn() -> Result<Box<dyn Detector>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Detector>> {
        self()
    }
}

#[derive(Debug, Clone)]
pub enum DetectorBackend {
    /// Local RT-DETR model.
    Model { model_path: String },
    /// Hosted inference over HTTP.
    Remote(RemoteConfig),
}

impl DetectorFactory for DetectorBackend {
    fn create(&self) -> Result<Box<dyn Detector>> {
        match self {
            DetectorBackend::Model { model_path } => Ok(Box::new(ModelDetector::new(model_path)?)),
            DetectorBackend::Remote(config) => Ok(Box::new(RemoteDetector::new(config.clone())?)),
        }
    }
}

/// A wrapper around the USLS RT-DETR model that handles BGR-to-RGB conversion
/// and corrects for aspect-ratio padding bugs in the underlying model library.
pub struct ModelDetector {
    model: RTDETR,
}

impl ModelDetector {
    pub fn new(model_path: &str) -> Result<Self> {
        let config = Config::default()
            .with_model_file(model_path)
            .with_class_names(&usls::NAMES_COCO_80);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config.commit()?;
        let model = RTDETR::new(config)?;
        tracing::info!("Loaded RT-DETR model from {}", model_path);
        Ok(Self { model })
    }

    fn detect(&mut self, image: &Mat) -> Result<Vec<Detection>> {
        let dynamic_image = mat_to_dynamic_image(image)?;

        // Correction for the square letterbox RT-DETR assumes
        let size = image.size()?;
        let img_w = size.width as f32;
        let img_h = size.height as f32;
        let (x_correction, y_correction) = if img_w > img_h {
            (img_w / img_h, 1.0)
        } else if img_h > img_w {
            (1.0, img_h / img_w)
        } else {
            (1.0, 1.0)
        };

        let results = self.model.forward(&[Image::from(dynamic_image)])?;
        let Some(y) = results.into_iter().next() else {
            return Ok(Vec::new());
        };

        Ok(y.hbbs
            .into_iter()
            .map(|hbb| {
                let width = hbb.width() * x_correction;
                let height = hbb.height() * y_correction;
                Detection {
                    x: hbb.xmin() * x_correction + width / 2.0,
                    y: hbb.ymin() * y_correction + height / 2.0,
                    width,
                    height,
                    class_label: hbb
                        .name()
                        .map(str::to_string)
                        .or_else(|| hbb.id().map(|id| id.to_string()))
                        .unwrap_or_else(|| "object".to_string()),
                    confidence: hbb.confidence().unwrap_or(0.0),
                }
            })
            .collect())
    }
}

impl Detector for ModelDetector {
    fn predict(
        &mut self,
        image: &Mat,
        confidence: f32,
        overlap: f32,
    ) -> Result<Vec<Detection>, DetectionError> {
        let detections = self
            .detect(image)
            .map_err(|e| DetectionError::Inference(e.to_string()))?;
        let confident = detections
            .into_iter()
            .filter(|d| d.confidence >= confidence)
            .collect();
        Ok(nms(confident, overlap))
    }
}

/// Greedy non-maximum suppression within each class label.
pub fn nms(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    // Sort by confidence (highest first)
    let mut sorted = detections;
    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..sorted.len() {
            if !suppressed[j]
                && sorted[j].class_label == sorted[i].class_label
                && sorted[i].iou(&sorted[j]) > iou_threshold
            {
                suppressed[j] = true;
            }
        }
        keep.push(sorted[i].clone());
    }

    keep
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
pub fn mat_to_dynamic_image(mat: &Mat) -> Result<DynamicImage> {
    let mut rgb_mat = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb_mat, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    let width = size.width as u32;
    let height = size.height as u32;

    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let buffer = rgb_mat.data_bytes()?.to_vec();
    let img_buffer = ImageBuffer::<Rgb<u8>, _>::from_vec(width, height, buffer)
        .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    fn det(x: f32, label: &str, confidence: f32) -> Detection {
        Detection {
            x,
            y: 50.0,
            width: 20.0,
            height: 20.0,
            class_label: label.to_string(),
            confidence,
        }
    }

    #[test]
    fn test_nms_suppresses_overlapping_same_class() {
        let kept = nms(
            vec![
                det(50.0, "player", 0.6),
                det(52.0, "player", 0.9),
                det(200.0, "player", 0.5),
            ],
            0.3,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].x, 200.0);
    }

    #[test]
    fn test_nms_keeps_overlapping_other_class() {
        let kept = nms(vec![det(50.0, "player", 0.9), det(50.0, "ball", 0.8)], 0.3);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_mat_to_dynamic_image_swaps_channels() {
        let mat =
            Mat::new_rows_cols_with_default(4, 6, CV_8UC3, Scalar::new(255.0, 0.0, 10.0, 0.0))
                .unwrap();
        let image = mat_to_dynamic_image(&mat).unwrap().to_rgb8();
        assert_eq!(image.dimensions(), (6, 4));
        assert_eq!(image.get_pixel(0, 0).0, [10, 0, 255]);
    }

    #[test]
    fn test_closure_factory() {
        struct Nothing;
        impl Detector for Nothing {
            fn predict(
                &mut self,
                _: &Mat,
                _: f32,
                _: f32,
            ) -> Result<Vec<Detection>, DetectionError> {
                Ok(Vec::new())
            }
        }

        let factory = || -> Result<Box<dyn Detector>> { Ok(Box::new(Nothing)) };
        let mut detector = factory.create().unwrap();
        let image = Mat::default();
        assert!(detector.predict(&image, 0.4, 0.3).unwrap().is_empty());
    }
}
