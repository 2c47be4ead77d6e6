// Overlay drawing: labeled boxes burned into a copy of the frame

use crate::pipeline::types::Detection;
use opencv::core::{Mat, Point, Rect, Scalar, Vec3b, CV_8UC3};
use opencv::imgproc;
use opencv::prelude::*;
use serde::Serialize;

const BOX_THICKNESS: i32 = 2;
const FONT_SCALE: f64 = 0.5;
const LABEL_OFFSET: i32 = 10;

/// How box colors are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    /// Fixed color per class label.
    #[default]
    Class,
    /// Dominant color sampled from inside the box.
    Dominant,
}

fn bgr(b: f64, g: f64, r: f64) -> Scalar {
    Scalar::new(b, g, r, 0.0)
}

/// Fixed palette for the known classes; other labels get a stable color
/// derived from the label text.
pub fn class_color(label: &str) -> Scalar {
    match label {
        "player" => bgr(0.0, 255.0, 0.0),
        "goalkeeper" => bgr(255.0, 0.0, 0.0),
        "referee" => bgr(0.0, 0.0, 255.0),
        "ball" => bgr(255.0, 255.0, 0.0),
        other => {
            // FNV-1a, so the color does not depend on the process
            let mut hash: u32 = 0x811c_9dc5;
            for byte in other.bytes() {
                hash ^= byte as u32;
                hash = hash.wrapping_mul(0x0100_0193);
            }
            bgr(
                (64 + (hash & 0xbf)) as f64,
                (64 + ((hash >> 8) & 0xbf)) as f64,
                (64 + ((hash >> 16) & 0xbf)) as f64,
            )
        }
    }
}

pub fn named_color(name: &str) -> Scalar {
    match name {
        "red" => bgr(0.0, 0.0, 255.0),
        "green" => bgr(0.0, 255.0, 0.0),
        "blue" => bgr(255.0, 0.0, 0.0),
        "black" => bgr(0.0, 0.0, 0.0),
        "white" => bgr(255.0, 255.0, 255.0),
        _ => bgr(128.0, 128.0, 128.0),
    }
}

/// Classify an HSV pixel (OpenCV 8-bit ranges, hue in 0..180).
pub fn classify_hsv(hue: u8, saturation: u8, value: u8) -> &'static str {
    if saturation < 50 {
        if value < 64 {
            "black"
        } else if value > 192 {
            "white"
        } else {
            "gray"
        }
    } else if !(30..=150).contains(&hue) {
        "red"
    } else if hue < 90 {
        "green"
    } else {
        "blue"
    }
}

fn clamp_to_image(rect: Rect, image: &Mat) -> Option<Rect> {
    let x1 = rect.x.clamp(0, image.cols());
    let y1 = rect.y.clamp(0, image.rows());
    let x2 = rect.x.saturating_add(rect.width).clamp(0, image.cols());
    let y2 = rect.y.saturating_add(rect.height).clamp(0, image.rows());
    (x2 > x1 && y2 > y1).then(|| Rect::new(x1, y1, x2 - x1, y2 - y1))
}

/// Name of the dominant color inside `rect`, from the mean BGR of the region.
pub fn dominant_color(image: &Mat, rect: Rect) -> opencv::Result<&'static str> {
    let Some(rect) = clamp_to_image(rect, image) else {
        return Ok("gray");
    };

    // Copy so the region is continuous
    let roi = Mat::roi(image, rect)?.try_clone()?;
    let bytes = roi.data_bytes()?;
    let pixels = (bytes.len() / 3).max(1) as f64;
    let mut sums = [0f64; 3];
    for px in bytes.chunks_exact(3) {
        sums[0] += px[0] as f64;
        sums[1] += px[1] as f64;
        sums[2] += px[2] as f64;
    }

    let mean = Mat::new_rows_cols_with_default(
        1,
        1,
        CV_8UC3,
        bgr(
            (sums[0] / pixels).round(),
            (sums[1] / pixels).round(),
            (sums[2] / pixels).round(),
        ),
    )?;
    let mut hsv = Mat::default();
    imgproc::cvt_color_def(&mean, &mut hsv, imgproc::COLOR_BGR2HSV)?;
    let px = *hsv.at_2d::<Vec3b>(0, 0)?;
    Ok(classify_hsv(px[0], px[1], px[2]))
}

/// Draw every detection at or above `confidence` onto a fresh copy of `image`.
/// Returns the annotated copy and the number of boxes drawn.
pub fn annotate(
    image: &Mat,
    detections: &[Detection],
    confidence: f32,
    mode: ColorMode,
) -> opencv::Result<(Mat, usize)> {
    let mut canvas = image.try_clone()?;
    let mut drawn = 0;

    for detection in detections.iter().filter(|d| d.confidence >= confidence) {
        let rect = detection.rect();
        let (color, label) = match mode {
            ColorMode::Class => (
                class_color(&detection.class_label),
                format!("{} {:.2}", detection.class_label, detection.confidence),
            ),
            // Sampled from the original, not from boxes drawn earlier
            ColorMode::Dominant => {
                let name = dominant_color(image, rect)?;
                (
                    named_color(name),
                    format!("{} {:.2}", name, detection.confidence),
                )
            }
        };

        imgproc::rectangle_points(
            &mut canvas,
            Point::new(rect.x, rect.y),
            Point::new(
                rect.x.saturating_add(rect.width),
                rect.y.saturating_add(rect.height),
            ),
            color,
            BOX_THICKNESS,
            imgproc::LINE_8,
            0,
        )?;
        imgproc::put_text(
            &mut canvas,
            &label,
            Point::new(rect.x, rect.y.saturating_sub(LABEL_OFFSET)),
            imgproc::FONT_HERSHEY_SIMPLEX,
            FONT_SCALE,
            color,
            BOX_THICKNESS,
            imgproc::LINE_8,
            false,
        )?;
        drawn += 1;
    }

    Ok((canvas, drawn))
}
