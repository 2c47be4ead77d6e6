use opencv::core::{Mat, Rect};
use serde::{Deserialize, Serialize};

/// The atomic work item: one decoded frame and its position in the video.
pub struct FrameUnit {
    pub sequence_number: u64,
    pub image: Mat,
}

/// Output of one worker invocation on one frame unit.
pub struct AnnotationResult {
    pub sequence_number: u64,
    pub image: Mat,
    pub detections_drawn: usize,
}

/// Corner coordinates are clamped to this magnitude before conversion to pixels.
const COORD_LIMIT: f32 = 1_000_000.0;

/// A detected object in pixel coordinates. `x`/`y` are the box center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub class_label: String,
    pub confidence: f32,
}

impl Detection {
    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.width, self.height, self.confidence]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Top-left anchored rectangle, not clipped to any image. Corners are
    /// bounded so the rectangle's edges always fit in `i32`.
    pub fn rect(&self) -> Rect {
        let corner = |v: f32| v.clamp(-COORD_LIMIT, COORD_LIMIT) as i32;
        let x1 = corner(self.x - self.width / 2.0);
        let y1 = corner(self.y - self.height / 2.0);
        let x2 = corner(self.x + self.width / 2.0);
        let y2 = corner(self.y + self.height / 2.0);
        Rect::new(x1, y1, (x2 - x1).max(1), (y2 - y1).max(1))
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let (ax1, ay1) = (self.x - self.width / 2.0, self.y - self.height / 2.0);
        let (bx1, by1) = (other.x - other.width / 2.0, other.y - other.height / 2.0);
        let x1 = ax1.max(bx1);
        let y1 = ay1.max(by1);
        let x2 = (ax1 + self.width).min(bx1 + other.width);
        let y2 = (ay1 + self.height).min(by1 + other.height);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.width * self.height + other.width * other.height - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// A frame that was dropped from the run, as reported by a worker.
#[derive(Debug, Clone, Serialize)]
pub struct FrameFailure {
    pub sequence_number: Option<u64>,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection {
            x,
            y,
            width: w,
            height: h,
            class_label: "player".to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn test_rect_from_center_box() {
        let r = det(50.0, 40.0, 20.0, 10.0).rect();
        assert_eq!((r.x, r.y, r.width, r.height), (40, 35, 20, 10));
    }

    #[test]
    fn test_rect_of_huge_boxes_stays_bounded() {
        let wide = det(0.0, 0.0, 1e10, 10.0).rect();
        assert_eq!(wide.x, -1_000_000);
        assert_eq!(wide.width, 2_000_000);
        assert!(wide.x.checked_add(wide.width).is_some());

        let far = det(3e9, 5.0, 10.0, 10.0).rect();
        assert_eq!(far.x, 1_000_000);
        assert_eq!(far.width, 1);
        assert!(far.x.checked_add(far.width).is_some());

        // Inverted boxes still get a positive size
        let inverted = det(10.0, 10.0, -50.0, -50.0).rect();
        assert_eq!((inverted.width, inverted.height), (1, 1));
    }

    #[test]
    fn test_non_finite_detection() {
        assert!(det(1.0, 2.0, 3.0, 4.0).is_finite());
        assert!(!det(f32::NAN, 2.0, 3.0, 4.0).is_finite());
        assert!(!det(1.0, 2.0, f32::INFINITY, 4.0).is_finite());
    }

    #[test]
    fn test_iou() {
        let a = det(10.0, 10.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);

        let disjoint = det(100.0, 100.0, 10.0, 10.0);
        assert_eq!(a.iou(&disjoint), 0.0);

        // Half overlap along x: intersection 50, union 150
        let shifted = det(15.0, 10.0, 10.0, 10.0);
        assert!((a.iou(&shifted) - 1.0 / 3.0).abs() < 1e-6);
    }
}
