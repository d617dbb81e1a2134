//! Face detection collaborator contract.
//!
//! Detection internals (SCRFD or equivalent) live outside this crate; the
//! engine consumes detections through [`FaceDetector`] and only relies on
//! the bounding box, the three landmark points, and the confidence score.

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector inference failed: {0}")]
    Inference(String),
}

/// Face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Minimal landmark set: eye centres and nose tip, in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmarks {
    pub left_eye: (f32, f32),
    pub right_eye: (f32, f32),
    pub nose: (f32, f32),
}

impl Landmarks {
    /// Midpoint between the two eye centres.
    pub fn eye_midpoint(&self) -> (f32, f32) {
        (
            (self.left_eye.0 + self.right_eye.0) / 2.0,
            (self.left_eye.1 + self.right_eye.1) / 2.0,
        )
    }
}

/// One detected face in a frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub landmarks: Option<Landmarks>,
    pub confidence: f32,
}

/// External face detector capability.
pub trait FaceDetector: Send {
    /// Detect faces in an RGB frame. An empty vector means no face; that is
    /// a normal outcome, not an error.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// Crop the face region from a frame, clamping the box to frame bounds.
/// Returns `None` when the clamped region is empty.
pub fn crop_face(frame: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let x = bbox.x.min(frame.width());
    let y = bbox.y.min(frame.height());
    let w = bbox.width.min(frame.width() - x);
    let h = bbox.height.min(frame.height() - y);
    if w == 0 || h == 0 {
        return None;
    }
    Some(image::imageops::crop_imm(frame, x, y, w, h).to_image())
}
