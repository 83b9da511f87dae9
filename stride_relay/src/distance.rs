use crate::{calibration::CalibrationCache, inference::BoundingBox};

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    pub bounding_box: BoundingBox,
    pub distance_meters: f64,
}

/// Monocular pinhole-camera range estimate from a per-class average height.
#[derive(Debug, Clone, Copy)]
pub struct DistanceEstimator {
    focal_length: f64,
}

impl DistanceEstimator {
    pub fn new(focal_length: f64) -> Self {
        Self { focal_length }
    }

    pub fn focal_length(&self) -> f64 {
        self.focal_length
    }

    pub fn distance(&self, real_height_meters: f64, perceived_pixel_height: i32) -> f64 {
        if perceived_pixel_height <= 0 {
            return 0.0;
        }
        (real_height_meters * self.focal_length) / f64::from(perceived_pixel_height)
    }

    /// Output is index-aligned with `detections`.
    pub fn estimate(
        &self,
        calibration: &CalibrationCache,
        detections: Vec<BoundingBox>,
    ) -> Vec<DetectedObject> {
        detections
            .into_iter()
            .map(|bounding_box| {
                let real_height = calibration.height_for(&bounding_box.class_name);
                let distance_meters = self.distance(real_height, bounding_box.height);
                DetectedObject {
                    bounding_box,
                    distance_meters,
                }
            })
            .collect()
    }
}
