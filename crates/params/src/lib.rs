use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Weights of the three objective terms used by face selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Weights {
    pub data_fitting: f64,
    pub model_coverage: f64,
    pub model_complexity: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            data_fitting: 0.43,
            model_coverage: 0.27,
            model_complexity: 0.30,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("weight `{name}` must be finite and non-negative (got {value})")]
    InvalidWeight { name: &'static str, value: f64 },
    #[error("at least one objective weight must be positive")]
    AllWeightsZero,
    #[error("tolerance `{name}` must be positive (got {value})")]
    NonPositiveTolerance { name: &'static str, value: f64 },
}

impl Weights {
    pub fn new(data_fitting: f64, model_coverage: f64, model_complexity: f64) -> Self {
        Self {
            data_fitting,
            model_coverage,
            model_complexity,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("data_fitting", self.data_fitting),
            ("model_coverage", self.model_coverage),
            ("model_complexity", self.model_complexity),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidWeight { name, value });
            }
        }
        if self.sum() <= 0.0 {
            return Err(ConfigError::AllWeightsZero);
        }
        Ok(())
    }

    pub fn sum(&self) -> f64 {
        self.data_fitting + self.model_coverage + self.model_complexity
    }
}

/// Geometric tolerances. Lengths are fractions of the bounding-box diagonal
/// of the input so that every threshold scales with the data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Tolerances {
    pub merge_angle_deg: f64,
    pub merge_distance: f64,
    pub merge_min_fraction: f64,
    pub adjacency_distance: f64,
    pub min_inliers: usize,
    pub max_rms: f64,
    pub bbox_margin: f64,
    pub parallel_angle_deg: f64,
    pub min_face_area: f64,
    pub min_face_angle_deg: f64,
    pub weld_distance: f64,
    pub support_distance: f64,
    pub coverage_cell_factor: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            merge_angle_deg: 10.0,
            merge_distance: 0.01,
            merge_min_fraction: 0.3,
            adjacency_distance: 0.05,
            min_inliers: 10,
            max_rms: 0.02,
            bbox_margin: 0.05,
            parallel_angle_deg: 0.5,
            min_face_area: 1e-6,
            min_face_angle_deg: 0.5,
            weld_distance: 1e-7,
            support_distance: 0.005,
            coverage_cell_factor: 2.0,
        }
    }
}

/// Tolerances resolved against a concrete bounding-box diagonal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScaledTolerances {
    pub diagonal: f64,
    pub merge_angle_rad: f64,
    pub merge_distance: f64,
    pub merge_min_fraction: f64,
    pub adjacency_distance: f64,
    pub min_inliers: usize,
    pub max_rms: f64,
    pub bbox_margin: f64,
    pub min_parallel_sin: f64,
    pub min_face_area: f64,
    pub min_face_angle_rad: f64,
    pub weld_distance: f64,
    pub epsilon: f64,
    pub support_distance: f64,
    pub coverage_cell_factor: f64,
}

impl Tolerances {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("merge_angle_deg", self.merge_angle_deg),
            ("merge_distance", self.merge_distance),
            ("adjacency_distance", self.adjacency_distance),
            ("max_rms", self.max_rms),
            ("parallel_angle_deg", self.parallel_angle_deg),
            ("min_face_area", self.min_face_area),
            ("weld_distance", self.weld_distance),
            ("support_distance", self.support_distance),
            ("coverage_cell_factor", self.coverage_cell_factor),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NonPositiveTolerance { name, value });
            }
        }
        if !(0.0..=1.0).contains(&self.merge_min_fraction) {
            return Err(ConfigError::NonPositiveTolerance {
                name: "merge_min_fraction",
                value: self.merge_min_fraction,
            });
        }
        Ok(())
    }

    pub fn scaled(&self, diagonal: f64) -> ScaledTolerances {
        let diagonal = if diagonal.is_finite() && diagonal > 0.0 {
            diagonal
        } else {
            1.0
        };
        ScaledTolerances {
            diagonal,
            merge_angle_rad: self.merge_angle_deg.to_radians(),
            merge_distance: self.merge_distance * diagonal,
            merge_min_fraction: self.merge_min_fraction,
            adjacency_distance: self.adjacency_distance * diagonal,
            min_inliers: self.min_inliers.max(3),
            max_rms: self.max_rms * diagonal,
            bbox_margin: self.bbox_margin * diagonal,
            min_parallel_sin: self.parallel_angle_deg.to_radians().sin(),
            min_face_area: self.min_face_area * diagonal * diagonal,
            min_face_angle_rad: self.min_face_angle_deg.to_radians(),
            weld_distance: self.weld_distance * diagonal,
            epsilon: 1e-9 * diagonal,
            support_distance: self.support_distance * diagonal,
            coverage_cell_factor: self.coverage_cell_factor,
        }
    }
}
