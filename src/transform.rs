//! Sensor-space to robot-space mapping.
//!
//! The camera is fixed above the pick area, so the mapping is a plain affine
//! calibration: pixels are converted to millimeters around the image center,
//! then rotated/flipped into robot axes and shifted by the base offsets.

use crate::types::{Pose, RobotPose};
use crate::{CellError, Result};
use serde::Deserialize;

/// Sign applied to the sensor rotation when computing tool yaw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YawSign {
    Plus,
    Minus,
}

impl YawSign {
    fn factor(self) -> f64 {
        match self {
            YawSign::Plus => 1.0,
            YawSign::Minus => -1.0,
        }
    }
}

/// Fixed per-deployment camera calibration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Calibration {
    /// Pixel coordinate of the image origin used for the mm conversion.
    pub offset_x: f64,
    pub offset_y: f64,
    /// Pixels per millimeter on each image axis.
    pub scale_x: f64,
    pub scale_y: f64,
    /// Robot coordinates of the image origin.
    pub base_x: f64,
    pub base_y: f64,
    /// Row-major mapping from `[x_mm, y_mm]` to `[robot_x, robot_y]`.
    #[serde(default = "identity_axes")]
    pub axes: [[f64; 2]; 2],
    /// Tool yaw when the object rotation is zero.
    pub yaw_base: f64,
    pub yaw_sign: YawSign,
}

fn identity_axes() -> [[f64; 2]; 2] {
    [[1.0, 0.0], [0.0, 1.0]]
}

impl Calibration {
    /// Check the constants once at load time so the transform itself cannot fail.
    pub fn validate(&self) -> Result<()> {
        let values = [
            self.offset_x,
            self.offset_y,
            self.scale_x,
            self.scale_y,
            self.base_x,
            self.base_y,
            self.axes[0][0],
            self.axes[0][1],
            self.axes[1][0],
            self.axes[1][1],
            self.yaw_base,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CellError::Config(
                "calibration constants must be finite".into(),
            ));
        }
        if self.scale_x == 0.0 || self.scale_y == 0.0 {
            return Err(CellError::Config("calibration scale must be non-zero".into()));
        }
        if self.determinant().abs() < 1e-12 {
            return Err(CellError::Config(
                "calibration axis matrix is singular".into(),
            ));
        }
        Ok(())
    }

    fn determinant(&self) -> f64 {
        self.axes[0][0] * self.axes[1][1] - self.axes[0][1] * self.axes[1][0]
    }

    /// Convert image pixels to millimeters relative to the image origin.
    pub fn pixels_to_mm(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.offset_x) / self.scale_x,
            (y - self.offset_y) / self.scale_y,
        )
    }

    /// Inverse of [`Calibration::pixels_to_mm`].
    pub fn mm_to_pixels(&self, x_mm: f64, y_mm: f64) -> (f64, f64) {
        (
            x_mm * self.scale_x + self.offset_x,
            y_mm * self.scale_y + self.offset_y,
        )
    }

    /// Map a sensor reading to a robot pick target.
    ///
    /// A `(0, 0)` reading means "nothing detected": the translated pair is
    /// returned as `(0, 0)` without calibration, only the yaw is mapped.
    /// Callers must not treat that result as a valid coordinate.
    pub fn to_robot_space(&self, pose: &Pose) -> RobotPose {
        let r = self.yaw_base + self.yaw_sign.factor() * pose.r;
        if pose.is_no_detection() {
            return RobotPose { x: 0.0, y: 0.0, r };
        }

        let (x_mm, y_mm) = self.pixels_to_mm(pose.x, pose.y);
        RobotPose {
            x: self.base_x + self.axes[0][0] * x_mm + self.axes[0][1] * y_mm,
            y: self.base_y + self.axes[1][0] * x_mm + self.axes[1][1] * y_mm,
            r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bench_calibration() -> Calibration {
        Calibration {
            offset_x: 295.0,
            offset_y: 235.0,
            scale_x: 4.9715,
            scale_y: 4.9715,
            base_x: -463.8,
            base_y: 610.1,
            axes: identity_axes(),
            yaw_base: 89.9,
            yaw_sign: YawSign::Minus,
        }
    }

    fn mirrored_calibration() -> Calibration {
        Calibration {
            base_x: -72.2,
            base_y: 325.9,
            axes: [[-1.0, 0.0], [0.0, 1.0]],
            yaw_base: -0.2,
            ..bench_calibration()
        }
    }

    #[test]
    fn test_center_pixel_maps_to_base() {
        let calib = bench_calibration();
        let target = calib.to_robot_space(&Pose::new(295.0, 235.0, 0.0));
        assert!((target.x - -463.8).abs() < 1e-9);
        assert!((target.y - 610.1).abs() < 1e-9);
        assert!((target.r - 89.9).abs() < 1e-9);
    }

    #[test]
    fn test_offset_pixel() {
        let calib = bench_calibration();
        let target = calib.to_robot_space(&Pose::new(295.0 + 4.9715 * 10.0, 235.0 - 4.9715 * 4.0, 12.0));
        assert!((target.x - (-463.8 + 10.0)).abs() < 1e-9);
        assert!((target.y - (610.1 - 4.0)).abs() < 1e-9);
        assert!((target.r - (89.9 - 12.0)).abs() < 1e-9);
    }

    #[test]
    fn test_mirrored_axis() {
        let calib = mirrored_calibration();
        let target = calib.to_robot_space(&Pose::new(295.0 + 4.9715 * 2.0, 235.0 + 4.9715, 5.0));
        assert!((target.x - (-72.2 - 2.0)).abs() < 1e-9);
        assert!((target.y - (325.9 + 1.0)).abs() < 1e-9);
        assert!((target.r - (-0.2 - 5.0)).abs() < 1e-9);
    }

    #[test]
    fn test_transform_is_deterministic() {
        let calib = bench_calibration();
        let pose = Pose::new(412.25, 98.5, -33.0);
        let first = calib.to_robot_space(&pose);
        for _ in 0..10 {
            assert_eq!(calib.to_robot_space(&pose), first);
        }
    }

    #[test]
    fn test_sentinel_bypasses_calibration() {
        for calib in [bench_calibration(), mirrored_calibration()] {
            for r in [-90.0, 0.0, 17.5] {
                let target = calib.to_robot_space(&Pose::new(0.0, 0.0, r));
                assert_eq!(target.x, 0.0);
                assert_eq!(target.y, 0.0);
                let expected = calib.yaw_base + calib.yaw_sign.factor() * r;
                assert!((target.r - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_only_both_zero_is_sentinel() {
        let calib = bench_calibration();
        let target = calib.to_robot_space(&Pose::new(0.0, 235.0, 0.0));
        assert!((target.x - (-463.8 - 295.0 / 4.9715)).abs() < 1e-9);
    }

    #[test]
    fn test_pixel_mm_round_trip() {
        let calib = bench_calibration();
        for x in [0.5, 100.0, 294.0, 296.0, 640.0, 1279.75] {
            let y = x * 0.5 + 3.0;
            let (x_mm, y_mm) = calib.pixels_to_mm(x, y);
            let (bx, by) = calib.mm_to_pixels(x_mm, y_mm);
            assert!((bx - x).abs() < 1e-9, "x={x} came back as {bx}");
            assert!((by - y).abs() < 1e-9, "y={y} came back as {by}");
        }
    }

    #[test]
    fn test_validate_rejects_bad_constants() {
        let mut calib = bench_calibration();
        assert!(calib.validate().is_ok());

        calib.scale_x = 0.0;
        assert!(calib.validate().is_err());

        let mut calib = bench_calibration();
        calib.axes = [[1.0, 2.0], [2.0, 4.0]];
        assert!(calib.validate().is_err());

        let mut calib = bench_calibration();
        calib.offset_y = f64::NAN;
        assert!(calib.validate().is_err());
    }
}
