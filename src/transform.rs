use anyhow::*;
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

/// Resolution transform of a mipmap level, mapping level voxel coordinates to full resolution coordinates.
///
/// On the wire this is a flat array of the 12 coefficients of the 3x4 matrix in row-major order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 12]", into = "[f64; 12]")]
pub struct AffineTransform {
    /// 3x4 affine transformation matrix in xyz coordinate order
    pub matrix: [[f64; 4]; 3],
}
impl AffineTransform {
    pub const IDENTITY: AffineTransform = AffineTransform {
        matrix: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]],
    };

    /// Default transform of a downsampled level: scale by the resolution factors and translate so
    /// that voxel centers of both levels line up.
    pub fn for_resolution(resolution: [f64; 3]) -> Self {
        let mut matrix = Self::IDENTITY.matrix;
        for d in 0..3 {
            matrix[d][d] = resolution[d];
            matrix[d][3] = 0.5 * (resolution[d] - 1.0);
        }
        AffineTransform { matrix }
    }

    pub fn from_simple_json_array(json: &str) -> Result<Self, Error> {
        let matrix: [[f64; 4]; 3] = serde_json::from_str(json)?;
        Ok(AffineTransform { matrix })
    }
    pub fn from_flat_json_array(json: &str) -> Result<Self, Error> {
        let coefficients: [f64; 12] = serde_json::from_str(json).context("expected 12 transform coefficients")?;
        Ok(coefficients.into())
    }

    pub fn apply(&self, xyz: [f64; 3]) -> [f64; 3] {
        let m = &self.matrix;
        let mut res = [0.0; 3];
        for (r, row) in m.iter().enumerate() {
            res[r] = row[0] * xyz[0] + row[1] * xyz[1] + row[2] * xyz[2] + row[3];
        }
        res
    }

    fn homogeneous(&self) -> Matrix4<f64> {
        let m = &self.matrix;
        Matrix4::new(
            m[0][0], m[0][1], m[0][2], m[0][3], //
            m[1][0], m[1][1], m[1][2], m[1][3], //
            m[2][0], m[2][1], m[2][2], m[2][3], //
            0.0, 0.0, 0.0, 1.0,
        )
    }
    fn from_homogeneous(h: &Matrix4<f64>) -> Self {
        let mut matrix = [[0.0; 4]; 3];
        for (r, row) in matrix.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = h[(r, c)];
            }
        }
        AffineTransform { matrix }
    }

    /// Invert this affine transformation matrix
    pub fn invert(&self) -> Result<Self, Error> {
        let inv = self
            .homogeneous()
            .try_inverse()
            .ok_or_else(|| anyhow!("Matrix is not invertible"))?;

        Ok(Self::from_homogeneous(&inv))
    }

    /// Transform composed of `self` applied after `first`.
    pub fn concatenate(&self, first: &AffineTransform) -> Self {
        Self::from_homogeneous(&(self.homogeneous() * first.homogeneous()))
    }
}
impl Default for AffineTransform {
    fn default() -> Self { Self::IDENTITY }
}
impl From<[f64; 12]> for AffineTransform {
    fn from(c: [f64; 12]) -> Self {
        AffineTransform {
            matrix: [
                [c[0], c[1], c[2], c[3]],
                [c[4], c[5], c[6], c[7]],
                [c[8], c[9], c[10], c[11]],
            ],
        }
    }
}
impl From<AffineTransform> for [f64; 12] {
    fn from(t: AffineTransform) -> Self {
        let m = t.matrix;
        [
            m[0][0], m[0][1], m[0][2], m[0][3], m[1][0], m[1][1], m[1][2], m[1][3], m[2][0], m[2][1], m[2][2], m[2][3],
        ]
    }
}
