use nalgebra::Point3;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BoardError {
    #[error("board needs at least 2x2 interior corners, got {cols}x{rows}")]
    TooSmall { cols: u32, rows: u32 },
    #[error("square size must be positive and finite, got {0}")]
    InvalidSquareSize(f64),
}

/// Interior-corner grid of a planar chessboard target.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardSpec {
    /// Interior corners per row.
    pub cols: u32,
    /// Interior corners per column.
    pub rows: u32,
    /// Square edge length in meters.
    pub square_size: f64,
}

impl Default for BoardSpec {
    fn default() -> Self {
        Self {
            cols: 9,
            rows: 6,
            square_size: 0.025,
        }
    }
}

impl BoardSpec {
    pub fn new(cols: u32, rows: u32, square_size: f64) -> Result<Self, BoardError> {
        let spec = Self {
            cols,
            rows,
            square_size,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), BoardError> {
        if self.cols < 2 || self.rows < 2 {
            return Err(BoardError::TooSmall {
                cols: self.cols,
                rows: self.rows,
            });
        }
        if !self.square_size.is_finite() || self.square_size <= 0.0 {
            return Err(BoardError::InvalidSquareSize(self.square_size));
        }
        Ok(())
    }

    /// `cols * rows`.
    #[inline]
    pub fn point_count(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    /// Corner positions on the board plane (`z = 0`), row by row.
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        let s = self.square_size;
        (0..self.rows)
            .flat_map(|i| (0..self.cols).map(move |j| Point3::new(j as f64 * s, i as f64 * s, 0.0)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_points_are_row_major_on_z0() {
        let board = BoardSpec::new(3, 2, 0.5).unwrap();
        let pts = board.object_points();
        assert_eq!(pts.len(), 6);
        assert_eq!(pts[1], Point3::new(0.5, 0.0, 0.0));
        assert_eq!(pts[3], Point3::new(0.0, 0.5, 0.0));
        assert!(pts.iter().all(|p| p.z == 0.0));
    }

    #[test]
    fn malformed_geometry_is_rejected() {
        assert_eq!(
            BoardSpec::new(1, 6, 0.02).unwrap_err(),
            BoardError::TooSmall { cols: 1, rows: 6 }
        );
        assert!(matches!(
            BoardSpec::new(9, 6, 0.0),
            Err(BoardError::InvalidSquareSize(_))
        ));
        assert!(BoardSpec::new(9, 6, f64::NAN).is_err());
    }
}
