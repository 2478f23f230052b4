//! Key/value calibration documents stored as JSON.
//!
//! Matrices use the OpenCV `FileStorage` JSON layout
//! (`{"type_id": "opencv-matrix", "rows", "cols", "dt": "d", "data"}`) so the
//! files stay readable by OpenCV tooling. Writes are atomic: the document is
//! written next to the target and renamed over it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use nalgebra::Matrix3;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const OPENCV_MATRIX: &str = "opencv-matrix";

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("missing key `{0}`")]
    MissingKey(String),
    #[error("key `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("key `{key}`: expected {expected}, found {rows}x{cols}")]
    Shape {
        key: String,
        expected: &'static str,
        rows: usize,
        cols: usize,
    },
    #[error("key `{0}` contains non-finite values")]
    NonFinite(String),
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Dense matrix in OpenCV JSON form, row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatrixRecord {
    pub type_id: String,
    pub rows: usize,
    pub cols: usize,
    pub dt: String,
    pub data: Vec<f64>,
}

impl MatrixRecord {
    pub fn from_matrix3(m: &Matrix3<f64>) -> Self {
        let data = (0..3)
            .flat_map(|r| (0..3).map(move |c| m[(r, c)]))
            .collect();
        Self {
            type_id: OPENCV_MATRIX.to_string(),
            rows: 3,
            cols: 3,
            dt: "d".to_string(),
            data,
        }
    }

    /// `n x 1` column, the shape OpenCV uses for distortion vectors.
    pub fn column(values: &[f64]) -> Self {
        Self {
            type_id: OPENCV_MATRIX.to_string(),
            rows: values.len(),
            cols: 1,
            dt: "d".to_string(),
            data: values.to_vec(),
        }
    }

    fn check(&self, key: &str) -> Result<(), StorageError> {
        if self.data.len() != self.rows * self.cols {
            return Err(StorageError::InvalidValue {
                key: key.to_string(),
                reason: format!(
                    "{}x{} matrix carries {} values",
                    self.rows,
                    self.cols,
                    self.data.len()
                ),
            });
        }
        if self.data.iter().any(|v| !v.is_finite()) {
            return Err(StorageError::NonFinite(key.to_string()));
        }
        Ok(())
    }

    pub fn to_matrix3(&self, key: &str) -> Result<Matrix3<f64>, StorageError> {
        if self.rows != 3 || self.cols != 3 {
            return Err(StorageError::Shape {
                key: key.to_string(),
                expected: "3x3",
                rows: self.rows,
                cols: self.cols,
            });
        }
        self.check(key)?;
        Ok(Matrix3::from_row_slice(&self.data))
    }

    /// Row or column vector contents; empty matrices are rejected.
    pub fn to_vector(&self, key: &str) -> Result<Vec<f64>, StorageError> {
        if self.data.is_empty() || (self.rows != 1 && self.cols != 1) {
            return Err(StorageError::Shape {
                key: key.to_string(),
                expected: "non-empty vector",
                rows: self.rows,
                cols: self.cols,
            });
        }
        self.check(key)?;
        Ok(self.data.clone())
    }
}

/// Named values making up one persisted file. Keys are written in sorted order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    map: Map<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), StorageError> {
        self.map.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn set_matrix3(&mut self, key: &str, m: &Matrix3<f64>) -> Result<(), StorageError> {
        self.set(key, MatrixRecord::from_matrix3(m))
    }

    pub fn set_vector(&mut self, key: &str, values: &[f64]) -> Result<(), StorageError> {
        self.set(key, MatrixRecord::column(values))
    }

    pub fn set_child(&mut self, key: &str, child: Document) {
        self.map.insert(key.to_string(), Value::Object(child.map));
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StorageError> {
        self.get_opt(key)?
            .ok_or_else(|| StorageError::MissingKey(key.to_string()))
    }

    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(value) = self.map.get(key) else {
            return Ok(None);
        };
        T::deserialize(value)
            .map(Some)
            .map_err(|e| StorageError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn matrix3(&self, key: &str) -> Result<Matrix3<f64>, StorageError> {
        self.get::<MatrixRecord>(key)?.to_matrix3(key)
    }

    pub fn vector(&self, key: &str) -> Result<Vec<f64>, StorageError> {
        self.get::<MatrixRecord>(key)?.to_vector(key)
    }

    /// Finite floating-point scalar.
    pub fn real(&self, key: &str) -> Result<f64, StorageError> {
        let v: f64 = self.get(key)?;
        if !v.is_finite() {
            return Err(StorageError::NonFinite(key.to_string()));
        }
        Ok(v)
    }

    pub fn child(&self, key: &str) -> Result<Document, StorageError> {
        match self.map.get(key) {
            Some(Value::Object(map)) => Ok(Document { map: map.clone() }),
            Some(_) => Err(StorageError::InvalidValue {
                key: key.to_string(),
                reason: "expected a nested record".to_string(),
            }),
            None => Err(StorageError::MissingKey(key.to_string())),
        }
    }

    pub fn to_json_string(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string_pretty(&self.map)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, StorageError> {
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => Ok(Self { map }),
            _ => Err(StorageError::InvalidValue {
                key: String::new(),
                reason: "top level is not an object".to_string(),
            }),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        write_atomic(path.as_ref(), self.to_json_string()?.as_bytes())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
        Self::from_json_str(&raw)
    }
}

/// Write `bytes` to `path` through a uniquely named temporary sibling and a
/// rename.
///
/// On failure the target is left as it was.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "groundmap".to_string());
    let result = (|| -> std::io::Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    })();
    result.map_err(|e| StorageError::io(path, e))
}
