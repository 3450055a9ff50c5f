//! Flat inner-product vector index.
//!
//! Brute-force top-k over unit-norm vectors, which doubles as cosine
//! similarity. Persisted with bincode via write-then-rename so a crash never
//! leaves a half-written index behind. `id_map[i]` always refers to the i-th
//! added vector; callers persist the map next to the index file.

use std::fs;
use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{MemoryError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatIndex {
    dim: usize,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Append one vector. The caller normalizes first.
    pub fn add(&mut self, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dim {
            return Err(MemoryError::DimensionMismatch {
                got: vector.len(),
                expected: self.dim,
            });
        }
        self.vectors.push(vector);
        Ok(())
    }

    /// Top-k positions by inner product, highest first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if query.len() != self.dim || self.vectors.is_empty() || k == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, dot(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    pub fn load(path: &Path, dim: usize) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(dim));
        }
        let bytes = fs::read(path)?;
        let index: FlatIndex =
            bincode::deserialize(&bytes).map_err(|e| MemoryError::Index(e.to_string()))?;
        if index.dim != dim {
            return Err(MemoryError::DimensionMismatch {
                got: dim,
                expected: index.dim,
            });
        }
        Ok(index)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes =
            bincode::serialize(self).map_err(|e| MemoryError::Index(e.to_string()))?;
        write_atomic(path, &bytes)
    }
}

/// Persist any serde id-map next to its index, same atomicity rules.
pub fn save_id_map<T: Serialize>(path: &Path, map: &T) -> Result<()> {
    let bytes = bincode::serialize(map).map_err(|e| MemoryError::Index(e.to_string()))?;
    write_atomic(path, &bytes)
}

pub fn load_id_map<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let bytes = fs::read(path)?;
    bincode::deserialize(&bytes).map_err(|e| MemoryError::Index(e.to_string()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Scale to unit L2 norm. Zero vectors pass through untouched.
pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(v: Vec<f32>) -> Vec<f32> {
        normalize(v)
    }

    #[test]
    fn normalize_produces_unit_norm() {
        let v = normalize(vec![3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        let zero = normalize(vec![0.0, 0.0]);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn search_orders_by_inner_product() {
        let mut idx = FlatIndex::new(2);
        idx.add(unit(vec![1.0, 0.0])).unwrap();
        idx.add(unit(vec![0.0, 1.0])).unwrap();
        idx.add(unit(vec![1.0, 1.0])).unwrap();

        let hits = idx.search(&unit(vec![1.0, 0.1]), 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 0);
        assert!(hits[0].1 >= hits[1].1);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut idx = FlatIndex::new(3);
        assert!(matches!(
            idx.add(vec![1.0, 2.0]),
            Err(MemoryError::DimensionMismatch { got: 2, expected: 3 })
        ));
        assert!(idx.search(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scope.index");

        let mut idx = FlatIndex::new(4);
        idx.add(unit(vec![0.2, 0.4, 0.1, 0.9])).unwrap();
        idx.add(unit(vec![0.9, 0.0, 0.0, 0.1])).unwrap();
        idx.save(&path).unwrap();

        let reloaded = FlatIndex::load(&path, 4).unwrap();
        assert_eq!(reloaded.len(), 2);

        // Same nearest neighbor for a fixed query after reload.
        let q = unit(vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(idx.search(&q, 1)[0].0, reloaded.search(&q, 1)[0].0);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let idx = FlatIndex::load(&dir.path().join("absent.index"), 8).unwrap();
        assert!(idx.is_empty());
        let map: Vec<i64> = load_id_map(&dir.path().join("absent.idmap")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn id_map_round_trip() {
        use crate::types::IdRef;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.idmap");
        let map = vec![IdRef::Private(1), IdRef::Group(7), IdRef::Private(2)];
        save_id_map(&path, &map).unwrap();
        let loaded: Vec<IdRef> = load_id_map(&path).unwrap();
        assert_eq!(loaded, map);
    }
}
