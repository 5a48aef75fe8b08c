// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! In-process nearest-neighbor index over face embeddings.
//!
//! Positions in the index map to student database ids via an append-only id
//! map; `position_count == id_map_length` always holds. Vectors are
//! L2-normalized on insertion, so inner product is cosine similarity and
//! scores fall in [-1, 1].
//!
//! Search is an exact flat scan until the index grows past
//! [`IVF_UPGRADE_THRESHOLD`] vectors; past that, a coarse quantizer is
//! trained over the data and searches probe the [`NPROBE`] nearest cells.
//! The upgrade preserves the position → student id mapping.
//!
//! Many readers may search concurrently; insertion, removal, and the
//! upgrade take the write half of the lock.

use base::time::Duration;
use base::{bail, err, Error};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use smallvec::SmallVec;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

/// Magic number at the head of the index blob file.
const INDEX_MAGIC: &[u8; 4] = b"mfpv";
const INDEX_VERSION: u32 = 1;

/// Past this many vectors, adds trigger the coarse-quantizer upgrade.
pub const IVF_UPGRADE_THRESHOLD: usize = 1_000;

/// Cells probed per search once the coarse quantizer is active.
const NPROBE: usize = 10;

/// Coarse quantizer cell count, as in the original deployment.
const NLIST: usize = 100;

const KMEANS_ITERS: usize = 10;

/// Persisted file names within the vector directory.
pub const INDEX_FILENAME: &str = "student_faces.index";
pub const ID_MAP_FILENAME: &str = "student_faces.ids";

struct Coarse {
    /// `NLIST` centroids, each `dim` long, unit-normalized.
    centroids: Vec<f32>,

    /// Positions per cell.
    lists: Vec<Vec<u32>>,
}

struct Inner {
    /// Row-major `len * dim` unit vectors.
    data: Vec<f32>,

    /// `ids[position]` is the owning student's database id.
    ids: Vec<i64>,

    coarse: Option<Coarse>,
}

impl Inner {
    fn len(&self) -> usize {
        self.ids.len()
    }
}

pub struct VectorIndex {
    dim: usize,
    paths: Option<(PathBuf, PathBuf)>,
    inner: RwLock<Inner>,
}

fn normalize(v: &mut [f32]) {
    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
    if norm_sq <= f32::EPSILON {
        return; // leave the zero vector alone; it will never match anything.
    }
    let inv = 1.0 / norm_sq.sqrt();
    for x in v.iter_mut() {
        *x *= inv;
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl VectorIndex {
    /// Creates an empty in-memory index which never persists.
    pub fn empty(dim: usize) -> Self {
        VectorIndex {
            dim,
            paths: None,
            inner: RwLock::new(Inner {
                data: Vec::new(),
                ids: Vec::new(),
                coarse: None,
            }),
        }
    }

    /// Opens the index persisted in `dir`, falling back to an empty index
    /// with a warning if the files are absent, corrupt, or mismatched.
    /// Save failures later surface as errors but never tear down the server.
    pub fn open(dim: usize, dir: &Path) -> Self {
        let index_path = dir.join(INDEX_FILENAME);
        let ids_path = dir.join(ID_MAP_FILENAME);
        let mut index = match Self::load(dim, &index_path, &ids_path) {
            Ok(i) => {
                info!("loaded vector index with {} vectors", i.len());
                i
            }
            Err(err) => {
                if index_path.exists() || ids_path.exists() {
                    warn!(
                        err = %err.chain(),
                        "unable to load vector index from {}; starting empty",
                        dir.display()
                    );
                } else {
                    info!("no vector index at {}; starting empty", dir.display());
                }
                Self::empty(dim)
            }
        };
        index.paths = Some((index_path, ids_path));
        index.maybe_upgrade();
        index
    }

    fn load(dim: usize, index_path: &Path, ids_path: &Path) -> Result<Self, Error> {
        let mut f = std::fs::File::open(index_path)?;
        let mut magic = [0u8; 4];
        f.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            bail!(DataLoss, msg("bad index magic {magic:02x?}"));
        }
        let version = f.read_u32::<LittleEndian>()?;
        if version != INDEX_VERSION {
            bail!(DataLoss, msg("unsupported index version {version}"));
        }
        let file_dim = f.read_u32::<LittleEndian>()? as usize;
        if file_dim != dim {
            bail!(DataLoss, msg("index dimension {file_dim} != expected {dim}"));
        }
        let count = f.read_u64::<LittleEndian>()? as usize;
        let mut raw = vec![0u8; count * dim * 4];
        f.read_exact(&mut raw)?;
        let mut data = vec![0f32; count * dim];
        LittleEndian::read_f32_into(&raw, &mut data);

        let ids: Vec<i64> = serde_json::from_reader(std::fs::File::open(ids_path)?)
            .map_err(|e| err!(DataLoss, msg("unable to parse id map"), source(e)))?;
        if ids.len() != count {
            bail!(
                DataLoss,
                msg("id map has {} entries but index has {count} vectors", ids.len())
            );
        }
        Ok(VectorIndex {
            dim,
            paths: None,
            inner: RwLock::new(Inner {
                data,
                ids,
                coarse: None,
            }),
        })
    }

    /// Serializes the matrix and id map to their two companion files,
    /// writing to temporary siblings then renaming into place.
    pub fn save(&self) -> Result<(), Error> {
        let (index_path, ids_path) = match self.paths {
            None => return Ok(()),
            Some(ref p) => p,
        };
        let l = self.inner.read().unwrap();
        if let Some(dir) = index_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let tmp = index_path.with_extension("index.tmp");
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(INDEX_MAGIC)?;
        f.write_u32::<LittleEndian>(INDEX_VERSION)?;
        f.write_u32::<LittleEndian>(self.dim as u32)?;
        f.write_u64::<LittleEndian>(l.len() as u64)?;
        let mut raw = vec![0u8; l.data.len() * 4];
        LittleEndian::write_f32_into(&l.data, &mut raw);
        f.write_all(&raw)?;
        f.sync_all()?;
        std::fs::rename(&tmp, index_path)?;

        let tmp = ids_path.with_extension("ids.tmp");
        let f = std::fs::File::create(&tmp)?;
        serde_json::to_writer(&f, &l.ids)
            .map_err(|e| err!(Internal, msg("unable to serialize id map"), source(e)))?;
        f.sync_all()?;
        std::fs::rename(&tmp, ids_path)?;

        info!("saved vector index with {} vectors", l.len());
        Ok(())
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct students with at least one vector.
    pub fn student_count(&self) -> usize {
        let l = self.inner.read().unwrap();
        let mut ids: Vec<i64> = l.ids.clone();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Appends one vector, normalizing it. Persists opportunistically every
    /// 100 additions.
    pub fn add(&self, mut vector: Vec<f32>, student_id: i32) -> Result<(), Error> {
        self.check_dim(&vector)?;
        normalize(&mut vector);
        let total = {
            let mut l = self.inner.write().unwrap();
            let pos = l.len() as u32;
            if let Some(ref mut coarse) = l.coarse {
                let cell = nearest_centroid(&coarse.centroids, self.dim, &vector);
                coarse.lists[cell].push(pos);
            }
            l.data.extend_from_slice(&vector);
            l.ids.push(i64::from(student_id));
            l.len()
        };
        self.maybe_upgrade();
        if total % 100 == 0 {
            if let Err(err) = self.save() {
                warn!(err = %err.chain(), "opportunistic index save failed");
            }
        }
        Ok(())
    }

    /// Appends a batch atomically with respect to readers, then persists.
    pub fn add_batch(&self, vectors: Vec<Vec<f32>>, student_ids: &[i32]) -> Result<(), Error> {
        if vectors.len() != student_ids.len() {
            bail!(
                InvalidArgument,
                msg("{} vectors but {} ids", vectors.len(), student_ids.len())
            );
        }
        for v in &vectors {
            self.check_dim(v)?;
        }
        {
            let mut l = self.inner.write().unwrap();
            for (mut v, &id) in vectors.into_iter().zip(student_ids) {
                normalize(&mut v);
                let pos = l.len() as u32;
                if let Some(ref mut coarse) = l.coarse {
                    let cell = nearest_centroid(&coarse.centroids, self.dim, &v);
                    coarse.lists[cell].push(pos);
                }
                l.data.extend_from_slice(&v);
                l.ids.push(i64::from(id));
            }
        }
        self.maybe_upgrade();
        if let Err(err) = self.save() {
            warn!(err = %err.chain(), "index save after batch add failed");
        }
        Ok(())
    }

    /// Returns the top-`k` matches by inner product, descending. `k` is
    /// clamped to the index size; an empty index yields an empty vec.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(i32, f32)>, Error> {
        self.check_dim(query)?;
        let mut q = query.to_vec();
        normalize(&mut q);
        let l = self.inner.read().unwrap();
        let k = std::cmp::min(k, l.len());
        if k == 0 {
            return Ok(Vec::new());
        }

        // (score, position) pairs, worst kept at the end.
        let mut top: SmallVec<[(f32, u32); 16]> = SmallVec::new();
        let mut consider = |pos: u32, score: f32| {
            if top.len() < k {
                top.push((score, pos));
                top.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));
            } else if score > top[k - 1].0 {
                top[k - 1] = (score, pos);
                top.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));
            }
        };

        match l.coarse {
            None => {
                for pos in 0..l.len() {
                    let v = &l.data[pos * self.dim..(pos + 1) * self.dim];
                    consider(pos as u32, dot(&q, v));
                }
            }
            Some(ref coarse) => {
                for cell in nearest_centroids(&coarse.centroids, self.dim, &q, NPROBE) {
                    for &pos in &coarse.lists[cell] {
                        let pos_usize = pos as usize;
                        let v = &l.data[pos_usize * self.dim..(pos_usize + 1) * self.dim];
                        consider(pos, dot(&q, v));
                    }
                }
            }
        }

        Ok(top
            .into_iter()
            .map(|(score, pos)| (l.ids[pos as usize] as i32, score))
            .collect())
    }

    /// Returns the best match iff its score clears `threshold`.
    pub fn search_with_threshold(
        &self,
        query: &[f32],
        threshold: f32,
    ) -> Result<Option<(i32, f32)>, Error> {
        let results = self.search(query, 1)?;
        match results.first() {
            Some(&(id, score)) if score >= threshold => Ok(Some((id, score))),
            _ => Ok(None),
        }
    }

    /// Removes all of a student's vectors by rebuilding from the survivors.
    /// A no-op if the student has none. O(n·d).
    pub fn remove_student(&self, student_id: i32) -> Result<(), Error> {
        let removed = {
            let mut l = self.inner.write().unwrap();
            let target = i64::from(student_id);
            if !l.ids.contains(&target) {
                return Ok(());
            }
            let old_len = l.len();
            let mut data = Vec::with_capacity(l.data.len());
            let mut ids = Vec::with_capacity(old_len);
            for pos in 0..old_len {
                if l.ids[pos] == target {
                    continue;
                }
                data.extend_from_slice(&l.data[pos * self.dim..(pos + 1) * self.dim]);
                ids.push(l.ids[pos]);
            }
            let removed = old_len - ids.len();
            l.data = data;
            l.ids = ids;
            l.coarse = if l.len() > IVF_UPGRADE_THRESHOLD {
                Some(train_coarse(&l.data, self.dim, l.len()))
            } else {
                None
            };
            removed
        };
        info!("removed {removed} vectors of student {student_id}");
        if let Err(err) = self.save() {
            warn!(err = %err.chain(), "index save after removal failed");
        }
        Ok(())
    }

    fn check_dim(&self, v: &[f32]) -> Result<(), Error> {
        if v.len() != self.dim {
            bail!(
                InvalidArgument,
                msg("vector has dimension {}, index wants {}", v.len(), self.dim)
            );
        }
        Ok(())
    }

    /// Trains the coarse quantizer once the flat index outgrows the
    /// threshold. All vectors are retrained into the new structure; the
    /// position → student id mapping is untouched.
    fn maybe_upgrade(&self) {
        let mut l = self.inner.write().unwrap();
        if l.coarse.is_some() || l.len() <= IVF_UPGRADE_THRESHOLD {
            return;
        }
        let start = std::time::Instant::now();
        let coarse = train_coarse(&l.data, self.dim, l.len());
        l.coarse = Some(coarse);
        info!(
            "trained {NLIST}-cell coarse quantizer over {} vectors in {}",
            l.len(),
            Duration::from_std(start.elapsed())
        );
    }
}

fn nearest_centroid(centroids: &[f32], dim: usize, v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f32::MIN;
    for (i, c) in centroids.chunks_exact(dim).enumerate() {
        let score = dot(c, v);
        if score > best_score {
            best_score = score;
            best = i;
        }
    }
    best
}

fn nearest_centroids(centroids: &[f32], dim: usize, v: &[f32], n: usize) -> Vec<usize> {
    let mut scored: Vec<(f32, usize)> = centroids
        .chunks_exact(dim)
        .enumerate()
        .map(|(i, c)| (dot(c, v), i))
        .collect();
    scored.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));
    scored.truncate(n);
    scored.into_iter().map(|(_, i)| i).collect()
}

/// Spherical k-means over unit vectors: maximize inner product, renormalize
/// centroids each iteration.
fn train_coarse(data: &[f32], dim: usize, len: usize) -> Coarse {
    let nlist = std::cmp::min(NLIST, len);

    // Seed centroids by striding over the data set.
    let mut centroids = Vec::with_capacity(nlist * dim);
    for i in 0..nlist {
        let pos = i * len / nlist;
        centroids.extend_from_slice(&data[pos * dim..(pos + 1) * dim]);
    }

    let mut assignment = vec![0usize; len];
    for _ in 0..KMEANS_ITERS {
        for pos in 0..len {
            assignment[pos] = nearest_centroid(&centroids, dim, &data[pos * dim..(pos + 1) * dim]);
        }
        let mut sums = vec![0f32; nlist * dim];
        let mut counts = vec![0usize; nlist];
        for pos in 0..len {
            let cell = assignment[pos];
            counts[cell] += 1;
            let v = &data[pos * dim..(pos + 1) * dim];
            for (s, x) in sums[cell * dim..(cell + 1) * dim].iter_mut().zip(v) {
                *s += x;
            }
        }
        for cell in 0..nlist {
            if counts[cell] == 0 {
                continue; // keep the old centroid for an empty cell.
            }
            let c = &mut sums[cell * dim..(cell + 1) * dim];
            normalize(c);
            centroids[cell * dim..(cell + 1) * dim].copy_from_slice(c);
        }
    }

    // Final assignment against the final centroids, so that every vector's
    // cell is its nearest centroid (and thus within any nprobe >= 1 of an
    // exact self-query).
    let mut lists = vec![Vec::new(); nlist];
    for pos in 0..len {
        let cell = nearest_centroid(&centroids, dim, &data[pos * dim..(pos + 1) * dim]);
        lists[cell].push(pos as u32);
    }
    Coarse { centroids, lists }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A deterministic pseudo-random unit vector.
    fn unit_vec(dim: usize, seed: u64) -> Vec<f32> {
        let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
        let mut v: Vec<f32> = (0..dim)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / (1u64 << 31) as f32) - 1.0
            })
            .collect();
        normalize(&mut v);
        v
    }

    #[test]
    fn empty_index() {
        let idx = VectorIndex::empty(8);
        assert!(idx.search(&[0.0; 8], 5).unwrap().is_empty());
        assert!(idx
            .search_with_threshold(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 0.6)
            .unwrap()
            .is_none());
    }

    #[test]
    fn exact_match_scores_high() {
        let idx = VectorIndex::empty(32);
        for s in 0..20 {
            idx.add(unit_vec(32, s), s as i32).unwrap();
        }
        let (id, score) = idx
            .search_with_threshold(&unit_vec(32, 7), 0.6)
            .unwrap()
            .unwrap();
        assert_eq!(id, 7);
        assert!(score >= 0.99, "score {score}");
    }

    #[test]
    fn unnormalized_input_is_normalized() {
        let idx = VectorIndex::empty(4);
        idx.add(vec![2.0, 0.0, 0.0, 0.0], 1).unwrap();
        let r = idx.search(&[10.0, 0.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(r.len(), 1);
        assert!((r[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn k_is_clamped_and_sorted() {
        let idx = VectorIndex::empty(16);
        for s in 0..3 {
            idx.add(unit_vec(16, s), s as i32).unwrap();
        }
        let r = idx.search(&unit_vec(16, 0), 10).unwrap();
        assert_eq!(r.len(), 3);
        assert_eq!(r[0].0, 0);
        assert!(r[0].1 >= r[1].1 && r[1].1 >= r[2].1);
    }

    #[test]
    fn threshold_filters() {
        let idx = VectorIndex::empty(4);
        idx.add(vec![1.0, 0.0, 0.0, 0.0], 1).unwrap();
        // Orthogonal query scores 0, below any sane threshold.
        assert!(idx
            .search_with_threshold(&[0.0, 1.0, 0.0, 0.0], 0.6)
            .unwrap()
            .is_none());
    }

    #[test]
    fn remove_student_rebuilds() {
        let idx = VectorIndex::empty(16);
        for (i, s) in [(0, 1), (1, 2), (2, 1), (3, 3)] {
            idx.add(unit_vec(16, i), s).unwrap();
        }
        assert_eq!(idx.len(), 4);
        idx.remove_student(1).unwrap();
        assert_eq!(idx.len(), 2);
        // Survivors still searchable with their original ids.
        let r = idx.search(&unit_vec(16, 1), 1).unwrap();
        assert_eq!(r[0].0, 2);
        // Removing an absent student is a no-op.
        idx.remove_student(99).unwrap();
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn per_student_counts() {
        let idx = VectorIndex::empty(16);
        for i in 0..5 {
            idx.add(unit_vec(16, i), 42).unwrap();
        }
        assert_eq!(idx.len(), 5);
        assert_eq!(idx.student_count(), 1);
        idx.remove_student(42).unwrap();
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn save_load_round_trip() {
        let tmpdir = tempfile::Builder::new()
            .prefix("moonfire-presence-test")
            .tempdir()
            .unwrap();
        let idx = VectorIndex::open(16, tmpdir.path());
        let vectors: Vec<Vec<f32>> = (0..10).map(|s| unit_vec(16, s)).collect();
        let ids: Vec<i32> = (100..110).collect();
        idx.add_batch(vectors, &ids).unwrap();

        let idx2 = VectorIndex::open(16, tmpdir.path());
        assert_eq!(idx2.len(), 10);
        for s in 0..10u64 {
            let r = idx2.search(&unit_vec(16, s), 1).unwrap();
            assert_eq!(r[0].0, 100 + s as i32);
            assert!(r[0].1 >= 0.99);
        }
    }

    #[test]
    fn load_dimension_mismatch_starts_empty() {
        let tmpdir = tempfile::Builder::new()
            .prefix("moonfire-presence-test")
            .tempdir()
            .unwrap();
        let idx = VectorIndex::open(16, tmpdir.path());
        idx.add(unit_vec(16, 1), 1).unwrap();
        idx.save().unwrap();

        let idx2 = VectorIndex::open(32, tmpdir.path());
        assert_eq!(idx2.len(), 0);
    }

    #[test]
    fn load_corrupt_starts_empty() {
        let tmpdir = tempfile::Builder::new()
            .prefix("moonfire-presence-test")
            .tempdir()
            .unwrap();
        std::fs::write(tmpdir.path().join(INDEX_FILENAME), b"garbage").unwrap();
        std::fs::write(tmpdir.path().join(ID_MAP_FILENAME), b"[]").unwrap();
        let idx = VectorIndex::open(16, tmpdir.path());
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn coarse_upgrade_preserves_mapping() {
        let idx = VectorIndex::empty(16);
        let n = IVF_UPGRADE_THRESHOLD + 50;
        let vectors: Vec<Vec<f32>> = (0..n).map(|s| unit_vec(16, s as u64)).collect();
        let ids: Vec<i32> = (0..n as i32).collect();
        idx.add_batch(vectors, &ids).unwrap();
        assert!(idx.inner.read().unwrap().coarse.is_some());

        // Exact self-queries land in the probed cells and keep their ids.
        for s in [0usize, 1, 17, 500, n - 1] {
            let r = idx
                .search_with_threshold(&unit_vec(16, s as u64), 0.99)
                .unwrap()
                .expect("self-query should match");
            assert_eq!(r.0, s as i32);
        }

        // Adds after the upgrade are routed into cells and found.
        idx.add(unit_vec(16, 1_000_000), 1_000_000).unwrap();
        let r = idx.search(&unit_vec(16, 1_000_000), 1).unwrap();
        assert_eq!(r[0].0, 1_000_000);
    }
}
