//! Fixel atlas loading
//!
//! A fixel directory contains an `index` image (4D: X,Y,Z,2 with the per-voxel
//! fixel count in channel 0 and the offset into the flat fixel table in
//! channel 1) and a `directions` image (N x 3, one unit direction per fixel).
//! This module loads both into a [`FixelAtlas`] providing per-fixel scanner
//! positions and directions plus the voxel -> fixel-range lookup.

use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::{FixelError, FixelResult};
use crate::mif::MifImage;

/// The template fixel atlas shared by all analysis phases
pub struct FixelAtlas {
    num_fixels: usize,
    /// Spatial dimensions of the index image
    dim: [usize; 3],
    /// Voxel spacing of the index image (mm)
    vox: [f64; 3],
    /// Per-voxel fixel count, flattened with axis 0 varying fastest
    counts: Vec<u32>,
    /// Per-voxel offset into the fixel table
    offsets: Vec<u32>,
    /// Per-fixel position in scanner coordinates (mm)
    positions: Vec<[f64; 3]>,
    /// Per-fixel unit direction
    directions: Vec<[f64; 3]>,
    /// Continuous scanner (mm) -> voxel transform
    scanner2voxel: [[f64; 4]; 3],
}

/// Multiply a 3x4 affine by a 3-vector (homogeneous w = 1)
fn apply_transform(t: &[[f64; 4]; 3], p: [f64; 3]) -> [f64; 3] {
    [
        t[0][0] * p[0] + t[0][1] * p[1] + t[0][2] * p[2] + t[0][3],
        t[1][0] * p[0] + t[1][1] * p[1] + t[1][2] * p[2] + t[1][3],
        t[2][0] * p[0] + t[2][1] * p[1] + t[2][2] * p[2] + t[2][3],
    ]
}

/// voxel -> scanner transform: direction cosines scaled by voxel size
fn voxel2scanner(transform: &[[f64; 4]; 3], vox: &[f64; 3]) -> [[f64; 4]; 3] {
    let mut out = *transform;
    for row in out.iter_mut() {
        for (axis, value) in row.iter_mut().take(3).enumerate() {
            *value *= vox[axis];
        }
    }
    out
}

/// Invert a 3x4 affine (rotation/scale part must be non-singular)
fn invert_transform(t: &[[f64; 4]; 3]) -> FixelResult<[[f64; 4]; 3]> {
    let m = [
        [t[0][0], t[0][1], t[0][2]],
        [t[1][0], t[1][1], t[1][2]],
        [t[2][0], t[2][1], t[2][2]],
    ];
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < 1e-12 {
        return Err(FixelError::Numerical(
            "image transform is singular".to_string(),
        ));
    }
    let inv_det = 1.0 / det;
    let inv = [
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ];
    let mut out = [[0.0; 4]; 3];
    for i in 0..3 {
        out[i][..3].copy_from_slice(&inv[i]);
        out[i][3] = -(inv[i][0] * t[0][3] + inv[i][1] * t[1][3] + inv[i][2] * t[2][3]);
    }
    Ok(out)
}

impl FixelAtlas {
    /// Build an atlas from an index image and a directions image
    pub fn from_images(index: &MifImage, directions: &MifImage) -> FixelResult<Self> {
        if index.dim.len() != 4 || index.dim[3] != 2 {
            return Err(FixelError::InputInvalid(format!(
                "index image must be 4D with 2 channels, got dimensions {:?}",
                index.dim
            )));
        }
        let dim = [index.dim[0], index.dim[1], index.dim[2]];
        let num_voxels = dim[0] * dim[1] * dim[2];

        let counts: Vec<u32> = index.data[..num_voxels].iter().map(|&v| v as u32).collect();
        let offsets: Vec<u32> = index.data[num_voxels..].iter().map(|&v| v as u32).collect();

        let num_fixels: usize = counts.iter().map(|&c| c as usize).sum();
        if num_fixels == 0 {
            return Err(FixelError::InputInvalid(
                "index image contains no fixels".to_string(),
            ));
        }

        if directions.dim.len() < 2 || directions.dim[1] != 3 || directions.dim[0] != num_fixels {
            return Err(FixelError::InputInvalid(format!(
                "directions image must be {} x 3, got dimensions {:?}",
                num_fixels, directions.dim
            )));
        }

        // Directions are stored with fixels along axis 0
        let mut dirs = Vec::with_capacity(num_fixels);
        for fixel in 0..num_fixels {
            let d = [
                directions.data[fixel],
                directions.data[num_fixels + fixel],
                directions.data[2 * num_fixels + fixel],
            ];
            let norm = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
            if norm < 1e-12 {
                return Err(FixelError::InputInvalid(format!(
                    "fixel {} has a zero direction vector",
                    fixel
                )));
            }
            dirs.push([d[0] / norm, d[1] / norm, d[2] / norm]);
        }

        let vox = [index.vox[0], index.vox[1], index.vox[2]];
        let v2s = voxel2scanner(&index.transform, &vox);
        let scanner2voxel = invert_transform(&v2s)?;

        // Every fixel takes the scanner position of its voxel centre
        let mut positions = vec![[0.0; 3]; num_fixels];
        let mut covered = vec![false; num_fixels];
        for k in 0..dim[2] {
            for j in 0..dim[1] {
                for i in 0..dim[0] {
                    let voxel = i + j * dim[0] + k * dim[0] * dim[1];
                    let count = counts[voxel] as usize;
                    if count == 0 {
                        continue;
                    }
                    let offset = offsets[voxel] as usize;
                    if offset + count > num_fixels {
                        return Err(FixelError::InputInvalid(format!(
                            "index offset {}+{} exceeds fixel count {}",
                            offset, count, num_fixels
                        )));
                    }
                    let pos = apply_transform(&v2s, [i as f64, j as f64, k as f64]);
                    for f in offset..offset + count {
                        if covered[f] {
                            return Err(FixelError::InputInvalid(format!(
                                "fixel {} is referenced by more than one voxel",
                                f
                            )));
                        }
                        covered[f] = true;
                        positions[f] = pos;
                    }
                }
            }
        }
        if covered.iter().any(|&c| !c) {
            return Err(FixelError::InputInvalid(
                "index voxel offsets do not cover the fixel table".to_string(),
            ));
        }

        Ok(FixelAtlas {
            num_fixels,
            dim,
            vox,
            counts,
            offsets,
            positions,
            directions: dirs,
            scanner2voxel,
        })
    }

    /// Load an atlas from a fixel directory containing index.mif and directions.mif
    pub fn load(fixel_directory: &Path) -> FixelResult<Self> {
        let index = MifImage::load(&find_file(fixel_directory, "index")?)?;
        let directions = MifImage::load(&find_file(fixel_directory, "directions")?)?;
        Self::from_images(&index, &directions)
    }

    /// Build an atlas programmatically: voxel fixel counts in canonical order
    /// (axis 0 fastest) with offsets assigned by prefix sum, directions one per
    /// fixel, positions at voxel centres under the given transform.
    pub fn from_parts(
        dim: [usize; 3],
        vox: [f64; 3],
        transform: [[f64; 4]; 3],
        counts: Vec<u32>,
        directions: Vec<[f64; 3]>,
    ) -> FixelResult<Self> {
        let num_voxels = dim[0] * dim[1] * dim[2];
        if counts.len() != num_voxels {
            return Err(FixelError::InputInvalid(format!(
                "expected {} voxel counts, got {}",
                num_voxels,
                counts.len()
            )));
        }
        let mut index_data = Vec::with_capacity(2 * num_voxels);
        index_data.extend(counts.iter().map(|&c| c as f64));
        let mut offset = 0u32;
        for &c in &counts {
            index_data.push(offset as f64);
            offset += c;
        }
        let num_fixels = offset as usize;
        if directions.len() != num_fixels {
            return Err(FixelError::InputInvalid(format!(
                "expected {} directions, got {}",
                num_fixels,
                directions.len()
            )));
        }
        let index = MifImage {
            dim: vec![dim[0], dim[1], dim[2], 2],
            vox: vec![vox[0], vox[1], vox[2], 1.0],
            transform,
            datatype: crate::mif::Datatype::UInt32LE,
            keyval: Vec::new(),
            data: index_data,
        };
        let mut dir_data = Vec::with_capacity(3 * num_fixels);
        for axis in 0..3 {
            dir_data.extend(directions.iter().map(|d| d[axis]));
        }
        let directions_image = MifImage {
            dim: vec![num_fixels, 3],
            vox: vec![1.0, 1.0],
            transform: crate::mif::identity_transform(),
            datatype: crate::mif::Datatype::Float32LE,
            keyval: Vec::new(),
            data: dir_data,
        };
        Self::from_images(&index, &directions_image)
    }

    /// Total number of fixels in the template
    pub fn num_fixels(&self) -> usize {
        self.num_fixels
    }

    /// Spatial dimensions of the index image
    pub fn dim(&self) -> [usize; 3] {
        self.dim
    }

    /// Voxel spacing of the index image (mm)
    pub fn vox(&self) -> [f64; 3] {
        self.vox
    }

    /// Scanner position (mm) of a fixel
    pub fn position(&self, fixel: usize) -> [f64; 3] {
        self.positions[fixel]
    }

    /// Unit direction of a fixel
    pub fn direction(&self, fixel: usize) -> [f64; 3] {
        self.directions[fixel]
    }

    /// Continuous voxel coordinates of a scanner-space point
    pub fn scanner_to_voxel(&self, point: [f64; 3]) -> [f64; 3] {
        apply_transform(&self.scanner2voxel, point)
    }

    /// The range of fixel indices within a voxel; empty when out of bounds
    pub fn fixels_in_voxel(&self, voxel: [i64; 3]) -> Range<usize> {
        if voxel[0] < 0
            || voxel[1] < 0
            || voxel[2] < 0
            || voxel[0] >= self.dim[0] as i64
            || voxel[1] >= self.dim[1] as i64
            || voxel[2] >= self.dim[2] as i64
        {
            return 0..0;
        }
        let index = voxel[0] as usize
            + voxel[1] as usize * self.dim[0]
            + voxel[2] as usize * self.dim[0] * self.dim[1];
        let offset = self.offsets[index] as usize;
        offset..offset + self.counts[index] as usize
    }
}

/// Copy the template index and directions images into the output directory,
/// creating it if absent
pub fn copy_index_and_directions(input: &Path, output: &Path) -> FixelResult<()> {
    std::fs::create_dir_all(output).map_err(|e| FixelError::io(output, e))?;
    for stem in ["index", "directions"] {
        let source = find_file(input, stem)?;
        let name = source.file_name().ok_or_else(|| {
            FixelError::InputInvalid(format!("malformed path \"{}\"", source.display()))
        })?;
        let target = output.join(name);
        std::fs::copy(&source, &target).map_err(|e| FixelError::io(&target, e))?;
    }
    Ok(())
}

fn find_file(directory: &Path, stem: &str) -> FixelResult<PathBuf> {
    for name in [format!("{}.mif", stem), format!("{}.mif.gz", stem)] {
        let candidate = directory.join(&name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(FixelError::InputInvalid(format!(
        "fixel directory \"{}\" contains no {}.mif",
        directory.display(),
        stem
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mif::identity_transform;

    fn line_atlas() -> FixelAtlas {
        // 4 voxels along x, one +x fixel in each
        FixelAtlas::from_parts(
            [4, 1, 1],
            [1.0, 1.0, 1.0],
            identity_transform(),
            vec![1, 1, 1, 1],
            vec![[1.0, 0.0, 0.0]; 4],
        )
        .unwrap()
    }

    #[test]
    fn test_atlas_lookup() {
        let atlas = line_atlas();
        assert_eq!(atlas.num_fixels(), 4);
        assert_eq!(atlas.fixels_in_voxel([2, 0, 0]), 2..3);
        assert_eq!(atlas.fixels_in_voxel([5, 0, 0]), 0..0);
        assert_eq!(atlas.fixels_in_voxel([-1, 0, 0]), 0..0);
        assert_eq!(atlas.position(3), [3.0, 0.0, 0.0]);
        assert_eq!(atlas.direction(0), [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_voxel_membership_round_trip() {
        // Mixed counts: reconstruct voxel membership by iterating all voxels
        let atlas = FixelAtlas::from_parts(
            [2, 2, 1],
            [1.0, 1.0, 1.0],
            identity_transform(),
            vec![2, 0, 1, 3],
            vec![
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
            ],
        )
        .unwrap();
        let mut seen = vec![false; atlas.num_fixels()];
        for k in 0..1i64 {
            for j in 0..2i64 {
                for i in 0..2i64 {
                    for fixel in atlas.fixels_in_voxel([i, j, k]) {
                        assert!(!seen[fixel], "fixel {} in two voxels", fixel);
                        seen[fixel] = true;
                    }
                }
            }
        }
        assert!(seen.iter().all(|&s| s), "all fixels recovered");
    }

    #[test]
    fn test_scanner_to_voxel_inverse() {
        let transform = [
            [0.0, -1.0, 0.0, 10.0],
            [1.0, 0.0, 0.0, -5.0],
            [0.0, 0.0, 1.0, 2.0],
        ];
        let atlas = FixelAtlas::from_parts(
            [2, 2, 2],
            [2.0, 2.0, 2.0],
            transform,
            vec![1; 8],
            vec![[0.0, 0.0, 1.0]; 8],
        )
        .unwrap();
        // Voxel (1,1,0): position should invert back to the voxel index
        let pos = atlas.position(3);
        let voxel = atlas.scanner_to_voxel(pos);
        assert!((voxel[0] - 1.0).abs() < 1e-9, "got {:?}", voxel);
        assert!((voxel[1] - 1.0).abs() < 1e-9, "got {:?}", voxel);
        assert!(voxel[2].abs() < 1e-9, "got {:?}", voxel);
    }

    #[test]
    fn test_rejects_direction_count_mismatch() {
        let result = FixelAtlas::from_parts(
            [2, 1, 1],
            [1.0, 1.0, 1.0],
            identity_transform(),
            vec![1, 1],
            vec![[1.0, 0.0, 0.0]; 3],
        );
        assert!(result.is_err());
    }
}
