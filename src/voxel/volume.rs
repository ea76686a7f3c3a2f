//! Dense voxel volume files
//!
//! Layout (little-endian): `W: u32, H: u32, D: u32` then `W*H*D` material
//! words, x fastest, z slowest. Used by on-disk builds as the intermediate
//! between voxelization and octree construction.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::voxel::VoxelSource;

const HEADER_BYTES: u64 = 12;

/// Read access to a dense voxel file, served block by block
pub struct VolumeFile {
    file: File,
    path: PathBuf,
    w: u32,
    h: u32,
    d: u32,
    block: (u32, u32, u32),
    row: Vec<u32>,
}

impl VolumeFile {
    pub fn open(path: &Path) -> Result<VolumeFile> {
        let mut file = File::open(path).map_err(|e| Error::io(path, e))?;

        let mut header = [0u8; HEADER_BYTES as usize];
        file.read_exact(&mut header).map_err(|e| Error::io(path, e))?;
        let w = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let h = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let d = u32::from_le_bytes(header[8..12].try_into().unwrap());

        log::info!("dense volume {}: {}x{}x{}", path.display(), w, h, d);

        Ok(VolumeFile {
            file,
            path: path.to_path_buf(),
            w,
            h,
            d,
            block: (0, 0, 0),
            row: Vec::new(),
        })
    }

    /// Read one x-run of `w` words at (x, y, z) into `dst`
    fn read_row(&mut self, dst: &mut [u32], x: u32, y: u32, z: u32) -> Result<()> {
        let index = x as u64 + self.w as u64 * (y as u64 + self.h as u64 * z as u64);
        self.file
            .seek(SeekFrom::Start(HEADER_BYTES + index * 4))
            .map_err(|e| Error::io(&self.path, e))?;
        self.file
            .read_exact(bytemuck::cast_slice_mut(dst))
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }
}

impl VoxelSource for VolumeFile {
    fn dims(&self) -> (u32, u32, u32) {
        (self.w, self.h, self.d)
    }

    fn begin_blocks(&mut self, block_w: u32, block_h: u32, block_d: u32) -> Result<()> {
        self.block = (block_w, block_h, block_d);
        self.row.resize(block_w as usize, 0);
        Ok(())
    }

    fn fill_block(
        &mut self,
        dst: &mut [u32],
        x: u32,
        y: u32,
        z: u32,
        w: u32,
        h: u32,
        d: u32,
    ) -> Result<()> {
        for zz in 0..d {
            for yy in 0..h {
                let offset = (yy as usize + zz as usize * h as usize) * w as usize;
                self.read_row(&mut dst[offset..offset + w as usize], x, y + yy, z + zz)?;
            }
        }
        Ok(())
    }

    fn block_empty(&mut self, x: u32, y: u32, z: u32) -> Result<bool> {
        let w = self.block.0.min(self.w.saturating_sub(x));
        let h = self.block.1.min(self.h.saturating_sub(y));
        let d = self.block.2.min(self.d.saturating_sub(z));
        if w == 0 || h == 0 || d == 0 {
            return Ok(true);
        }

        let mut row = std::mem::take(&mut self.row);
        let mut empty = true;
        'scan: for zz in 0..d {
            for yy in 0..h {
                self.read_row(&mut row[..w as usize], x, y + yy, z + zz)?;
                if row[..w as usize].iter().any(|&word| word != 0) {
                    empty = false;
                    break 'scan;
                }
            }
        }
        self.row = row;
        Ok(empty)
    }
}

/// Stream `source` into a dense voxel file, one z-slab at a time
pub fn write_dense(path: &Path, source: &mut dyn VoxelSource, slab_depth: u32) -> Result<()> {
    let (w, h, d) = source.dims();
    source.begin_blocks(w, h, slab_depth)?;

    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for dim in [w, h, d] {
        writer
            .write_all(&dim.to_le_bytes())
            .map_err(|e| Error::io(path, e))?;
    }

    let mut slab = vec![0u32; (w as usize) * (h as usize) * (slab_depth as usize)];
    let mut z = 0;
    while z < d {
        let depth = slab_depth.min(d - z);
        let words = (w as usize) * (h as usize) * (depth as usize);
        slab[..words].fill(0);
        source.fill_block(&mut slab[..words], 0, 0, z, w, h, depth)?;
        writer
            .write_all(bytemuck::cast_slice(&slab[..words]))
            .map_err(|e| Error::io(path, e))?;
        z += depth;
    }

    writer.flush().map_err(|e| Error::io(path, e))?;
    log::info!("wrote dense volume {} ({}x{}x{})", path.display(), w, h, d);
    Ok(())
}

/// Write a fully materialized volume (test and tooling helper)
pub fn write_raw(path: &Path, w: u32, h: u32, d: u32, words: &[u32]) -> Result<()> {
    assert_eq!(words.len(), (w as usize) * (h as usize) * (d as usize));

    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for dim in [w, h, d] {
        writer
            .write_all(&dim.to_le_bytes())
            .map_err(|e| Error::io(path, e))?;
    }
    writer
        .write_all(bytemuck::cast_slice(words))
        .map_err(|e| Error::io(path, e))?;
    writer.flush().map_err(|e| Error::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.dat");

        let (w, h, d) = (4u32, 3u32, 2u32);
        let words: Vec<u32> = (0..w * h * d).collect();
        write_raw(&path, w, h, d, &words).unwrap();

        let mut volume = VolumeFile::open(&path).unwrap();
        assert_eq!(volume.dims(), (w, h, d));
        volume.begin_blocks(2, 2, 2).unwrap();

        // Block at (2, 1, 0), clamped extents 2x2x2
        let mut dst = vec![0u32; 8];
        volume.fill_block(&mut dst, 2, 1, 0, 2, 2, 2).unwrap();
        // Expected words: index x + 4*(y + 3*z)
        assert_eq!(dst, vec![6, 7, 10, 11, 18, 19, 22, 23]);
    }

    #[test]
    fn test_block_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.dat");

        let (w, h, d) = (4u32, 4u32, 4u32);
        let mut words = vec![0u32; (w * h * d) as usize];
        words[(3 + 4 * (3 + 4 * 3)) as usize] = 42;
        write_raw(&path, w, h, d, &words).unwrap();

        let mut volume = VolumeFile::open(&path).unwrap();
        volume.begin_blocks(2, 2, 2).unwrap();
        assert!(volume.block_empty(0, 0, 0).unwrap());
        assert!(!volume.block_empty(2, 2, 2).unwrap());
        // Fully outside the volume
        assert!(volume.block_empty(4, 4, 4).unwrap());
    }
}
