//! Octree file persistence
//!
//! Layout (little-endian):
//!
//! ```text
//! center:   f32[3]
//! count:    u64                  number of u32 descriptor words
//! repeated: comp_size u64, LZ4 block of comp_size bytes
//! ```
//!
//! Each block holds up to 64 MiB of uncompressed descriptor words and is an
//! independent `lz4_flex` size-prepended segment.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::core::error::Error;
use crate::core::types::{Result, Vec3};
use crate::octree::tree::VoxelOctree;

const SEGMENT_WORDS: usize = 64 * 1024 * 1024 / 4;

pub fn save(tree: &VoxelOctree, path: &Path) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = BufWriter::new(file);

    let center = tree.center();
    for component in [center.x, center.y, center.z] {
        writer
            .write_all(&component.to_le_bytes())
            .map_err(|e| Error::io(path, e))?;
    }
    writer
        .write_all(&(tree.words().len() as u64).to_le_bytes())
        .map_err(|e| Error::io(path, e))?;

    for segment in tree.words().chunks(SEGMENT_WORDS) {
        let compressed = lz4_flex::compress_prepend_size(bytemuck::cast_slice(segment));
        writer
            .write_all(&(compressed.len() as u64).to_le_bytes())
            .map_err(|e| Error::io(path, e))?;
        writer
            .write_all(&compressed)
            .map_err(|e| Error::io(path, e))?;
    }

    writer.flush().map_err(|e| Error::io(path, e))?;
    log::info!(
        "saved octree {}: {} words ({} KiB packed)",
        path.display(),
        tree.words().len(),
        tree.memory_usage() / 1024
    );
    Ok(())
}

pub fn load(path: &Path) -> Result<VoxelOctree> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::new(file);

    let mut header = [0u8; 20];
    reader
        .read_exact(&mut header)
        .map_err(|e| Error::io(path, e))?;
    let center = Vec3::new(
        f32::from_le_bytes(header[0..4].try_into().unwrap()),
        f32::from_le_bytes(header[4..8].try_into().unwrap()),
        f32::from_le_bytes(header[8..12].try_into().unwrap()),
    );
    let count = u64::from_le_bytes(header[12..20].try_into().unwrap());
    if count == 0 {
        return Err(Error::CorruptOctree(format!(
            "{}: zero descriptor words",
            path.display()
        )));
    }

    let mut words = vec![0u32; count as usize];
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words);
    let total = bytes.len();

    let mut consumed = 0usize;
    while consumed < total {
        let mut size_bytes = [0u8; 8];
        reader.read_exact(&mut size_bytes).map_err(|_| {
            Error::CorruptOctree(format!(
                "{}: stream ends at byte {} of {}",
                path.display(),
                consumed,
                total
            ))
        })?;
        let comp_size = u64::from_le_bytes(size_bytes) as usize;
        // A segment never compresses to more than its uncompressed size
        // plus the lz4 worst-case expansion
        if comp_size > SEGMENT_WORDS * 4 + SEGMENT_WORDS / 64 + 64 {
            return Err(Error::CorruptOctree(format!(
                "{}: segment of {} bytes",
                path.display(),
                comp_size
            )));
        }

        let mut compressed = vec![0u8; comp_size];
        reader.read_exact(&mut compressed).map_err(|_| {
            Error::CorruptOctree(format!("{}: truncated segment", path.display()))
        })?;

        let segment = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| Error::CorruptOctree(format!("{}: {}", path.display(), e)))?;
        if consumed + segment.len() > total {
            return Err(Error::CorruptOctree(format!(
                "{}: segments exceed declared {} words",
                path.display(),
                count
            )));
        }
        bytes[consumed..consumed + segment.len()].copy_from_slice(&segment);
        consumed += segment.len();
    }

    log::info!("loaded octree {}: {} words", path.display(), count);
    Ok(VoxelOctree::new(words, center))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(words: usize) -> VoxelOctree {
        let words: Vec<u32> = (0..words as u32).map(|i| i.wrapping_mul(2654435761)).collect();
        VoxelOctree::new(words, Vec3::new(0.5, 0.25, 0.5))
    }

    #[test]
    fn test_roundtrip_is_bitwise_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.oct");

        let tree = sample_tree(10_000);
        save(&tree, &path).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.words(), tree.words());
        assert_eq!(loaded.center(), tree.center());
    }

    #[test]
    fn test_truncated_stream_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.oct");

        let tree = sample_tree(4096);
        save(&tree, &path).unwrap();

        // Drop the tail of the file: the declared count can no longer be
        // satisfied
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(load(&path), Err(Error::CorruptOctree(_))));
    }

    #[test]
    fn test_overlong_declared_count_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.oct");

        let tree = sample_tree(64);
        save(&tree, &path).unwrap();

        // Inflate the declared word count past what the segments provide
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[12..20].copy_from_slice(&(1_000_000u64).to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(load(&path), Err(Error::CorruptOctree(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(&dir.path().join("nope.oct")),
            Err(Error::Io { .. })
        ));
    }
}
