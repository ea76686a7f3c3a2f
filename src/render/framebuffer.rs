//! Framebuffer presentation seam
//!
//! The windowing and event layer is an external collaborator: the renderer
//! only needs somewhere to publish finished frames and a snapshot of user
//! input in return. Pixels are packed 0xAARRGGBB.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::core::error::Error;
use crate::core::types::Result;

/// Input gathered since the previous frame
#[derive(Clone, Copy, Debug, Default)]
pub struct InputState {
    pub quit: bool,
    pub mouse_dx: f32,
    pub mouse_dy: f32,
    /// Rotate drag
    pub button0: bool,
    /// Zoom drag
    pub button1: bool,
}

/// Double-buffered framebuffer consumer
pub trait FramebufferSink {
    /// Publish the finished frame; returns the input collected since the
    /// last call.
    fn present(&mut self, pixels: &[u32], width: usize, height: usize) -> InputState;
}

/// Sink without a window: renders a fixed number of frames, keeps the last
/// one, and optionally writes it out as a PPM screenshot.
pub struct HeadlessSink {
    max_frames: usize,
    frames: usize,
    screenshot: Option<PathBuf>,
    last_frame: Vec<u32>,
}

impl HeadlessSink {
    pub fn new(max_frames: usize, screenshot: Option<PathBuf>) -> Self {
        Self {
            max_frames,
            frames: 0,
            screenshot,
            last_frame: Vec::new(),
        }
    }

    pub fn frames_presented(&self) -> usize {
        self.frames
    }

    pub fn last_frame(&self) -> &[u32] {
        &self.last_frame
    }
}

impl FramebufferSink for HeadlessSink {
    fn present(&mut self, pixels: &[u32], width: usize, height: usize) -> InputState {
        self.frames += 1;
        self.last_frame = pixels.to_vec();

        let done = self.frames >= self.max_frames;
        if done {
            if let Some(path) = &self.screenshot {
                if let Err(e) = write_ppm(path, pixels, width, height) {
                    log::error!("screenshot failed: {}", e);
                } else {
                    log::info!("wrote screenshot {}", path.display());
                }
            }
        }

        InputState {
            quit: done,
            ..InputState::default()
        }
    }
}

/// Write a frame as binary PPM (P6)
pub fn write_ppm(path: &Path, pixels: &[u32], width: usize, height: usize) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = BufWriter::new(file);

    write!(writer, "P6\n{} {}\n255\n", width, height).map_err(|e| Error::io(path, e))?;
    for &pixel in pixels {
        let rgb = [
            (pixel >> 16) as u8,
            (pixel >> 8) as u8,
            pixel as u8,
        ];
        writer.write_all(&rgb).map_err(|e| Error::io(path, e))?;
    }
    writer.flush().map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_sink_quits_after_max_frames() {
        let mut sink = HeadlessSink::new(2, None);
        let frame = vec![0u32; 4];
        assert!(!sink.present(&frame, 2, 2).quit);
        assert!(sink.present(&frame, 2, 2).quit);
        assert_eq!(sink.frames_presented(), 2);
    }

    #[test]
    fn test_ppm_header_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.ppm");
        let pixels = vec![0x00FF8040u32; 6];
        write_ppm(&path, &pixels, 3, 2).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"P6\n3 2\n255\n"));
        assert_eq!(bytes.len(), 11 + 6 * 3);
        // First pixel decodes back to (R, G, B) = (255, 128, 64)
        assert_eq!(&bytes[11..14], &[0xFF, 0x80, 0x40]);
    }
}
