//! Directory-of-images frame source.
//!
//! Frame `i` is the `i`th JPEG/PNG file in the directory, ordered by file name.
//! Files are decoded on demand, so skipped frames are never read.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub struct ImageSequenceSource {
    root: PathBuf,
    name: String,
    files: Option<Vec<PathBuf>>,
    frames_grabbed: u64,
}

impl ImageSequenceSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            name: root.display().to_string(),
            root,
            files: None,
            frames_grabbed: 0,
        }
    }
}

fn list_images(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(root)
        .with_context(|| format!("failed to read image directory {}", root.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

impl FrameSource for ImageSequenceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        let files = list_images(&self.root)?;
        log::info!(
            "frame source: {} ({} image frames)",
            self.root.display(),
            files.len()
        );
        self.files = Some(files);
        Ok(())
    }

    fn length_in_frames(&self) -> Option<u64> {
        self.files.as_ref().map(|files| files.len() as u64)
    }

    fn grab(&mut self, index: u64) -> Result<Option<Frame>> {
        let files = self
            .files
            .as_ref()
            .ok_or_else(|| anyhow!("image source not started; call start() first"))?;
        let Some(path) = usize::try_from(index).ok().and_then(|i| files.get(i)) else {
            return Ok(None);
        };
        let image = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .into_rgb8();
        self.frames_grabbed += 1;
        Ok(Some(Frame::new(index, crate::now_ms()?, image)))
    }

    fn stop(&mut self) -> Result<()> {
        self.files = None;
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_grabbed: self.frames_grabbed,
            source: self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn reads_images_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, value) in [("b.png", 20u8), ("a.png", 10), ("c.jpg", 30)] {
            RgbImage::from_pixel(8, 4, Rgb([value, value, value]))
                .save(dir.path().join(name))
                .unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = ImageSequenceSource::new(dir.path());
        assert_eq!(source.length_in_frames(), None);
        source.start().unwrap();
        assert_eq!(source.length_in_frames(), Some(3));

        let first = source.grab(0).unwrap().unwrap();
        assert_eq!(first.image.get_pixel(0, 0), &Rgb([10, 10, 10]));
        let second = source.grab(1).unwrap().unwrap();
        assert_eq!(second.image.get_pixel(0, 0), &Rgb([20, 20, 20]));
        let third = source.grab(2).unwrap().unwrap();
        assert_eq!((third.width(), third.height()), (8, 4));
        assert!(source.grab(3).unwrap().is_none());
        assert_eq!(source.stats().frames_grabbed, 3);
    }

    #[test]
    fn undecodable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        let mut source = ImageSequenceSource::new(dir.path());
        source.start().unwrap();
        assert!(source.grab(0).is_err());
    }
}
