use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};

use crate::PredictError;

/// Location of output `index`. Stable across calls, so a later call
/// overwrites the files of an earlier one.
pub fn output_path(scratch_dir: &Path, index: usize) -> PathBuf {
    scratch_dir.join(format!("out-{index}.png"))
}

/// Writes `images` as PNGs in batch order.
///
/// On failure the files already written by this call are removed, so a
/// failed call never leaves a partial batch behind.
pub fn write_batch(scratch_dir: &Path, images: &[DynamicImage]) -> Result<Vec<PathBuf>, PredictError> {
    if let Err(e) = std::fs::create_dir_all(scratch_dir) {
        return Err(PredictError::Output {
            path: scratch_dir.to_path_buf(),
            source: image::ImageError::IoError(e),
        });
    }
    let mut written = Vec::with_capacity(images.len());
    for (index, image) in images.iter().enumerate() {
        let path = output_path(scratch_dir, index);
        if let Err(source) = image.save_with_format(&path, ImageFormat::Png) {
            for done in written.iter().chain(std::iter::once(&path)) {
                let _ = std::fs::remove_file(done);
            }
            return Err(PredictError::Output { path, source });
        }
        tracing::debug!("wrote {}", path.display());
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn solid(value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, image::Rgb([value, value, value])))
    }

    #[test]
    fn writes_indexed_pngs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_batch(dir.path(), &[solid(0), solid(255)]).unwrap();
        assert_eq!(paths, vec![dir.path().join("out-0.png"), dir.path().join("out-1.png")]);
        let second = image::open(&paths[1]).unwrap().to_rgb8();
        assert_eq!(second.get_pixel(0, 0).0, [255, 255, 255]);
    }

    #[test]
    fn creates_missing_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let paths = write_batch(&nested, &[solid(1)]).unwrap();
        assert!(paths[0].is_file());
    }

    #[test]
    fn overwrites_previous_outputs() {
        let dir = tempfile::tempdir().unwrap();
        write_batch(dir.path(), &[solid(10)]).unwrap();
        let paths = write_batch(dir.path(), &[solid(200)]).unwrap();
        let pixel = image::open(&paths[0]).unwrap().to_rgb8().get_pixel(0, 0).0;
        assert_eq!(pixel, [200, 200, 200]);
    }

    #[test]
    fn failed_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        // a directory squatting on out-1.png makes the second save fail
        std::fs::create_dir(dir.path().join("out-1.png")).unwrap();
        let err = write_batch(dir.path(), &[solid(0), solid(1)]).unwrap_err();
        assert!(matches!(err, PredictError::Output { .. }));
        assert!(!dir.path().join("out-0.png").exists());
    }
}
