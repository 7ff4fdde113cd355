//! `root/<class_name>/<image>` directory datasets.

use std::fs;
use std::path::{Path, PathBuf};

use image::ImageFormat;

use super::{DatasetError, ImageDataset, ImageRecord, RecordImage};
use crate::labels::LabelMap;

/// Load an image-folder dataset.
///
/// Class names are the sorted sub-directory names; files inside each class are
/// sorted too, so the record order does not depend on the filesystem.
pub(crate) fn load_image_folder(root: &Path) -> Result<ImageDataset, DatasetError> {
    let mut class_dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    class_dirs.sort();

    let names: Vec<String> = class_dirs
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect();
    if names.is_empty() {
        return Err(DatasetError::Empty);
    }
    let labels = LabelMap::from_names(names)?;

    let mut records = Vec::new();
    for (label, dir) in class_dirs.iter().enumerate() {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && ImageFormat::from_path(p).is_ok())
            .collect();
        files.sort();

        tracing::debug!(class = %labels.name(label as u32).unwrap_or_default(), images = files.len(), "scanned class directory");
        records.extend(
            files
                .into_iter()
                .map(|p| ImageRecord::new(RecordImage::Path(p), label as u32)),
        );
    }

    if records.is_empty() {
        return Err(DatasetError::Empty);
    }

    ImageDataset::new(records, labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(path: &Path) {
        image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_load_image_folder() {
        let dir = tempfile::tempdir().unwrap();
        for class in ["dog", "cat"] {
            fs::create_dir(dir.path().join(class)).unwrap();
            for i in 0..3 {
                write_png(&dir.path().join(class).join(format!("{i}.png")));
            }
        }
        fs::write(dir.path().join("cat").join("notes.txt"), "not an image").unwrap();

        let ds = load_image_folder(dir.path()).unwrap();
        assert_eq!(ds.labels().names(), &["cat", "dog"]);
        assert_eq!(ds.len(), 6);
        assert_eq!(ds.get(0).unwrap().label, 0);
        assert_eq!(ds.get(5).unwrap().label, 1);
        assert_eq!(ds.get(0).unwrap().decode().unwrap().width(), 4);
    }

    #[test]
    fn test_empty_folder() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_image_folder(dir.path()),
            Err(DatasetError::Empty)
        ));
    }
}
