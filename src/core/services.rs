//! Collaborators the orchestrator talks to but does not implement itself
//!
//! - [`ImageService`] - thumbnails of local images and Exif date-taken
//! - [`TrashMover`] - moving local copies out of the way when the card's
//!   original is gone
//! - [`Notifier`] - audible cue at the end of a cycle
//!
//! Each has a default implementation good enough for the command-line tool.

use crate::core::error::{Result, SyncError};
use crate::core::exif;
use crate::core::tracking::suffixed_name;
use chrono::NaiveDateTime;
use image::codecs::jpeg::JpegEncoder;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the trash folder created inside the destination
pub const TRASH_FOLDER: &str = ".trash";

// =============================================================================
// Images
// =============================================================================

pub trait ImageService: Send + Sync {
    /// Thumbnail (JPEG bytes) of a local image file
    fn local_thumbnail(&self, path: &Path) -> Result<Vec<u8>>;

    /// When the photo in `data` was taken, if the file says so
    fn date_taken(&self, data: &[u8]) -> Option<NaiveDateTime>;
}

/// Reads Exif; falls back to decoding and downscaling the image
#[derive(Debug, Clone)]
pub struct ExifImageService {
    pub max_width: u32,
    pub max_height: u32,
    pub quality: u8,
}

impl Default for ExifImageService {
    fn default() -> Self {
        Self {
            max_width: 160,
            max_height: 120,
            quality: 80,
        }
    }
}

impl ExifImageService {
    fn synthesize(&self, data: &[u8], path: &Path) -> Result<Vec<u8>> {
        let img = image::load_from_memory(data).map_err(|e| {
            SyncError::unexpected(format!("Failed to decode {}", path.display()), e)
        })?;
        let thumb = img.thumbnail(self.max_width, self.max_height).to_rgb8();

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(&thumb)
            .map_err(|e| {
                SyncError::unexpected(format!("Failed to encode thumbnail of {}", path.display()), e)
            })?;
        Ok(out)
    }
}

impl ImageService for ExifImageService {
    fn local_thumbnail(&self, path: &Path) -> Result<Vec<u8>> {
        let data = fs::read(path)
            .map_err(|e| SyncError::Io(format!("Failed to read {}: {}", path.display(), e)))?;

        if let Some(embedded) = exif::embedded_thumbnail(&data) {
            debug!("Using embedded thumbnail of {}", path.display());
            return Ok(embedded);
        }
        self.synthesize(&data, path)
    }

    fn date_taken(&self, data: &[u8]) -> Option<NaiveDateTime> {
        exif::date_taken(data)
    }
}

/// No thumbnails, no dates
#[derive(Debug, Clone, Copy, Default)]
pub struct NoImageService;

impl ImageService for NoImageService {
    fn local_thumbnail(&self, path: &Path) -> Result<Vec<u8>> {
        Err(SyncError::Io(format!(
            "No image support to read {}",
            path.display()
        )))
    }

    fn date_taken(&self, _data: &[u8]) -> Option<NaiveDateTime> {
        None
    }
}

// =============================================================================
// Trash
// =============================================================================

pub trait TrashMover: Send + Sync {
    /// Move a local file to the trash
    fn move_to_trash(&self, path: &Path) -> Result<()>;
}

/// Moves files into `<root>/.trash`, keeping their path below `root`
#[derive(Debug, Clone)]
pub struct FolderTrash {
    root: PathBuf,
}

impl FolderTrash {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.root.join(TRASH_FOLDER)
    }

    fn target_for(&self, path: &Path) -> PathBuf {
        let relative = path
            .strip_prefix(&self.root)
            .ok()
            .map(Path::to_path_buf)
            .or_else(|| path.file_name().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("unnamed"));
        let base = self.trash_dir().join(relative);

        let name = match base.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return base,
        };
        let mut candidate = base.clone();
        let mut suffix = 0;
        while candidate.exists() {
            suffix += 1;
            candidate = base.with_file_name(suffixed_name(&name, suffix));
        }
        candidate
    }
}

impl TrashMover for FolderTrash {
    fn move_to_trash(&self, path: &Path) -> Result<()> {
        let target = self.target_for(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if fs::rename(path, &target).is_err() {
            // different volume: copy then remove
            fs::copy(path, &target).map_err(|e| {
                SyncError::Io(format!("Failed to move {} to trash: {}", path.display(), e))
            })?;
            fs::remove_file(path)?;
        }
        info!("Moved {} to {}", path.display(), target.display());
        Ok(())
    }
}

// =============================================================================
// Notification
// =============================================================================

/// End-of-cycle cue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sound {
    Done,
    Error,
    Interrupted,
}

pub trait Notifier: Send + Sync {
    fn play(&self, sound: Sound);
}

/// Writes the cue to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn play(&self, sound: Sound) {
        match sound {
            Sound::Done => info!("Sync cycle finished"),
            Sound::Interrupted => warn!("Sync cycle interrupted by the connection"),
            Sound::Error => warn!("Sync cycle failed"),
        }
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// The collaborators handed to an orchestrator
#[derive(Clone)]
pub struct Services {
    pub images: Arc<dyn ImageService>,
    pub trash: Arc<dyn TrashMover>,
    pub notifier: Arc<dyn Notifier>,
}

impl Services {
    /// Exif thumbnails, `.trash` inside `destination`, log cues
    pub fn standard(destination: &Path) -> Self {
        Self {
            images: Arc::new(ExifImageService::default()),
            trash: Arc::new(FolderTrash::new(destination)),
            notifier: Arc::new(LogNotifier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdb::generator::{encode_test_image, generate_jpeg, JpegSpec};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    #[test]
    fn test_embedded_thumbnail_is_preferred() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("IMG_0001.JPG");
        let data = generate_jpeg(&JpegSpec::default());
        fs::write(&path, &data).unwrap();

        let thumbnail = ExifImageService::default().local_thumbnail(&path).unwrap();
        assert_eq!(Some(thumbnail), exif::embedded_thumbnail(&data));
    }

    #[test]
    fn test_thumbnail_is_synthesized_without_exif() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("IMG_0002.JPG");
        fs::write(&path, encode_test_image(640, 480)).unwrap();

        let thumbnail = ExifImageService::default().local_thumbnail(&path).unwrap();
        let decoded = image::load_from_memory(&thumbnail).unwrap();
        assert!(decoded.width() <= 160 && decoded.height() <= 120);
    }

    #[test]
    fn test_undecodable_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.jpg");
        fs::write(&path, b"definitely not an image").unwrap();

        assert!(ExifImageService::default().local_thumbnail(&path).is_err());
        assert!(NoImageService.local_thumbnail(&path).is_err());
    }

    #[test]
    fn test_date_taken() {
        let taken = NaiveDate::from_ymd_opt(2022, 5, 6)
            .unwrap()
            .and_hms_opt(7, 8, 9)
            .unwrap();
        let data = generate_jpeg(&JpegSpec {
            date_taken: Some(taken),
            ..JpegSpec::default()
        });
        assert_eq!(ExifImageService::default().date_taken(&data), Some(taken));
        assert_eq!(NoImageService.date_taken(&data), None);
    }

    #[test]
    fn test_folder_trash_keeps_relative_path() {
        let dir = TempDir::new().unwrap();
        let folder = dir.path().join("20240101");
        fs::create_dir_all(&folder).unwrap();
        let file = folder.join("IMG_0001.JPG");
        fs::write(&file, b"one").unwrap();

        let trash = FolderTrash::new(dir.path());
        trash.move_to_trash(&file).unwrap();

        assert!(!file.exists());
        let moved = trash.trash_dir().join("20240101").join("IMG_0001.JPG");
        assert_eq!(fs::read(moved).unwrap(), b"one");
    }

    #[test]
    fn test_folder_trash_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let trash = FolderTrash::new(dir.path());

        for content in [b"first", b"other"] {
            let file = dir.path().join("IMG_0001.JPG");
            fs::write(&file, content).unwrap();
            trash.move_to_trash(&file).unwrap();
        }

        assert_eq!(
            fs::read(trash.trash_dir().join("IMG_0001.JPG")).unwrap(),
            b"first"
        );
        assert_eq!(
            fs::read(trash.trash_dir().join("IMG_0001_1.JPG")).unwrap(),
            b"other"
        );
    }
}
