//! Mock data generator for card files
//!
//! Produces file content that looks enough like real camera output for the
//! synchronizer: JPEGs carry a proper Exif block (date taken, modification
//! date and an optional embedded thumbnail), everything else is seeded
//! pseudo-random bytes behind a recognisable header.
//!
//! Content is kept small; the listing reports the generated length.

use chrono::NaiveDateTime;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Default content size for JPEG test files
pub const TEST_JPEG_SIZE: usize = 2 * 1024;

/// Default content size for video test files
pub const TEST_VIDEO_SIZE: usize = 4 * 1024;

/// Stand-in for a camera-embedded thumbnail; only the JPEG markers matter
const EMBEDDED_THUMBNAIL: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x04, 0x00, 0x01, 0x54, 0x48, 0x55, 0x4D, 0xFF, 0xD9,
];

const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

// =============================================================================
// JPEG GENERATION
// =============================================================================

/// What to put into a generated JPEG
#[derive(Debug, Clone)]
pub struct JpegSpec {
    /// Exif DateTimeOriginal
    pub date_taken: Option<NaiveDateTime>,
    /// IFD0 DateTime
    pub modified: Option<NaiveDateTime>,
    pub embed_thumbnail: bool,
    /// Total file size; grown to fit the headers if too small
    pub size: usize,
    pub seed: u64,
}

impl Default for JpegSpec {
    fn default() -> Self {
        Self {
            date_taken: None,
            modified: None,
            embed_thumbnail: true,
            size: TEST_JPEG_SIZE,
            seed: 0,
        }
    }
}

fn exif_date(value: &NaiveDateTime) -> [u8; 20] {
    let mut bytes = [0u8; 20];
    let text = value.format(EXIF_DATE_FORMAT).to_string();
    bytes[..19].copy_from_slice(&text.as_bytes()[..19]);
    bytes
}

fn ifd_entry(tiff: &mut Vec<u8>, tag: u16, kind: u16, count: u32, value: u32) {
    tiff.extend_from_slice(&tag.to_le_bytes());
    tiff.extend_from_slice(&kind.to_le_bytes());
    tiff.extend_from_slice(&count.to_le_bytes());
    tiff.extend_from_slice(&value.to_le_bytes());
}

/// Little-endian TIFF block: IFD0, optional Exif IFD, optional IFD1, then data
fn build_tiff(spec: &JpegSpec) -> Vec<u8> {
    let ifd0_count = spec.modified.is_some() as u32 + spec.date_taken.is_some() as u32;
    let ifd0_pos = 8u32;
    let exif_pos = ifd0_pos + 2 + 12 * ifd0_count + 4;
    let exif_len = if spec.date_taken.is_some() { 18 } else { 0 };
    let ifd1_pos = exif_pos + exif_len;
    let ifd1_len = if spec.embed_thumbnail { 30 } else { 0 };

    let mut data_pos = ifd1_pos + ifd1_len;
    let modified_pos = data_pos;
    if spec.modified.is_some() {
        data_pos += 20;
    }
    let original_pos = data_pos;
    if spec.date_taken.is_some() {
        data_pos += 20;
    }
    let thumbnail_pos = data_pos;

    let mut tiff = Vec::new();
    tiff.extend_from_slice(b"II");
    tiff.extend_from_slice(&42u16.to_le_bytes());
    tiff.extend_from_slice(&ifd0_pos.to_le_bytes());

    // IFD0
    tiff.extend_from_slice(&(ifd0_count as u16).to_le_bytes());
    if spec.modified.is_some() {
        ifd_entry(&mut tiff, 0x0132, 2, 20, modified_pos);
    }
    if spec.date_taken.is_some() {
        ifd_entry(&mut tiff, 0x8769, 4, 1, exif_pos);
    }
    let next = if spec.embed_thumbnail { ifd1_pos } else { 0 };
    tiff.extend_from_slice(&next.to_le_bytes());

    // Exif IFD
    if spec.date_taken.is_some() {
        tiff.extend_from_slice(&1u16.to_le_bytes());
        ifd_entry(&mut tiff, 0x9003, 2, 20, original_pos);
        tiff.extend_from_slice(&0u32.to_le_bytes());
    }

    // IFD1
    if spec.embed_thumbnail {
        tiff.extend_from_slice(&2u16.to_le_bytes());
        ifd_entry(&mut tiff, 0x0201, 4, 1, thumbnail_pos);
        ifd_entry(&mut tiff, 0x0202, 4, 1, EMBEDDED_THUMBNAIL.len() as u32);
        tiff.extend_from_slice(&0u32.to_le_bytes());
    }

    if let Some(modified) = &spec.modified {
        tiff.extend_from_slice(&exif_date(modified));
    }
    if let Some(taken) = &spec.date_taken {
        tiff.extend_from_slice(&exif_date(taken));
    }
    if spec.embed_thumbnail {
        tiff.extend_from_slice(EMBEDDED_THUMBNAIL);
    }
    tiff
}

/// JPEG with an Exif APP1 segment and seeded filler
pub fn generate_jpeg(spec: &JpegSpec) -> Vec<u8> {
    let mut data = Vec::with_capacity(spec.size);

    // SOI
    data.extend_from_slice(&[0xFF, 0xD8]);

    // APP1 (Exif)
    let mut exif = b"Exif\0\0".to_vec();
    exif.extend_from_slice(&build_tiff(spec));
    data.extend_from_slice(&[0xFF, 0xE1]);
    data.extend_from_slice(&((exif.len() + 2) as u16).to_be_bytes());
    data.extend_from_slice(&exif);

    // APP0 (JFIF)
    data.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
    data.extend_from_slice(b"JFIF\0");
    data.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00]);

    fill_seeded(&mut data, spec.size.saturating_sub(2), spec.seed);

    // EOI
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

// =============================================================================
// OTHER FILES
// =============================================================================

/// Append deterministic pseudo-random bytes until `data` is `size` long
pub fn fill_seeded(data: &mut Vec<u8>, size: usize, seed: u64) {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    let mut current = hasher.finish();

    while data.len() < size {
        current = current.wrapping_mul(6364136223846793005).wrapping_add(1);
        data.push((current >> 33) as u8);
    }
}

/// Minimal QuickTime file
pub fn generate_mov(size: usize, seed: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    data.extend_from_slice(&20u32.to_be_bytes());
    data.extend_from_slice(b"ftypqt  ");
    data.extend_from_slice(&[0x00, 0x00, 0x02, 0x00]);
    data.extend_from_slice(b"qt  ");
    fill_seeded(&mut data, size, seed);
    data
}

/// Content for a file name, chosen by extension
pub fn generate_for_name(file_name: &str, date: NaiveDateTime, seed: u64) -> Vec<u8> {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => generate_jpeg(&JpegSpec {
            date_taken: Some(date),
            modified: Some(date),
            embed_thumbnail: true,
            size: TEST_JPEG_SIZE,
            seed,
        }),
        "mov" | "mp4" => generate_mov(TEST_VIDEO_SIZE, seed),
        _ => {
            let mut data = Vec::new();
            fill_seeded(&mut data, TEST_JPEG_SIZE / 2, seed);
            data
        }
    }
}

/// A real, decodable JPEG image of the given dimensions
pub fn encode_test_image(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, 128])
    });
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 85);
    // encoding an in-memory RGB buffer into a Vec does not fail
    let _ = encoder.encode_image(&image);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_jpeg_markers_and_size() {
        let data = generate_jpeg(&JpegSpec {
            date_taken: Some(date()),
            size: 1024,
            ..JpegSpec::default()
        });
        assert_eq!(data.len(), 1024);
        assert_eq!(&data[0..4], &[0xFF, 0xD8, 0xFF, 0xE1]);
        assert_eq!(&data[data.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_small_size_grows_to_fit_headers() {
        let data = generate_jpeg(&JpegSpec {
            size: 10,
            ..JpegSpec::default()
        });
        assert!(data.len() > 10);
        assert_eq!(&data[data.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_seeded_content_is_deterministic() {
        let a = generate_for_name("IMG_0001.JPG", date(), 1);
        let b = generate_for_name("IMG_0001.JPG", date(), 1);
        let c = generate_for_name("IMG_0001.JPG", date(), 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_mov_header() {
        let data = generate_for_name("MVI_0001.MOV", date(), 3);
        assert_eq!(data.len(), TEST_VIDEO_SIZE);
        assert_eq!(&data[4..8], b"ftyp");
        assert_eq!(&data[8..12], b"qt  ");
    }

    #[test]
    fn test_encoded_image_decodes() {
        let data = encode_test_image(64, 48);
        let decoded = image::load_from_memory(&data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }
}
