//! Minimal Exif reader for JPEG files
//!
//! Only what the synchronizer needs: the date a photo was taken (used to
//! stamp the copied file) and the thumbnail the camera embedded in IFD1.
//! Both byte orders are supported; anything malformed yields `None`.

use chrono::NaiveDateTime;

const TAG_DATE_TIME: u16 = 0x0132;
const TAG_EXIF_IFD: u16 = 0x8769;
const TAG_DATE_TIME_ORIGINAL: u16 = 0x9003;
const TAG_THUMBNAIL_OFFSET: u16 = 0x0201;
const TAG_THUMBNAIL_LENGTH: u16 = 0x0202;

const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;

const EXIF_DATE_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// TIFF structure found inside a JPEG APP1 segment
pub struct ExifData<'a> {
    tiff: &'a [u8],
    little_endian: bool,
}

struct IfdEntry {
    tag: u16,
    kind: u16,
    count: u32,
    /// Position of the 4-byte value/offset field inside the TIFF block
    value_pos: usize,
}

impl<'a> ExifData<'a> {
    /// Locate the Exif block of a JPEG file
    pub fn from_jpeg(data: &'a [u8]) -> Option<Self> {
        if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
            return None;
        }

        let mut pos = 2;
        while pos + 4 <= data.len() {
            if data[pos] != 0xFF {
                return None;
            }
            let marker = data[pos + 1];
            // start of scan or end of image: no more metadata segments
            if marker == 0xDA || marker == 0xD9 {
                return None;
            }
            let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            if length < 2 || pos + 2 + length > data.len() {
                return None;
            }
            let segment = &data[pos + 4..pos + 2 + length];
            if marker == 0xE1 && segment.starts_with(b"Exif\0\0") {
                return Self::from_tiff(&segment[6..]);
            }
            pos += 2 + length;
        }
        None
    }

    /// Wrap a raw TIFF block (starting at the byte-order mark)
    pub fn from_tiff(tiff: &'a [u8]) -> Option<Self> {
        let little_endian = match tiff.get(0..2)? {
            b"II" => true,
            b"MM" => false,
            _ => return None,
        };
        let exif = Self {
            tiff,
            little_endian,
        };
        if exif.u16_at(2)? != 42 {
            return None;
        }
        Some(exif)
    }

    fn u16_at(&self, pos: usize) -> Option<u16> {
        let bytes: [u8; 2] = self.tiff.get(pos..pos + 2)?.try_into().ok()?;
        Some(if self.little_endian {
            u16::from_le_bytes(bytes)
        } else {
            u16::from_be_bytes(bytes)
        })
    }

    fn u32_at(&self, pos: usize) -> Option<u32> {
        let bytes: [u8; 4] = self.tiff.get(pos..pos + 4)?.try_into().ok()?;
        Some(if self.little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    }

    fn ifd0_offset(&self) -> Option<usize> {
        Some(self.u32_at(4)? as usize)
    }

    fn entries(&self, offset: usize) -> Option<Vec<IfdEntry>> {
        let count = self.u16_at(offset)? as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let pos = offset + 2 + i * 12;
            entries.push(IfdEntry {
                tag: self.u16_at(pos)?,
                kind: self.u16_at(pos + 2)?,
                count: self.u32_at(pos + 4)?,
                value_pos: pos + 8,
            });
        }
        Some(entries)
    }

    fn next_ifd(&self, offset: usize) -> Option<usize> {
        let count = self.u16_at(offset)? as usize;
        match self.u32_at(offset + 2 + count * 12)? {
            0 => None,
            next => Some(next as usize),
        }
    }

    fn find(&self, offset: usize, tag: u16) -> Option<IfdEntry> {
        self.entries(offset)?.into_iter().find(|e| e.tag == tag)
    }

    fn number(&self, entry: &IfdEntry) -> Option<u32> {
        if entry.kind == TYPE_SHORT {
            self.u16_at(entry.value_pos).map(u32::from)
        } else {
            self.u32_at(entry.value_pos)
        }
    }

    fn ascii(&self, entry: &IfdEntry) -> Option<&'a str> {
        if entry.kind != TYPE_ASCII {
            return None;
        }
        let len = entry.count as usize;
        let start = if len <= 4 {
            entry.value_pos
        } else {
            self.u32_at(entry.value_pos)? as usize
        };
        let bytes = self.tiff.get(start..start + len)?;
        let text = std::str::from_utf8(bytes).ok()?;
        Some(text.trim_end_matches('\0').trim())
    }

    fn date_from(&self, entry: &IfdEntry) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(self.ascii(entry)?, EXIF_DATE_FORMAT).ok()
    }

    /// DateTimeOriginal from the Exif IFD, else DateTime from IFD0
    pub fn date_taken(&self) -> Option<NaiveDateTime> {
        let ifd0 = self.ifd0_offset()?;

        let original = self
            .find(ifd0, TAG_EXIF_IFD)
            .and_then(|e| self.number(&e))
            .and_then(|offset| self.find(offset as usize, TAG_DATE_TIME_ORIGINAL))
            .and_then(|e| self.date_from(&e));
        if original.is_some() {
            return original;
        }

        self.find(ifd0, TAG_DATE_TIME)
            .and_then(|e| self.date_from(&e))
    }

    /// JPEG thumbnail stored in IFD1, if any
    pub fn thumbnail(&self) -> Option<&'a [u8]> {
        let ifd1 = self.next_ifd(self.ifd0_offset()?)?;
        let offset = self.number(&self.find(ifd1, TAG_THUMBNAIL_OFFSET)?)? as usize;
        let length = self.number(&self.find(ifd1, TAG_THUMBNAIL_LENGTH)?)? as usize;
        let thumbnail = self.tiff.get(offset..offset.checked_add(length)?)?;
        if thumbnail.starts_with(&[0xFF, 0xD8]) {
            Some(thumbnail)
        } else {
            None
        }
    }
}

/// Date-taken of a JPEG file's bytes
pub fn date_taken(data: &[u8]) -> Option<NaiveDateTime> {
    ExifData::from_jpeg(data)?.date_taken()
}

/// Embedded thumbnail of a JPEG file's bytes
pub fn embedded_thumbnail(data: &[u8]) -> Option<Vec<u8>> {
    ExifData::from_jpeg(data)?.thumbnail().map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdb::generator::{generate_jpeg, JpegSpec};
    use chrono::NaiveDate;

    fn taken() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 7, 14)
            .unwrap()
            .and_hms_opt(9, 30, 5)
            .unwrap()
    }

    #[test]
    fn test_date_taken_prefers_original() {
        let data = generate_jpeg(&JpegSpec {
            date_taken: Some(taken()),
            modified: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0),
            ..JpegSpec::default()
        });
        assert_eq!(date_taken(&data), Some(taken()));
    }

    #[test]
    fn test_date_taken_falls_back_to_ifd0() {
        let data = generate_jpeg(&JpegSpec {
            date_taken: None,
            modified: Some(taken()),
            ..JpegSpec::default()
        });
        assert_eq!(date_taken(&data), Some(taken()));
    }

    #[test]
    fn test_embedded_thumbnail() {
        let data = generate_jpeg(&JpegSpec {
            embed_thumbnail: true,
            ..JpegSpec::default()
        });
        let thumbnail = embedded_thumbnail(&data).unwrap();
        assert_eq!(&thumbnail[..2], &[0xFF, 0xD8]);
        assert_eq!(&thumbnail[thumbnail.len() - 2..], &[0xFF, 0xD9]);

        let bare = generate_jpeg(&JpegSpec {
            embed_thumbnail: false,
            ..JpegSpec::default()
        });
        assert!(embedded_thumbnail(&bare).is_none());
    }

    #[test]
    fn test_big_endian_tiff() {
        let mut tiff = b"MM\x00\x2a\x00\x00\x00\x08".to_vec();
        // one entry: DateTime, ASCII, 20 bytes at offset 26
        tiff.extend_from_slice(&[0x00, 0x01]);
        tiff.extend_from_slice(&[0x01, 0x32, 0x00, 0x02, 0x00, 0x00, 0x00, 0x14]);
        tiff.extend_from_slice(&26u32.to_be_bytes());
        tiff.extend_from_slice(&[0, 0, 0, 0]);
        tiff.extend_from_slice(b"2023:07:14 09:30:05\0");

        let exif = ExifData::from_tiff(&tiff).unwrap();
        assert_eq!(exif.date_taken(), Some(taken()));
        assert!(exif.thumbnail().is_none());
    }

    #[test]
    fn test_garbage_is_ignored() {
        assert!(date_taken(b"not a jpeg").is_none());
        assert!(date_taken(&[0xFF, 0xD8, 0xFF, 0xE1, 0x00]).is_none());
        assert!(embedded_thumbnail(&[0xFF, 0xD8, 0xFF, 0xD9]).is_none());
    }
}
