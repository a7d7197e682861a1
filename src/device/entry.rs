//! Remote file entries and the card's directory-listing format
//!
//! The card answers a listing request (`op=100`) with one line per entry:
//!
//! ```text
//! <dirpath>,<filename>,<size>,<attr>,<packed-date>,<packed-time>
//! ```
//!
//! Filenames may themselves contain commas, so everything between the
//! directory and the last four numeric fields is the filename. Dates and
//! times are packed the FAT way.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

/// Separator between fields of a listing line
const SEPARATOR: char = ',';

/// Number of numeric fields following the filename
const NUMERIC_FIELDS: usize = 4;

/// Characters the card never produces in directory or file names
const INVALID_NAME_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\\'];

/// Photo extensions, grouped by kind
const JPEG_EXTENSIONS: &[&str] = &["jpg", "jpeg", "jpe"];
const TIFF_EXTENSIONS: &[&str] = &["tif", "tiff"];
const RAW_EXTENSIONS: &[&str] = &[
    "arw", "cr2", "cr3", "crw", "dng", "nef", "nrw", "orf", "pef", "raf", "raw", "rw2", "srw",
];

// =============================================================================
// Attributes
// =============================================================================

/// FAT attribute bitmask as reported by the card
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FileAttributes(u8);

impl FileAttributes {
    pub const READ_ONLY: u8 = 1 << 0;
    pub const HIDDEN: u8 = 1 << 1;
    pub const SYSTEM: u8 = 1 << 2;
    pub const VOLUME: u8 = 1 << 3;
    pub const DIRECTORY: u8 = 1 << 4;
    pub const ARCHIVE: u8 = 1 << 5;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x3F)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_read_only(&self) -> bool {
        self.0 & Self::READ_ONLY != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.0 & Self::HIDDEN != 0
    }

    pub fn is_system(&self) -> bool {
        self.0 & Self::SYSTEM != 0
    }

    pub fn is_volume(&self) -> bool {
        self.0 & Self::VOLUME != 0
    }

    pub fn is_directory(&self) -> bool {
        self.0 & Self::DIRECTORY != 0
    }

    pub fn is_archive(&self) -> bool {
        self.0 & Self::ARCHIVE != 0
    }
}

// =============================================================================
// File kinds
// =============================================================================

/// Classification of a remote file by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileKind {
    Jpeg,
    Tiff,
    Png,
    Bmp,
    Gif,
    Raw,
    Mov,
    Mp4,
    Avi,
    #[default]
    Other,
}

impl FileKind {
    /// Classify a file name by its extension (case-insensitive)
    pub fn from_file_name(name: &str) -> Self {
        let extension = match name.rsplit_once('.') {
            Some((_, ext)) => ext.to_lowercase(),
            None => return FileKind::Other,
        };
        let ext = extension.as_str();

        if JPEG_EXTENSIONS.contains(&ext) {
            FileKind::Jpeg
        } else if TIFF_EXTENSIONS.contains(&ext) {
            FileKind::Tiff
        } else if RAW_EXTENSIONS.contains(&ext) {
            FileKind::Raw
        } else {
            match ext {
                "png" => FileKind::Png,
                "bmp" => FileKind::Bmp,
                "gif" => FileKind::Gif,
                "mov" => FileKind::Mov,
                "mp4" | "m4v" => FileKind::Mp4,
                "avi" => FileKind::Avi,
                _ => FileKind::Other,
            }
        }
    }

    pub fn is_jpeg(&self) -> bool {
        matches!(self, FileKind::Jpeg)
    }

    pub fn is_image(&self) -> bool {
        matches!(
            self,
            FileKind::Jpeg
                | FileKind::Tiff
                | FileKind::Png
                | FileKind::Bmp
                | FileKind::Gif
                | FileKind::Raw
        )
    }

    pub fn is_video(&self) -> bool {
        matches!(self, FileKind::Mov | FileKind::Mp4 | FileKind::Avi)
    }

    pub fn is_media(&self) -> bool {
        self.is_image() || self.is_video()
    }
}

// =============================================================================
// FAT date/time packing
// =============================================================================

/// Unpack a FAT date/time pair
///
/// Returns `None` for a non-positive date, a negative time, or a value that
/// does not name a real calendar instant.
pub fn unpack_fat_datetime(packed_date: i32, packed_time: i32) -> Option<NaiveDateTime> {
    if packed_date <= 0 || packed_time < 0 {
        return None;
    }

    let day = (packed_date & 0x1F) as u32;
    let month = ((packed_date >> 5) & 0x0F) as u32;
    let year = ((packed_date >> 9) & 0x7F) + 1980;

    let seconds = ((packed_time & 0x1F) * 2) as u32;
    let minute = ((packed_time >> 5) & 0x3F) as u32;
    let hour = ((packed_time >> 11) & 0x1F) as u32;

    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, seconds)
}

/// Pack a date the FAT way. Years outside 1980..=2107 pack to 0.
pub fn pack_fat_date(value: &NaiveDateTime) -> i32 {
    let year = value.year();
    if !(1980..=2107).contains(&year) {
        return 0;
    }
    ((year - 1980) << 9) | ((value.month() as i32) << 5) | value.day() as i32
}

/// Pack a time of day the FAT way (two-second resolution)
pub fn pack_fat_time(value: &NaiveDateTime) -> i32 {
    ((value.hour() as i32) << 11) | ((value.minute() as i32) << 5) | (value.second() as i32 / 2)
}

// =============================================================================
// Signature
// =============================================================================

/// Coarse copy signature of a remote file
///
/// Derived from the timestamp (whole seconds), the full remote path and the
/// size. It is not a content hash: two different files with the same three
/// values share a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature([u8; Signature::LEN]);

impl Signature {
    /// Width of one signature record on disk
    pub const LEN: usize = 16;

    pub fn compute(date: &NaiveDateTime, file_path: &str, size: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(date.and_utc().timestamp().to_le_bytes());
        hasher.update(file_path.as_bytes());
        hasher.update(size.to_le_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&digest[..Self::LEN]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// =============================================================================
// Remote file entry
// =============================================================================

/// One file or folder on the card, as parsed from a listing line
#[derive(Debug, Clone)]
pub struct RemoteFileEntry {
    directory: String,
    file_name: String,
    size: u64,
    attributes: FileAttributes,
    date: NaiveDateTime,
    kind: FileKind,
}

impl RemoteFileEntry {
    /// Build an entry directly (used by the mock card and tests)
    pub fn new(
        directory: &str,
        file_name: &str,
        size: u64,
        attributes: FileAttributes,
        date: NaiveDateTime,
    ) -> Self {
        Self {
            directory: directory.trim_end_matches('/').to_string(),
            file_name: file_name.to_string(),
            size,
            attributes,
            date,
            kind: FileKind::from_file_name(file_name),
        }
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn attributes(&self) -> FileAttributes {
        self.attributes
    }

    /// Timestamp reported by the card (`NaiveDateTime::default()` if invalid)
    pub fn date(&self) -> NaiveDateTime {
        self.date
    }

    pub fn has_valid_date(&self) -> bool {
        self.date != NaiveDateTime::default()
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.is_directory()
    }

    /// Full remote path, e.g. `/DCIM/100__TSB/IMG_0001.JPG`
    pub fn file_path(&self) -> String {
        format!("{}/{}", self.directory, self.file_name)
    }

    pub fn signature(&self) -> Signature {
        Signature::compute(&self.date, &self.file_path(), self.size)
    }

    /// Entries the card keeps for itself and a copier should never see
    pub fn is_hidden_from_sync(&self) -> bool {
        self.attributes.is_hidden() || self.attributes.is_system() || self.attributes.is_volume()
    }

    /// Same directory, file name and size (case-insensitive names)
    pub fn matches(&self, other: &RemoteFileEntry) -> bool {
        self.size == other.size
            && self.directory.eq_ignore_ascii_case(&other.directory)
            && self.file_name.eq_ignore_ascii_case(&other.file_name)
    }

    /// Reconstruct the listing line this entry was parsed from
    pub fn listing_line(&self) -> String {
        let (date, time) = if self.has_valid_date() {
            (pack_fat_date(&self.date), pack_fat_time(&self.date))
        } else {
            (0, 0)
        };
        format!(
            "{dir}{sep}{name}{sep}{size}{sep}{attr}{sep}{date}{sep}{time}",
            dir = self.directory,
            name = self.file_name,
            size = self.size,
            attr = self.attributes.bits(),
            sep = SEPARATOR,
        )
    }
}

impl PartialEq for RemoteFileEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RemoteFileEntry {}

impl Hash for RemoteFileEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.date.hash(state);
        self.directory.hash(state);
        self.file_name.hash(state);
        self.size.hash(state);
    }
}

impl PartialOrd for RemoteFileEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RemoteFileEntry {
    /// Date, then full path (ordinal), then size
    fn cmp(&self, other: &Self) -> Ordering {
        self.date
            .cmp(&other.date)
            .then_with(|| self.file_path().cmp(&other.file_path()))
            .then_with(|| self.size.cmp(&other.size))
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Normalise a requested directory to the prefix the card echoes back
///
/// The root is listed as `/` but echoed as an empty prefix.
pub fn normalize_directory(directory: &str) -> &str {
    directory.trim_end_matches('/')
}

fn is_valid_directory(directory: &str) -> bool {
    !directory
        .chars()
        .any(|c| c.is_control() || INVALID_NAME_CHARS.contains(&c))
}

fn is_valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name
            .chars()
            .any(|c| c == '/' || c.is_control() || INVALID_NAME_CHARS.contains(&c))
}

/// Parse one listing line for the given requested directory
///
/// Returns `None` when the line is not an entry of that directory (this
/// includes the `WLANSD_FILELIST` header the card sends first).
pub fn parse_line(line: &str, directory: &str) -> Option<RemoteFileEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let prefix = normalize_directory(directory);

    if line.len() < prefix.len() || !line.is_char_boundary(prefix.len()) {
        return None;
    }
    let (line_dir, remainder) = line.split_at(prefix.len());
    if !line_dir.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let remainder = remainder.strip_prefix(SEPARATOR)?;

    if !is_valid_directory(line_dir) {
        return None;
    }

    let fields: Vec<&str> = remainder.split(SEPARATOR).collect();
    if fields.len() < NUMERIC_FIELDS + 1 {
        return None;
    }
    let name_end = fields.len() - NUMERIC_FIELDS;
    let file_name = fields[..name_end].join(",");
    if !is_valid_file_name(&file_name) {
        return None;
    }

    let numbers = &fields[name_end..];
    let size: u64 = numbers[0].trim().parse().ok()?;
    let attributes: u16 = numbers[1].trim().parse().ok()?;
    let packed_date: i32 = numbers[2].trim().parse().ok()?;
    let packed_time: i32 = numbers[3].trim().parse().ok()?;

    let date = unpack_fat_datetime(packed_date, packed_time).unwrap_or_default();

    Some(RemoteFileEntry {
        directory: line_dir.to_string(),
        kind: FileKind::from_file_name(&file_name),
        file_name,
        size,
        attributes: FileAttributes::from_bits((attributes & 0xFF) as u8),
        date,
    })
}

/// Parse a whole listing body, dropping lines that are not entries
pub fn parse_listing(body: &str, directory: &str) -> Vec<RemoteFileEntry> {
    body.lines()
        .filter_map(|line| parse_line(line, directory))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datetime(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_parse_scenario_line() {
        let entry = parse_line("/DCIM,IMG_0001.JPG,2048576,32,18765,24601", "/DCIM").unwrap();

        assert_eq!(entry.directory(), "/DCIM");
        assert_eq!(entry.file_name(), "IMG_0001.JPG");
        assert_eq!(entry.size(), 2048576);
        assert!(entry.attributes().is_archive());
        assert!(!entry.attributes().is_read_only());
        assert!(!entry.is_directory());
        assert_eq!(entry.date(), datetime(2016, 10, 13, 12, 0, 50));
        assert_eq!(entry.kind(), FileKind::Jpeg);
        assert_eq!(entry.file_path(), "/DCIM/IMG_0001.JPG");
    }

    #[test]
    fn test_parse_directory_case_insensitive() {
        let entry = parse_line("/dcim,100__TSB,0,16,18765,24601", "/DCIM/").unwrap();
        assert_eq!(entry.directory(), "/dcim");
        assert!(entry.is_directory());
    }

    #[test]
    fn test_parse_root_listing() {
        let entry = parse_line(",DCIM,0,16,18765,24601", "/").unwrap();
        assert_eq!(entry.directory(), "");
        assert_eq!(entry.file_name(), "DCIM");
        assert_eq!(entry.file_path(), "/DCIM");
    }

    #[test]
    fn test_parse_filename_with_commas() {
        let entry = parse_line("/DCIM,a,b,c.jpg,10,32,18765,24601", "/DCIM").unwrap();
        assert_eq!(entry.file_name(), "a,b,c.jpg");
        assert_eq!(entry.size(), 10);
    }

    #[test]
    fn test_parse_rejects() {
        // header line
        assert!(parse_line("WLANSD_FILELIST", "/DCIM").is_none());
        // other directory
        assert!(parse_line("/MISC,A.JPG,1,32,18765,24601", "/DCIM").is_none());
        // prefix shared but no separator after it
        assert!(parse_line("/DCIMX,A.JPG,1,32,18765,24601", "/DCIM").is_none());
        // too few fields
        assert!(parse_line("/DCIM,A.JPG,1,32,18765", "/DCIM").is_none());
        // non-numeric fields
        assert!(parse_line("/DCIM,A.JPG,big,32,18765,24601", "/DCIM").is_none());
        assert!(parse_line("/DCIM,A.JPG,1,x,18765,24601", "/DCIM").is_none());
        assert!(parse_line("/DCIM,A.JPG,1,32,d,24601", "/DCIM").is_none());
        assert!(parse_line("/DCIM,A.JPG,1,32,18765,t", "/DCIM").is_none());
        // empty or invalid file name
        assert!(parse_line("/DCIM,,1,32,18765,24601", "/DCIM").is_none());
        assert!(parse_line("/DCIM,A?.JPG,1,32,18765,24601", "/DCIM").is_none());
        // invalid directory characters
        assert!(parse_line("/DC|M,A.JPG,1,32,18765,24601", "/DC|M").is_none());
    }

    #[test]
    fn test_invalid_packed_values_give_default_date() {
        let entry = parse_line("/DCIM,A.JPG,1,32,0,24601", "/DCIM").unwrap();
        assert_eq!(entry.date(), NaiveDateTime::default());
        assert!(!entry.has_valid_date());

        let entry = parse_line("/DCIM,A.JPG,1,32,18765,-1", "/DCIM").unwrap();
        assert!(!entry.has_valid_date());

        // month 0 is not a real date
        let entry = parse_line("/DCIM,A.JPG,1,32,1,0", "/DCIM").unwrap();
        assert!(!entry.has_valid_date());
    }

    #[test]
    fn test_listing_line_round_trip() {
        let lines = [
            "/DCIM/100__TSB,IMG_0001.JPG,2048576,32,18765,24601",
            "/DCIM/100__TSB,odd,name.jpg,1,33,18765,0",
            "/DCIM,MOV_0002.MOV,987654321,32,22000,35000",
            "/DCIM,NODATE.JPG,5,32,0,0",
        ];

        for line in lines {
            let dir = line.split(',').next().unwrap();
            let first = parse_line(line, dir).unwrap();
            let rebuilt = first.listing_line();
            let second = parse_line(&rebuilt, dir).unwrap();

            assert_eq!(second.directory(), first.directory());
            assert_eq!(second.file_name(), first.file_name());
            assert_eq!(second.size(), first.size());
            assert_eq!(second.date(), first.date());
        }
    }

    #[test]
    fn test_fat_round_trip() {
        let samples = [
            datetime(1980, 1, 1, 0, 0, 0),
            datetime(2107, 12, 31, 23, 59, 58),
            datetime(2000, 2, 29, 12, 30, 44),
            datetime(2016, 10, 13, 12, 0, 50),
        ];
        for value in samples {
            let date = pack_fat_date(&value);
            let time = pack_fat_time(&value);
            assert_eq!(unpack_fat_datetime(date, time), Some(value));
        }

        // every month/hour/minute/even-second combination in one year
        for month in 1..=12 {
            for hour in [0, 7, 23] {
                for minute in [0, 31, 59] {
                    for second in (0..60).step_by(2) {
                        let value = datetime(2024, month, 28, hour, minute, second);
                        let unpacked =
                            unpack_fat_datetime(pack_fat_date(&value), pack_fat_time(&value));
                        assert_eq!(unpacked, Some(value));
                    }
                }
            }
        }
    }

    #[test]
    fn test_pack_out_of_range_year() {
        assert_eq!(pack_fat_date(&datetime(1979, 12, 31, 0, 0, 0)), 0);
        assert_eq!(pack_fat_date(&datetime(2108, 1, 1, 0, 0, 0)), 0);
    }

    #[test]
    fn test_ordering_date_then_path_then_size() {
        let early = RemoteFileEntry::new(
            "/DCIM",
            "B.JPG",
            10,
            FileAttributes::default(),
            datetime(2020, 1, 1, 0, 0, 0),
        );
        let late = RemoteFileEntry::new(
            "/DCIM",
            "A.JPG",
            10,
            FileAttributes::default(),
            datetime(2021, 1, 1, 0, 0, 0),
        );
        let late_bigger = RemoteFileEntry::new(
            "/DCIM",
            "A.JPG",
            20,
            FileAttributes::default(),
            datetime(2021, 1, 1, 0, 0, 0),
        );
        let late_other_path = RemoteFileEntry::new(
            "/DCIM",
            "C.JPG",
            1,
            FileAttributes::default(),
            datetime(2021, 1, 1, 0, 0, 0),
        );

        let mut entries = vec![
            late_other_path.clone(),
            late_bigger.clone(),
            late.clone(),
            early.clone(),
        ];
        entries.sort();
        assert_eq!(entries, vec![early, late, late_bigger, late_other_path]);
    }

    #[test]
    fn test_signature_is_deterministic() {
        let date = datetime(2016, 10, 13, 12, 0, 50);
        let a = Signature::compute(&date, "/DCIM/IMG_0001.JPG", 100);
        let b = Signature::compute(&date, "/DCIM/IMG_0001.JPG", 100);
        assert_eq!(a, b);

        assert_ne!(a, Signature::compute(&date, "/DCIM/IMG_0002.JPG", 100));
        assert_ne!(a, Signature::compute(&date, "/DCIM/IMG_0001.JPG", 101));
        let later = datetime(2016, 10, 13, 12, 0, 52);
        assert_ne!(a, Signature::compute(&later, "/DCIM/IMG_0001.JPG", 100));
        assert_eq!(a.to_string().len(), Signature::LEN * 2);
    }

    #[test]
    fn test_file_kind_classification() {
        assert_eq!(FileKind::from_file_name("a.JPG"), FileKind::Jpeg);
        assert_eq!(FileKind::from_file_name("a.jpeg"), FileKind::Jpeg);
        assert_eq!(FileKind::from_file_name("a.CR2"), FileKind::Raw);
        assert_eq!(FileKind::from_file_name("a.tif"), FileKind::Tiff);
        assert_eq!(FileKind::from_file_name("clip.MOV"), FileKind::Mov);
        assert_eq!(FileKind::from_file_name("clip.m4v"), FileKind::Mp4);
        assert_eq!(FileKind::from_file_name("README"), FileKind::Other);
        assert!(FileKind::Raw.is_image());
        assert!(FileKind::Avi.is_video());
        assert!(!FileKind::Other.is_media());
    }

    #[test]
    fn test_parse_listing_skips_header() {
        let body = "WLANSD_FILELIST\r\n/DCIM,100__TSB,0,16,18765,24601\r\n/DCIM,A.JPG,3,32,18765,24601\r\n";
        let entries = parse_listing(body, "/DCIM");
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_directory());
        assert_eq!(entries[1].file_name(), "A.JPG");
    }
}
