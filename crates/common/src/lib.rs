use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

mod tag;

pub use tag::{Tag, Tags, TAG_ID_SEPARATOR};

pub const UNKNOWN_ARTIST: &str = "[Unknown Artist]";
pub const UNKNOWN_ALBUM: &str = "[Unknown Album]";
pub const VARIOUS_ARTISTS: &str = "Various Artists";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genre {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    pub id: String,
    pub pid: String,
    pub library_id: u32,
    pub folder_id: String,
    /// Library-relative path, slash separated.
    pub path: String,
    pub suffix: String,
    pub size: u64,
    pub title: String,
    pub album: String,
    pub album_id: String,
    pub artist: String,
    pub artist_id: String,
    pub album_artist: String,
    pub album_artist_id: String,
    pub compilation: bool,
    pub track_number: u32,
    pub disc_number: u32,
    pub disc_subtitle: String,
    pub year: i32,
    pub date: String,
    pub original_year: i32,
    pub original_date: String,
    pub release_year: i32,
    pub release_date: String,
    pub genre: String,
    pub genres: Vec<Genre>,
    pub duration: f32,
    pub bit_rate: u32,
    pub channels: u8,
    pub sample_rate: u32,
    pub has_cover_art: bool,
    pub sort_title: String,
    pub sort_album_name: String,
    pub sort_artist_name: String,
    pub sort_album_artist_name: String,
    pub order_title: String,
    pub order_album_name: String,
    pub order_artist_name: String,
    pub order_album_artist_name: String,
    pub catalog_num: String,
    pub mbz_recording_id: String,
    pub mbz_release_track_id: String,
    pub mbz_album_id: String,
    pub mbz_artist_id: String,
    pub mbz_album_artist_id: String,
    pub mbz_album_type: String,
    pub mbz_album_comment: String,
    pub rg_album_gain: f64,
    pub rg_album_peak: f64,
    pub rg_track_gain: f64,
    pub rg_track_peak: f64,
    pub comment: String,
    pub lyrics: String,
    pub bpm: u32,
    pub tags: Tags,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Default for MediaFile {
    fn default() -> Self {
        Self {
            id: String::new(),
            pid: String::new(),
            library_id: 0,
            folder_id: String::new(),
            path: String::new(),
            suffix: String::new(),
            size: 0,
            title: String::new(),
            album: String::new(),
            album_id: String::new(),
            artist: String::new(),
            artist_id: String::new(),
            album_artist: String::new(),
            album_artist_id: String::new(),
            compilation: false,
            track_number: 0,
            disc_number: 0,
            disc_subtitle: String::new(),
            year: 0,
            date: String::new(),
            original_year: 0,
            original_date: String::new(),
            release_year: 0,
            release_date: String::new(),
            genre: String::new(),
            genres: Vec::new(),
            duration: 0.0,
            bit_rate: 0,
            channels: 0,
            sample_rate: 0,
            has_cover_art: false,
            sort_title: String::new(),
            sort_album_name: String::new(),
            sort_artist_name: String::new(),
            sort_album_artist_name: String::new(),
            order_title: String::new(),
            order_album_name: String::new(),
            order_artist_name: String::new(),
            order_album_artist_name: String::new(),
            catalog_num: String::new(),
            mbz_recording_id: String::new(),
            mbz_release_track_id: String::new(),
            mbz_album_id: String::new(),
            mbz_artist_id: String::new(),
            mbz_album_artist_id: String::new(),
            mbz_album_type: String::new(),
            mbz_album_comment: String::new(),
            rg_album_gain: 0.0,
            rg_album_peak: 0.0,
            rg_track_gain: 0.0,
            rg_track_peak: 0.0,
            comment: String::new(),
            lyrics: String::new(),
            bpm: 0,
            tags: Tags::default(),
            created_at: SystemTime::UNIX_EPOCH,
            updated_at: SystemTime::UNIX_EPOCH,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub library_id: u32,
    pub name: String,
    pub album_artist: String,
    pub album_artist_id: String,
    pub compilation: bool,
    pub min_year: i32,
    pub max_year: i32,
    pub date: String,
    pub original_date: String,
    pub release_date: String,
    pub genre: String,
    #[serde(default)]
    pub genres: Vec<Genre>,
    pub sort_album_name: String,
    pub sort_album_artist_name: String,
    pub order_album_name: String,
    pub order_album_artist_name: String,
    pub mbz_album_id: String,
    pub mbz_album_type: String,
    pub mbz_album_comment: String,
    #[serde(default)]
    pub folder_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub order_artist_name: String,
    pub sort_artist_name: String,
    pub mbz_artist_id: String,
    #[serde(default)]
    pub genres: Vec<Genre>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LibraryInfo {
    pub id: u32,
    pub name: String,
    pub path: PathBuf,
    pub last_scan_at: Option<SystemTime>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FolderRecord {
    pub id: String,
    pub library_id: u32,
    pub path: String,
    pub parent_id: Option<String>,
    pub updated_at: SystemTime,
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

pub fn folder_id(library_id: u32, relpath: &str) -> String {
    stable_id(&format!("{}:{}", library_id, relpath))
}

pub fn relpath_from(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(path_to_slash_string(rel))
}

pub fn join_relpath(root: &Path, relpath: &str) -> PathBuf {
    let mut out = PathBuf::from(root);
    for part in relpath.split('/') {
        if part.is_empty() {
            continue;
        }
        out.push(part);
    }
    out
}

pub fn parent_relpath(relpath: &str) -> Option<&str> {
    if relpath.is_empty() {
        return None;
    }
    match relpath.rfind('/') {
        Some(idx) => Some(&relpath[..idx]),
        None => Some(""),
    }
}

fn path_to_slash_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}
