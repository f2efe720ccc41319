use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use common::Tags;
use lofty::error::LoftyError;
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use lofty::tag::Tag;
use tracing::warn;

/// Tag names kept on the track as searchable tag facts.
pub const MODEL_TAG_NAMES: &[&str] = &["genre", "mood", "grouping", "recordlabel", "releasetype"];

/// Everything extracted from one audio file: raw tag values plus file and stream properties.
#[derive(Debug, Clone)]
pub struct FileTags {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub created: SystemTime,
    pub duration: f32,
    pub bit_rate: u32,
    pub channels: u8,
    pub sample_rate: u32,
    pub has_picture: bool,
    pub tags: Tags,
}

impl FileTags {
    pub fn new(path: PathBuf, tags: Tags) -> Self {
        Self {
            path,
            size: 0,
            modified: SystemTime::UNIX_EPOCH,
            created: SystemTime::UNIX_EPOCH,
            duration: 0.0,
            bit_rate: 0,
            channels: 0,
            sample_rate: 0,
            has_picture: false,
            tags,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }

    pub fn suffix(&self) -> String {
        self.path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }

    pub fn title(&self) -> &str {
        self.first("title")
    }

    pub fn album(&self) -> &str {
        self.first("album")
    }

    pub fn artist(&self) -> &str {
        self.first("artist")
    }

    pub fn album_artist(&self) -> &str {
        self.first("albumartist")
    }

    pub fn compilation(&self) -> bool {
        parse_bool(self.first("compilation"))
    }

    pub fn genres(&self) -> &[String] {
        self.tags.values("genre")
    }

    pub fn date(&self) -> (i32, String) {
        let value = match self.first("date") {
            "" => self.first("year"),
            value => value,
        };
        parse_date(value)
    }

    pub fn original_date(&self) -> (i32, String) {
        parse_date(self.first("originaldate"))
    }

    pub fn release_date(&self) -> (i32, String) {
        parse_date(self.first("releasedate"))
    }

    pub fn track_number(&self) -> (u32, u32) {
        number_pair(self.first("tracknumber"), self.first("tracktotal"))
    }

    pub fn disc_number(&self) -> (u32, u32) {
        number_pair(self.first("discnumber"), self.first("disctotal"))
    }

    pub fn disc_subtitle(&self) -> &str {
        self.first("discsubtitle")
    }

    pub fn sort_title(&self) -> &str {
        self.first("titlesort")
    }

    pub fn sort_album(&self) -> &str {
        self.first("albumsort")
    }

    pub fn sort_artist(&self) -> &str {
        self.first("artistsort")
    }

    pub fn sort_album_artist(&self) -> &str {
        self.first("albumartistsort")
    }

    pub fn catalog_num(&self) -> &str {
        self.first("catalognumber")
    }

    pub fn mbz_recording_id(&self) -> &str {
        self.first("musicbrainz_trackid")
    }

    pub fn mbz_release_track_id(&self) -> &str {
        self.first("musicbrainz_releasetrackid")
    }

    pub fn mbz_album_id(&self) -> &str {
        self.first("musicbrainz_albumid")
    }

    pub fn mbz_artist_id(&self) -> &str {
        self.first("musicbrainz_artistid")
    }

    pub fn mbz_album_artist_id(&self) -> &str {
        self.first("musicbrainz_albumartistid")
    }

    pub fn mbz_album_type(&self) -> &str {
        self.first("releasetype")
    }

    pub fn mbz_album_comment(&self) -> &str {
        self.first("musicbrainz_albumcomment")
    }

    pub fn rg_album_gain(&self) -> f64 {
        parse_gain(self.first("replaygain_album_gain"))
    }

    pub fn rg_album_peak(&self) -> f64 {
        parse_gain(self.first("replaygain_album_peak"))
    }

    pub fn rg_track_gain(&self) -> f64 {
        parse_gain(self.first("replaygain_track_gain"))
    }

    pub fn rg_track_peak(&self) -> f64 {
        parse_gain(self.first("replaygain_track_peak"))
    }

    pub fn comment(&self) -> &str {
        self.first("comment")
    }

    pub fn lyrics(&self) -> &str {
        self.first("lyrics")
    }

    pub fn bpm(&self) -> u32 {
        let value = self.first("bpm").trim();
        value
            .parse::<f64>()
            .map(|bpm| bpm.round().max(0.0) as u32)
            .unwrap_or(0)
    }

    pub fn model_tags(&self) -> Tags {
        let mut out = Tags::new();
        for name in MODEL_TAG_NAMES {
            for value in self.tags.values(name) {
                out.add(name, value.trim());
            }
        }
        out
    }

    fn first(&self, name: &str) -> &str {
        self.tags.first(name).map(str::trim).unwrap_or("")
    }
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Batched tag extraction. Implementations return one entry per readable path.
pub trait TagExtractor: Send + Sync {
    fn extract(&self, paths: &[PathBuf]) -> Result<Vec<FileTags>, MetadataError>;
}

/// Reads tags with lofty. Unreadable files are logged and skipped; a file that
/// cannot be stat'ed fails the whole batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoftyExtractor;

impl TagExtractor for LoftyExtractor {
    fn extract(&self, paths: &[PathBuf]) -> Result<Vec<FileTags>, MetadataError> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            match read_tags(path) {
                Ok(tags) => out.push(tags),
                Err(MetadataError::Lofty(err)) => {
                    warn!("Failed to read tags for {:?}: {}", path, err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }
}

fn item_names() -> Vec<(ItemKey, &'static str)> {
    vec![
        (ItemKey::TrackTitle, "title"),
        (ItemKey::AlbumTitle, "album"),
        (ItemKey::TrackArtist, "artist"),
        (ItemKey::AlbumArtist, "albumartist"),
        (ItemKey::Genre, "genre"),
        (ItemKey::RecordingDate, "date"),
        (ItemKey::Year, "year"),
        (ItemKey::OriginalReleaseDate, "originaldate"),
        (ItemKey::ReleaseDate, "releasedate"),
        (ItemKey::FlagCompilation, "compilation"),
        (ItemKey::TrackNumber, "tracknumber"),
        (ItemKey::TrackTotal, "tracktotal"),
        (ItemKey::DiscNumber, "discnumber"),
        (ItemKey::DiscTotal, "disctotal"),
        (ItemKey::SetSubtitle, "discsubtitle"),
        (ItemKey::TrackTitleSortOrder, "titlesort"),
        (ItemKey::AlbumTitleSortOrder, "albumsort"),
        (ItemKey::TrackArtistSortOrder, "artistsort"),
        (ItemKey::AlbumArtistSortOrder, "albumartistsort"),
        (ItemKey::CatalogNumber, "catalognumber"),
        (ItemKey::MusicBrainzRecordingId, "musicbrainz_trackid"),
        (ItemKey::MusicBrainzTrackId, "musicbrainz_releasetrackid"),
        (ItemKey::MusicBrainzReleaseId, "musicbrainz_albumid"),
        (ItemKey::MusicBrainzArtistId, "musicbrainz_artistid"),
        (ItemKey::MusicBrainzReleaseArtistId, "musicbrainz_albumartistid"),
        (ItemKey::ReplayGainAlbumGain, "replaygain_album_gain"),
        (ItemKey::ReplayGainAlbumPeak, "replaygain_album_peak"),
        (ItemKey::ReplayGainTrackGain, "replaygain_track_gain"),
        (ItemKey::ReplayGainTrackPeak, "replaygain_track_peak"),
        (ItemKey::Comment, "comment"),
        (ItemKey::Lyrics, "lyrics"),
        (ItemKey::Bpm, "bpm"),
        (ItemKey::Mood, "mood"),
        (ItemKey::ContentGroup, "grouping"),
        (ItemKey::Label, "recordlabel"),
    ]
}

const UNMAPPED_NAMES: &[(&str, &str)] = &[
    ("MUSICBRAINZ_ALBUMTYPE", "releasetype"),
    ("RELEASETYPE", "releasetype"),
    ("MUSICBRAINZ_ALBUMCOMMENT", "musicbrainz_albumcomment"),
];

pub fn read_tags(path: &Path) -> Result<FileTags, MetadataError> {
    let file_meta = fs::metadata(path)?;
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut info = FileTags::new(path.to_path_buf(), Tags::new());
    info.size = file_meta.len();
    info.modified = file_meta.modified()?;
    info.created = file_meta.created().unwrap_or(info.modified);

    info.duration = properties.duration().as_secs_f32();
    info.sample_rate = properties.sample_rate().unwrap_or(0);
    info.channels = properties.channels().unwrap_or(0);
    info.bit_rate = properties
        .audio_bitrate()
        .or(properties.overall_bitrate())
        .unwrap_or(0);

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.tags = collect_tags(tag);
        info.has_picture = !tag.pictures().is_empty();
    }

    Ok(info)
}

fn collect_tags(tag: &Tag) -> Tags {
    let mut tags = Tags::new();
    for (key, name) in item_names() {
        for value in tag.get_strings(&key) {
            tags.add(name, value);
        }
    }
    for (raw, name) in UNMAPPED_NAMES {
        if !tags.values(name).is_empty() {
            continue;
        }
        let key = ItemKey::Unknown(raw.to_string());
        for value in tag.get_strings(&key) {
            tags.add(name, value);
        }
    }
    tags
}

/// Splits a date tag into its year and the normalized `YYYY[-MM[-DD]]` prefix.
pub fn parse_date(text: &str) -> (i32, String) {
    let year = match parse_year(text) {
        Some(year) => year,
        None => return (0, String::new()),
    };
    let trimmed = text
        .trim()
        .split(|c: char| c == 'T' || c.is_whitespace())
        .next()
        .unwrap_or("");
    let mut date = String::new();
    let mut parts = 0;
    for part in trimmed.split(|c: char| c == '-' || c == '.' || c == '/') {
        let expected = if parts == 0 { 4 } else { 2 };
        if part.len() != expected || !part.chars().all(|c| c.is_ascii_digit()) {
            break;
        }
        if parts > 0 {
            date.push('-');
        }
        date.push_str(part);
        parts += 1;
        if parts == 3 {
            break;
        }
    }
    if date.is_empty() {
        date = format!("{:04}", year);
    }
    (year, date)
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.len() != 4 {
        None
    } else {
        digits.parse().ok().filter(|year| *year > 0)
    }
}

fn number_pair(value: &str, total: &str) -> (u32, u32) {
    let mut parts = value.splitn(2, '/');
    let number = parts
        .next()
        .and_then(|head| head.trim().parse().ok())
        .unwrap_or(0);
    let total = parts
        .next()
        .and_then(|tail| tail.trim().parse().ok())
        .or_else(|| total.trim().parse().ok())
        .unwrap_or(0);
    (number, total)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

fn parse_gain(value: &str) -> f64 {
    let trimmed = value.trim();
    let numeric = trimmed
        .strip_suffix("dB")
        .or_else(|| trimmed.strip_suffix("db"))
        .unwrap_or(trimmed)
        .trim();
    match numeric.parse::<f64>() {
        Ok(gain) if gain.is_finite() => gain,
        _ => 0.0,
    }
}
