use std::collections::HashSet;
use std::path::Path;

use common::{stable_id, Genre, MediaFile, UNKNOWN_ALBUM, UNKNOWN_ARTIST, VARIOUS_ARTISTS};
use metadata::FileTags;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::config::MappingOptions;

/// Turns one file's extracted tags into a track record for a given folder.
pub struct MediaFileMapper<'a> {
    library_id: u32,
    library_root: &'a Path,
    folder_path: &'a Path,
    folder_id: &'a str,
    options: &'a MappingOptions,
}

/// Nominal, original and release `(year, date)` pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dates {
    pub year: i32,
    pub date: String,
    pub original_year: i32,
    pub original_date: String,
    pub release_year: i32,
    pub release_date: String,
}

impl<'a> MediaFileMapper<'a> {
    pub fn new(
        library_id: u32,
        library_root: &'a Path,
        folder_path: &'a Path,
        folder_id: &'a str,
        options: &'a MappingOptions,
    ) -> Self {
        Self {
            library_id,
            library_root,
            folder_path,
            folder_id,
            options,
        }
    }

    pub fn to_media_file(&self, md: &FileTags) -> MediaFile {
        let dates = map_dates(md);
        let title = self.track_title(md);
        let album = album_name(md);
        let artist = artist_name(md);
        let album_artist = album_artist_name(md);
        let (genre, genres) = map_genres(md.genres(), &self.options.genre_separators);
        let relpath = common::relpath_from(self.library_root, md.file_path())
            .unwrap_or_else(|| md.file_path().to_string_lossy().to_string());
        let id = track_id(md.file_path());

        MediaFile {
            pid: id.clone(),
            id,
            library_id: self.library_id,
            folder_id: self.folder_id.to_string(),
            path: relpath,
            suffix: md.suffix(),
            size: md.size,
            album_id: self.album_id(md, &dates.release_date),
            artist_id: stable_id(&artist.to_lowercase()),
            album_artist_id: stable_id(&album_artist.to_lowercase()),
            order_title: strip_accents(&title).trim().to_string(),
            order_album_name: self.sort_key(&album),
            order_artist_name: self.sort_key(&artist),
            order_album_artist_name: self.sort_key(&album_artist),
            title,
            album,
            artist,
            album_artist,
            compilation: md.compilation(),
            track_number: md.track_number().0,
            disc_number: md.disc_number().0,
            disc_subtitle: md.disc_subtitle().to_string(),
            year: dates.year,
            date: dates.date,
            original_year: dates.original_year,
            original_date: dates.original_date,
            release_year: dates.release_year,
            release_date: dates.release_date,
            genre,
            genres,
            duration: md.duration,
            bit_rate: md.bit_rate,
            channels: md.channels,
            sample_rate: md.sample_rate,
            has_cover_art: md.has_picture,
            sort_title: md.sort_title().to_string(),
            sort_album_name: md.sort_album().to_string(),
            sort_artist_name: md.sort_artist().to_string(),
            sort_album_artist_name: md.sort_album_artist().to_string(),
            catalog_num: md.catalog_num().to_string(),
            mbz_recording_id: md.mbz_recording_id().to_string(),
            mbz_release_track_id: md.mbz_release_track_id().to_string(),
            mbz_album_id: md.mbz_album_id().to_string(),
            mbz_artist_id: md.mbz_artist_id().to_string(),
            mbz_album_artist_id: md.mbz_album_artist_id().to_string(),
            mbz_album_type: md.mbz_album_type().to_string(),
            mbz_album_comment: md.mbz_album_comment().to_string(),
            rg_album_gain: md.rg_album_gain(),
            rg_album_peak: md.rg_album_peak(),
            rg_track_gain: md.rg_track_gain(),
            rg_track_peak: md.rg_track_peak(),
            comment: sanitize_text(md.comment()),
            lyrics: sanitize_text(md.lyrics()),
            bpm: md.bpm(),
            tags: md.model_tags(),
            created_at: md.created,
            updated_at: md.modified,
        }
    }

    fn track_title(&self, md: &FileTags) -> String {
        let title = md.title();
        if !title.is_empty() {
            return title.to_string();
        }
        let path = md.file_path();
        let relative = path.strip_prefix(self.folder_path).unwrap_or(path);
        let name = relative.to_string_lossy();
        match relative.extension() {
            Some(ext) => {
                let cut = name.len().saturating_sub(ext.len() + 1);
                name[..cut].to_string()
            }
            None => name.to_string(),
        }
    }

    fn album_id(&self, md: &FileTags, release_date: &str) -> String {
        let mut key = format!("{}\\{}", album_artist_name(md), album_name(md)).to_lowercase();
        if !self.options.group_album_releases && !release_date.is_empty() {
            key.push('\\');
            key.push_str(release_date);
        }
        stable_id(&key)
    }

    fn sort_key(&self, value: &str) -> String {
        let cleaned = strip_accents(value);
        strip_article(cleaned.trim(), &self.options.ignored_articles).to_string()
    }
}

pub fn track_id(path: &Path) -> String {
    stable_id(&path.to_string_lossy())
}

fn artist_name(md: &FileTags) -> String {
    match md.artist() {
        "" => UNKNOWN_ARTIST.to_string(),
        artist => artist.to_string(),
    }
}

fn album_artist_name(md: &FileTags) -> String {
    if !md.album_artist().is_empty() {
        md.album_artist().to_string()
    } else if md.compilation() {
        VARIOUS_ARTISTS.to_string()
    } else if !md.artist().is_empty() {
        md.artist().to_string()
    } else {
        UNKNOWN_ARTIST.to_string()
    }
}

fn album_name(md: &FileTags) -> String {
    match md.album() {
        "" => UNKNOWN_ALBUM.to_string(),
        album => album.to_string(),
    }
}

/// Splits raw genre values on any separator and dedupes case-insensitively in first-seen order.
pub fn map_genres(raw: &[String], separators: &[char]) -> (String, Vec<Genre>) {
    let mut seen = HashSet::new();
    let mut genres = Vec::new();
    for value in raw {
        for part in value.split(|c: char| separators.contains(&c)) {
            let name = part.trim();
            if name.is_empty() {
                continue;
            }
            if seen.insert(name.to_lowercase()) {
                genres.push(Genre {
                    name: name.to_string(),
                });
            }
        }
    }
    let primary = genres
        .first()
        .map(|genre| genre.name.clone())
        .unwrap_or_default();
    (primary, genres)
}

pub fn map_dates(md: &FileTags) -> Dates {
    let (year, date) = md.date();
    let (original_year, original_date) = md.original_date();
    let (release_year, release_date) = md.release_date();
    resolve_dates(
        (year, date),
        (original_year, original_date),
        (release_year, release_date),
    )
}

/// Picard writes the release date into the plain date tag and leaves the release tag empty.
pub fn resolve_dates(
    nominal: (i32, String),
    original: (i32, String),
    release: (i32, String),
) -> Dates {
    let (year, date) = nominal;
    let (original_year, original_date) = original;
    let (release_year, release_date) = release;

    let tagged_like_picard = original_year != 0 && release_year == 0 && year >= original_year;
    if tagged_like_picard {
        return Dates {
            year: original_year,
            date: original_date.clone(),
            original_year,
            original_date,
            release_year: year,
            release_date: date,
        };
    }

    let (year, date) = if year != 0 {
        (year, date)
    } else if original_year > 0 {
        (original_year, original_date.clone())
    } else {
        (release_year, release_date.clone())
    };
    Dates {
        year,
        date,
        original_year,
        original_date,
        release_year,
        release_date,
    }
}

pub fn strip_accents(value: &str) -> String {
    value.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Drops the first matching `article + " "` prefix, ignoring ASCII case, and any spaces after it.
pub fn strip_article<'v>(value: &'v str, articles: &[String]) -> &'v str {
    for article in articles {
        let prefix_len = article.len() + 1;
        if value.len() <= prefix_len || !value.is_char_boundary(prefix_len) {
            continue;
        }
        let (head, rest) = value.split_at(prefix_len);
        let rest = rest.trim_start();
        let matches = head.ends_with(' ') && head[..article.len()].eq_ignore_ascii_case(article);
        if matches && !rest.is_empty() {
            return rest;
        }
    }
    value
}

fn sanitize_text(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}
