use std::collections::{HashMap, HashSet};

use common::{Album, Artist, Genre, MediaFile};

/// Groups tracks into albums by `album_id`, keeping first-seen order.
pub fn derive_albums(tracks: &[MediaFile]) -> Vec<Album> {
    let mut albums: Vec<Album> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for track in tracks {
        let slot = match index.get(track.album_id.as_str()) {
            Some(slot) => *slot,
            None => {
                index.insert(track.album_id.as_str(), albums.len());
                albums.push(album_from_track(track));
                albums.len() - 1
            }
        };
        let album = &mut albums[slot];
        if track.year != 0 {
            if album.min_year == 0 || track.year < album.min_year {
                album.min_year = track.year;
            }
            if track.year > album.max_year {
                album.max_year = track.year;
            }
        }
        album.compilation = album.compilation || track.compilation;
        merge_genres(&mut album.genres, &track.genres);
        if album.genre.is_empty() {
            album.genre = track.genre.clone();
        }
        if !album.folder_ids.contains(&track.folder_id) {
            album.folder_ids.push(track.folder_id.clone());
        }
    }
    albums
}

fn album_from_track(track: &MediaFile) -> Album {
    Album {
        id: track.album_id.clone(),
        library_id: track.library_id,
        name: track.album.clone(),
        album_artist: track.album_artist.clone(),
        album_artist_id: track.album_artist_id.clone(),
        compilation: track.compilation,
        min_year: 0,
        max_year: 0,
        date: track.date.clone(),
        original_date: track.original_date.clone(),
        release_date: track.release_date.clone(),
        genre: track.genre.clone(),
        genres: Vec::new(),
        sort_album_name: track.sort_album_name.clone(),
        sort_album_artist_name: track.sort_album_artist_name.clone(),
        order_album_name: track.order_album_name.clone(),
        order_album_artist_name: track.order_album_artist_name.clone(),
        mbz_album_id: track.mbz_album_id.clone(),
        mbz_album_type: track.mbz_album_type.clone(),
        mbz_album_comment: track.mbz_album_comment.clone(),
        folder_ids: Vec::new(),
    }
}

/// One artist per distinct track artist and album artist.
pub fn derive_artists(tracks: &[MediaFile]) -> Vec<Artist> {
    let mut artists: Vec<Artist> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for track in tracks {
        let credits = [
            (
                &track.artist_id,
                &track.artist,
                &track.order_artist_name,
                &track.sort_artist_name,
                &track.mbz_artist_id,
            ),
            (
                &track.album_artist_id,
                &track.album_artist,
                &track.order_album_artist_name,
                &track.sort_album_artist_name,
                &track.mbz_album_artist_id,
            ),
        ];
        for (id, name, order, sort, mbz) in credits {
            let slot = match index.get(id.as_str()) {
                Some(slot) => *slot,
                None => {
                    index.insert(id.clone(), artists.len());
                    artists.push(Artist {
                        id: id.clone(),
                        name: name.clone(),
                        order_artist_name: order.clone(),
                        sort_artist_name: sort.clone(),
                        mbz_artist_id: mbz.clone(),
                        genres: Vec::new(),
                    });
                    artists.len() - 1
                }
            };
            let artist = &mut artists[slot];
            if artist.mbz_artist_id.is_empty() {
                artist.mbz_artist_id = mbz.clone();
            }
            merge_genres(&mut artist.genres, &track.genres);
        }
    }
    artists
}

fn merge_genres(target: &mut Vec<Genre>, incoming: &[Genre]) {
    let mut seen: HashSet<String> = target
        .iter()
        .map(|genre| genre.name.to_lowercase())
        .collect();
    for genre in incoming {
        if seen.insert(genre.name.to_lowercase()) {
            target.push(genre.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{derive_albums, derive_artists};
    use common::{Genre, MediaFile};

    fn track(album_id: &str, artist_id: &str, year: i32, genres: &[&str]) -> MediaFile {
        MediaFile {
            album_id: album_id.to_string(),
            album: format!("Album {}", album_id),
            artist_id: artist_id.to_string(),
            artist: format!("Artist {}", artist_id),
            album_artist_id: "aa".to_string(),
            album_artist: "Album Artist".to_string(),
            folder_id: "f1".to_string(),
            year,
            genres: genres
                .iter()
                .map(|name| Genre { name: name.to_string() })
                .collect(),
            ..MediaFile::default()
        }
    }

    #[test]
    fn albums_group_by_id_and_span_years() {
        let tracks = vec![
            track("a1", "x", 2001, &["Rock"]),
            track("a2", "x", 0, &[]),
            track("a1", "y", 1999, &["rock", "Pop"]),
            track("a1", "y", 0, &[]),
        ];
        let albums = derive_albums(&tracks);
        assert_eq!(albums.len(), 2);
        assert_eq!(albums[0].id, "a1");
        assert_eq!((albums[0].min_year, albums[0].max_year), (1999, 2001));
        let names: Vec<&str> = albums[0].genres.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["Rock", "Pop"]);
        assert_eq!(albums[0].folder_ids, vec!["f1".to_string()]);
        assert_eq!((albums[1].min_year, albums[1].max_year), (0, 0));
    }

    #[test]
    fn artists_cover_track_and_album_artists_once() {
        let tracks = vec![
            track("a1", "x", 0, &["Jazz"]),
            track("a1", "y", 0, &[]),
            track("a1", "x", 0, &["Blues"]),
        ];
        let artists = derive_artists(&tracks);
        let ids: Vec<&str> = artists.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "aa", "y"]);
        assert_eq!(artists[0].genres.len(), 2);
        assert_eq!(artists[1].name, "Album Artist");
    }
}
