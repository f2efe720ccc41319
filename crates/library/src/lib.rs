use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bincode;
use common::{Album, Artist, FolderRecord, Genre, LibraryInfo, MediaFile, Tag};
use parking_lot::RwLock;
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError, WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const INDEX_VERSION: u32 = 1;
const KEY_SEP: char = '\x1f';

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const LIBRARIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("libraries");
const FOLDERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("folders");
const LIBRARY_FOLDERS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("library_folders");
const MEDIA_FILES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("media_files");
const FOLDER_TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("folder_tracks");
const ALBUMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("albums");
const ARTISTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("artists");
const TAGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tags");

const ALL_TABLES: [TableDefinition<&str, &[u8]>; 9] = [
    META_TABLE,
    LIBRARIES_TABLE,
    FOLDERS_TABLE,
    LIBRARY_FOLDERS_TABLE,
    MEDIA_FILES_TABLE,
    FOLDER_TRACKS_TABLE,
    ALBUMS_TABLE,
    ARTISTS_TABLE,
    TAGS_TABLE,
];

const META_VERSION_KEY: &str = "version";

/// Persistent index of scanned folders, tracks, albums, artists and tags.
///
/// The handle can be released so another process may open the same file;
/// every operation fails with [`LibraryError::Released`] until [`Library::reopen`].
#[derive(Clone)]
pub struct Library {
    path: PathBuf,
    db: Arc<RwLock<Option<Arc<Database>>>>,
}

/// Everything one folder pass wants written.
pub struct FolderChanges<'a> {
    pub folder: &'a FolderRecord,
    pub tracks: &'a [MediaFile],
    pub missing: &'a [MediaFile],
    pub tags: &'a [Tag],
    pub albums: &'a [Album],
    pub artists: &'a [Artist],
}

impl Library {
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        let db = open_or_create_db(path)?;
        prepare_index(&db)?;
        info!("Opened library index at {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            db: Arc::new(RwLock::new(Some(Arc::new(db)))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drops this process' handle on the index file.
    pub fn release(&self) {
        let previous = self.db.write().take();
        if previous.is_some() {
            info!("Released library index {:?}", self.path);
        }
    }

    pub fn reopen(&self) -> Result<(), LibraryError> {
        let mut guard = self.db.write();
        if guard.is_none() {
            let db = open_or_create_db(&self.path)?;
            *guard = Some(Arc::new(db));
            info!("Reopened library index {:?}", self.path);
        }
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.db.read().is_none()
    }

    fn handle(&self) -> Result<Arc<Database>, LibraryError> {
        self.db
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(LibraryError::Released)
    }

    pub fn ensure_library(
        &self,
        id: u32,
        name: &str,
        path: &Path,
    ) -> Result<LibraryInfo, LibraryError> {
        let db = self.handle()?;
        let write_txn = db.begin_write()?;
        let info = {
            let mut table = write_txn.open_table(LIBRARIES_TABLE)?;
            let key = id.to_string();
            let existing: Option<LibraryInfo> = match table.get(key.as_str())? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            let info = match existing {
                Some(mut info) => {
                    if info.path != path {
                        warn!("Library {} moved from {:?} to {:?}", id, info.path, path);
                    }
                    info.path = path.to_path_buf();
                    info.name = name.to_string();
                    info
                }
                None => LibraryInfo {
                    id,
                    name: name.to_string(),
                    path: path.to_path_buf(),
                    last_scan_at: None,
                },
            };
            let bytes = encode_value(&info)?;
            table.insert(key.as_str(), bytes.as_slice())?;
            info
        };
        write_txn.commit()?;
        Ok(info)
    }

    pub fn get_library(&self, id: u32) -> Result<Option<LibraryInfo>, LibraryError> {
        let db = self.handle()?;
        let read_txn = db.begin_read()?;
        let table = match read_txn.open_table(LIBRARIES_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let key = id.to_string();
        let info = match table.get(key.as_str())? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(info)
    }

    pub fn list_libraries(&self) -> Result<Vec<LibraryInfo>, LibraryError> {
        let db = self.handle()?;
        let read_txn = db.begin_read()?;
        let table = match read_txn.open_table(LIBRARIES_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let info: LibraryInfo = decode_value(entry.1.value())?;
            out.push(info);
        }
        out.sort_by_key(|info| info.id);
        Ok(out)
    }

    pub fn set_last_scan(&self, id: u32, at: SystemTime) -> Result<(), LibraryError> {
        let db = self.handle()?;
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(LIBRARIES_TABLE)?;
            let key = id.to_string();
            let mut info: LibraryInfo = match table.get(key.as_str())? {
                Some(value) => decode_value(value.value())?,
                None => return Err(LibraryError::UnknownLibrary(id)),
            };
            info.last_scan_at = Some(at);
            let bytes = encode_value(&info)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn media_files_by_folder(&self, folder_id: &str) -> Result<Vec<MediaFile>, LibraryError> {
        let db = self.handle()?;
        let read_txn = db.begin_read()?;
        let index = match read_txn.open_table(FOLDER_TRACKS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let tracks = read_txn.open_table(MEDIA_FILES_TABLE)?;

        let prefix = prefix_key(folder_id);
        let end = prefix_end(&prefix);
        let mut out = Vec::new();
        for entry in index.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let (_, track_id) = split_key_last(entry.0.value())?;
            if let Some(value) = tracks.get(track_id)? {
                let track: MediaFile = decode_value(value.value())?;
                out.push(track);
            }
        }
        Ok(out)
    }

    pub fn get_media_file(&self, id: &str) -> Result<Option<MediaFile>, LibraryError> {
        self.get_value(MEDIA_FILES_TABLE, id)
    }

    pub fn get_album(&self, id: &str) -> Result<Option<Album>, LibraryError> {
        self.get_value(ALBUMS_TABLE, id)
    }

    pub fn get_artist(&self, id: &str) -> Result<Option<Artist>, LibraryError> {
        self.get_value(ARTISTS_TABLE, id)
    }

    pub fn get_folder(&self, id: &str) -> Result<Option<FolderRecord>, LibraryError> {
        self.get_value(FOLDERS_TABLE, id)
    }

    pub fn get_tag(&self, id: &str) -> Result<Option<Tag>, LibraryError> {
        self.get_value(TAGS_TABLE, id)
    }

    pub fn count_media_files(&self) -> Result<u64, LibraryError> {
        self.count(MEDIA_FILES_TABLE)
    }

    pub fn count_folders(&self) -> Result<u64, LibraryError> {
        self.count(FOLDERS_TABLE)
    }

    pub fn save_folder(&self, changes: &FolderChanges<'_>) -> Result<(), LibraryError> {
        let db = self.handle()?;
        let write_txn = db.begin_write()?;
        {
            let mut folders = write_txn.open_table(FOLDERS_TABLE)?;
            let mut library_folders = write_txn.open_table(LIBRARY_FOLDERS_TABLE)?;
            let mut media_files = write_txn.open_table(MEDIA_FILES_TABLE)?;
            let mut folder_tracks = write_txn.open_table(FOLDER_TRACKS_TABLE)?;
            let mut albums = write_txn.open_table(ALBUMS_TABLE)?;
            let mut artists = write_txn.open_table(ARTISTS_TABLE)?;
            let mut tags = write_txn.open_table(TAGS_TABLE)?;

            let folder = changes.folder;
            let folder_bytes = encode_value(folder)?;
            folders.insert(folder.id.as_str(), folder_bytes.as_slice())?;
            let library_key = library_folder_key(folder.library_id, &folder.id);
            library_folders.insert(library_key.as_str(), folder.id.as_bytes())?;

            for track in changes.tracks {
                let bytes = encode_value(track)?;
                media_files.insert(track.id.as_str(), bytes.as_slice())?;
                let key = pair_key(&track.folder_id, &track.id);
                folder_tracks.insert(key.as_str(), track.id.as_bytes())?;
            }

            for track in changes.missing {
                media_files.remove(track.id.as_str())?;
                let key = pair_key(&track.folder_id, &track.id);
                folder_tracks.remove(key.as_str())?;
            }

            for tag in changes.tags {
                let bytes = encode_value(tag)?;
                tags.insert(tag.id.as_str(), bytes.as_slice())?;
            }

            for album in changes.albums {
                let merged = match albums.get(album.id.as_str())? {
                    Some(value) => {
                        let existing: Album = decode_value(value.value())?;
                        merge_album(existing, album)
                    }
                    None => album.clone(),
                };
                let bytes = encode_value(&merged)?;
                albums.insert(album.id.as_str(), bytes.as_slice())?;
            }

            for artist in changes.artists {
                let merged = match artists.get(artist.id.as_str())? {
                    Some(value) => {
                        let existing: Artist = decode_value(value.value())?;
                        merge_artist(existing, artist)
                    }
                    None => artist.clone(),
                };
                let bytes = encode_value(&merged)?;
                artists.insert(artist.id.as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Deletes folders of `library_id` that are not in `seen`, together with their tracks.
    pub fn purge_folders(
        &self,
        library_id: u32,
        seen: &HashSet<String>,
    ) -> Result<usize, LibraryError> {
        let db = self.handle()?;
        let write_txn = db.begin_write()?;
        let purged = {
            let mut folders = write_txn.open_table(FOLDERS_TABLE)?;
            let mut library_folders = write_txn.open_table(LIBRARY_FOLDERS_TABLE)?;
            let mut media_files = write_txn.open_table(MEDIA_FILES_TABLE)?;
            let mut folder_tracks = write_txn.open_table(FOLDER_TRACKS_TABLE)?;

            let prefix = prefix_key(&library_id.to_string());
            let end = prefix_end(&prefix);
            let mut stale = Vec::new();
            for entry in library_folders.range(prefix.as_str()..end.as_str())? {
                let entry = entry?;
                let key = entry.0.value();
                let (_, folder_id) = split_key_last(key)?;
                if !seen.contains(folder_id) {
                    stale.push((key.to_string(), folder_id.to_string()));
                }
            }

            for (library_key, folder_id) in &stale {
                let prefix = prefix_key(folder_id);
                let end = prefix_end(&prefix);
                let mut track_keys = Vec::new();
                for entry in folder_tracks.range(prefix.as_str()..end.as_str())? {
                    let entry = entry?;
                    track_keys.push(entry.0.value().to_string());
                }
                for key in track_keys {
                    let (_, track_id) = split_key_last(&key)?;
                    media_files.remove(track_id)?;
                    folder_tracks.remove(key.as_str())?;
                }
                folders.remove(folder_id.as_str())?;
                library_folders.remove(library_key.as_str())?;
            }
            stale.len()
        };
        write_txn.commit()?;
        if purged > 0 {
            info!("Purged {} vanished folders from library {}", purged, library_id);
        }
        Ok(purged)
    }

    fn get_value<T: for<'de> Deserialize<'de>>(
        &self,
        definition: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, LibraryError> {
        let db = self.handle()?;
        let read_txn = db.begin_read()?;
        let table = match read_txn.open_table(definition) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value = match table.get(key)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(value)
    }

    fn count(&self, definition: TableDefinition<&str, &[u8]>) -> Result<u64, LibraryError> {
        let db = self.handle()?;
        let read_txn = db.begin_read()?;
        let table = match read_txn.open_table(definition) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        Ok(table.len()?)
    }
}

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    KeyParse(String),
    UnknownLibrary(u32),
    Released,
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Redb(err) => write!(f, "db error: {}", err),
            LibraryError::Bincode(err) => write!(f, "bincode error: {}", err),
            LibraryError::KeyParse(value) => write!(f, "key parse error: {}", value),
            LibraryError::UnknownLibrary(id) => write!(f, "unknown library: {}", id),
            LibraryError::Released => write!(f, "library index is released to another process"),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<redb::Error> for LibraryError {
    fn from(err: redb::Error) -> Self {
        LibraryError::Redb(err)
    }
}

impl From<DatabaseError> for LibraryError {
    fn from(err: DatabaseError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TableError> for LibraryError {
    fn from(err: TableError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TransactionError> for LibraryError {
    fn from(err: TransactionError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<StorageError> for LibraryError {
    fn from(err: StorageError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<CommitError> for LibraryError {
    fn from(err: CommitError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for LibraryError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        LibraryError::Bincode(err)
    }
}

fn open_or_create_db(path: &Path) -> Result<Database, LibraryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn prepare_index(db: &Database) -> Result<(), LibraryError> {
    let write_txn = db.begin_write()?;
    {
        let version: Option<u32> = {
            let meta = write_txn.open_table(META_TABLE)?;
            let value = meta.get(META_VERSION_KEY)?;
            match value {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            }
        };
        match version {
            Some(version) if version == INDEX_VERSION => {}
            Some(version) => {
                warn!("Index version mismatch ({}); clearing index", version);
                for table in ALL_TABLES {
                    clear_table(&write_txn, table)?;
                }
            }
            None => {}
        }
        for table in ALL_TABLES {
            write_txn.open_table(table)?;
        }
        let mut meta = write_txn.open_table(META_TABLE)?;
        let version_bytes = encode_value(&INDEX_VERSION)?;
        meta.insert(META_VERSION_KEY, version_bytes.as_slice())?;
    }
    write_txn.commit()?;
    Ok(())
}

fn clear_table(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
) -> Result<(), LibraryError> {
    match txn.delete_table(table) {
        Ok(_) => Ok(()),
        Err(TableError::TableDoesNotExist(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}

fn merge_album(mut existing: Album, incoming: &Album) -> Album {
    merge_genres(&mut existing.genres, &incoming.genres);
    if existing.genre.is_empty() {
        existing.genre = incoming.genre.clone();
    }
    for folder_id in &incoming.folder_ids {
        if !existing.folder_ids.contains(folder_id) {
            existing.folder_ids.push(folder_id.clone());
        }
    }
    if incoming.min_year != 0 && (existing.min_year == 0 || incoming.min_year < existing.min_year) {
        existing.min_year = incoming.min_year;
    }
    if incoming.max_year > existing.max_year {
        existing.max_year = incoming.max_year;
    }
    existing.compilation = existing.compilation || incoming.compilation;
    existing
}

fn merge_artist(mut existing: Artist, incoming: &Artist) -> Artist {
    merge_genres(&mut existing.genres, &incoming.genres);
    if existing.mbz_artist_id.is_empty() {
        existing.mbz_artist_id = incoming.mbz_artist_id.clone();
    }
    if existing.sort_artist_name.is_empty() {
        existing.sort_artist_name = incoming.sort_artist_name.clone();
    }
    existing
}

fn merge_genres(target: &mut Vec<Genre>, incoming: &[Genre]) {
    let mut seen: HashSet<String> = target
        .iter()
        .map(|genre| genre.name.trim().to_lowercase())
        .collect();
    for genre in incoming {
        let name = genre.name.trim();
        if name.is_empty() {
            continue;
        }
        if seen.insert(name.to_lowercase()) {
            target.push(Genre {
                name: name.to_string(),
            });
        }
    }
}

fn pair_key(first: &str, second: &str) -> String {
    let mut out = String::with_capacity(first.len() + second.len() + 1);
    out.push_str(first);
    out.push(KEY_SEP);
    out.push_str(second);
    out
}

fn library_folder_key(library_id: u32, folder_id: &str) -> String {
    pair_key(&library_id.to_string(), folder_id)
}

fn prefix_key(prefix: &str) -> String {
    let mut out = String::new();
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

fn prefix_end(prefix: &str) -> String {
    let mut end = prefix.to_string();
    end.push('\u{10ffff}');
    end
}

fn split_key_last(value: &str) -> Result<(&str, &str), LibraryError> {
    let idx = value
        .rfind(KEY_SEP)
        .ok_or_else(|| LibraryError::KeyParse(value.to_string()))?;
    let next = idx + KEY_SEP.len_utf8();
    Ok((&value[..idx], &value[next..]))
}
