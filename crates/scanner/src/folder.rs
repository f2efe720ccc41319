use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use common::{
    folder_id, join_relpath, parent_relpath, relpath_from, Album, Artist, FolderRecord,
    LibraryInfo, MediaFile, Tag,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::ScanError;
use crate::store::DataStore;

pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "opus", "m4a", "mp4", "aac", "wav", "aif", "aiff", "wma", "ape",
    "wv", "mpc", "dsf",
];

/// Shared by every folder of one library pass.
pub struct ScanContext {
    pub library: LibraryInfo,
    pub store: Arc<dyn DataStore>,
    pub full_rescan: bool,
}

/// One directory's scan-time state.
pub struct FolderEntry {
    pub id: String,
    pub scan_ctx: Arc<ScanContext>,
    pub path: PathBuf,
    /// Library-relative, slash separated; empty for the library root.
    pub relpath: String,
    pub parent_id: Option<String>,
    pub mod_time: SystemTime,
    /// File name → absolute path, for every audio file physically present.
    pub audio_files: BTreeMap<String, PathBuf>,
    pub tracks: Vec<MediaFile>,
    pub tags: Vec<Tag>,
    pub albums: Vec<Album>,
    pub artists: Vec<Artist>,
    pub missing_tracks: Vec<MediaFile>,
}

impl FolderEntry {
    pub fn new(scan_ctx: Arc<ScanContext>, relpath: &str) -> Self {
        let library_id = scan_ctx.library.id;
        let path = join_relpath(&scan_ctx.library.path, relpath);
        Self {
            id: folder_id(library_id, relpath),
            parent_id: parent_relpath(relpath).map(|parent| folder_id(library_id, parent)),
            path,
            relpath: relpath.to_string(),
            scan_ctx,
            mod_time: SystemTime::UNIX_EPOCH,
            audio_files: BTreeMap::new(),
            tracks: Vec::new(),
            tags: Vec::new(),
            albums: Vec::new(),
            artists: Vec::new(),
            missing_tracks: Vec::new(),
        }
    }

    pub fn library_id(&self) -> u32 {
        self.scan_ctx.library.id
    }

    /// Library-relative path of a file in this folder.
    pub fn file_relpath(&self, name: &str) -> String {
        if self.relpath.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.relpath, name)
        }
    }

    pub fn to_record(&self) -> FolderRecord {
        FolderRecord {
            id: self.id.clone(),
            library_id: self.library_id(),
            path: self.relpath.clone(),
            parent_id: self.parent_id.clone(),
            updated_at: self.mod_time,
        }
    }
}

/// A directory the walk could not read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkFailure {
    pub relpath: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct WalkSummary {
    pub seen: HashSet<String>,
    /// Unreadable directories, at most one per path.
    pub failures: Vec<WalkFailure>,
    /// False when the walk was cancelled, the consumer went away or a directory failed.
    pub complete: bool,
}

impl WalkSummary {
    fn fail(&mut self, relpath: String, message: String) {
        if self.failures.iter().any(|failure| failure.relpath == relpath) {
            return;
        }
        self.failures.push(WalkFailure { relpath, message });
    }
}

pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Walks every directory under the library root, handing one entry per folder to `emit`.
/// `emit` returns false to stop the walk.
pub fn walk_library<F>(
    scan_ctx: Arc<ScanContext>,
    cancel: &CancellationToken,
    mut emit: F,
) -> Result<WalkSummary, ScanError>
where
    F: FnMut(FolderEntry) -> bool,
{
    let root = scan_ctx.library.path.clone();
    if !root.is_dir() {
        return Err(ScanError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("library root {:?} is not a directory", root),
        )));
    }

    let mut summary = WalkSummary::default();
    let walker = WalkDir::new(&root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.file_type().is_dir() && !is_hidden(entry));
    for item in walker {
        if cancel.is_cancelled() {
            debug!("Walk of {:?} cancelled", root);
            return Ok(summary);
        }
        let dir = match item {
            Ok(dir) => dir,
            Err(err) => {
                warn!("Failed to walk {:?}: {}", root, err);
                let relpath = err
                    .path()
                    .and_then(|path| relpath_from(&root, path))
                    .unwrap_or_default();
                summary.fail(relpath, err.to_string());
                continue;
            }
        };
        let relpath = match relpath_from(&root, dir.path()) {
            Some(relpath) => relpath,
            None => continue,
        };
        let mut entry = FolderEntry::new(Arc::clone(&scan_ctx), &relpath);
        summary.seen.insert(entry.id.clone());
        if let Err(err) = load_folder(&mut entry) {
            warn!("Skipping folder {:?}: {}", dir.path(), err);
            summary.fail(relpath, err.to_string());
            continue;
        }
        if !emit(entry) {
            return Ok(summary);
        }
    }
    summary.complete = summary.failures.is_empty();
    Ok(summary)
}

fn load_folder(entry: &mut FolderEntry) -> Result<(), std::io::Error> {
    entry.mod_time = fs::metadata(&entry.path)?.modified()?;
    for item in fs::read_dir(&entry.path)? {
        let item = item?;
        let path = item.path();
        let file_type = match item.file_type() {
            Ok(file_type) => file_type,
            Err(_) => continue,
        };
        let is_file = file_type.is_file() || (file_type.is_symlink() && path.is_file());
        if !is_file || !is_audio_file(&path) {
            continue;
        }
        let name = item.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        entry.audio_files.insert(name, path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{is_audio_file, walk_library, FolderEntry, ScanContext};
    use common::LibraryInfo;
    use library::Library;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn context(root: &Path, store: Library) -> Arc<ScanContext> {
        Arc::new(ScanContext {
            library: LibraryInfo {
                id: 1,
                name: "Music".to_string(),
                path: root.to_path_buf(),
                last_scan_at: None,
            },
            store: Arc::new(store),
            full_rescan: false,
        })
    }

    #[test]
    fn walks_every_visible_folder_with_its_audio_files() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(music.join("Artist/Album")).unwrap();
        fs::create_dir_all(music.join(".hidden/Inner")).unwrap();
        fs::write(music.join("Artist/Album/01.flac"), b"x").unwrap();
        fs::write(music.join("Artist/Album/cover.jpg"), b"x").unwrap();
        fs::write(music.join(".hidden/Inner/02.mp3"), b"x").unwrap();
        let store = Library::open(&dir.path().join("index.redb")).unwrap();

        let mut folders = Vec::new();
        let summary = walk_library(context(&music, store), &CancellationToken::new(), |entry| {
            folders.push((entry.relpath.clone(), entry.audio_files.len()));
            true
        })
        .unwrap();

        assert!(summary.complete);
        assert_eq!(summary.seen.len(), 3);
        assert_eq!(
            folders,
            vec![
                (String::new(), 0),
                ("Artist".to_string(), 0),
                ("Artist/Album".to_string(), 1)
            ]
        );
    }

    #[test]
    fn cancelled_walk_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(music.join("A")).unwrap();
        let store = Library::open(&dir.path().join("index.redb")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = walk_library(context(&music, store), &cancel, |_| true).unwrap();
        assert!(!summary.complete);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_folder_is_reported_and_walk_is_incomplete() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(music.join("A/Sub")).unwrap();
        fs::create_dir_all(music.join("B")).unwrap();
        let locked = music.join("A");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&locked).is_ok() {
            // Permission bits do not apply to this user.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }
        let store = Library::open(&dir.path().join("index.redb")).unwrap();

        let mut folders = Vec::new();
        let summary = walk_library(context(&music, store), &CancellationToken::new(), |entry| {
            folders.push(entry.relpath.clone());
            true
        });
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        let summary = summary.unwrap();

        assert!(!summary.complete);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].relpath, "A");
        folders.sort();
        assert_eq!(folders, vec![String::new(), "B".to_string()]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Library::open(&dir.path().join("index.redb")).unwrap();
        let ctx = context(&dir.path().join("absent"), store);
        assert!(walk_library(ctx, &CancellationToken::new(), |_| true).is_err());
    }

    #[test]
    fn entry_ids_link_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Library::open(&dir.path().join("index.redb")).unwrap();
        let ctx = context(dir.path(), store);
        let root = FolderEntry::new(Arc::clone(&ctx), "");
        let child = FolderEntry::new(Arc::clone(&ctx), "Artist");
        assert!(root.parent_id.is_none());
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(child.file_relpath("a.mp3"), "Artist/a.mp3");
        assert_eq!(root.file_relpath("a.mp3"), "a.mp3");
        assert!(is_audio_file(Path::new("x/Song.FLAC")));
        assert!(!is_audio_file(Path::new("x/notes.txt")));
    }
}
