use std::sync::Arc;
use std::time::SystemTime;

use common::LibraryInfo;
use library::FolderChanges;
use metadata::TagExtractor;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::context::RequestContext;
use crate::error::ScanError;
use crate::folder::{walk_library, FolderEntry, ScanContext, WalkSummary};
use crate::process_folders::FolderProcessor;
use crate::protocol::ProgressRecord;
use crate::store::DataStore;

/// Runs the folder pipeline in this process.
pub struct LocalScanner {
    store: Arc<dyn DataStore>,
    processor: Arc<FolderProcessor>,
    workers: usize,
}

impl LocalScanner {
    pub fn new(
        store: Arc<dyn DataStore>,
        extractor: Arc<dyn TagExtractor>,
        config: &ScannerConfig,
    ) -> Self {
        Self {
            store,
            processor: Arc::new(FolderProcessor::new(extractor, config)),
            workers: config.workers(),
        }
    }

    /// Scans every library, sending one record per folder. `progress` closes when this returns.
    pub async fn scan_all(
        &self,
        ctx: &RequestContext,
        full_rescan: bool,
        progress: mpsc::Sender<ProgressRecord>,
    ) {
        let libraries = match self.store.libraries() {
            Ok(libraries) => libraries,
            Err(err) => {
                let _ = progress
                    .send(ProgressRecord::failure(0, "", format!("listing libraries: {}", err)))
                    .await;
                return;
            }
        };
        for library in libraries {
            if ctx.is_cancelled() {
                break;
            }
            self.scan_library(ctx, library, full_rescan, &progress).await;
        }
    }

    async fn scan_library(
        &self,
        ctx: &RequestContext,
        library: LibraryInfo,
        full_rescan: bool,
        progress: &mpsc::Sender<ProgressRecord>,
    ) {
        let library_id = library.id;
        info!(
            "Scanning library {} at {:?} (full rescan: {})",
            library_id, library.path, full_rescan
        );
        let scan_ctx = Arc::new(ScanContext {
            library,
            store: Arc::clone(&self.store),
            full_rescan,
        });
        let cancel = ctx.cancellation().clone();

        let (folder_tx, mut folder_rx) = mpsc::channel::<FolderEntry>(self.workers * 2);
        let walk_ctx = Arc::clone(&scan_ctx);
        let walk_cancel = cancel.clone();
        let walker = tokio::task::spawn_blocking(move || {
            walk_library(walk_ctx, &walk_cancel, |entry| folder_tx.blocking_send(entry).is_ok())
        });

        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => break,
                entry = folder_rx.recv() => entry,
            };
            let Some(entry) = entry else { break };
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let processor = Arc::clone(&self.processor);
            let progress = progress.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let relpath = entry.relpath.clone();
                let record = tokio::task::spawn_blocking(move || {
                    process_and_save(&processor, entry, &cancel)
                })
                .await
                .unwrap_or_else(|err| {
                    ProgressRecord::failure(library_id, relpath, err.to_string())
                });
                drop(permit);
                let _ = progress.send(record).await;
            });
        }
        drop(folder_rx);
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!("Folder task failed: {}", err);
            }
        }

        let summary = match walker.await {
            Ok(Ok(summary)) => summary,
            Ok(Err(err)) => {
                warn!("Library {} walk failed: {}", library_id, err);
                let _ = progress
                    .send(ProgressRecord::failure(library_id, "", err.to_string()))
                    .await;
                return;
            }
            Err(err) => {
                let _ = progress
                    .send(ProgressRecord::failure(library_id, "", err.to_string()))
                    .await;
                return;
            }
        };
        for failure in &summary.failures {
            let _ = progress
                .send(ProgressRecord::failure(
                    library_id,
                    failure.relpath.clone(),
                    failure.message.clone(),
                ))
                .await;
        }
        if cancel.is_cancelled() || !summary.complete {
            debug!("Library {} scan incomplete; skipping purge", library_id);
            return;
        }
        if let Err(err) = self.finish_library(library_id, summary).await {
            let _ = progress
                .send(ProgressRecord::failure(library_id, "", err.to_string()))
                .await;
        }
    }

    async fn finish_library(&self, library_id: u32, summary: WalkSummary) -> Result<(), ScanError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            store.purge_folders(library_id, &summary.seen)?;
            store.set_last_scan(library_id, SystemTime::now())?;
            info!(
                "Library {} scan complete ({} folders)",
                library_id,
                summary.seen.len()
            );
            Ok::<(), ScanError>(())
        })
        .await?
    }
}

fn process_and_save(
    processor: &FolderProcessor,
    entry: FolderEntry,
    cancel: &CancellationToken,
) -> ProgressRecord {
    let library_id = entry.library_id();
    let relpath = entry.relpath.clone();
    let entry = match processor.process(entry, cancel) {
        Ok(entry) => entry,
        Err(err) => {
            warn!("Failed to process folder {:?}: {}", relpath, err);
            return ProgressRecord::failure(library_id, relpath, err.to_string());
        }
    };
    let folder = entry.to_record();
    let changes = FolderChanges {
        folder: &folder,
        tracks: &entry.tracks,
        missing: &entry.missing_tracks,
        tags: &entry.tags,
        albums: &entry.albums,
        artists: &entry.artists,
    };
    if let Err(err) = entry.scan_ctx.store.save_folder(&changes) {
        warn!("Failed to save folder {:?}: {}", relpath, err);
        return ProgressRecord::failure(library_id, relpath, err.to_string());
    }
    ProgressRecord::folder(library_id, entry.audio_files.len() as u32, relpath)
}

#[cfg(test)]
mod tests {
    use super::LocalScanner;
    use crate::config::ScannerConfig;
    use crate::context::RequestContext;
    use crate::protocol::ProgressRecord;
    use common::Tags;
    use library::Library;
    use metadata::{FileTags, MetadataError, TagExtractor};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct TitleExtractor;

    impl TagExtractor for TitleExtractor {
        fn extract(&self, paths: &[PathBuf]) -> Result<Vec<FileTags>, MetadataError> {
            Ok(paths
                .iter()
                .map(|path| {
                    let mut tags = Tags::new();
                    tags.add("album", "Album");
                    tags.add("artist", "Artist");
                    let mut md = FileTags::new(path.clone(), tags);
                    md.modified = fs::metadata(path).and_then(|m| m.modified()).unwrap();
                    md
                })
                .collect())
        }
    }

    async fn run(scanner: &LocalScanner, full: bool) -> Vec<ProgressRecord> {
        let (tx, mut rx) = mpsc::channel(100);
        scanner.scan_all(&RequestContext::new(), full, tx).await;
        let mut records = Vec::new();
        while let Some(record) = rx.recv().await {
            records.push(record);
        }
        records.sort_by(|a, b| a.last_path.cmp(&b.last_path));
        records
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scans_saves_and_purges_folders() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(music.join("A")).unwrap();
        fs::create_dir_all(music.join("B")).unwrap();
        fs::write(music.join("A/1.mp3"), b"x").unwrap();
        fs::write(music.join("A/2.flac"), b"x").unwrap();
        fs::write(music.join("B/3.mp3"), b"x").unwrap();

        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        library.ensure_library(1, "Music", &music).unwrap();
        let scanner = LocalScanner::new(
            Arc::new(library.clone()),
            Arc::new(TitleExtractor),
            &ScannerConfig::default(),
        );

        let records = run(&scanner, false).await;
        let summary: Vec<(&str, u32)> = records
            .iter()
            .map(|r| (r.last_path.as_str(), r.file_count))
            .collect();
        assert_eq!(summary, vec![("", 0), ("A", 2), ("B", 1)]);
        assert!(records.iter().all(|r| r.error.is_none()));
        assert_eq!(library.count_media_files().unwrap(), 3);
        assert_eq!(library.count_folders().unwrap(), 3);
        assert!(library.get_library(1).unwrap().unwrap().last_scan_at.is_some());

        fs::remove_dir_all(music.join("B")).unwrap();
        fs::remove_file(music.join("A/2.flac")).unwrap();
        let records = run(&scanner, false).await;
        assert_eq!(records.len(), 2);
        assert_eq!(library.count_media_files().unwrap(), 1);
        assert_eq!(library.count_folders().unwrap(), 2);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreadable_folder_fails_the_scan_and_keeps_its_tracks() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(music.join("A/Sub")).unwrap();
        fs::write(music.join("A/2.mp3"), b"x").unwrap();
        fs::write(music.join("A/Sub/1.mp3"), b"x").unwrap();

        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        library.ensure_library(1, "Music", &music).unwrap();
        let scanner = LocalScanner::new(
            Arc::new(library.clone()),
            Arc::new(TitleExtractor),
            &ScannerConfig::default(),
        );
        run(&scanner, false).await;
        assert_eq!(library.count_media_files().unwrap(), 2);
        assert_eq!(library.count_folders().unwrap(), 3);
        let first_scan = library.get_library(1).unwrap().unwrap().last_scan_at;

        let locked = music.join("A");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&locked).is_ok() {
            // Permission bits do not apply to this user.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }
        let records = run(&scanner, false).await;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let failures: Vec<&ProgressRecord> =
            records.iter().filter(|r| r.error.is_some()).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].last_path, "A");
        assert_eq!(library.count_media_files().unwrap(), 2);
        assert_eq!(library.count_folders().unwrap(), 3);
        assert_eq!(library.get_library(1).unwrap().unwrap().last_scan_at, first_scan);
    }

    #[tokio::test]
    async fn missing_root_reports_one_error() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        library
            .ensure_library(1, "Music", Path::new("/definitely/not/here"))
            .unwrap();
        let scanner = LocalScanner::new(
            Arc::new(library),
            Arc::new(TitleExtractor),
            &ScannerConfig::default(),
        );
        let records = run(&scanner, false).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].error.is_some());
    }
}
