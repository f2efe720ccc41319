use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use common::{MediaFile, Tag};
use metadata::TagExtractor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{MappingOptions, ScannerConfig};
use crate::entities::{derive_albums, derive_artists};
use crate::error::ScanError;
use crate::folder::FolderEntry;
use crate::mapping::MediaFileMapper;

/// Diffs one folder against the store and loads tags for new or changed files.
pub struct FolderProcessor {
    extractor: Arc<dyn TagExtractor>,
    options: MappingOptions,
    batch_size: usize,
}

impl FolderProcessor {
    pub fn new(extractor: Arc<dyn TagExtractor>, config: &ScannerConfig) -> Self {
        Self {
            extractor,
            options: config.mapping(),
            batch_size: config.batch_size(),
        }
    }

    pub fn process(
        &self,
        mut entry: FolderEntry,
        cancel: &CancellationToken,
    ) -> Result<FolderEntry, ScanError> {
        let stored = entry.scan_ctx.store.media_files_by_folder(&entry.id)?;
        let mut stored: HashMap<String, MediaFile> = stored
            .into_iter()
            .map(|track| (track.path.clone(), track))
            .collect();

        let full_rescan = entry.scan_ctx.full_rescan;
        let mut to_import: Vec<PathBuf> = Vec::new();
        for (name, path) in &entry.audio_files {
            let relpath = entry.file_relpath(name);
            match stored.remove(&relpath) {
                None => to_import.push(path.clone()),
                Some(_) if full_rescan => to_import.push(path.clone()),
                Some(track) => {
                    let modified = fs::metadata(path)?.modified()?;
                    if modified > track.updated_at {
                        to_import.push(path.clone());
                    }
                }
            }
        }

        let mut missing: Vec<MediaFile> = stored.into_values().collect();
        missing.sort_by(|a, b| a.path.cmp(&b.path));
        entry.missing_tracks = missing;

        if to_import.is_empty() {
            return Ok(entry);
        }
        debug!(
            "Importing {} of {} files in {:?}",
            to_import.len(),
            entry.audio_files.len(),
            entry.path
        );

        match self.load_tracks(&entry, &to_import, cancel) {
            Ok((tracks, tags)) => {
                entry.albums = derive_albums(&tracks);
                entry.artists = derive_artists(&tracks);
                entry.tracks = tracks;
                entry.tags = tags;
            }
            Err(err) => {
                warn!("Error extracting metadata from {:?}: {}", entry.path, err);
            }
        }
        Ok(entry)
    }

    fn load_tracks(
        &self,
        entry: &FolderEntry,
        paths: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<(Vec<MediaFile>, Vec<Tag>), ScanError> {
        let mapper = MediaFileMapper::new(
            entry.library_id(),
            &entry.scan_ctx.library.path,
            &entry.path,
            &entry.id,
            &self.options,
        );
        let mut tracks = Vec::with_capacity(paths.len());
        let mut tags = Vec::new();
        let mut seen_tags = HashSet::new();
        for chunk in paths.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                break;
            }
            for md in self.extractor.extract(chunk)? {
                let track = mapper.to_media_file(&md);
                for tag in track.tags.flatten_all() {
                    if seen_tags.insert(tag.id.clone()) {
                        tags.push(tag);
                    }
                }
                tracks.push(track);
            }
        }
        Ok((tracks, tags))
    }
}
