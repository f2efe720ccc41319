use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_GENRE_SEPARATORS: &str = ";/,";
pub const DEFAULT_IGNORED_ARTICLES: &str = "The El La Los Las Le Les Os As O A";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub genre_separators: String,
    pub group_album_releases: bool,
    pub ignored_articles: String,
    pub status_update_interval_ms: u64,
    pub files_batch_size: usize,
    pub folder_workers: usize,
    /// Run each scan in a child process instead of in-process.
    pub external: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            genre_separators: DEFAULT_GENRE_SEPARATORS.to_string(),
            group_album_releases: false,
            ignored_articles: DEFAULT_IGNORED_ARTICLES.to_string(),
            status_update_interval_ms: 2000,
            files_batch_size: 100,
            folder_workers: 4,
            external: false,
        }
    }
}

impl ScannerConfig {
    pub fn mapping(&self) -> MappingOptions {
        MappingOptions {
            genre_separators: self.genre_separators.chars().collect(),
            group_album_releases: self.group_album_releases,
            ignored_articles: self
                .ignored_articles
                .split_whitespace()
                .map(|article| article.to_string())
                .collect(),
        }
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_update_interval_ms)
    }

    pub fn batch_size(&self) -> usize {
        self.files_batch_size.max(1)
    }

    pub fn workers(&self) -> usize {
        self.folder_workers.max(1)
    }
}

/// The part of the configuration the tag mapper reads.
#[derive(Clone, Debug)]
pub struct MappingOptions {
    pub genre_separators: Vec<char>,
    pub group_album_releases: bool,
    pub ignored_articles: Vec<String>,
}

impl Default for MappingOptions {
    fn default() -> Self {
        ScannerConfig::default().mapping()
    }
}
