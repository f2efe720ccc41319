use std::collections::HashSet;
use std::time::SystemTime;

use common::{LibraryInfo, MediaFile};
use library::{FolderChanges, Library, LibraryError};

/// Storage the scanner reads folder state from and writes results to.
pub trait DataStore: Send + Sync {
    fn media_files_by_folder(&self, folder_id: &str) -> Result<Vec<MediaFile>, LibraryError>;
    fn count_media_files(&self) -> Result<u64, LibraryError>;
    fn count_folders(&self) -> Result<u64, LibraryError>;
    fn get_library(&self, id: u32) -> Result<Option<LibraryInfo>, LibraryError>;
    fn libraries(&self) -> Result<Vec<LibraryInfo>, LibraryError>;
    fn save_folder(&self, changes: &FolderChanges<'_>) -> Result<(), LibraryError>;
    fn purge_folders(&self, library_id: u32, seen: &HashSet<String>) -> Result<usize, LibraryError>;
    fn set_last_scan(&self, library_id: u32, at: SystemTime) -> Result<(), LibraryError>;
    /// Gives up the underlying file so a child process can open it.
    fn release(&self);
    fn reopen(&self) -> Result<(), LibraryError>;
}

impl DataStore for Library {
    fn media_files_by_folder(&self, folder_id: &str) -> Result<Vec<MediaFile>, LibraryError> {
        Library::media_files_by_folder(self, folder_id)
    }

    fn count_media_files(&self) -> Result<u64, LibraryError> {
        Library::count_media_files(self)
    }

    fn count_folders(&self) -> Result<u64, LibraryError> {
        Library::count_folders(self)
    }

    fn get_library(&self, id: u32) -> Result<Option<LibraryInfo>, LibraryError> {
        Library::get_library(self, id)
    }

    fn libraries(&self) -> Result<Vec<LibraryInfo>, LibraryError> {
        self.list_libraries()
    }

    fn save_folder(&self, changes: &FolderChanges<'_>) -> Result<(), LibraryError> {
        Library::save_folder(self, changes)
    }

    fn purge_folders(
        &self,
        library_id: u32,
        seen: &HashSet<String>,
    ) -> Result<usize, LibraryError> {
        Library::purge_folders(self, library_id, seen)
    }

    fn set_last_scan(&self, library_id: u32, at: SystemTime) -> Result<(), LibraryError> {
        Library::set_last_scan(self, library_id, at)
    }

    fn release(&self) {
        Library::release(self)
    }

    fn reopen(&self) -> Result<(), LibraryError> {
        Library::reopen(self)
    }
}
