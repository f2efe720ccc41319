use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use metadata::TagExtractor;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ScannerConfig;
use crate::context::RequestContext;
use crate::error::ScanError;
use crate::events::{Broker, ScanStatus};
use crate::external::ExternalScanner;
use crate::pipeline::LocalScanner;
use crate::protocol::ProgressRecord;
use crate::store::DataStore;
use crate::{DEFAULT_LIBRARY_ID, PROGRESS_QUEUE_SIZE};

/// Where a scan runs, chosen once at construction.
pub enum ScanStrategy {
    Local(LocalScanner),
    External(ExternalScanner),
}

impl ScanStrategy {
    pub async fn scan_all(
        &self,
        ctx: &RequestContext,
        full_rescan: bool,
        progress: mpsc::Sender<ProgressRecord>,
    ) {
        match self {
            ScanStrategy::Local(scanner) => scanner.scan_all(ctx, full_rescan, progress).await,
            ScanStrategy::External(scanner) => scanner.scan_all(ctx, full_rescan, progress).await,
        }
    }
}

/// Serializes scan runs, aggregates their progress and publishes status.
pub struct Scanner {
    strategy: Arc<ScanStrategy>,
    store: Arc<dyn DataStore>,
    broker: Arc<dyn Broker>,
    root: CancellationToken,
    active: AtomicBool,
    count: AtomicU32,
    folder_count: AtomicU32,
    last_scan: Mutex<Option<SystemTime>>,
    status_interval: Duration,
}

impl Scanner {
    pub fn new(
        strategy: ScanStrategy,
        store: Arc<dyn DataStore>,
        broker: Arc<dyn Broker>,
        root: CancellationToken,
        status_interval: Duration,
    ) -> Self {
        Self {
            strategy: Arc::new(strategy),
            store,
            broker,
            root,
            active: AtomicBool::new(false),
            count: AtomicU32::new(0),
            folder_count: AtomicU32::new(0),
            last_scan: Mutex::new(None),
            status_interval,
        }
    }

    pub fn from_config(
        config: &ScannerConfig,
        store: Arc<dyn DataStore>,
        extractor: Arc<dyn TagExtractor>,
        broker: Arc<dyn Broker>,
        root: CancellationToken,
    ) -> Result<Self, ScanError> {
        let strategy = if config.external {
            info!("Scans run in a child process");
            ScanStrategy::External(ExternalScanner::new(Arc::clone(&store))?)
        } else {
            ScanStrategy::Local(LocalScanner::new(Arc::clone(&store), extractor, config))
        };
        Ok(Self::new(
            strategy,
            store,
            broker,
            root,
            config.status_interval(),
        ))
    }

    pub fn is_scanning(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn scan_all(&self, ctx: &RequestContext, full_rescan: bool) -> Result<(), ScanError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ScanError::AlreadyScanning);
        }
        let _active = ActiveGuard(&self.active);

        self.count.store(0, Ordering::SeqCst);
        self.folder_count.store(0, Ordering::SeqCst);
        *self.last_scan.lock() = self.stored_last_scan();

        let scan_ctx = ctx.derive(&self.root);
        info!("Scan started (full rescan: {})", full_rescan);
        self.broker.send_message(&scan_ctx, self.live_status(true));

        let (tx, mut rx) = mpsc::channel(PROGRESS_QUEUE_SIZE);
        let strategy = Arc::clone(&self.strategy);
        let task_ctx = scan_ctx.clone();
        let handle = tokio::spawn(async move {
            strategy.scan_all(&task_ctx, full_rescan, tx).await;
        });

        let mut errors = Vec::new();
        let mut throttle = Throttle::new(self.status_interval);
        let mut caller_cancelled = false;
        loop {
            let record = tokio::select! {
                record = rx.recv() => record,
                _ = ctx.cancellation().cancelled(), if !caller_cancelled => {
                    info!("Scan cancelled by caller");
                    caller_cancelled = true;
                    scan_ctx.cancellation().cancel();
                    continue;
                }
            };
            let Some(record) = record else { break };
            if let Some(message) = record.error {
                warn!("Scan error in {:?}: {}", record.last_path, message);
                errors.push(ScanError::Folder {
                    path: record.last_path,
                    message,
                });
                continue;
            }
            self.count.fetch_add(record.file_count, Ordering::SeqCst);
            self.folder_count.fetch_add(1, Ordering::SeqCst);
            if throttle.ready() {
                self.broker.send_message(&scan_ctx, self.live_status(true));
            }
        }
        if let Err(err) = handle.await {
            errors.push(err.into());
        }

        if let Some(last_scan) = self.stored_last_scan() {
            *self.last_scan.lock() = Some(last_scan);
        }
        let finished = self.live_status(false);
        info!(
            "Scan finished: {} files in {} folders, {} errors",
            finished.count,
            finished.folder_count,
            errors.len()
        );
        self.broker.send_message(&scan_ctx, finished);

        match ScanError::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn status(&self) -> Result<ScanStatus, ScanError> {
        if self.is_scanning() {
            return Ok(self.live_status(true));
        }
        let library = self.store.get_library(DEFAULT_LIBRARY_ID)?;
        let count = self.store.count_media_files()?;
        let folder_count = self.store.count_folders()?;
        Ok(ScanStatus {
            scanning: false,
            last_scan: library.and_then(|library| library.last_scan_at),
            count: saturate(count),
            folder_count: saturate(folder_count),
        })
    }

    fn live_status(&self, scanning: bool) -> ScanStatus {
        ScanStatus {
            scanning,
            last_scan: *self.last_scan.lock(),
            count: self.count.load(Ordering::SeqCst),
            folder_count: self.folder_count.load(Ordering::SeqCst),
        }
    }

    fn stored_last_scan(&self) -> Option<SystemTime> {
        match self.store.get_library(DEFAULT_LIBRARY_ID) {
            Ok(library) => library.and_then(|library| library.last_scan_at),
            Err(err) => {
                warn!("Failed to read last scan time: {}", err);
                None
            }
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Lets the first call through, then at most one per interval.
struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::{Scanner, ScanStrategy, Throttle};
    use crate::config::ScannerConfig;
    use crate::context::RequestContext;
    use crate::error::ScanError;
    use crate::events::{EventBroker, ScanStatus};
    use crate::pipeline::LocalScanner;
    use common::Tags;
    use library::Library;
    use metadata::{FileTags, MetadataError, TagExtractor};
    use parking_lot::Mutex;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Blocks every extraction until the test lets it go.
    struct GateExtractor {
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
    }

    impl TagExtractor for GateExtractor {
        fn extract(&self, paths: &[PathBuf]) -> Result<Vec<FileTags>, MetadataError> {
            let _ = self.entered.lock().send(());
            let _ = self.release.lock().recv();
            Ok(paths
                .iter()
                .map(|path| FileTags::new(path.clone(), Tags::new()))
                .collect())
        }
    }

    struct InstantExtractor;

    impl TagExtractor for InstantExtractor {
        fn extract(&self, paths: &[PathBuf]) -> Result<Vec<FileTags>, MetadataError> {
            Ok(paths
                .iter()
                .map(|path| FileTags::new(path.clone(), Tags::new()))
                .collect())
        }
    }

    fn library_with_music(dir: &Path, files: &[&str]) -> Library {
        let music = dir.join("music");
        fs::create_dir_all(&music).unwrap();
        for file in files {
            fs::write(music.join(file), b"x").unwrap();
        }
        let library = Library::open(&dir.join("index.redb")).unwrap();
        library.ensure_library(1, "Music", &music).unwrap();
        library
    }

    fn scanner(
        library: &Library,
        extractor: Arc<dyn TagExtractor>,
        broker: &EventBroker,
    ) -> Scanner {
        let store = Arc::new(library.clone());
        let strategy = ScanStrategy::Local(LocalScanner::new(
            store.clone(),
            extractor,
            &ScannerConfig::default(),
        ));
        Scanner::new(
            strategy,
            store,
            Arc::new(broker.clone()),
            CancellationToken::new(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_scan_is_rejected_while_first_runs() {
        let dir = tempfile::tempdir().unwrap();
        let library = library_with_music(dir.path(), &["1.mp3", "2.mp3"]);
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        let extractor = Arc::new(GateExtractor {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let broker = EventBroker::new();
        let scanner = Arc::new(scanner(&library, extractor, &broker));

        let first = {
            let scanner = Arc::clone(&scanner);
            tokio::spawn(async move { scanner.scan_all(&RequestContext::new(), false).await })
        };
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(scanner.is_scanning());
        let before = scanner.status().unwrap();
        assert!(matches!(
            scanner.scan_all(&RequestContext::new(), true).await,
            Err(ScanError::AlreadyScanning)
        ));
        assert_eq!(scanner.status().unwrap(), before);

        release_tx.send(()).unwrap();
        first.await.unwrap().unwrap();

        assert!(!scanner.is_scanning());
        let status = scanner.status().unwrap();
        assert_eq!(status.count, 2);
        assert_eq!(status.folder_count, 1);
        assert!(status.last_scan.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn first_and_last_status_are_always_published() {
        let dir = tempfile::tempdir().unwrap();
        let library = library_with_music(dir.path(), &["1.mp3"]);
        let broker = EventBroker::new();
        let mut events = broker.subscribe();
        let scanner = scanner(&library, Arc::new(InstantExtractor), &broker);

        scanner.scan_all(&RequestContext::new(), false).await.unwrap();

        let mut statuses: Vec<ScanStatus> = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert!(event.broadcast_to_all);
            statuses.push(event.data);
        }
        let first = statuses.first().unwrap();
        let last = statuses.last().unwrap();
        assert!(first.scanning);
        assert_eq!(first.count, 0);
        assert!(!last.scanning);
        assert_eq!((last.count, last.folder_count), (1, 1));
        assert_eq!(statuses.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn caller_cancel_releases_the_flag_without_stamping() {
        let dir = tempfile::tempdir().unwrap();
        let library = library_with_music(dir.path(), &["1.mp3", "2.mp3"]);
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        let extractor = Arc::new(GateExtractor {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let broker = EventBroker::new();
        let mut events = broker.subscribe();
        let scanner = Arc::new(scanner(&library, extractor, &broker));

        let caller = CancellationToken::new();
        let run = {
            let scanner = Arc::clone(&scanner);
            let ctx = RequestContext::new().with_cancellation(caller.clone());
            tokio::spawn(async move { scanner.scan_all(&ctx, false).await })
        };
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();
        caller.cancel();
        release_tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("cancelled scan did not finish")
            .unwrap();
        assert!(result.is_ok());
        assert!(!scanner.is_scanning());

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event.data);
        }
        assert!(!last.unwrap().scanning);
        assert!(library.get_library(1).unwrap().unwrap().last_scan_at.is_none());
        assert!(scanner.status().unwrap().last_scan.is_none());
    }

    #[tokio::test]
    async fn folder_failures_are_joined_into_the_result() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        library.ensure_library(1, "Music", Path::new("/missing/one")).unwrap();
        library.ensure_library(2, "Other", Path::new("/missing/two")).unwrap();
        let broker = EventBroker::new();
        let scanner = scanner(&library, Arc::new(InstantExtractor), &broker);

        let err = scanner
            .scan_all(&RequestContext::new(), false)
            .await
            .unwrap_err();
        match err {
            ScanError::Joined(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {}", other),
        }
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn throttle_passes_first_call_then_waits() {
        let mut throttle = Throttle::new(Duration::from_secs(60));
        assert!(throttle.ready());
        assert!(!throttle.ready());
        let mut open = Throttle::new(Duration::ZERO);
        assert!(open.ready());
        assert!(open.ready());
    }
}
