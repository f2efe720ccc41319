use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::error::ScanError;
use crate::protocol::{read_record, ProgressRecord, ProtocolError};
use crate::store::DataStore;

pub const SUBPROCESS_FLAG: &str = "--subprocess";
pub const FULL_RESCAN_FLAG: &str = "--full";

/// Runs the scan in a child copy of this executable and relays its progress frames.
pub struct ExternalScanner {
    program: PathBuf,
    args: Vec<OsString>,
    store: Arc<dyn DataStore>,
}

impl ExternalScanner {
    pub fn new(store: Arc<dyn DataStore>) -> Result<Self, ScanError> {
        let program = std::env::current_exe()?;
        Ok(Self::with_command(
            program,
            vec![OsString::from("scan"), OsString::from(SUBPROCESS_FLAG)],
            store,
        ))
    }

    pub fn with_command(
        program: impl Into<PathBuf>,
        args: Vec<OsString>,
        store: Arc<dyn DataStore>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            store,
        }
    }

    pub async fn scan_all(
        &self,
        ctx: &RequestContext,
        full_rescan: bool,
        progress: mpsc::Sender<ProgressRecord>,
    ) {
        self.store.release();
        let _reopen = ReopenOnDrop(self.store.as_ref());

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if full_rescan {
            command.arg(FULL_RESCAN_FLAG);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let err = ScanError::Subprocess(format!(
                    "failed to start {:?}: {}",
                    self.program, err
                ));
                warn!("{}", err);
                let _ = progress.send(failure(&err)).await;
                return;
            }
        };
        info!("External scanner started (pid {:?})", child.id());

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill().await;
                let err = ScanError::Subprocess("no stdout pipe".to_string());
                let _ = progress.send(failure(&err)).await;
                return;
            }
        };

        let cancel = ctx.cancellation().clone();
        let waiter = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    debug!("Cancelling external scanner");
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        });

        let mut reader = BufReader::new(stdout);
        let stream_error = relay(&mut reader, &progress).await;
        drop(reader);

        let outcome = match waiter.await {
            Ok(Ok(status)) => check_status(status),
            Ok(Err(err)) => Err(ScanError::Subprocess(format!("waiting for exit: {}", err))),
            Err(err) => Err(ScanError::from(err)),
        };
        let outcome = match (outcome, stream_error) {
            (Err(err), _) => Err(err),
            (Ok(()), Some(err)) => Err(err.into()),
            (Ok(()), None) => Ok(()),
        };
        match outcome {
            Ok(()) => info!("External scanner finished"),
            Err(err) => {
                warn!("External scan failed: {}", err);
                let _ = progress.send(failure(&err)).await;
            }
        }
    }
}

async fn relay<R>(reader: &mut R, progress: &mpsc::Sender<ProgressRecord>) -> Option<ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match read_record(reader).await {
            Ok(Some(record)) => {
                if progress.send(record).await.is_err() {
                    return None;
                }
            }
            Ok(None) => return None,
            Err(err) => return Some(err),
        }
    }
}

fn check_status(status: ExitStatus) -> Result<(), ScanError> {
    if status.success() {
        Ok(())
    } else {
        Err(ScanError::Subprocess(format!("exited with non-zero status: {}", status)))
    }
}

fn failure(err: &ScanError) -> ProgressRecord {
    ProgressRecord::failure(0, "", err.to_string())
}

struct ReopenOnDrop<'a>(&'a dyn DataStore);

impl Drop for ReopenOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.0.reopen() {
            warn!("Failed to reopen library index: {}", err);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::ExternalScanner;
    use crate::context::RequestContext;
    use crate::protocol::{write_record, ProgressRecord};
    use library::Library;
    use std::ffi::OsString;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    async fn collect(scanner: &ExternalScanner) -> Vec<ProgressRecord> {
        let (tx, mut rx) = mpsc::channel(100);
        scanner.scan_all(&RequestContext::new(), false, tx).await;
        let mut records = Vec::new();
        while let Some(record) = rx.recv().await {
            records.push(record);
        }
        records
    }

    fn shell(script: String) -> Vec<OsString> {
        vec![OsString::from("-c"), OsString::from(script)]
    }

    #[tokio::test]
    async fn non_zero_exit_after_one_record_yields_record_then_error() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames.bin");
        let mut buf = Vec::new();
        write_record(&mut buf, &ProgressRecord::folder(1, 4, "Artist/Album")).unwrap();
        fs::write(&frames, &buf).unwrap();

        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        let scanner = ExternalScanner::with_command(
            "sh",
            shell(format!("cat '{}'; exit 2", frames.display())),
            Arc::new(library.clone()),
        );

        let records = collect(&scanner).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], ProgressRecord::folder(1, 4, "Artist/Album"));
        assert!(records[1]
            .error
            .as_deref()
            .unwrap()
            .starts_with("external scanner: exited with non-zero status"));
        assert!(!library.is_released());
    }

    #[tokio::test]
    async fn truncated_stream_with_clean_exit_yields_one_error() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames.bin");
        let mut buf = Vec::new();
        write_record(&mut buf, &ProgressRecord::folder(1, 1, "A")).unwrap();
        write_record(&mut buf, &ProgressRecord::folder(1, 1, "B")).unwrap();
        buf.truncate(buf.len() - 2);
        fs::write(&frames, &buf).unwrap();

        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        let scanner = ExternalScanner::with_command(
            "sh",
            shell(format!("cat '{}'", frames.display())),
            Arc::new(library),
        );

        let records = collect(&scanner).await;
        assert_eq!(records.len(), 2);
        assert!(records[0].error.is_none());
        assert!(records[1].error.as_deref().unwrap().starts_with("progress stream error: "));
    }

    #[tokio::test]
    async fn cancelled_child_is_killed_and_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        let scanner = ExternalScanner::with_command(
            "sh",
            shell("exec sleep 30".to_string()),
            Arc::new(library.clone()),
        );

        let cancel = CancellationToken::new();
        let ctx = RequestContext::new().with_cancellation(cancel.clone());
        let (tx, mut rx) = mpsc::channel(100);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
        tokio::time::timeout(Duration::from_secs(10), scanner.scan_all(&ctx, false, tx))
            .await
            .expect("cancelled child was not reaped");

        let mut records = Vec::new();
        while let Some(record) = rx.recv().await {
            records.push(record);
        }
        assert_eq!(records.len(), 1);
        let message = records[0].error.as_deref().unwrap();
        assert!(message.contains("non-zero status"));
        assert!(message.contains("signal: 9"));
        assert!(!library.is_released());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_as_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        let scanner = ExternalScanner::with_command(
            dir.path().join("no-such-binary"),
            Vec::new(),
            Arc::new(library.clone()),
        );

        let records = collect(&scanner).await;
        assert_eq!(records.len(), 1);
        assert!(records[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("external scanner: failed to start"));
        assert_eq!(library.count_folders().unwrap(), 0);
        assert!(!library.is_released());
    }
}
