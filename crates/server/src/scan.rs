use std::io::Write;
use std::sync::Arc;

use scanner::{
    write_record, LocalScanner, RequestContext, ScanError, Scanner, FULL_RESCAN_FLAG,
    PROGRESS_QUEUE_SIZE, SUBPROCESS_FLAG,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::state::AppState;

/// Flags of the `scan` subcommand.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanCommand {
    pub subprocess: bool,
    pub full_rescan: bool,
}

impl ScanCommand {
    /// Returns `None` unless the first argument is `scan`.
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Option<Self>, String> {
        let mut args = args.into_iter();
        match args.next().as_deref() {
            Some("scan") => {}
            _ => return Ok(None),
        }
        let mut command = ScanCommand::default();
        for arg in args {
            match arg.as_str() {
                SUBPROCESS_FLAG => command.subprocess = true,
                FULL_RESCAN_FLAG => command.full_rescan = true,
                other => return Err(format!("unknown scan option: {}", other)),
            }
        }
        Ok(Some(command))
    }
}

/// Starts a background scan; a scan already in progress wins.
pub fn start_scan(state: &AppState, full_rescan: bool, reason: &'static str) {
    let scanner = Arc::clone(&state.scanner);
    let ctx = RequestContext::new().with_user(reason);
    tokio::spawn(async move {
        match scanner.scan_all(&ctx, full_rescan).await {
            Ok(()) => info!("Library scan ({}) finished", reason),
            Err(ScanError::AlreadyScanning) => {
                debug!("Library scan ({}) skipped: already scanning", reason)
            }
            Err(err) => warn!("Library scan ({}) finished with errors:\n{}", reason, err),
        }
    });
}

/// Child side of an external scan: progress frames go to stdout. Returns the exit code.
pub async fn run_subprocess(
    scanner: LocalScanner,
    full_rescan: bool,
    shutdown: CancellationToken,
) -> i32 {
    let ctx = RequestContext::new().with_cancellation(shutdown.child_token());
    let (tx, mut rx) = mpsc::channel(PROGRESS_QUEUE_SIZE);

    let scan = scanner.scan_all(&ctx, full_rescan, tx);
    let relay = async {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        while let Some(record) = rx.recv().await {
            if let Err(err) = write_record(&mut out, &record) {
                error!("Failed to write progress record: {}", err);
                ctx.cancellation().cancel();
                return false;
            }
        }
        out.flush().is_ok()
    };
    let ((), written) = tokio::join!(scan, relay);
    if written {
        0
    } else {
        1
    }
}

/// Runs one scan through the controller and prints the totals.
pub async fn run_once(scanner: &Scanner, full_rescan: bool, shutdown: CancellationToken) -> i32 {
    let ctx = RequestContext::new().with_cancellation(shutdown);
    let result = scanner.scan_all(&ctx, full_rescan).await;
    let code = match &result {
        Ok(()) => 0,
        Err(err) => {
            warn!("Scan finished with errors:\n{}", err);
            1
        }
    };
    match scanner.status() {
        Ok(status) => println!(
            "Scanned: {} tracks in {} folders",
            status.count, status.folder_count
        ),
        Err(err) => {
            error!("Failed to read scan status: {}", err);
            return 1;
        }
    }
    code
}

#[cfg(test)]
mod tests {
    use super::ScanCommand;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parses_scan_subcommand_flags() {
        assert_eq!(ScanCommand::parse(args(&[])).unwrap(), None);
        assert_eq!(ScanCommand::parse(args(&["serve"])).unwrap(), None);
        assert_eq!(
            ScanCommand::parse(args(&["scan", "--subprocess", "--full"])).unwrap(),
            Some(ScanCommand {
                subprocess: true,
                full_rescan: true
            })
        );
        assert_eq!(
            ScanCommand::parse(args(&["scan"])).unwrap(),
            Some(ScanCommand::default())
        );
        assert!(ScanCommand::parse(args(&["scan", "--bogus"])).is_err());
    }
}
