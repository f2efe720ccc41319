use std::path::PathBuf;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use crate::scan::start_scan;
use crate::state::AppState;

pub fn configure_watcher(state: &AppState, root: PathBuf) {
    let config = state.config.read().clone();
    if !config.watch_music {
        info!("Watcher disabled (watch_music=false)");
        *state.watcher.write() = None;
        return;
    }

    let watch_debounce_secs = if config.watch_debounce_secs == 0 {
        2
    } else {
        config.watch_debounce_secs
    };
    let watch_debounce = Duration::from_secs(watch_debounce_secs);

    match setup_watcher(state.clone(), root.clone(), watch_debounce) {
        Ok(watcher) => {
            info!(
                "Watching {} for changes (debounce {}s)",
                root.display(),
                watch_debounce.as_secs()
            );
            *state.watcher.write() = Some(watcher);
        }
        Err(err) => {
            warn!("Failed to start watcher: {}", err);
            *state.watcher.write() = None;
        }
    }
}

fn setup_watcher(
    state: AppState,
    root: PathBuf,
    debounce: Duration,
) -> Result<RecommendedWatcher, Box<dyn std::error::Error>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(&root, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        watch_loop(state, rx, debounce).await;
    });

    Ok(watcher)
}

async fn watch_loop(state: AppState, mut rx: UnboundedReceiver<Event>, debounce: Duration) {
    loop {
        let event = tokio::select! {
            _ = state.shutdown.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        if !is_relevant_event(&event) {
            continue;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => {
                    info!("Changes detected; starting incremental scan");
                    start_scan(&state, false, "watcher");
                    break;
                }
                maybe_event = rx.recv() => {
                    if maybe_event.is_none() {
                        return;
                    }
                }
            }
        }
    }
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::is_relevant_event;
    use notify::event::{AccessKind, CreateKind, RemoveKind};
    use notify::{Event, EventKind};

    #[test]
    fn only_content_changes_trigger_scans() {
        assert!(is_relevant_event(&Event::new(EventKind::Create(CreateKind::File))));
        assert!(is_relevant_event(&Event::new(EventKind::Remove(RemoveKind::Folder))));
        assert!(!is_relevant_event(&Event::new(EventKind::Access(AccessKind::Any))));
    }
}
