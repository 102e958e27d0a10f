//! Liveness reporting while a provider call blocks.
//!
//! A background thread watches the run directory and reports file activity,
//! periodic heartbeats and a one-time stall warning. It only talks to the
//! [`Reporter`]; it never reads or writes session state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{EventKind, PollWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::report::Reporter;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const TICK: Duration = Duration::from_millis(500);
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

enum Signal {
    Fs(notify::Event),
    Stop,
}

/// Timing for the observer thread.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatTiming {
    pub interval: Duration,
    pub stall_after: Duration,
    pub poll_interval: Duration,
}

impl HeartbeatTiming {
    pub fn new(interval: Duration, stall_after: Duration) -> Self {
        Self {
            interval,
            stall_after,
            poll_interval: POLL_INTERVAL,
        }
    }
}

/// Handle to a running observer. Dropping it stops the thread.
pub struct Heartbeat {
    stop_tx: Sender<Signal>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    watcher: Option<PollWatcher>,
}

impl Heartbeat {
    pub fn start(
        watch_dir: &Path,
        reporter: Arc<dyn Reporter>,
        interval: Duration,
        stall_after: Duration,
    ) -> Result<Self> {
        Self::start_with(watch_dir, reporter, HeartbeatTiming::new(interval, stall_after))
    }

    pub fn start_with(
        watch_dir: &Path,
        reporter: Arc<dyn Reporter>,
        timing: HeartbeatTiming,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Signal>();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let fs_tx = tx.clone();
        let mut watcher = PollWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let _ = fs_tx.send(Signal::Fs(event));
                }
                Err(err) => debug!(err = %err, "watch error"),
            },
            notify::Config::default().with_poll_interval(timing.poll_interval),
        )
        .context("create run directory watcher")?;
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", watch_dir.display()))?;

        let handle = thread::Builder::new()
            .name("phaseloop-heartbeat".to_string())
            .spawn(move || {
                observe(&rx, reporter.as_ref(), timing);
                let _ = done_tx.send(());
            })
            .context("spawn heartbeat thread")?;
        debug!(dir = %watch_dir.display(), "heartbeat started");

        Ok(Self {
            stop_tx: tx,
            done_rx,
            handle: Some(handle),
            watcher: Some(watcher),
        })
    }

    /// Cancel the observer and wait briefly for it to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.watcher = None;
        let _ = self.stop_tx.send(Signal::Stop);
        match self.done_rx.recv_timeout(JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("heartbeat thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("heartbeat thread did not stop in time, detaching");
            }
        }
        debug!("heartbeat stopped");
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn observe(rx: &Receiver<Signal>, reporter: &dyn Reporter, timing: HeartbeatTiming) {
    let started = Instant::now();
    let mut last_activity = started;
    let mut last_heartbeat = started;
    let mut stall_reported = false;

    loop {
        match rx.recv_timeout(TICK) {
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Ok(Signal::Fs(event)) => {
                if let Some(verb) = describe(&event.kind) {
                    for path in &event.paths {
                        reporter.info(&format!("{} {verb}", file_label(path)));
                    }
                    last_activity = Instant::now();
                    stall_reported = false;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        let idle = now.duration_since(last_activity);
        if !stall_reported && idle >= timing.stall_after {
            stall_reported = true;
            reporter.warn(&format!(
                "no file activity for {}; the provider may be stalled",
                format_elapsed(idle)
            ));
        }
        if now.duration_since(last_heartbeat) >= timing.interval {
            last_heartbeat = now;
            reporter.info(&format!(
                "still working ({} elapsed, last activity {} ago)",
                format_elapsed(now.duration_since(started)),
                format_elapsed(idle)
            ));
        }
    }
}

fn describe(kind: &EventKind) -> Option<&'static str> {
    match kind {
        EventKind::Create(_) => Some("created"),
        EventKind::Modify(_) => Some("modified"),
        EventKind::Remove(_) => Some("deleted"),
        _ => None,
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}

/// Format as `45s`, `3m 20s` or `1h 05m`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    }
}
