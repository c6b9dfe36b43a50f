//! # Probelist Swap Controller
//!
//! Live probelist reloads run through a small state machine:
//!
//! ```text
//! Idle ──schedule()──▶ Scheduled ──spawn_if_scheduled()──▶ Running ──▶ Idle
//! ```
//!
//! A reload is scheduled from the outside (SIGHUP); at its next tick the
//! scheduler promotes it to running, spawning a loader thread that builds a
//! complete [`ProbelistState`] and hands it back over a channel. The
//! scheduler collects the finished generation only at a round boundary and
//! swaps it in there; a failed load is discarded and the active generation
//! keeps serving. Scheduling while a reload is already underway is ignored
//! with a warning.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use tracing::{error, info, warn};

use vantage_timeseries::Sink;

use crate::state::ProbelistState;

enum Phase {
    Idle,
    Scheduled,
    Running(Receiver<anyhow::Result<Box<ProbelistState>>>),
}

pub struct ReloadController {
    phase: Phase,
    path: PathBuf,
    name_ts: String,
    ts_slash24: Arc<dyn Sink>,
    ts_aggr: Arc<dyn Sink>,
    shutdown: Arc<AtomicBool>,
}

impl ReloadController {
    pub fn new(
        path: PathBuf,
        name_ts: String,
        ts_slash24: Arc<dyn Sink>,
        ts_aggr: Arc<dyn Sink>,
        shutdown: Arc<AtomicBool>,
    ) -> ReloadController {
        ReloadController {
            phase: Phase::Idle,
            path,
            name_ts,
            ts_slash24,
            ts_aggr,
            shutdown,
        }
    }

    /// Request a reload. Ignored (with a warning) while one is in flight.
    pub fn schedule(&mut self) {
        match self.phase {
            Phase::Idle => {
                info!("probelist reload scheduled");
                self.phase = Phase::Scheduled;
            }
            Phase::Scheduled | Phase::Running(_) => {
                warn!("probelist reload still in progress, ignoring request");
            }
        }
    }

    /// Promote a scheduled reload to running by spawning the loader thread.
    pub fn spawn_if_scheduled(&mut self) {
        if !matches!(self.phase, Phase::Scheduled) {
            return;
        }

        let (tx, rx) = bounded(1);
        let path = self.path.clone();
        let name_ts = self.name_ts.clone();
        let ts_slash24 = Arc::clone(&self.ts_slash24);
        let ts_aggr = Arc::clone(&self.ts_aggr);
        let shutdown = Arc::clone(&self.shutdown);

        info!("spawning probelist loader thread");
        let spawned = thread::Builder::new()
            .name("vantage-reload".to_string())
            .spawn(move || {
                let result =
                    ProbelistState::build(&path, &name_ts, ts_slash24, ts_aggr, &shutdown)
                        .map(Box::new);
                match &result {
                    Ok(_) => info!("probelist reloaded on loader thread"),
                    Err(e) => error!(error = %e, "probelist reload failed"),
                }
                let _ = tx.send(result);
            });

        match spawned {
            Ok(_) => self.phase = Phase::Running(rx),
            Err(e) => {
                error!(error = %e, "could not spawn probelist loader thread");
                self.phase = Phase::Idle;
            }
        }
    }

    /// At a round boundary: collect a finished reload, if any.
    ///
    /// Returns the freshly built generation when the loader is done; `None`
    /// while it is still running (logged, retried next boundary) or when it
    /// failed (the active generation keeps serving).
    pub fn try_take_done(&mut self) -> Option<Box<ProbelistState>> {
        let Phase::Running(rx) = &self.phase else {
            return None;
        };
        match rx.try_recv() {
            Ok(Ok(state)) => {
                info!("probelist reload done, updating at round boundary");
                self.phase = Phase::Idle;
                Some(state)
            }
            Ok(Err(_)) => {
                // already logged by the loader; keep the active generation
                self.phase = Phase::Idle;
                None
            }
            Err(TryRecvError::Empty) => {
                info!("probelist reload still in progress, waiting until next round");
                None
            }
            Err(TryRecvError::Disconnected) => {
                error!("probelist loader thread vanished without a result");
                self.phase = Phase::Idle;
                None
            }
        }
    }
}
