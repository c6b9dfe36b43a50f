//! # Probe Driver Layer
//!
//! A driver is a long-lived worker on its own thread that accepts a stream
//! of probe requests and emits a stream of probe responses, in whatever
//! order its transport completes them. The prober talks to it exclusively
//! through a pair of message channels carrying the two-frame messages of
//! [`crate::wire`]; there is no shared mutable state.
//!
//! The generic worker loop multiplexes the command pipe with an optional
//! cadence timer and dispatches to the concrete driver through
//! [`DriverWorker`]. Concrete drivers are registered by name in
//! [`Driver::create`].
//!
//! ## Lifecycle
//!
//! `create` spawns the worker and returns only once the worker has signaled
//! readiness; a worker that dies during startup turns into a create error.
//! `destroy` (also run on drop) sends `$TERM` and joins the thread. A worker
//! that exits for any other reason raises the driver's dead flag, which the
//! prober checks on every reactor tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, tick, unbounded, Receiver, Sender};
use crossbeam_channel::{TryRecvError, TrySendError};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::drivers::external::ExternalDriver;
use crate::drivers::test::TestDriver;
use crate::probe::{ProbeReq, ProbeResp};
use crate::wire::{self, Frame, FrameTag, WireError};

/// Maximum number of driver instances a prober may run.
pub const DRIVER_MAX_CNT: usize = 100;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no driver named '{0}'")]
    UnknownDriver(String),
    #[error("driver config: {0}")]
    Config(String),
    #[error("driver startup failed: {0}")]
    Startup(String),
    #[error("driver '{0}' is unavailable: {1}")]
    Unavailable(&'static str, String),
    #[error("driver worker has shut down")]
    Dead,
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// The request was handed to the driver.
    Queued,
    /// The driver's bounded queue is full; the request was not sent.
    Dropped,
}

/// Handle through which a worker yields responses back to the prober.
pub struct ResponseYield {
    tx: Sender<Frame>,
}

impl ResponseYield {
    pub(crate) fn from_sender(tx: Sender<Frame>) -> ResponseYield {
        ResponseYield { tx }
    }

    pub fn yield_resp(&self, resp: &ProbeResp) -> Result<(), DriverError> {
        self.tx
            .send(wire::encode_resp(resp))
            .map_err(|_| DriverError::Dead)
    }
}

/// Capability set a concrete driver implements.
///
/// Construction ("init") happens on the prober thread via the driver's
/// config parser; everything here runs on the worker thread.
pub(crate) trait DriverWorker: Send {
    /// One-time setup on the worker thread, before readiness is signaled.
    /// Returns the cadence at which [`DriverWorker::on_timer`] should fire.
    fn init_thread(&mut self) -> Result<Option<Duration>, DriverError>;

    /// Handle one probe request.
    fn handle_req(&mut self, req: ProbeReq, out: &ResponseYield) -> Result<(), DriverError>;

    /// Periodic tick at the cadence returned by `init_thread`.
    fn on_timer(&mut self, out: &ResponseYield) -> Result<(), DriverError>;
}

/// A running driver instance.
pub struct Driver {
    name: String,
    cmd_tx: Sender<Frame>,
    resp_rx: Receiver<Frame>,
    dead: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.name)
            .field("dead", &self.dead)
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Start the named driver with an unbounded request queue.
    pub fn create(name: &str, config: &str) -> Result<Driver, DriverError> {
        Self::spawn(name, config, None)
    }

    /// Start the named driver with a bounded request queue; enqueueing into
    /// a full queue reports [`QueueOutcome::Dropped`].
    pub fn create_bounded(
        name: &str,
        config: &str,
        capacity: usize,
    ) -> Result<Driver, DriverError> {
        Self::spawn(name, config, Some(capacity))
    }

    fn spawn(name: &str, config: &str, capacity: Option<usize>) -> Result<Driver, DriverError> {
        let worker: Box<dyn DriverWorker> = match name {
            TestDriver::NAME => Box::new(TestDriver::from_config(config)?),
            ExternalDriver::NAME => Box::new(ExternalDriver::from_config(config)?),
            other => return Err(DriverError::UnknownDriver(other.to_string())),
        };

        let (cmd_tx, cmd_rx) = match capacity {
            Some(cap) => bounded(cap),
            None => unbounded(),
        };
        let (resp_tx, resp_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let dead = Arc::new(AtomicBool::new(false));

        let worker_dead = Arc::clone(&dead);
        let handle = thread::Builder::new()
            .name(format!("vantage-drv-{name}"))
            .spawn(move || worker_run(worker, cmd_rx, resp_tx, ready_tx, worker_dead))
            .map_err(|e| DriverError::Startup(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(DriverError::Startup(
                    "worker exited before signaling readiness".to_string(),
                ));
            }
        }

        debug!(driver = name, "driver worker ready");
        Ok(Driver {
            name: name.to_string(),
            cmd_tx,
            resp_rx,
            dead,
            worker: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking enqueue of a probe request.
    pub fn queue_req(&self, req: &ProbeReq) -> Result<QueueOutcome, DriverError> {
        if self.is_dead() {
            return Err(DriverError::Dead);
        }
        match self.cmd_tx.try_send(wire::encode_req(req)) {
            Ok(()) => Ok(QueueOutcome::Queued),
            Err(TrySendError::Full(_)) => Ok(QueueOutcome::Dropped),
            Err(TrySendError::Disconnected(_)) => Err(DriverError::Dead),
        }
    }

    /// Receive one probe response, blocking or not.
    ///
    /// Returns `Ok(None)` when non-blocking and nothing is pending.
    pub fn recv_resp(&self, blocking: bool) -> Result<Option<ProbeResp>, DriverError> {
        let frame = if blocking {
            self.resp_rx.recv().map_err(|_| DriverError::Dead)?
        } else {
            match self.resp_rx.try_recv() {
                Ok(frame) => frame,
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(DriverError::Dead),
            }
        };
        Ok(Some(wire::decode_resp(&frame)?))
    }

    /// The response channel, for registration in a multi-source
    /// `crossbeam_channel::Select`.
    pub fn poll_handle(&self) -> &Receiver<Frame> {
        &self.resp_rx
    }

    /// Has the worker exited (other than through `destroy`)?
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    /// Send the termination command and join the worker. Idempotent.
    pub fn destroy(&mut self) {
        let _ = self.cmd_tx.send(wire::term_frame());
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// The generic single-threaded driver event loop: multiplexes the command
/// pipe from the prober with the driver's cadence timer.
fn worker_run(
    mut worker: Box<dyn DriverWorker>,
    cmd_rx: Receiver<Frame>,
    resp_tx: Sender<Frame>,
    ready_tx: Sender<Result<(), DriverError>>,
    dead: Arc<AtomicBool>,
) {
    let out = ResponseYield { tx: resp_tx };

    let cadence = match worker.init_thread() {
        Ok(cadence) => cadence,
        Err(e) => {
            error!(error = %e, "driver thread setup failed");
            dead.store(true, Ordering::Relaxed);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let ticker = match cadence {
        Some(interval) => tick(interval),
        None => never(),
    };

    if ready_tx.send(Ok(())).is_err() {
        dead.store(true, Ordering::Relaxed);
        return;
    }

    let mut terminated = false;
    while !terminated {
        select! {
            recv(cmd_rx) -> msg => {
                let frame = match msg {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                match frame.tag {
                    FrameTag::Term => terminated = true,
                    FrameTag::Req => {
                        let req = match wire::decode_req(&frame) {
                            Ok(req) => req,
                            Err(e) => {
                                warn!(error = %e, "dropping malformed request frame");
                                continue;
                            }
                        };
                        if let Err(e) = worker.handle_req(req, &out) {
                            error!(error = %e, "request handling failed, shutting down driver");
                            break;
                        }
                    }
                    FrameTag::Resp => warn!("unexpected RESP command on driver pipe"),
                }
            }
            recv(ticker) -> _ => {
                if let Err(e) = worker.on_timer(&out) {
                    error!(error = %e, "driver timer failed, shutting down driver");
                    break;
                }
            }
        }
    }

    if !terminated {
        dead.store(true, Ordering::Relaxed);
    }
    debug!("driver thread shutting down");
}

/// Parse a driver config string of whitespace-separated `key=value` options.
pub(crate) fn parse_config(config: &str) -> Result<Vec<(String, String)>, DriverError> {
    let mut options = Vec::new();
    for part in config.split_whitespace() {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| DriverError::Config(format!("expected key=value, got '{part}'")))?;
        options.push((key.to_string(), value.to_string()));
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Verdict;

    fn fast_test_driver() -> Driver {
        Driver::create("test", "max-rtt=5 timer-interval=10").unwrap()
    }

    #[test]
    fn unknown_driver_name_is_rejected() {
        assert!(matches!(
            Driver::create("nope", ""),
            Err(DriverError::UnknownDriver(_))
        ));
    }

    #[test]
    fn bad_config_is_rejected_at_create() {
        assert!(matches!(
            Driver::create("test", "gibberish"),
            Err(DriverError::Config(_))
        ));
    }

    #[test]
    fn external_driver_fails_at_startup() {
        let err = Driver::create("external", "endpoint=tcp://localhost:9000").unwrap_err();
        assert!(matches!(err, DriverError::Unavailable("external", _)));
    }

    #[test]
    fn queue_and_receive_one_response() {
        let driver = fast_test_driver();
        let req = ProbeReq {
            target_ip: 0x0a00_0001,
            wait: 0,
        };
        assert_eq!(driver.queue_req(&req).unwrap(), QueueOutcome::Queued);

        let resp = driver.recv_resp(true).unwrap().unwrap();
        assert_eq!(resp.target_ip, req.target_ip);
    }

    #[test]
    fn nonblocking_recv_on_idle_driver_returns_none() {
        let driver = fast_test_driver();
        assert!(driver.recv_resp(false).unwrap().is_none());
    }

    #[test]
    fn responses_arrive_for_every_request() {
        let driver = Driver::create("test", "max-rtt=5 timer-interval=10 unresp-targets=50")
            .unwrap();
        for i in 0..20u32 {
            driver
                .queue_req(&ProbeReq {
                    target_ip: 0x0a00_0100 + i,
                    wait: 0,
                })
                .unwrap();
        }
        let mut seen = 0;
        while seen < 20 {
            if driver.recv_resp(true).unwrap().is_some() {
                seen += 1;
            }
        }
    }

    #[test]
    fn bounded_queue_reports_dropped() {
        let driver = Driver::create_bounded("test", "timer-interval=60000", 1).unwrap();
        // The worker is parked in its select with a one-minute timer, so the
        // second request cannot be drained before we try to enqueue it.
        let req = ProbeReq {
            target_ip: 1,
            wait: 0,
        };
        let mut dropped = false;
        for _ in 0..10_000 {
            if driver.queue_req(&req).unwrap() == QueueOutcome::Dropped {
                dropped = true;
                break;
            }
        }
        assert!(dropped, "bounded queue never reported Dropped");
    }

    #[test]
    fn destroy_is_idempotent_and_kills_worker() {
        let mut driver = fast_test_driver();
        driver.destroy();
        driver.destroy();
        assert!(matches!(
            driver.queue_req(&ProbeReq {
                target_ip: 1,
                wait: 0
            }),
            Err(DriverError::Dead) | Ok(QueueOutcome::Queued)
        ));
    }

    #[test]
    fn deterministic_driver_is_reproducible() {
        let run = || -> Vec<Verdict> {
            let driver =
                Driver::create("test", "max-rtt=5 timer-interval=10 unresp-probes=50 seed=99")
                    .unwrap();
            for i in 0..10u32 {
                driver
                    .queue_req(&ProbeReq {
                        target_ip: 0x0a00_0000 + i,
                        wait: 0,
                    })
                    .unwrap();
            }
            (0..10)
                .map(|_| driver.recv_resp(true).unwrap().unwrap().verdict)
                .collect()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn parse_config_accepts_key_value_pairs() {
        let opts = parse_config("a=1  b=two").unwrap();
        assert_eq!(
            opts,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string())
            ]
        );
        assert!(parse_config("").unwrap().is_empty());
    }
}
