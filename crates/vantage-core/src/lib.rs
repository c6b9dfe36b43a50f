//! # vantage-core
//!
//! Core building blocks for the vantage outage prober:
//!
//! - [`probe`]: probe request/response value types
//! - [`wire`]: the two-frame codec used on the prober↔driver pipe
//! - [`driver`]: the driver abstraction (worker threads behind message pipes)
//! - [`drivers`]: concrete drivers (synthetic test driver, external stub)
//! - [`belief`]: the per-/24 Bayesian belief engine and probe policy
//! - [`probelist`]: the /24 probelist data model and loader
//!
//! The prober daemon that ties these together lives in `vantage-prober`.

pub mod belief;
pub mod driver;
pub mod drivers;
pub mod probe;
pub mod probelist;
pub mod wire;

pub use driver::{Driver, DriverError, QueueOutcome};
pub use probe::{ProbeReq, ProbeResp, ProbeType, Verdict};
