//! # Signal Handling
//!
//! SIGINT and SIGTERM raise the shutdown flag; SIGHUP raises the reload
//! flag. Handlers only flip atomics; the scheduler reactor observes both
//! flags at its next event boundary.

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag;

/// Register the prober's signal handlers against the given flags.
pub fn install(shutdown: &Arc<AtomicBool>, reload: &Arc<AtomicBool>) -> io::Result<()> {
    flag::register(SIGINT, Arc::clone(shutdown))?;
    flag::register(SIGTERM, Arc::clone(shutdown))?;
    flag::register(SIGHUP, Arc::clone(reload))?;
    Ok(())
}
