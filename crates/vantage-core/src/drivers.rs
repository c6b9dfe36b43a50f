//! Concrete probe drivers.
//!
//! - [`test`]: synthetic driver simulating RTTs and loss, for tests and
//!   benchmarks
//! - [`external`]: stub for delegating probing to an external prober process

pub mod external;
pub mod test;
