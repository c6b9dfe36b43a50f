//! # External Prober Driver (stub)
//!
//! Placeholder for the driver that hands probing to a real measurement
//! process over a control socket. The config surface is wired up so that
//! deployments can already carry the flag, but startup fails until the
//! integration lands: the prober treats that as a fatal driver startup
//! error, which is the safe behavior for a host that cannot actually probe.

use std::time::Duration;

use crate::driver::{parse_config, DriverError, DriverWorker, ResponseYield};
use crate::probe::ProbeReq;

pub struct ExternalDriver {
    endpoint: String,
}

impl ExternalDriver {
    pub(crate) const NAME: &'static str = "external";

    pub(crate) fn from_config(config: &str) -> Result<ExternalDriver, DriverError> {
        let mut endpoint = None;
        for (key, value) in parse_config(config)? {
            match key.as_str() {
                "endpoint" => endpoint = Some(value),
                other => {
                    return Err(DriverError::Config(format!("unknown option '{other}'")));
                }
            }
        }
        let endpoint = endpoint
            .ok_or_else(|| DriverError::Config("missing required option 'endpoint'".into()))?;
        Ok(ExternalDriver { endpoint })
    }
}

impl DriverWorker for ExternalDriver {
    fn init_thread(&mut self) -> Result<Option<Duration>, DriverError> {
        Err(DriverError::Unavailable(
            Self::NAME,
            format!(
                "no external prober integration is built in (endpoint '{}')",
                self.endpoint
            ),
        ))
    }

    fn handle_req(&mut self, _req: ProbeReq, _out: &ResponseYield) -> Result<(), DriverError> {
        Err(DriverError::Unavailable(
            Self::NAME,
            "driver never became ready".into(),
        ))
    }

    fn on_timer(&mut self, _out: &ResponseYield) -> Result<(), DriverError> {
        Err(DriverError::Unavailable(
            Self::NAME,
            "driver never became ready".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_endpoint_option() {
        assert!(matches!(
            ExternalDriver::from_config(""),
            Err(DriverError::Config(_))
        ));
    }

    #[test]
    fn parses_endpoint() {
        let drv = ExternalDriver::from_config("endpoint=tcp://probe-host:5555").unwrap();
        assert_eq!(drv.endpoint, "tcp://probe-host:5555");
    }

    #[test]
    fn startup_reports_unavailable() {
        let mut drv = ExternalDriver::from_config("endpoint=tcp://probe-host:5555").unwrap();
        assert!(matches!(
            drv.init_thread(),
            Err(DriverError::Unavailable("external", _))
        ));
    }
}
