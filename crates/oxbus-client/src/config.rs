use oxbus::ErrorKind;
use serde::Deserialize;

use crate::{
    thread::{SchedPolicy, ThreadPriority},
    timing::Nanos,
};

/// Hard cap on the registry tied to the 16-bit wire transaction id space.
pub const MAX_REQUESTS_LIMIT: usize = 65_536;

/// Longest response deadline the timeout wheel will be sized for.
const MAX_RESPONSE_TIMEOUT: Nanos = Nanos::from_secs(600);

/// Engine-wide options.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackConfig {
    /// Floor on spacing between consecutive sends on a TCP device.
    pub inter_frame_delay: Nanos,
    /// Deadline from send to response; the timeout wheel is sized from
    /// this.
    pub response_timeout: Nanos,
    /// Capacity of the transaction registry.
    pub max_requests: usize,
    pub scheduler: SchedPolicy,
    pub priority: ThreadPriority,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            inter_frame_delay: Nanos::ZERO,
            response_timeout: Nanos::from_millis(1_000),
            max_requests: 1_024,
            scheduler: SchedPolicy::OsDefault,
            priority: ThreadPriority::OsDefault,
        }
    }
}

impl StackConfig {
    pub fn validate(&self) -> Result<(), ErrorKind> {
        if self.max_requests == 0 || self.max_requests > MAX_REQUESTS_LIMIT {
            return Err(ErrorKind::InvalidConfig);
        }
        // The wheel ticks at millisecond resolution; a deadline below one
        // tick or past the sizing cap cannot be tracked.
        if self.response_timeout < Nanos::from_millis(1)
            || self.response_timeout > MAX_RESPONSE_TIMEOUT
        {
            return Err(ErrorKind::InvalidConfig);
        }
        Ok(())
    }
}

/// Parity of the serial line. With no parity the frame carries a second
/// stop bit instead, keeping the character 11 bits long.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Per-port options for an RTU context.
#[derive(Clone, Debug, Deserialize)]
pub struct SerialParams {
    pub port_name: String,
    pub baud: u32,
    #[serde(default)]
    pub parity: Parity,
    /// Extra spacing on top of the baud-rate-derived inter-frame delay.
    #[serde(default)]
    pub inter_frame_delay: Nanos,
    #[serde(default = "default_serial_timeout")]
    pub response_timeout: Nanos,
}

fn default_serial_timeout() -> Nanos {
    Nanos::from_millis(1_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(StackConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_values() {
        let mut cfg = StackConfig::default();
        cfg.max_requests = 0;
        assert_eq!(cfg.validate(), Err(ErrorKind::InvalidConfig));

        let mut cfg = StackConfig::default();
        cfg.max_requests = MAX_REQUESTS_LIMIT + 1;
        assert_eq!(cfg.validate(), Err(ErrorKind::InvalidConfig));

        let mut cfg = StackConfig::default();
        cfg.response_timeout = Nanos::from_micros(100);
        assert_eq!(cfg.validate(), Err(ErrorKind::InvalidConfig));
    }

    #[test]
    fn deserializes_human_readable_durations() {
        let cfg: StackConfig = serde_json::from_str(
            r#"{"inter_frame_delay": "50us", "response_timeout": "250ms", "scheduler": "fifo"}"#,
        )
        .unwrap();
        assert_eq!(cfg.inter_frame_delay, Nanos::from_micros(50));
        assert_eq!(cfg.response_timeout, Nanos::from_millis(250));
        assert_eq!(cfg.scheduler, SchedPolicy::Fifo);
        assert_eq!(cfg.max_requests, 1_024);
    }

    #[test]
    fn serial_params_default_timeout() {
        let p: SerialParams =
            serde_json::from_str(r#"{"port_name": "/dev/ttyUSB0", "baud": 19200, "parity": "even"}"#)
                .unwrap();
        assert_eq!(p.parity, Parity::Even);
        assert_eq!(p.response_timeout, Nanos::from_millis(1_000));
        assert_eq!(p.inter_frame_delay, Nanos::ZERO);
    }
}
