//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Engine configuration.
///
/// All pacing and retry thresholds are tunable; the defaults mirror a
/// small re-engagement campaign (tens of conversations per day).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Booking URL shared with engaged leads.
    pub booking_link: String,
    /// Maximum outbound body length in characters (SMS segments are 160;
    /// two segments is the practical ceiling for this campaign).
    pub max_body_chars: usize,
    /// Minimum interval between outbound messages to the same lead.
    pub per_lead_interval: Duration,
    /// No inbound activity for this long moves an engaged conversation
    /// to unresponsive.
    pub unresponsive_after: Duration,
    /// Interval between re-engagement attempts for unresponsive leads.
    pub reengagement_interval: Duration,
    /// Re-engagement attempts before an unresponsive conversation is
    /// left alone for good.
    pub max_reengagement_attempts: u32,
    /// Transport send attempts per message before giving up until the
    /// next sweep.
    pub max_send_attempts: u32,
    /// Base delay for exponential backoff between send attempts.
    pub retry_base_delay: Duration,
    /// Global ceiling on outbound sends per scheduler sweep.
    pub max_sends_per_sweep: usize,
    /// Scheduler sweep cadence.
    pub sweep_interval: Duration,
}

impl EngineConfig {
    /// Build from environment variables. `BOOKING_LINK` is required;
    /// the pacing knobs are optional overrides on the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let booking_link = std::env::var("BOOKING_LINK")
            .map_err(|_| ConfigError::MissingEnvVar("BOOKING_LINK".to_string()))?;

        let mut config = Self {
            booking_link,
            ..Self::default()
        };
        if let Some(secs) = env_u64("REENGAGE_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("REENGAGE_MAX_SENDS_PER_SWEEP")? {
            config.max_sends_per_sweep = n as usize;
        }
        if let Some(days) = env_u64("REENGAGE_UNRESPONSIVE_AFTER_DAYS")? {
            config.unresponsive_after = Duration::from_secs(days * 24 * 3600);
        }
        if let Some(days) = env_u64("REENGAGE_REENGAGEMENT_INTERVAL_DAYS")? {
            config.reengagement_interval = Duration::from_secs(days * 24 * 3600);
        }
        if let Some(n) = env_u64("REENGAGE_MAX_REENGAGEMENT_ATTEMPTS")? {
            config.max_reengagement_attempts = n as u32;
        }
        Ok(config)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected an integer, got '{raw}'"),
        }),
        Err(_) => Ok(None),
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            booking_link: "https://calendly.com/example/sales-call".to_string(),
            max_body_chars: 320,
            per_lead_interval: Duration::from_secs(60),
            unresponsive_after: Duration::from_secs(3 * 24 * 3600), // 3 days
            reengagement_interval: Duration::from_secs(2 * 24 * 3600), // 2 days
            max_reengagement_attempts: 3,
            max_send_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            max_sends_per_sweep: 10,
            sweep_interval: Duration::from_secs(60),
        }
    }
}
