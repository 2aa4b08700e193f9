//! Tracer configuration.

use crate::activity::{ActivityBuffer, ActivityKind};
use crate::error::{Result, TraceError};

/// Environment variable overriding [`TracerConfig::buffer_size`].
pub const ENV_BUFFER_SIZE: &str = "KERNELTRACE_BUFFER_SIZE";
/// Environment variable overriding [`TracerConfig::fault_policy`] (`abort` or `propagate`).
pub const ENV_FAULT_POLICY: &str = "KERNELTRACE_FAULT_POLICY";

/// Default activity buffer size handed to the source.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Smallest accepted activity buffer size. A buffer has to hold at least one
/// kernel record together with its header.
pub const MIN_BUFFER_SIZE: usize = 64;

/// What to do when a required activity source call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Log the failure and abort the process.
    #[default]
    Abort,
    /// Return the failure to the caller of `enable`/`disable`.
    Propagate,
}

impl FaultPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "abort" => Some(FaultPolicy::Abort),
            "propagate" => Some(FaultPolicy::Propagate),
            _ => None,
        }
    }
}

/// How repeated annotations for the same correlation id are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// A later annotation replaces the stored one.
    #[default]
    LastWriteWins,
    /// The first annotation is kept, later ones are discarded.
    FirstWriteWins,
}

/// Configuration for an activity tracer.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Size in bytes of each activity buffer handed to the source.
    pub buffer_size: usize,
    /// Record kinds enabled on the source for the duration of a session.
    pub record_kinds: Vec<ActivityKind>,
    /// Storage policy for duplicate correlation ids.
    pub duplicate_policy: DuplicatePolicy,
    /// Handling of failed setup calls.
    pub fault_policy: FaultPolicy,
    /// Log the per-name summary when a profile is generated.
    pub log_summary: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            record_kinds: vec![
                ActivityKind::Memcpy,
                ActivityKind::Kernel,
                ActivityKind::Device,
                ActivityKind::Memset,
                ActivityKind::Overhead,
            ],
            duplicate_policy: DuplicatePolicy::LastWriteWins,
            fault_policy: FaultPolicy::Abort,
            log_summary: true,
        }
    }
}

impl TracerConfig {
    /// Creates a configuration that only collects kernel records.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            record_kinds: vec![ActivityKind::Kernel],
            ..Self::default()
        }
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(ENV_BUFFER_SIZE) {
            config.buffer_size = value.trim().parse().map_err(|_| {
                TraceError::Config(format!("{ENV_BUFFER_SIZE}={value} is not a byte count"))
            })?;
        }

        if let Ok(value) = std::env::var(ENV_FAULT_POLICY) {
            config.fault_policy = FaultPolicy::parse(&value).ok_or_else(|| {
                TraceError::Config(format!(
                    "{ENV_FAULT_POLICY}={value} must be `abort` or `propagate`"
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the source cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(TraceError::Config(format!(
                "buffer_size must be at least {MIN_BUFFER_SIZE} bytes"
            )));
        }
        if self.buffer_size % ActivityBuffer::ALIGN != 0 {
            return Err(TraceError::Config(format!(
                "buffer_size must be a multiple of {}",
                ActivityBuffer::ALIGN
            )));
        }
        if !self.record_kinds.iter().any(|kind| kind.is_kernel()) {
            return Err(TraceError::Config(
                "record_kinds must include a kernel kind".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`TracerConfig`].
#[derive(Debug, Default)]
pub struct TracerConfigBuilder {
    config: TracerConfig,
}

impl TracerConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder starting from [`TracerConfig::minimal`].
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            config: TracerConfig::minimal(),
        }
    }

    /// Sets the activity buffer size.
    #[must_use]
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.config.buffer_size = bytes;
        self
    }

    /// Replaces the set of enabled record kinds.
    #[must_use]
    pub fn with_record_kinds(mut self, kinds: impl IntoIterator<Item = ActivityKind>) -> Self {
        self.config.record_kinds = kinds.into_iter().collect();
        self
    }

    /// Sets the duplicate correlation id policy.
    #[must_use]
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.config.duplicate_policy = policy;
        self
    }

    /// Sets the setup fault policy.
    #[must_use]
    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.config.fault_policy = policy;
        self
    }

    /// Enables or disables the summary log on profile generation.
    #[must_use]
    pub fn with_summary_log(mut self, enabled: bool) -> Self {
        self.config.log_summary = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> TracerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracer_config_defaults() {
        let config = TracerConfig::default();
        assert_eq!(config.buffer_size, 32 * 1024);
        assert_eq!(config.fault_policy, FaultPolicy::Abort);
        assert_eq!(config.duplicate_policy, DuplicatePolicy::LastWriteWins);
        assert!(config.record_kinds.contains(&ActivityKind::Kernel));
        assert!(config.log_summary);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tracer_config_minimal() {
        let config = TracerConfig::minimal();
        assert_eq!(config.record_kinds, vec![ActivityKind::Kernel]);
    }

    #[test]
    fn test_tracer_config_builder() {
        let config = TracerConfigBuilder::new()
            .with_buffer_size(4096)
            .with_record_kinds([ActivityKind::ConcurrentKernel])
            .with_duplicate_policy(DuplicatePolicy::FirstWriteWins)
            .with_fault_policy(FaultPolicy::Propagate)
            .with_summary_log(false)
            .build();

        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.record_kinds, vec![ActivityKind::ConcurrentKernel]);
        assert_eq!(config.duplicate_policy, DuplicatePolicy::FirstWriteWins);
        assert_eq!(config.fault_policy, FaultPolicy::Propagate);
        assert!(!config.log_summary);
    }

    #[test]
    fn test_tracer_config_validation() {
        let zero = TracerConfigBuilder::new().with_buffer_size(0).build();
        assert!(matches!(zero.validate(), Err(TraceError::Config(_))));

        let too_small = TracerConfigBuilder::new().with_buffer_size(8).build();
        assert!(matches!(too_small.validate(), Err(TraceError::Config(_))));

        let smallest = TracerConfigBuilder::new()
            .with_buffer_size(MIN_BUFFER_SIZE)
            .build();
        assert!(smallest.validate().is_ok());

        let unaligned = TracerConfigBuilder::new().with_buffer_size(1001).build();
        assert!(matches!(unaligned.validate(), Err(TraceError::Config(_))));

        let no_kernels = TracerConfigBuilder::new()
            .with_record_kinds([ActivityKind::Memcpy])
            .build();
        assert!(matches!(no_kernels.validate(), Err(TraceError::Config(_))));
    }

    #[test]
    fn test_fault_policy_parse() {
        assert_eq!(FaultPolicy::parse("abort"), Some(FaultPolicy::Abort));
        assert_eq!(FaultPolicy::parse(" Propagate "), Some(FaultPolicy::Propagate));
        assert_eq!(FaultPolicy::parse("ignore"), None);
    }

    // The only test touching the process environment.
    #[test]
    fn test_from_env_overrides() {
        std::env::remove_var(ENV_BUFFER_SIZE);
        std::env::remove_var(ENV_FAULT_POLICY);
        let config = TracerConfig::from_env().unwrap();
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.fault_policy, FaultPolicy::Abort);

        std::env::set_var(ENV_BUFFER_SIZE, " 4096 ");
        std::env::set_var(ENV_FAULT_POLICY, "Propagate");
        let config = TracerConfig::from_env().unwrap();
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.fault_policy, FaultPolicy::Propagate);

        std::env::set_var(ENV_FAULT_POLICY, "ignore");
        assert!(matches!(TracerConfig::from_env(), Err(TraceError::Config(_))));
        std::env::remove_var(ENV_FAULT_POLICY);

        std::env::set_var(ENV_BUFFER_SIZE, "lots");
        assert!(matches!(TracerConfig::from_env(), Err(TraceError::Config(_))));

        std::env::set_var(ENV_BUFFER_SIZE, "8");
        assert!(matches!(TracerConfig::from_env(), Err(TraceError::Config(_))));

        std::env::remove_var(ENV_BUFFER_SIZE);
    }
}
