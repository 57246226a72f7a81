//! Session configuration (boot parameters).
//!
//! `kedr-core` is a library consumed by out-of-scope module-notifier glue,
//! not a standalone executable, so these fields are validated the way
//! kernel `module_param`s are validated at load time rather than parsed from
//! a command line.

use crate::error::{Error, Result};

/// Configuration for one instrumentation session, validated once at
/// construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name of the module to instrument. Must be non-empty.
    pub target_name: String,
    /// Directory containing the section-resolver user-mode helper script.
    pub umh_dir: Option<String>,
    /// Whether to report memory accesses whose effective address lies on
    /// the current thread/IRQ stack.
    pub process_stack_accesses: bool,
    /// `0` disables sampling; otherwise the low bits of a per-block counter
    /// gate which memory events are reported.
    pub sampling_rate: u32,
}

impl SessionConfig {
    /// Build and validate a configuration, matching the `module_param`
    /// validation that would run at module-load time.
    pub fn new(target_name: impl Into<String>) -> Result<Self> {
        let config = SessionConfig {
            target_name: target_name.into(),
            umh_dir: None,
            process_stack_accesses: false,
            sampling_rate: 0,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_umh_dir(mut self, dir: impl Into<String>) -> Self {
        self.umh_dir = Some(dir.into());
        self
    }

    pub fn with_process_stack_accesses(mut self, yes: bool) -> Self {
        self.process_stack_accesses = yes;
        self
    }

    pub fn with_sampling_rate(mut self, rate: u32) -> Self {
        self.sampling_rate = rate;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_name.is_empty() {
            return Err(Error::InvalidConfig("target_name must be non-empty"));
        }
        Ok(())
    }

    /// Sampling is disabled when `sampling_rate == 0`.
    pub fn sampling_enabled(&self) -> bool {
        self.sampling_rate != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_target_name() {
        assert!(SessionConfig::new("").is_err());
    }

    #[test]
    fn accepts_nonempty_target_name() {
        let config = SessionConfig::new("my_module").unwrap();
        assert_eq!(config.target_name, "my_module");
        assert!(!config.sampling_enabled());
    }

    #[test]
    fn sampling_rate_zero_disables_sampling() {
        let config = SessionConfig::new("m").unwrap().with_sampling_rate(0);
        assert!(!config.sampling_enabled());
        let config = config.with_sampling_rate(8);
        assert!(config.sampling_enabled());
    }
}
