//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Process-wide throttling configuration
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    /// Maximum number of concurrent transfers across all jobs (<= 0 = no limit)
    pub max_transfers: i64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_transfers: throttle::DEFAULT_MAX_TRANSFERS,
        }
    }
}

impl ThrottleConfig {
    pub fn apply(&self) {
        throttle::set_max_transfers(self.max_transfers);
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// Log directive used when `RUST_LOG` is not set.
    pub fn log_directive(&self) -> &'static str {
        if self.quiet {
            return "off";
        }
        match self.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_log_levels() {
        let levels: Vec<_> = (0..5)
            .map(|verbose| {
                OutputConfig {
                    verbose,
                    ..Default::default()
                }
                .log_directive()
            })
            .collect();
        assert_eq!(levels, vec!["error", "info", "debug", "trace", "trace"]);
        let quiet = OutputConfig {
            quiet: true,
            verbose: 3,
            print_summary: true,
        };
        assert_eq!(quiet.log_directive(), "off");
    }

    #[test]
    fn default_throttle_is_serial() {
        assert_eq!(ThrottleConfig::default().max_transfers, 1);
    }
}
