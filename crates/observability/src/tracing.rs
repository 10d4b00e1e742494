//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Logging options.
///
/// `RUST_LOG` always wins over `default_directive` when set.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub default_directive: String,
    pub json: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            json: true,
        }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(options: LogOptions) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_directive));

    if options.json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_a_no_op() {
        init(LogOptions::default());
        init(LogOptions {
            default_directive: "debug".to_string(),
            json: false,
        });
    }
}
