//! Log stream setup.
//!
//! Everything goes to stdout so the platform's log collector sees the
//! progress markers of both phases. `RUST_LOG` takes precedence over the
//! configured level.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LogSettings};

/// Install the global subscriber. Later calls are ignored.
pub fn init(settings: &LogSettings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stdout)
            .with_current_span(false)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stdout)
            .with_target(false)
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!("Logging already initialised: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_idempotent() {
        let settings = LogSettings {
            format: LogFormat::Pretty,
            level: "warn".into(),
        };
        init(&settings);
        init(&settings);
        init(&LogSettings::default());
    }

    #[test]
    fn test_init_tolerates_bad_level() {
        init(&LogSettings {
            format: LogFormat::Json,
            level: "not=a=filter=".into(),
        });
    }
}
