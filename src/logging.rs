//! Structured logging setup and log-safe formatting of card data

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Calling this more than once is
/// harmless; later calls leave the first subscriber in place.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()));

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Plain => registry.with(fmt::layer().with_target(true)).try_init(),
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Mask a PAN for logging, keeping the first six and last four digits.
///
/// Hashes, envelopes and short values are never echoed.
pub fn mask_pan(pan: &str) -> String {
    if crate::crypto::is_hash(pan) || crate::crypto::is_encrypted(pan) {
        return "[protected]".to_string();
    }
    let len = pan.chars().count();
    if len < 12 {
        return "*".repeat(len);
    }
    let head: String = pan.chars().take(6).collect();
    let tail: String = pan.chars().skip(len - 4).collect();
    format!("{}{}{}", head, "*".repeat(len - 10), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_pan() {
        assert_eq!(mask_pan("4111111111111111"), "411111******1111");
        assert_eq!(mask_pan("1234"), "****");
        assert_eq!(mask_pan("h:deadbeef"), "[protected]");
        assert_eq!(mask_pan("enc:AAAA:BBBB"), "[protected]");
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
