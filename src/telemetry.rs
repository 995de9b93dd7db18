//! Tracing initialization.

use std::fs::{self, File};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub fn is_test_env() -> bool {
    std::env::var_os("RUST_TEST_THREADS").is_some()
}

/// Initialize the global subscriber from the logging configuration.
///
/// `RUST_LOG` wins over the configured level. With a configured log file
/// the output goes there, otherwise to stderr. Safe to call twice; the
/// second call is a no-op.
pub fn init(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact();

    // Tests log to the captured stderr, never to the configured file.
    let file = if is_test_env() {
        None
    } else {
        logging.file.as_ref().and_then(|path| {
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() {
                    fs::create_dir_all(dir).ok()?;
                }
            }
            File::options().create(true).append(true).open(path).ok()
        })
    };

    match file {
        Some(file) => {
            let _ = builder
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        let logging = LoggingConfig {
            level: "debug".into(),
            file: None,
        };
        init(&logging);
        init(&logging);
    }
}
