//! Logging Setup

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber honouring `RUST_LOG` (default `info`)
///
/// Fails if a global subscriber is already installed.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let _ = init_logging();
        assert!(init_logging().is_err());
    }
}
