//! Startup configuration.
//!
//! Built once before the engine exists and owned by it afterwards. Nothing
//! here is global or mutable while serving.

use std::time::Duration;

use clap::Parser;

/// Engine and server settings.
#[derive(Clone, Debug)]
pub struct Config {
    /// Port bound by [`Engine::listen`](crate::Engine::listen) when no
    /// listener is inherited.
    pub port: u16,
    /// Largest request body read into memory; bigger bodies get 413.
    pub body_limit: usize,
    /// Largest multipart body [`Context::form_params`](crate::Context::form_params)
    /// will decode; bigger bodies get 413.
    pub max_multipart_memory: usize,
    /// Default drain period when shutdown is triggered by a signal.
    pub shutdown_timeout: Duration,
    /// Idle contexts kept for reuse. Extra contexts are dropped on release.
    pub pool_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            body_limit: 32 << 20,
            max_multipart_memory: 32 << 20,
            shutdown_timeout: Duration::from_secs(30),
            pool_capacity: 1024,
        }
    }
}

/// Command line flags.
#[derive(Debug, Parser)]
#[command(name = "harrow", version, about = "HTTP request-dispatch engine")]
pub struct Options {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, default_value_t = 30)]
    pub shutdown_timeout: u64,

    /// Maximum request body size in bytes
    #[arg(long, default_value_t = 32 << 20)]
    pub body_limit: usize,
}

impl Options {
    pub fn into_config(self) -> Config {
        Config {
            port: self.port,
            body_limit: self.body_limit,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout),
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_defaults_match_config_defaults() {
        let config = Options::parse_from(["harrow"]).into_config();
        let default = Config::default();
        assert_eq!(config.port, default.port);
        assert_eq!(config.body_limit, default.body_limit);
        assert_eq!(config.shutdown_timeout, default.shutdown_timeout);
    }

    #[test]
    fn options_override() {
        let config = Options::parse_from(["harrow", "-p", "8080", "--shutdown-timeout", "5"])
            .into_config();
        assert_eq!(config.port, 8080);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }
}
