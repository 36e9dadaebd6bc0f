// Configuration for the streaming server

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    /// Directory holding one sub-directory per book.
    pub library_root: PathBuf,
    /// Spawn the engine from this executable instead of expecting it to run.
    pub engine_executable: Option<PathBuf>,
    pub engine_cpu_threads: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            rate_limit_per_minute: 120,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            library_root: PathBuf::from("books"),
            engine_executable: None,
            engine_cpu_threads: None,
        }
    }
}

impl ServerConfig {
    /// Read the server's environment, falling back to defaults for unset
    /// or unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("PORT").unwrap_or(defaults.port),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE")
                .unwrap_or(defaults.rate_limit_per_minute),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout_secs),
            cors_allowed_origins: env_value("CORS_ALLOWED_ORIGINS").map(|v| split_origins(&v)),
            library_root: env_value("NK_LIBRARY")
                .map(PathBuf::from)
                .unwrap_or(defaults.library_root),
            engine_executable: env_value("NK_ENGINE_EXECUTABLE").map(PathBuf::from),
            engine_cpu_threads: env_parse("NK_ENGINE_CPU_THREADS"),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|v| v.trim().parse().ok())
}

fn split_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8085);
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert!(config.engine_executable.is_none());
    }

    #[test]
    fn test_split_origins_drops_blanks() {
        assert_eq!(
            split_origins("http://a.test, ,http://b.test,"),
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
    }
}
