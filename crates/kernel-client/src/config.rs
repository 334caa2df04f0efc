//! Configuration for the client, the kernelspec store and the echo kernel.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable that overrides the kernelspec enumeration command.
///
/// The value is split on whitespace into an argv, e.g.
/// `RUNT_KERNELSPEC_CMD="python -m jupyter kernelspec list"`.
pub const KERNELSPEC_CMD_ENV: &str = "RUNT_KERNELSPEC_CMD";

/// Path-list variable consulted by `jupyter kernelspec list`.
pub const JUPYTER_PATH_ENV: &str = "JUPYTER_PATH";

/// Client-side limits and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Number of handled messages kept in the client's history ring.
    pub history_capacity: usize,
    /// Number of messages kept in each request's activity log.
    pub request_history_capacity: usize,
    /// Wait budget used by `execute_and_wait` when none is given.
    #[serde(with = "duration_secs")]
    pub default_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            history_capacity: 10,
            request_history_capacity: 32,
            default_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_request_history_capacity(mut self, capacity: usize) -> Self {
        self.request_history_capacity = capacity;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// How kernelspecs are enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelspecStoreConfig {
    /// argv of the enumeration call. Must print `<name> <path>` per line
    /// after a single header line.
    pub command: Vec<String>,
    /// Name of the path-list variable the enumeration consults.
    pub path_var: String,
}

impl Default for KernelspecStoreConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "jupyter".to_string(),
                "kernelspec".to_string(),
                "list".to_string(),
            ],
            path_var: JUPYTER_PATH_ENV.to_string(),
        }
    }
}

impl KernelspecStoreConfig {
    /// Defaults, with the command replaced by `RUNT_KERNELSPEC_CMD` if set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(cmd) = std::env::var(KERNELSPEC_CMD_ENV) {
            let argv: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            if !argv.is_empty() {
                config.command = argv;
            }
        }
        config
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }
}

/// Behaviour of the in-memory echo kernel.
#[derive(Debug, Clone)]
pub struct EchoConfig {
    /// Delay before each emitted message (busy, reply, idle).
    pub step_delay: Duration,
    /// Also broadcast `execute_input`/`execute_result` for `execute_request`.
    pub emit_execute_io: bool,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(5),
            emit_execute_io: false,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.default_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_client_config_partial_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"history_capacity": 4, "default_timeout": 1.5}"#).unwrap();
        assert_eq!(config.history_capacity, 4);
        assert_eq!(config.request_history_capacity, 32);
        assert_eq!(config.default_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_client_config_rejects_negative_timeout() {
        let result = serde_json::from_str::<ClientConfig>(r#"{"default_timeout": -1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_client_config_rejects_overflowing_timeout() {
        let result = serde_json::from_str::<ClientConfig>(r#"{"default_timeout": 1e30}"#);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_kernelspec_command_from_env() {
        std::env::set_var(KERNELSPEC_CMD_ENV, "python -m jupyter kernelspec list");
        let config = KernelspecStoreConfig::from_env();
        std::env::remove_var(KERNELSPEC_CMD_ENV);

        assert_eq!(
            config.command,
            vec!["python", "-m", "jupyter", "kernelspec", "list"]
        );
        assert_eq!(config.path_var, "JUPYTER_PATH");
    }

    #[test]
    #[serial]
    fn test_kernelspec_command_default() {
        std::env::remove_var(KERNELSPEC_CMD_ENV);
        let config = KernelspecStoreConfig::from_env();
        assert_eq!(config, KernelspecStoreConfig::default());
    }
}
