//! Hub configuration: the six knobs in enumerated form, loaded from JSON the
//! same way the teacher's `reload_config` loads `GameConfig.json`.

use crate::errors::ConfigError;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub max_sockets: u32,
    pub max_player_sockets: u32,
    pub max_games: u32,
    pub p_read_secs: u64,
    pub p_write_secs: u64,
    pub p_ping_secs: u64,
    pub p_idle_secs: u64,
    pub p_http_secs: u64,
    #[serde(default)]
    pub debug: bool,
}

impl Config {
    pub fn p_read(&self) -> Duration {
        Duration::from_secs(self.p_read_secs)
    }
    pub fn p_write(&self) -> Duration {
        Duration::from_secs(self.p_write_secs)
    }
    pub fn p_ping(&self) -> Duration {
        Duration::from_secs(self.p_ping_secs)
    }
    pub fn p_idle(&self) -> Duration {
        Duration::from_secs(self.p_idle_secs)
    }
    pub fn p_http(&self) -> Duration {
        Duration::from_secs(self.p_http_secs)
    }

    /// Loads and validates the config file; does not start the server on
    /// failure, per the ConfigInvalid error policy.
    pub async fn load(path: &str) -> Result<Config, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
        let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sockets < self.max_player_sockets {
            return Err(ConfigError::SocketCapBelowPlayerCap {
                max_sockets: self.max_sockets,
                max_player_sockets: self.max_player_sockets,
            });
        }
        if self.max_player_sockets < 1 {
            return Err(ConfigError::PlayerSocketCapZero);
        }
        if self.max_games < 1 {
            return Err(ConfigError::MaxGamesZero);
        }
        for (field, secs) in [
            ("P_read", self.p_read_secs),
            ("P_write", self.p_write_secs),
            ("P_ping", self.p_ping_secs),
            ("P_idle", self.p_idle_secs),
            ("P_http", self.p_http_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::NonPositiveDuration { field });
            }
        }
        if self.p_ping_secs >= self.p_read_secs {
            return Err(ConfigError::PingNotBelowRead {
                ping: self.p_ping(),
                read: self.p_read(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            max_sockets: 100,
            max_player_sockets: 4,
            max_games: 10,
            p_read_secs: 60,
            p_write_secs: 10,
            p_ping_secs: 20,
            p_idle_secs: 300,
            p_http_secs: 600,
            debug: false,
        }
    }

    #[test]
    fn rejects_ping_not_below_read() {
        let mut config = valid();
        config.p_ping_secs = config.p_read_secs;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PingNotBelowRead { .. })
        ));
    }

    #[test]
    fn rejects_socket_cap_below_player_cap() {
        let mut config = valid();
        config.max_sockets = 2;
        config.max_player_sockets = 4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SocketCapBelowPlayerCap { .. })
        ));
    }

    #[test]
    fn accepts_a_valid_config() {
        assert!(valid().validate().is_ok());
    }
}
