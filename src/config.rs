// soulseek-core - Network and concurrency substrate for a Soulseek peer-to-peer client
// Copyright (C) 2024  soulseek-core contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Runtime options: a flat `serde::Deserialize` struct with nested
//! connection tuning groups, loaded from TOML.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::diagnostics::DiagnosticLevel;
use crate::error::SlskResult;
use crate::net::connection::ConnectionOptions as NetConnectionOptions;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConnectionOptions {
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub inactivity_timeout_ms: Option<u64>,
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_write_buffer_size() -> usize {
    16 * 1024
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            write_buffer_size: default_write_buffer_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            inactivity_timeout_ms: Some(60_000),
        }
    }
}

impl ConnectionOptions {
    pub fn to_net_options(&self) -> NetConnectionOptions {
        NetConnectionOptions {
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            inactivity_timeout: self.inactivity_timeout_ms.map(Duration::from_millis),
            proxy: None,
        }
    }

    pub fn without_inactivity(mut self) -> Self {
        self.inactivity_timeout_ms = None;
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SlskOptions {
    #[serde(default = "default_true")]
    pub enable_listener: bool,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_true")]
    pub enable_distributed_network: bool,
    #[serde(default)]
    pub accept_distributed_children: bool,
    #[serde(default = "default_distributed_child_limit")]
    pub distributed_child_limit: usize,
    #[serde(default = "default_maximum_concurrent_uploads")]
    pub maximum_concurrent_uploads: usize,
    #[serde(default = "default_true")]
    pub deduplicate_search_requests: bool,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default)]
    pub auto_acknowledge_private_messages: bool,
    #[serde(default)]
    pub auto_acknowledge_privilege_notifications: bool,
    #[serde(default)]
    pub accept_private_room_invitations: bool,
    #[serde(default = "default_minimum_diagnostic_level")]
    pub minimum_diagnostic_level: DiagnosticLevelConfig,
    #[serde(default)]
    pub starting_token: i32,

    #[serde(default)]
    pub server_connection_options: ConnectionOptions,
    #[serde(default)]
    pub peer_connection_options: ConnectionOptions,
    #[serde(default)]
    pub transfer_connection_options: ConnectionOptions,
    #[serde(default)]
    pub incoming_connection_options: ConnectionOptions,
    #[serde(default)]
    pub distributed_connection_options: ConnectionOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevelConfig {
    Debug,
    Info,
    Warning,
    Error,
}

impl From<DiagnosticLevelConfig> for DiagnosticLevel {
    fn from(value: DiagnosticLevelConfig) -> Self {
        match value {
            DiagnosticLevelConfig::Debug => DiagnosticLevel::Debug,
            DiagnosticLevelConfig::Info => DiagnosticLevel::Info,
            DiagnosticLevelConfig::Warning => DiagnosticLevel::Warning,
            DiagnosticLevelConfig::Error => DiagnosticLevel::Error,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen_port() -> u16 {
    2234
}

fn default_distributed_child_limit() -> usize {
    10
}

fn default_maximum_concurrent_uploads() -> usize {
    4
}

fn default_message_timeout_ms() -> u64 {
    5000
}

fn default_minimum_diagnostic_level() -> DiagnosticLevelConfig {
    DiagnosticLevelConfig::Info
}

impl Default for SlskOptions {
    fn default() -> Self {
        Self {
            enable_listener: default_true(),
            listen_port: default_listen_port(),
            enable_distributed_network: default_true(),
            accept_distributed_children: false,
            distributed_child_limit: default_distributed_child_limit(),
            maximum_concurrent_uploads: default_maximum_concurrent_uploads(),
            deduplicate_search_requests: default_true(),
            message_timeout_ms: default_message_timeout_ms(),
            auto_acknowledge_private_messages: false,
            auto_acknowledge_privilege_notifications: false,
            accept_private_room_invitations: false,
            minimum_diagnostic_level: default_minimum_diagnostic_level(),
            starting_token: 0,
            server_connection_options: ConnectionOptions::default().without_inactivity(),
            peer_connection_options: ConnectionOptions::default(),
            transfer_connection_options: ConnectionOptions::default().without_inactivity(),
            incoming_connection_options: ConnectionOptions::default(),
            distributed_connection_options: ConnectionOptions::default(),
        }
    }
}

impl SlskOptions {
    pub fn from_toml_str(input: &str) -> SlskResult<Self> {
        Ok(toml::from_str(input).map_err(|_| crate::error::SlskError::MalformedMessage)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> SlskResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let options = SlskOptions::default();
        assert_eq!(options.message_timeout_ms, 5000);
        assert!(options.listen_port >= 1024);
        assert!(options.server_connection_options.inactivity_timeout_ms.is_none());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let options = SlskOptions::from_toml_str("listen_port = 3000\n").unwrap();
        assert_eq!(options.listen_port, 3000);
        assert_eq!(options.message_timeout_ms, default_message_timeout_ms());
    }

    #[test]
    fn nested_connection_options_parse() {
        let toml = r#"
            [peer_connection_options]
            connect_timeout_ms = 2500
        "#;
        let options = SlskOptions::from_toml_str(toml).unwrap();
        assert_eq!(options.peer_connection_options.connect_timeout_ms, 2500);
    }
}
