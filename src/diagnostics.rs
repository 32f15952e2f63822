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

//! Diagnostics are an injected sink, not a forced backend.
//! `LoggingDiagnosticSink` forwards to the `log` facade the same way the
//! rest of this crate's internals do, and is the default when the host
//! does not supply its own.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct DiagnosticEvent {
    pub level: DiagnosticLevel,
    pub message: String,
}

impl DiagnosticEvent {
    pub fn new(level: DiagnosticLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, event: DiagnosticEvent);
}

/// Forwards every event to the `log` facade at the matching level,
/// filtered by `minimum_level`.
pub struct LoggingDiagnosticSink {
    minimum_level: DiagnosticLevel,
}

impl LoggingDiagnosticSink {
    pub fn new(minimum_level: DiagnosticLevel) -> Self {
        Self { minimum_level }
    }
}

impl Default for LoggingDiagnosticSink {
    fn default() -> Self {
        Self::new(DiagnosticLevel::Debug)
    }
}

impl DiagnosticSink for LoggingDiagnosticSink {
    fn emit(&self, event: DiagnosticEvent) {
        if event.level < self.minimum_level {
            return;
        }
        match event.level {
            DiagnosticLevel::Debug => log::debug!("{}", event.message),
            DiagnosticLevel::Info => log::info!("{}", event.message),
            DiagnosticLevel::Warning => log::warn!("{}", event.message),
            DiagnosticLevel::Error => log::error!("{}", event.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_level_suppresses_lower_severity() {
        let sink = LoggingDiagnosticSink::new(DiagnosticLevel::Warning);
        // Nothing to assert on log output directly; this exercises the
        // filter path without panicking.
        sink.emit(DiagnosticEvent::new(DiagnosticLevel::Debug, "ignored"));
        sink.emit(DiagnosticEvent::new(DiagnosticLevel::Error, "surfaced"));
    }

    #[test]
    fn level_ordering_matches_severity() {
        assert!(DiagnosticLevel::Debug < DiagnosticLevel::Info);
        assert!(DiagnosticLevel::Info < DiagnosticLevel::Warning);
        assert!(DiagnosticLevel::Warning < DiagnosticLevel::Error);
    }
}
