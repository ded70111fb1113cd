use std::fmt;

use thiserror::Error;

/// Errors raised while building or parsing a command.
///
/// Both variants are recoverable: callers log the error and drop the payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("cannot parse command payload ({0:?})")]
    Unparseable(String),

    #[error("dim level out of range ({0})")]
    InvalidDimLevel(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchPosition {
    On,
    Off,
    Toggle,
}

/// A normalized command for a Hue light or group.
///
/// `Dim` levels are always in 1..=100; a requested level of 0 is canonically
/// represented as `Switch(Off)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HueCommand {
    Switch(SwitchPosition),
    Dim(u8),
}

impl HueCommand {
    pub fn dim(level: i64) -> Result<Self, CommandError> {
        match level {
            0 => Ok(Self::Switch(SwitchPosition::Off)),
            1..=100 => Ok(Self::Dim(level as u8)),
            other => Err(CommandError::InvalidDimLevel(other)),
        }
    }

    /// Parse a free-text MQTT payload into a command.
    ///
    /// Accepts `ON`/`TRUE`, `OFF`/`FALSE`, `TOGGLE` (case-insensitive,
    /// whitespace-trimmed) or an integer in 0..=100.
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let text = payload.trim().to_uppercase();
        match text.as_str() {
            "ON" | "TRUE" => Ok(Self::Switch(SwitchPosition::On)),
            "OFF" | "FALSE" => Ok(Self::Switch(SwitchPosition::Off)),
            "TOGGLE" => Ok(Self::Switch(SwitchPosition::Toggle)),
            other => other
                .parse::<i64>()
                .ok()
                .and_then(|level| Self::dim(level).ok())
                .ok_or_else(|| CommandError::Unparseable(payload.to_string())),
        }
    }
}

impl fmt::Display for SwitchPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Toggle => "toggle",
        };
        write!(f, "{text}")
    }
}

impl fmt::Display for HueCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Switch(position) => write!(f, "switch({position})"),
            Self::Dim(level) => write!(f, "dim({level})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_switch_words_case_and_whitespace_insensitive() {
        for text in ["on", "ON", " On "] {
            assert_eq!(
                HueCommand::parse(text),
                Ok(HueCommand::Switch(SwitchPosition::On))
            );
        }
        for text in ["off", "OFF", " fAlSe "] {
            assert_eq!(
                HueCommand::parse(text),
                Ok(HueCommand::Switch(SwitchPosition::Off))
            );
        }
        assert_eq!(
            HueCommand::parse("true"),
            Ok(HueCommand::Switch(SwitchPosition::On))
        );
        assert_eq!(
            HueCommand::parse("\ttoggle\n"),
            Ok(HueCommand::Switch(SwitchPosition::Toggle))
        );
    }

    #[test]
    fn numeric_payloads_round_trip() {
        for level in 0..=100_i64 {
            let parsed = HueCommand::parse(&level.to_string()).unwrap();
            let expected = if level == 0 {
                HueCommand::Switch(SwitchPosition::Off)
            } else {
                HueCommand::Dim(level as u8)
            };
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn rejects_out_of_range_and_garbage() {
        assert_eq!(
            HueCommand::parse("200"),
            Err(CommandError::Unparseable("200".to_string()))
        );
        assert_eq!(
            HueCommand::parse("-1"),
            Err(CommandError::Unparseable("-1".to_string()))
        );
        assert_eq!(
            HueCommand::parse("not-a-number"),
            Err(CommandError::Unparseable("not-a-number".to_string()))
        );
        assert_eq!(
            HueCommand::parse(""),
            Err(CommandError::Unparseable(String::new()))
        );
    }

    #[test]
    fn dim_constructor_enforces_range() {
        assert_eq!(
            HueCommand::dim(0),
            Ok(HueCommand::Switch(SwitchPosition::Off))
        );
        assert_eq!(HueCommand::dim(100), Ok(HueCommand::Dim(100)));
        assert_eq!(HueCommand::dim(101), Err(CommandError::InvalidDimLevel(101)));
        assert_eq!(HueCommand::dim(-5), Err(CommandError::InvalidDimLevel(-5)));
    }
}
