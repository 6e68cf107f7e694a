use thiserror::Error;

use kubeship_types::{ContainerLogLine, GelfMessage};

#[derive(Debug, Error)]
#[error("malformed container log line: {0}")]
pub struct ParseError(#[from] serde_json::Error);

/// Parser for container runtime JSON log lines
pub struct LogParser;

impl LogParser {
    /// Parse a raw `{"log": ..., "time": ...}` line
    ///
    /// Both fields are required; unknown fields such as `stream` are ignored.
    pub fn parse(raw: &str) -> Result<ContainerLogLine, ParseError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Shape a parsed line into the GELF message for `host`
    pub fn to_gelf(line: &ContainerLogLine, host: &str) -> GelfMessage {
        GelfMessage::new(host, line.log.as_str(), &line.time)
    }

    /// Parse a raw line and serialize the resulting GELF message
    pub fn to_gelf_json(raw: &str, host: &str) -> Result<String, ParseError> {
        let line = Self::parse(raw)?;
        Ok(Self::to_gelf(&line, host).to_json()?)
    }
}
