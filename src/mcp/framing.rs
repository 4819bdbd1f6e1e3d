//! Newline-delimited JSON framing.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{HubError, Result};

/// A line that could not be decoded, with its 1-based position in the delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Decode every non-blank line of `data` independently.
///
/// Lines are split on `\n` with an optional preceding `\r`. One bad line never
/// affects its neighbours.
pub fn decode_lines<T: DeserializeOwned>(
    data: &str,
) -> impl Iterator<Item = std::result::Result<T, FrameError>> + '_ {
    data.split('\n')
        .enumerate()
        .map(|(index, line)| (index + 1, line.strip_suffix('\r').unwrap_or(line)))
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(line_no, line)| {
            serde_json::from_str(line).map_err(|e| FrameError {
                line: line_no,
                message: e.to_string(),
            })
        })
}

/// Serialize one message as a newline-terminated frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<String> {
    let mut frame = serde_json::to_string(message).map_err(HubError::Serialization)?;
    frame.push('\n');
    Ok(frame)
}
