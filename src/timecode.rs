//! Conversion between colon-separated time strings (`HH:MM:SS`, `MM:SS`, ...)
//! and whole seconds.

use thiserror::Error;

/// Literal yt-dlp understands as "until the end of the media".
pub const UNBOUNDED: &str = "inf";

/// Default start of a trim range.
pub const DEFAULT_START: &str = "00:00";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Seconds(u64),
    Unbounded,
}

impl Bound {
    /// Value used in embed query strings where "to the end" is written as `0`.
    pub fn as_query_seconds(self) -> u64 {
        match self {
            Bound::Seconds(secs) => secs,
            Bound::Unbounded => 0,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimecodeError {
    #[error("time `{0}` has an empty field")]
    EmptySegment(String),
    #[error("time `{input}` has a non-numeric field `{segment}`")]
    InvalidSegment { input: String, segment: String },
    #[error("time `{0}` is too large")]
    Overflow(String),
}

/// Parses a colon-separated time into seconds. Absent input and the literal
/// `inf` mean [`Bound::Unbounded`].
pub fn parse_duration(input: Option<&str>) -> Result<Bound, TimecodeError> {
    let raw = match input.map(str::trim) {
        None => return Ok(Bound::Unbounded),
        Some(value) if value == UNBOUNDED => return Ok(Bound::Unbounded),
        Some(value) => value,
    };

    let mut total: u64 = 0;
    for segment in raw.split(':') {
        if segment.is_empty() {
            return Err(TimecodeError::EmptySegment(raw.to_string()));
        }
        if !segment.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimecodeError::InvalidSegment {
                input: raw.to_string(),
                segment: segment.to_string(),
            });
        }
        let value: u64 = segment
            .parse()
            .map_err(|_| TimecodeError::Overflow(raw.to_string()))?;
        total = total
            .checked_mul(60)
            .and_then(|acc| acc.checked_add(value))
            .ok_or_else(|| TimecodeError::Overflow(raw.to_string()))?;
    }
    Ok(Bound::Seconds(total))
}

/// Formats seconds as `HH:MM:SS`.
pub fn format_duration(total: u64) -> String {
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
