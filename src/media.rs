//! Request and result types exchanged between the client, the invocation
//! service and the delivery endpoint.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ClipError, ClipResult};
use crate::timecode::{self, Bound, DEFAULT_START, UNBOUNDED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Mp3,
    Mp4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Mp3 => "mp3",
            FileType::Mp4 => "mp4",
        }
    }

    pub fn kind(self) -> MediaKind {
        match self {
            FileType::Mp3 => MediaKind::Audio,
            FileType::Mp4 => MediaKind::Video,
        }
    }

    /// `audio/<type>` or `video/<type>`.
    pub fn content_type(self) -> String {
        match self.kind() {
            MediaKind::Audio => format!("audio/{}", self.as_str()),
            MediaKind::Video => format!("video/{}", self.as_str()),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = ClipError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mp3" => Ok(FileType::Mp3),
            "mp4" => Ok(FileType::Mp4),
            other => Err(ClipError::validation(format!(
                "Filetype {other} not supported"
            ))),
        }
    }
}

/// Invocation RPC input as it arrives on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<FileType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

/// A [`DownloadRequest`] that passed validation, with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipRequest {
    pub url: String,
    pub file_type: FileType,
    pub start_time: String,
    pub end_time: String,
}

impl DownloadRequest {
    pub fn validate(self) -> ClipResult<ClipRequest> {
        let url = self
            .url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ClipError::validation("Parameter: url missing"))?;
        if url.starts_with('-') {
            return Err(ClipError::validation(format!("url cannot start with `-`: {url}")));
        }

        let start_time = non_blank(self.start_time).unwrap_or_else(|| DEFAULT_START.to_string());
        let end_time = non_blank(self.end_time).unwrap_or_else(|| UNBOUNDED.to_string());

        let start = timecode::parse_duration(Some(&start_time))
            .map_err(|err| ClipError::validation(format!("startTime: {err}")))?;
        let end = timecode::parse_duration(Some(&end_time))
            .map_err(|err| ClipError::validation(format!("endTime: {err}")))?;
        if start == Bound::Unbounded {
            return Err(ClipError::validation("startTime cannot be `inf`"));
        }
        if let (Bound::Seconds(start), Bound::Seconds(end)) = (start, end) {
            if end <= start {
                return Err(ClipError::validation(format!(
                    "endTime ({end_time}) must be after startTime ({start_time})"
                )));
            }
        }

        Ok(ClipRequest {
            url,
            file_type: self.file_type.unwrap_or(FileType::Mp4),
            start_time,
            end_time,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl ClipRequest {
    /// yt-dlp `--download-sections` expression: one range across the whole
    /// media, raw strings passed through.
    pub fn section(&self) -> String {
        format!("*{}-{}", self.start_time, self.end_time)
    }
}

/// A file the invocation service left in the storage directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedFile {
    /// Path relative to the storage directory.
    pub path: String,
    pub file_type: FileType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub res: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> DownloadRequest {
        DownloadRequest {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_fill_in_video_and_full_range() {
        let clip = request("https://www.youtube.com/watch?v=abc").validate().unwrap();
        assert_eq!(clip.file_type, FileType::Mp4);
        assert_eq!(clip.start_time, "00:00");
        assert_eq!(clip.end_time, "inf");
        assert_eq!(clip.section(), "*00:00-inf");
    }

    #[test]
    fn missing_or_blank_url_is_rejected() {
        let err = DownloadRequest::default().validate().unwrap_err();
        assert!(matches!(err, ClipError::Validation(_)));
        let err = request("   ").validate().unwrap_err();
        assert!(matches!(err, ClipError::Validation(_)));
        let err = request("--exec rm").validate().unwrap_err();
        assert!(matches!(err, ClipError::Validation(_)));
    }

    #[test]
    fn scheme_less_urls_are_passed_through() {
        let clip = request("youtube.com/watch?v=abc").validate().unwrap();
        assert_eq!(clip.url, "youtube.com/watch?v=abc");
        let clip = request(" dQw4w9WgXcQ ").validate().unwrap();
        assert_eq!(clip.url, "dQw4w9WgXcQ");
    }

    #[test]
    fn trim_range_is_checked() {
        let mut req = request("https://youtu.be/abc");
        req.start_time = Some("00:00:20".into());
        req.end_time = Some("00:00:10".into());
        assert!(req.validate().is_err());

        let mut req = request("https://youtu.be/abc");
        req.end_time = Some("00:x".into());
        assert!(req.validate().is_err());

        let mut req = request("https://youtu.be/abc");
        req.start_time = Some("inf".into());
        assert!(req.validate().is_err());

        let mut req = request("https://youtu.be/abc");
        req.start_time = Some("00:00:10".into());
        req.end_time = Some("00:00:20".into());
        req.file_type = Some(FileType::Mp3);
        let clip = req.validate().unwrap();
        assert_eq!(clip.section(), "*00:00:10-00:00:20");
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let req: DownloadRequest = serde_json::from_str(
            r#"{"url":"https://youtu.be/x","fileType":"mp3","startTime":"00:01","endTime":"00:02"}"#,
        )
        .unwrap();
        assert_eq!(req.file_type, Some(FileType::Mp3));
        assert_eq!(req.start_time.as_deref(), Some("00:01"));
        assert_eq!(req.end_time.as_deref(), Some("00:02"));
    }

    #[test]
    fn content_types_follow_media_kind() {
        assert_eq!(FileType::Mp3.content_type(), "audio/mp3");
        assert_eq!(FileType::Mp4.content_type(), "video/mp4");
        assert!("wav".parse::<FileType>().is_err());
        assert_eq!("mp3".parse::<FileType>().unwrap(), FileType::Mp3);
    }
}
