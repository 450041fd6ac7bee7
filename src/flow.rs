//! Client-side session as an explicit state machine.
//!
//! `Empty → UrlEntered → PreviewLoading → PreviewReady → TrimSelecting →
//! FormatSelecting → Downloading → ReadyToFetch → Empty`
//!
//! Transitions are pure: [`Session::apply`] consumes the session and returns
//! the next one. `Close` is accepted everywhere and always yields a fresh
//! session, so nothing from a finished or abandoned clip leaks into the next.

use thiserror::Error;

use crate::media::{DownloadRequest, FileType};
use crate::timecode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Empty,
    UrlEntered,
    PreviewLoading,
    PreviewReady,
    TrimSelecting,
    FormatSelecting,
    Downloading,
    ReadyToFetch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    EditUrl(String),
    Submit,
    PreviewLoaded,
    SetStart(Option<String>),
    SetEnd(Option<String>),
    ChooseFormat(FileType),
    Confirm,
    InvocationSucceeded(String),
    InvocationFailed,
    Fetched,
    Close,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{event:?} is not accepted while {stage:?}")]
pub struct FlowError {
    pub stage: Stage,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub stage: Stage,
    pub url: String,
    pub valid: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub file_type: Option<FileType>,
    pub in_flight: bool,
    pub file_path: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            stage: Stage::Empty,
            url: String::new(),
            valid: true,
            start_time: None,
            end_time: None,
            file_type: None,
            in_flight: false,
            file_path: None,
        }
    }
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(self, event: Event) -> Result<Session, FlowError> {
        use Stage::*;

        match (self.stage, event) {
            (_, Event::Close) => Ok(Session::default()),

            (Empty | UrlEntered, Event::EditUrl(url)) => Ok(Session {
                stage: if url.trim().is_empty() { Empty } else { UrlEntered },
                url,
                valid: true,
                ..self
            }),
            (Empty, Event::Submit) => Ok(Session {
                valid: false,
                ..self
            }),
            (UrlEntered, Event::Submit) => Ok(Session {
                stage: PreviewLoading,
                valid: true,
                ..self
            }),
            (PreviewLoading, Event::PreviewLoaded) => Ok(Session {
                stage: PreviewReady,
                ..self
            }),

            (PreviewReady | TrimSelecting | FormatSelecting, Event::SetStart(start)) => {
                Ok(Session {
                    stage: TrimSelecting,
                    start_time: start,
                    file_type: None,
                    ..self
                })
            }
            (PreviewReady | TrimSelecting | FormatSelecting, Event::SetEnd(end)) => Ok(Session {
                stage: TrimSelecting,
                end_time: end,
                file_type: None,
                ..self
            }),
            (PreviewReady | TrimSelecting | FormatSelecting, Event::ChooseFormat(file_type)) => {
                Ok(Session {
                    stage: FormatSelecting,
                    file_type: Some(file_type),
                    ..self
                })
            }
            (FormatSelecting, Event::Confirm) => Ok(Session {
                stage: Downloading,
                in_flight: true,
                ..self
            }),
            (Downloading, Event::InvocationSucceeded(path)) => Ok(Session {
                stage: ReadyToFetch,
                in_flight: false,
                file_path: Some(path),
                ..self
            }),
            (Downloading, Event::InvocationFailed) => Ok(Session::default()),
            (ReadyToFetch, Event::Fetched) => Ok(Session::default()),

            (stage, event) => Err(FlowError { stage, event }),
        }
    }

    /// Invocation RPC body for the current selection, once a format is chosen.
    pub fn request(&self) -> Option<DownloadRequest> {
        if self.url.trim().is_empty() {
            return None;
        }
        let file_type = self.file_type?;
        Some(DownloadRequest {
            url: Some(self.url.trim().to_string()),
            file_type: Some(file_type),
            start_time: self.start_time.clone(),
            end_time: self.end_time.clone(),
        })
    }

    /// Query string for the delivery endpoint, available only while the
    /// generated file has not been fetched yet.
    pub fn delivery_query(&self) -> Option<Vec<(&'static str, String)>> {
        if self.stage != Stage::ReadyToFetch {
            return None;
        }
        let path = self.file_path.clone()?;
        let file_type = self.file_type?;
        Some(vec![
            ("filename", path),
            ("filetype", file_type.as_str().to_string()),
        ])
    }

    /// Preview URL for an embedded player, trimmed to the selected range.
    pub fn embed_url(&self) -> Option<String> {
        let url = self.url.trim();
        if url.is_empty() {
            return None;
        }
        Some(embed_url(
            url,
            self.start_time.as_deref(),
            self.end_time.as_deref(),
        ))
    }
}

/// Turns a watch URL into an embed URL with `start`/`end` in seconds.
/// Missing, unbounded or malformed times become `0`.
pub fn embed_url(url: &str, start: Option<&str>, end: Option<&str>) -> String {
    let seconds = |value: Option<&str>| {
        timecode::parse_duration(value)
            .map(timecode::Bound::as_query_seconds)
            .unwrap_or(0)
    };
    let embed = url.replacen("watch?v=", "embed/", 1);
    format!("{embed}?start={}&end={}", seconds(start), seconds(end))
}
