#![forbid(unsafe_code)]

//! Terminal client for the clip server: asks the backend to cut a clip, then
//! fetches it once and saves it next to you.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::{debug, info, warn};
use tubeclip::{
    flow::{Event, Session},
    logging::init_logging,
    media::{DownloadRequest, FileType, InvocationResponse},
    security::is_plain_file_name,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Download a trimmed clip through a tubeclip server.")]
struct Cli {
    /// Video page URL, e.g. https://www.youtube.com/watch?v=...
    url: String,
    #[arg(long = "format", short = 'f', value_name = "mp3|mp4", default_value = "mp4", value_parser = parse_file_type)]
    format: FileType,
    #[arg(long = "start", value_name = "HH:MM:SS", help = "Clip start (default 00:00)")]
    start: Option<String>,
    #[arg(long = "end", value_name = "HH:MM:SS", help = "Clip end (default: end of media)")]
    end: Option<String>,
    #[arg(long = "server", value_name = "URL", default_value = "http://127.0.0.1:3000")]
    server: String,
    #[arg(long = "out", value_name = "DIR", default_value = ".", help = "Where to save the clip")]
    out: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "warn")]
    log_level: String,
}

fn parse_file_type(value: &str) -> Result<FileType, String> {
    value.parse::<FileType>().map_err(|err| err.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let server = cli.server.trim_end_matches('/');

    let session = Session::new()
        .apply(Event::EditUrl(cli.url.clone()))?
        .apply(Event::Submit)?;
    if !session.valid {
        bail!("a video URL is required");
    }
    let session = session.apply(Event::PreviewLoaded)?;
    if let Some(preview) = session.embed_url() {
        info!(preview = %preview, "preview");
    }

    let session = session
        .apply(Event::SetStart(cli.start.clone()))?
        .apply(Event::SetEnd(cli.end.clone()))?
        .apply(Event::ChooseFormat(cli.format))?;
    let request = session
        .request()
        .ok_or_else(|| anyhow!("nothing to request"))?;
    let session = session.apply(Event::Confirm)?;

    eprintln!("Cutting {} as {} ...", cli.url, cli.format);
    let session = match invoke(server, &request) {
        Ok(name) => session.apply(Event::InvocationSucceeded(name))?,
        Err(err) => {
            let _reset = session.apply(Event::InvocationFailed)?;
            return Err(err);
        }
    };

    let query = session
        .delivery_query()
        .ok_or_else(|| anyhow!("no file to fetch"))?;
    let saved = fetch(server, &query, &cli.out)?;
    let session = session.apply(Event::Fetched)?;
    debug!(stage = ?session.stage, "session reset");

    println!("{}", saved.display());
    Ok(())
}

fn invoke(server: &str, request: &DownloadRequest) -> Result<String> {
    let response = match ureq::post(&format!("{server}/api/video")).send_json(request) {
        Ok(response) => response,
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            bail!("server refused the clip ({code}): {}", error_message(&body));
        }
        Err(err) => return Err(err).context("contacting clip server"),
    };
    let payload: InvocationResponse = response
        .into_json()
        .context("decoding invocation response")?;
    payload
        .res
        .ok_or_else(|| anyhow!("server returned no file"))
}

fn fetch(server: &str, query: &[(&str, String)], out_dir: &Path) -> Result<PathBuf> {
    let name = query
        .iter()
        .find(|(key, _)| *key == "filename")
        .map(|(_, value)| value.as_str())
        .ok_or_else(|| anyhow!("missing filename"))?;
    if !is_plain_file_name(name) {
        bail!("server returned an unusable file name: {name}");
    }

    let mut request = ureq::get(&format!("{server}/api/download"));
    for (key, value) in query {
        request = request.query(key, value);
    }
    let response = match request.call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            bail!("download failed ({code}): {}", error_message(&body));
        }
        Err(err) => return Err(err).context("fetching clip"),
    };
    debug!(content_type = %response.content_type(), "receiving clip");

    let target = out_dir.join(name);
    let file = File::create(&target).with_context(|| format!("creating {}", target.display()))?;
    let mut writer = BufWriter::new(file);
    let copied = io::copy(&mut response.into_reader(), &mut writer);
    match copied.and_then(|bytes| writer.flush().map(|()| bytes)) {
        Ok(bytes) => {
            info!(path = %target.display(), bytes, "clip saved");
            Ok(target)
        }
        Err(err) => {
            if let Err(remove_err) = std::fs::remove_file(&target) {
                warn!(path = %target.display(), error = %remove_err, "could not remove partial clip");
            }
            Err(err).with_context(|| format!("writing {}", target.display()))
        }
    }
}

/// Pulls `message` out of a JSON error payload, falling back to the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
