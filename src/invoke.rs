//! Runs yt-dlp once per request and reports the file it produced.
//!
//! Every run gets a fresh random token that prefixes the output template, so
//! concurrent runs never write to the same name. yt-dlp decides the final
//! extension and id, so the realized path is read back from its
//! `--print after_move:filepath` output instead of being guessed.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use rand_core::{OsRng, RngCore};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ClipError, ClipResult, ToolError};
use crate::media::{ClipRequest, FileType, GeneratedFile};
use crate::storage::Storage;

const TOKEN_BYTES: usize = 8;
const OUTPUT_TEMPLATE_SUFFIX: &str = "%(id)s.%(ext)s";
const STDERR_TAIL: usize = 2000;

/// Hex token with [`TOKEN_BYTES`] bytes of OS entropy.
pub fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

pub struct Invoker {
    program: PathBuf,
    max_filesize: String,
    timeout: Duration,
    storage: Arc<Storage>,
}

impl Invoker {
    pub fn new(
        program: impl Into<PathBuf>,
        max_filesize: impl Into<String>,
        timeout: Duration,
        storage: Arc<Storage>,
    ) -> Self {
        Self {
            program: program.into(),
            max_filesize: max_filesize.into(),
            timeout,
            storage,
        }
    }

    /// Full argument list for one run, URL last.
    pub fn build_args(&self, request: &ClipRequest, token: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--no-playlist".into(),
            "--no-progress".into(),
            "--no-simulate".into(),
            "--no-mtime".into(),
            "--max-filesize".into(),
            self.max_filesize.clone().into(),
            "--download-sections".into(),
            request.section().into(),
            "--force-keyframes-at-cuts".into(),
            "--paths".into(),
            self.storage.dir().as_os_str().to_owned(),
            "--output".into(),
            format!("{token}_{OUTPUT_TEMPLATE_SUFFIX}").into(),
        ];
        match request.file_type {
            FileType::Mp3 => {
                args.push("--extract-audio".into());
                args.push("--audio-format".into());
                args.push(request.file_type.as_str().into());
            }
            FileType::Mp4 => {
                args.push("--format".into());
                args.push(request.file_type.as_str().into());
            }
        }
        args.push("--print".into());
        args.push("after_move:filepath".into());
        args.push("--".into());
        args.push(request.url.clone().into());
        args
    }

    /// Runs yt-dlp for `request`. One attempt only; any failure is returned
    /// to the caller as is.
    pub async fn invoke(&self, request: &ClipRequest) -> ClipResult<GeneratedFile> {
        let token = random_token();
        let _in_flight = self.storage.begin_run(&token);
        let args = self.build_args(request, &token);
        info!(
            token = %token,
            url = %request.url,
            file_type = %request.file_type,
            section = %request.section(),
            "starting yt-dlp"
        );

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| ToolError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ToolError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?,
            Err(_) => {
                warn!(token = %token, "yt-dlp timed out");
                self.discard_partials(&token).await;
                return Err(ToolError::Timeout {
                    secs: self.timeout.as_secs(),
                }
                .into());
            }
        };

        if !output.status.success() {
            let stderr = tail(&String::from_utf8_lossy(&output.stderr));
            warn!(token = %token, status = %output.status, "yt-dlp failed");
            self.discard_partials(&token).await;
            return Err(ToolError::Exit {
                status: output.status.to_string(),
                stderr,
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let realized = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(PathBuf::from);
        let Some(realized) = realized else {
            info!(token = %token, max_filesize = %self.max_filesize, "yt-dlp produced no file");
            self.discard_partials(&token).await;
            return Err(ToolError::NoOutput {
                max_filesize: self.max_filesize.clone(),
            }
            .into());
        };

        let name = match self.validate_realized(&realized, &token) {
            Ok(name) => name,
            Err(err) => {
                warn!(token = %token, error = %err, "rejecting yt-dlp output");
                self.discard_partials(&token).await;
                return Err(err);
            }
        };
        self.storage.issue(&name, request.file_type);
        info!(token = %token, file = %name, "clip ready");
        Ok(GeneratedFile {
            path: name,
            file_type: request.file_type,
        })
    }

    fn validate_realized(&self, realized: &Path, token: &str) -> ClipResult<String> {
        let realized = if realized.is_absolute() {
            realized.to_path_buf()
        } else {
            self.storage.dir().join(realized)
        };
        let name = self.storage.relative_name(&realized).ok_or_else(|| {
            ClipError::from(ToolError::UnexpectedOutput(format!(
                "{} is outside the storage directory",
                realized.display()
            )))
        })?;
        if !name.starts_with(&format!("{token}_")) || !realized.is_file() {
            return Err(ToolError::UnexpectedOutput(format!(
                "{} was not produced by this run",
                realized.display()
            ))
            .into());
        }
        Ok(name)
    }

    /// Removes whatever a failed run left behind under its token.
    async fn discard_partials(&self, token: &str) {
        let prefix = format!("{token}_");
        let Ok(mut entries) = tokio::fs::read_dir(self.storage.dir()).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let matches = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix));
            if matches {
                let path = entry.path();
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %err, "failed to remove partial download");
                } else {
                    debug!(path = %path.display(), "removed partial download");
                }
            }
        }
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

#[cfg(all(test, unix))]
pub(crate) mod stub {
    //! Stand-in for yt-dlp used by the tests in this crate.

    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Writes `<output>` under `<paths>` with `%(id)s`/`%(ext)s` filled in and
    /// prints the result, like `--print after_move:filepath` does.
    pub const WORKING: &str = r#"#!/usr/bin/env bash
set -euo pipefail
prev=""
dir=""
output=""
ext="mp4"
for arg in "$@"; do
    case "$prev" in
        --paths) dir="$arg" ;;
        --output) output="$arg" ;;
        --audio-format) ext="$arg" ;;
    esac
    prev="$arg"
done
name=$(printf '%s' "$output" | sed -e 's/%(id)s/dQw4w9WgXcQ/' -e "s/%(ext)s/$ext/")
printf 'clip bytes for %s\n' "$name" > "$dir/$name"
echo "[download] Destination: $dir/$name" >&2
echo "$dir/$name"
"#;

    /// Exits non-zero after leaving a partial file behind.
    pub const FAILING: &str = r#"#!/usr/bin/env bash
prev=""
dir=""
output=""
for arg in "$@"; do
    case "$prev" in
        --paths) dir="$arg" ;;
        --output) output="$arg" ;;
    esac
    prev="$arg"
done
name=$(printf '%s' "$output" | sed -e 's/%(id)s/broken/' -e 's/%(ext)s/part/')
echo partial > "$dir/$name"
echo "ERROR: [youtube] broken: Video unavailable" >&2
exit 1
"#;

    /// What yt-dlp does when `--max-filesize` rejects a download.
    pub const OVERSIZED: &str = r#"#!/usr/bin/env bash
echo "[download] File is larger than max-filesize. Aborting." >&2
exit 0
"#;

    /// Prints a path outside the directory it was given.
    pub const ESCAPING: &str = r#"#!/usr/bin/env bash
echo "/etc/passwd"
"#;

    /// Prints a path under the right token but in the wrong place, after
    /// leaving real output in the storage directory.
    pub const MISPLACED: &str = r#"#!/usr/bin/env bash
prev=""
dir=""
output=""
for arg in "$@"; do
    case "$prev" in
        --paths) dir="$arg" ;;
        --output) output="$arg" ;;
    esac
    prev="$arg"
done
name=$(printf '%s' "$output" | sed -e 's/%(id)s/vid/' -e 's/%(ext)s/mp4/')
echo data > "$dir/$name"
echo "/tmp/$name"
"#;

    /// Writes its output with an old modification time, then keeps working
    /// for a moment before reporting the path.
    pub const BACKDATED: &str = r#"#!/usr/bin/env bash
set -euo pipefail
prev=""
dir=""
output=""
for arg in "$@"; do
    case "$prev" in
        --paths) dir="$arg" ;;
        --output) output="$arg" ;;
    esac
    prev="$arg"
done
name=$(printf '%s' "$output" | sed -e 's/%(id)s/vid/' -e 's/%(ext)s/mp4/')
echo data > "$dir/$name"
touch -d 2015-01-01 "$dir/$name"
sleep 0.5
echo "$dir/$name"
"#;

    pub const SLOW: &str = r#"#!/usr/bin/env bash
sleep 5
"#;

    pub fn install(dir: &Path, script: &str) -> PathBuf {
        let script_path = dir.join("yt-dlp");
        fs::write(&script_path, script).unwrap();
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
        script_path
    }
}
