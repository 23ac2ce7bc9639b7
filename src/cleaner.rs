//! Pre-training cleanup of raw datasets.
//!
//! Lines are decoded lossily, stripped of control characters, trimmed, and
//! written to a `.clean` sidecar next to the input. Blank lines are dropped.

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

const PROGRESS_EVERY: u64 = 100_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanMode {
    /// Leave the input untouched and write `<input>.clean`.
    #[default]
    Sidecar,
    /// Replace the input with the cleaned file when every line decoded
    /// cleanly; otherwise keep the sidecar.
    InPlace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleaningOutcome {
    pub success: bool,
    pub total_lines: u64,
    /// Lines that contained invalid UTF-8.
    pub problematic_lines: u64,
    pub cleaned_lines: u64,
    pub output_file: Option<PathBuf>,
    pub error: Option<String>,
}

/// Path of the cleaned sidecar for `input`.
pub fn sidecar_path(input: &Path) -> PathBuf {
    let mut name = OsString::from(input.as_os_str());
    name.push(".clean");
    PathBuf::from(name)
}

/// Clean `input`. Failures are reported in the outcome, not as an `Err`.
pub fn clean_dataset(input: &Path, mode: CleanMode) -> CleaningOutcome {
    info!(input = %input.display(), ?mode, "cleaning dataset");
    let mut outcome = CleaningOutcome::default();
    match clean_into(input, mode, &mut outcome) {
        Ok(output) => {
            outcome.success = true;
            outcome.output_file = Some(output);
            info!(
                total = outcome.total_lines,
                cleaned = outcome.cleaned_lines,
                problematic = outcome.problematic_lines,
                "dataset cleaned"
            );
        }
        Err(e) => {
            error!(input = %input.display(), error = %e, "cleaning failed");
            outcome.success = false;
            outcome.error = Some(e.to_string());
        }
    }
    outcome
}

fn clean_into(
    input: &Path,
    mode: CleanMode,
    outcome: &mut CleaningOutcome,
) -> Result<PathBuf> {
    let file = File::open(input).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound {
            kind: "dataset",
            name: input.display().to_string(),
        },
        _ => Error::Io(e),
    })?;
    let sidecar = sidecar_path(input);
    let mut reader = BufReader::new(file);
    let mut writer = BufWriter::new(File::create(&sidecar)?);

    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        outcome.total_lines += 1;

        if std::str::from_utf8(&buf).is_err() {
            outcome.problematic_lines += 1;
            warn!(line = outcome.total_lines, "invalid UTF-8 in line");
        }
        let cleaned = clean_line(&String::from_utf8_lossy(&buf));
        if !cleaned.is_empty() {
            writer.write_all(cleaned.as_bytes())?;
            writer.write_all(b"\n")?;
            outcome.cleaned_lines += 1;
        }

        if outcome.total_lines % PROGRESS_EVERY == 0 {
            info!(lines = outcome.total_lines, "cleaning progress");
        }
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    if mode == CleanMode::InPlace {
        if outcome.problematic_lines == 0 {
            fs::rename(&sidecar, input)?;
            return Ok(input.to_path_buf());
        }
        warn!(
            sidecar = %sidecar.display(),
            problematic = outcome.problematic_lines,
            "input kept, cleaned copy left beside it"
        );
    }
    Ok(sidecar)
}

/// Drop control characters other than whitespace and trim.
pub fn clean_line(line: &str) -> String {
    line.chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect::<String>()
        .trim()
        .to_string()
}
