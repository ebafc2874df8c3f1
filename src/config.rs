//! CLI surface and the small parsing helpers it needs.
//!
//! Ground truth: `examples/original_source/src/BaseApp.{h,cpp}`. Poco's
//! `Util::OptionSet` + per-option callback methods become a single `clap` derive
//! struct; `clap` is already a teacher dependency (used by its `tools/discovery`
//! binaries), just not previously through the derive API.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::Parser;
use regex::Regex;

use crate::error::{AppResult, SupervisorError};

fn buffer_size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+(?:\.\d*)?)\s*([MKmk]?[Bb]?)$").expect("static regex is valid"))
}

/// `NAME=VALUE` environment variable pair, parsed by [`parse_env_pair`].
fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got `{s}`")),
    }
}

fn parse_callback_api(s: &str) -> Result<String, String> {
    if s.starts_with("http://") {
        Ok(s.to_string())
    } else {
        Err("callback API URI must start with http://".to_string())
    }
}

/// Supervises a user program, ring-buffers its combined output, and streams it
/// over HTTP.
#[derive(Parser, Debug)]
#[command(name = "grid-supervisor", about = "User program executor and output server")]
pub struct CliArgs {
    /// Set the program's working directory.
    #[arg(short = 'w', long = "work-dir", value_name = "PATH")]
    pub work_dir: Option<PathBuf>,

    /// Set environmental variable NAME=VALUE.
    #[arg(short = 'e', long = "env", value_name = "NAME=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Do not exit the executor after the program has finished; wait for
    /// termination signals.
    #[arg(long = "no-exit")]
    pub no_exit: bool,

    /// Watch generated JSON files and submit them via the callback API.
    #[arg(long = "watch-generated")]
    pub watch_generated: bool,

    /// The listening host for the executor server.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// The listening port for the executor server.
    #[arg(short = 'p', long = "server-port", value_name = "PORT", default_value_t = 0)]
    pub server_port: u16,

    /// Set the memory buffer size, e.g. "4M", "512K", "1024" (bytes).
    #[arg(long = "buffer-size", value_name = "BUFFER-SIZE", value_parser = parse_buffer_size_arg, default_value = "4M")]
    pub buffer_size: usize,

    /// Set the URI of the callback API.
    #[arg(long = "callback-api", value_name = "URI", value_parser = parse_callback_api)]
    pub callback_api: Option<String>,

    /// Set the auth token of the callback API.
    #[arg(long = "callback-token", value_name = "TOKEN", default_value = "")]
    pub callback_token: String,

    /// Save program output to this path.
    #[arg(long = "save-output", value_name = "PATH")]
    pub save_output: Option<PathBuf>,

    /// Write the final status document to this path.
    #[arg(long = "status-file", value_name = "PATH")]
    pub status_file: Option<PathBuf>,

    /// Run shell command after the program has executed.
    #[arg(long = "run-after", value_name = "COMMAND")]
    pub run_after: Option<String>,

    /// The program to run, and its arguments, after a `--` separator.
    #[arg(trailing_var_arg = true, required = true, value_name = "ARGS")]
    pub args: Vec<String>,
}

fn parse_buffer_size_arg(s: &str) -> Result<usize, String> {
    parse_buffer_size(s).map_err(|e| e.to_string())
}

/// Parses a human buffer-size string like `"4M"`, `"512 KB"`, or `"1024"` (plain
/// bytes) into a byte count. Mirrors `BaseApp::handleSetBufferSize`'s
/// `BUFFER_SIZE_PATTERN` regex and unit scaling exactly (binary, not decimal,
/// units).
pub fn parse_buffer_size(s: &str) -> AppResult<usize> {
    let re = buffer_size_re();
    let captures = re
        .captures(s.trim())
        .ok_or_else(|| SupervisorError::Config(format!("invalid buffer size: `{s}`")))?;

    let value: f64 = captures[1]
        .parse()
        .map_err(|_| SupervisorError::Config(format!("invalid buffer size: `{s}`")))?;
    let unit = captures[2].to_uppercase();

    let scaled = match unit.as_str() {
        "M" | "MB" => value * 1024.0 * 1024.0,
        "K" | "KB" => value * 1024.0,
        _ => value,
    };

    Ok(scaled as usize)
}

pub fn env_map(pairs: &[(String, String)]) -> HashMap<String, String> {
    pairs.iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse_buffer_size("1024").unwrap(), 1024);
    }

    #[test]
    fn parses_kilobytes_and_megabytes() {
        assert_eq!(parse_buffer_size("4M").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_buffer_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_buffer_size("1.5MB").unwrap(), (1.5 * 1024.0 * 1024.0) as usize);
    }

    #[test]
    fn rejects_malformed_sizes() {
        assert!(parse_buffer_size("abc").is_err());
        assert!(parse_buffer_size("").is_err());
    }

    #[test]
    fn env_pair_parses_name_value() {
        assert_eq!(
            parse_env_pair("FOO=bar").unwrap(),
            ("FOO".to_string(), "bar".to_string())
        );
        assert!(parse_env_pair("noequals").is_err());
    }

    #[test]
    fn callback_api_requires_http_scheme() {
        assert!(parse_callback_api("http://example.com").is_ok());
        assert!(parse_callback_api("https://example.com").is_err());
    }
}
