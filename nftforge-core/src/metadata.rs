//! Embedded Metadata - exiftool Stamping
//!
//! One exiftool process runs in `-stay_open` mode for the whole run. Shared
//! fields (subject, contact, copyright, keywords) are passed once as common
//! arguments; each image only sends its title/description/comment.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_FILE: &str = "exif_metadata.yaml";
pub const DEFAULT_EXIFTOOL: &str = "exiftool";

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

const READY_MARKER: &str = "{ready}";
const UPDATED_MARKER: &str = "1 image files updated";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to read metadata config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid metadata config: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("exiftool pipe error: {0}")]
    Pipe(#[from] std::io::Error),

    #[error("exiftool is already closed")]
    Closed,

    #[error("exiftool did not update {path}: {output}")]
    NotUpdated { path: PathBuf, output: String },

    #[error("{path} not visible after {waited_ms}ms")]
    NotVisible { path: PathBuf, waited_ms: u128 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub author: String,
    pub email: String,
    pub url: String,
    pub country: Country,
}

/// Run-wide embedded metadata defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub subject: String,
    pub contact: Contact,
    pub copyright: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl MetadataConfig {
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = fs::read_to_string(path).map_err(|source| MetadataError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, MetadataError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// exiftool arguments applied to every execute call.
    pub fn common_args(&self) -> Vec<String> {
        let author = &self.contact.author;
        let mut args = vec![
            "-overwrite_original".to_string(),
            format!("-subject={}", self.subject),
            format!("-author={author}"),
            format!("-artist={author}"),
            format!("-creator={author}"),
            format!("-CreatorWorkEmail={}", self.contact.email),
            format!("-CreatorWorkURL={}", self.contact.url),
            format!("-CreatorCountry={}", self.contact.country.name),
            format!("-CountryCode={}", self.contact.country.code),
            format!("-copyright={}", self.copyright),
            "-marked=True".to_string(),
        ];
        args.extend(self.keywords.iter().map(|k| format!("-keywords={k}")));
        args
    }
}

/// Per-image fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStamp {
    pub title: String,
    pub description: String,
    pub comment: String,
}

impl ImageStamp {
    pub fn new(image_desc: &str, traits: &str) -> Self {
        let details = format!("{image_desc} :: {traits}");
        Self {
            title: image_desc.to_string(),
            description: details.clone(),
            comment: details,
        }
    }

    pub fn args(&self) -> [String; 3] {
        [
            format!("-comment={}", self.comment),
            format!("-title={}", self.title),
            format!("-description={}", self.description),
        ]
    }
}

pub trait MetadataWriter {
    fn stamp(&mut self, path: &Path, stamp: &ImageStamp) -> Result<(), MetadataError>;

    /// Release any held resources. Safe to call more than once.
    fn close(&mut self) -> Result<(), MetadataError> {
        Ok(())
    }
}

/// Leaves files untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledWriter;

impl MetadataWriter for DisabledWriter {
    fn stamp(&mut self, path: &Path, _stamp: &ImageStamp) -> Result<(), MetadataError> {
        debug!(path = %path.display(), "metadata stamping disabled");
        Ok(())
    }
}

/// Long-lived `exiftool -stay_open` process. Terminated on [`close`] or drop.
///
/// [`close`]: MetadataWriter::close
pub struct ExifTool {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ExifTool {
    pub fn start(program: &str, config: &MetadataConfig) -> Result<Self, MetadataError> {
        let spawn_err = |source| MetadataError::Spawn {
            program: program.to_string(),
            source,
        };

        let mut child = Command::new(program)
            .args(["-stay_open", "True", "-@", "-", "-common_args"])
            .args(config.common_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_err)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => Ok(Self {
                child,
                stdin: Some(stdin),
                stdout: BufReader::new(stdout),
            }),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                Err(spawn_err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "exiftool pipes unavailable",
                )))
            }
        }
    }

    /// Send one argument batch and collect output up to the ready marker.
    fn execute(&mut self, args: &[String]) -> Result<String, MetadataError> {
        let stdin = self.stdin.as_mut().ok_or(MetadataError::Closed)?;
        for arg in args {
            writeln!(stdin, "{}", arg_line(arg))?;
        }
        writeln!(stdin, "-execute")?;
        stdin.flush()?;

        let mut output = String::new();
        loop {
            let mut line = String::new();
            if self.stdout.read_line(&mut line)? == 0 {
                return Err(MetadataError::Pipe(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "exiftool exited mid-command",
                )));
            }
            if line.trim_end() == READY_MARKER {
                return Ok(output);
            }
            output.push_str(&line);
        }
    }

    fn shutdown(&mut self) -> Result<(), MetadataError> {
        let Some(mut stdin) = self.stdin.take() else {
            return Ok(());
        };
        let graceful = request_stop(&mut stdin);
        drop(stdin);

        if let Err(e) = graceful {
            warn!(error = %e, "exiftool did not accept shutdown; killing");
            let _ = self.child.kill();
        }
        self.child.wait()?;
        Ok(())
    }
}

impl MetadataWriter for ExifTool {
    fn stamp(&mut self, path: &Path, stamp: &ImageStamp) -> Result<(), MetadataError> {
        let mut args = stamp.args().to_vec();
        args.push(path.display().to_string());

        let output = self.execute(&args)?;
        if !output.contains(UPDATED_MARKER) {
            return Err(MetadataError::NotUpdated {
                path: path.to_path_buf(),
                output: output.trim().to_string(),
            });
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), MetadataError> {
        self.shutdown()
    }
}

impl Drop for ExifTool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "exiftool shutdown failed");
        }
    }
}

fn request_stop(stdin: &mut ChildStdin) -> std::io::Result<()> {
    writeln!(stdin, "-stay_open")?;
    writeln!(stdin, "False")?;
    stdin.flush()
}

/// The `-@ -` argfile protocol is line based.
fn arg_line(arg: &str) -> String {
    arg.replace(|c: char| c == '\r' || c == '\n', " ")
}

/// Poll until `path` exists, giving up after `timeout`.
pub fn wait_for_file(path: &Path, timeout: Duration) -> Result<(), MetadataError> {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() >= timeout {
            return Err(MetadataError::NotVisible {
                path: path.to_path_buf(),
                waited_ms: start.elapsed().as_millis(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CONFIG: &str = r#"
subject: Generative Art
contact:
  author: Jane Artist
  email: jane@example.com
  url: https://example.com
  country:
    name: United States
    code: US
copyright: Copyright 2026 Jane Artist
keywords:
  - nft
  - generative
"#;

    #[test]
    fn test_config_parses() {
        let config = MetadataConfig::from_yaml_str(CONFIG).unwrap();
        assert_eq!(config.contact.country.code, "US");
        assert_eq!(config.keywords, vec!["nft", "generative"]);
    }

    #[test]
    fn test_missing_field_is_error() {
        let broken = "subject: x\ncopyright: y\n";
        assert!(matches!(
            MetadataConfig::from_yaml_str(broken),
            Err(MetadataError::Config(_))
        ));
    }

    #[test]
    fn test_common_args() {
        let args = MetadataConfig::from_yaml_str(CONFIG).unwrap().common_args();
        assert_eq!(args[0], "-overwrite_original");
        assert!(args.contains(&"-artist=Jane Artist".to_string()));
        assert!(args.contains(&"-CountryCode=US".to_string()));
        assert!(args.contains(&"-marked=True".to_string()));
        assert_eq!(args.iter().filter(|a| a.starts_with("-keywords=")).count(), 2);
    }

    #[test]
    fn test_image_stamp_details() {
        let stamp = ImageStamp::new("NFT #7", "[]");
        assert_eq!(stamp.title, "NFT #7");
        assert_eq!(stamp.description, "NFT #7 :: []");
        assert_eq!(stamp.args()[0], "-comment=NFT #7 :: []");
    }

    #[test]
    fn test_arg_line_strips_newlines() {
        assert_eq!(arg_line("-title=a\nb"), "-title=a b");
    }

    #[test]
    fn test_wait_for_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00001.png");
        fs::write(&path, b"x").unwrap();
        assert!(wait_for_file(&path, Duration::from_millis(0)).is_ok());
    }

    #[test]
    fn test_wait_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("never.png");
        assert!(matches!(
            wait_for_file(&path, Duration::from_millis(150)),
            Err(MetadataError::NotVisible { .. })
        ));
    }

    #[test]
    fn test_missing_exiftool_binary() {
        let config = MetadataConfig::from_yaml_str(CONFIG).unwrap();
        assert!(matches!(
            ExifTool::start("definitely-not-exiftool-7f3a", &config),
            Err(MetadataError::Spawn { .. })
        ));
    }
}
