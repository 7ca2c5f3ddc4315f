//! Line oriented tracer configuration.
//!
//! ```text
//! # capture call stacks
//! complex
//! post-process-graph
//! timer-interval = 250
//! ```

use crate::encoder::EncoderOptions;
use crate::time::TimerSchedule;
use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the configuration file looked up in the working directory and then
/// in `$HOME`
pub const FILE_NAME: &str = ".hwmtrace";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Line {line}: '{key}' expects a value")]
    MissingValue { line: usize, key: String },

    #[error("Line {line}: invalid value '{value}' for '{key}'")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },

    #[error(
        "Encountered and IO error while reading the configuration ({})",
        .0.kind()
    )]
    Io(#[from] io::Error),
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TraceConfig {
    /// Capture a call stack for every allocation
    pub complex: bool,
    /// Analyze the trace when the process finishes
    pub post_process: bool,
    pub post_process_graph: bool,
    pub post_process_functions: bool,
    /// Traced calls between `Timer` frames, 0 disables them
    pub timer_interval: u32,
    pub buffer_size: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            complex: false,
            post_process: false,
            post_process_graph: false,
            post_process_functions: false,
            timer_interval: TimerSchedule::DEFAULT_INTERVAL,
            buffer_size: EncoderOptions::DEFAULT_BUFFER_SIZE,
        }
    }
}

impl TraceConfig {
    /// Load `./.hwmtrace`, falling back to `$HOME/.hwmtrace`, falling back to
    /// the defaults
    pub fn load() -> Result<Self, Error> {
        let mut candidates = vec![PathBuf::from(FILE_NAME)];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(FILE_NAME));
        }
        Self::load_from(&candidates)
    }

    /// Load the first of `candidates` that exists
    pub fn load_from<P: AsRef<Path>>(candidates: &[P]) -> Result<Self, Error> {
        for path in candidates.iter().map(AsRef::as_ref) {
            if let Some(cfg) = Self::from_file(path)? {
                debug!(path = %path.display(), ?cfg, "Loaded configuration");
                return Ok(cfg);
            }
        }
        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// `None` when the file does not exist
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Option<Self>, Error> {
        match File::open(path) {
            Ok(f) => Self::read(BufReader::new(f)).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read<R: BufRead>(r: R) -> Result<Self, Error> {
        let mut cfg = Self::default();
        for (idx, line) in r.lines().enumerate() {
            cfg.apply_line(idx + 1, &line?)?;
        }
        Ok(cfg)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        Self::read(text.as_bytes())
    }

    pub fn timer_schedule(&self) -> TimerSchedule {
        TimerSchedule::every(self.timer_interval)
    }

    pub fn encoder_options(&self) -> EncoderOptions {
        EncoderOptions::default().with_buffer_size(self.buffer_size)
    }

    fn apply_line(&mut self, line: usize, raw: &str) -> Result<(), Error> {
        let content = raw.split('#').next().unwrap_or_default().trim();
        if content.is_empty() {
            return Ok(());
        }
        let (key, value) = match content.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (content, None),
        };

        match key {
            "complex" => self.complex = true,
            "post-process" => self.post_process = true,
            "post-process-graph" => {
                self.post_process = true;
                self.post_process_graph = true;
            }
            "post-process-functions" => {
                self.post_process = true;
                self.post_process_functions = true;
            }
            "timer-interval" => self.timer_interval = parse_value(line, key, value)?,
            "buffer-size" => self.buffer_size = parse_value(line, key, value)?,
            _ => warn!(line, key, "Ignoring unknown configuration key"),
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(line: usize, key: &str, value: Option<&str>) -> Result<T, Error> {
    let value = value.ok_or_else(|| Error::MissingValue {
        line,
        key: key.to_owned(),
    })?;
    value.parse().map_err(|_| Error::InvalidValue {
        line,
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_keys() {
        let cfg = TraceConfig::parse(
            "# a comment\n\
             complex\n\
             \n\
             post-process-graph   # inline comment\n\
             timer-interval = 250\n\
             buffer-size=4096\n\
             something-else\n",
        )
        .unwrap();
        assert_eq!(
            cfg,
            TraceConfig {
                complex: true,
                post_process: true,
                post_process_graph: true,
                post_process_functions: false,
                timer_interval: 250,
                buffer_size: 4096,
            }
        );
        assert_eq!(cfg.timer_schedule().interval().map(|i| i.get()), Some(250));
    }

    #[test]
    fn malformed_values() {
        assert!(matches!(
            TraceConfig::parse("timer-interval = often"),
            Err(Error::InvalidValue { line: 1, .. })
        ));
        assert!(matches!(
            TraceConfig::parse("complex\nbuffer-size"),
            Err(Error::MissingValue { line: 2, .. })
        ));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let missing = std::env::temp_dir().join("hwm-trace-no-such-config");
        assert!(TraceConfig::from_file(&missing).unwrap().is_none());
        assert_eq!(TraceConfig::load_from(&[missing]).unwrap(), TraceConfig::default());
    }
}
