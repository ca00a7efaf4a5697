use std::ffi::OsString;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Suffix inserted before the extension of the input to name the default output.
pub const DEFAULT_OUTPUT_SUFFIX: &str = "-qrr";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("the reduce schedule is empty")]
    Empty,
    #[error("reduce schedule entry {position} ('{entry}') is not an integer")]
    NotAnInteger { position: usize, entry: String },
    #[error("reduce schedule entry {position} ({value}) must be positive")]
    NonPositive { position: usize, value: i64 },
    #[error("the last reduce schedule entry must be 1, but was {0}")]
    LastNotOne(usize),
    #[error("reduce schedule entry {position} ('{entry}'): only the first entry may spread")]
    SpreadNotFirst { position: usize, entry: String },
    #[error("the reduce schedule has a spread stage but no reduce stages")]
    SpreadOnly,
}

/// Reducer fan-in of every reduce stage, in order, optionally preceded by a spread
/// stage (`s<N>`) that scatters the input rows unchanged into N parts so the first
/// reduce stage gets N map tasks. Never empty; the last fan-in is 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceSchedule {
    spread: Option<NonZeroUsize>,
    fan_ins: Vec<NonZeroUsize>,
}

fn parse_count(position: usize, entry: &str, digits: &str) -> Result<NonZeroUsize, ScheduleError> {
    let value: i64 = digits.parse().map_err(|_| ScheduleError::NotAnInteger {
        position,
        entry: entry.to_string(),
    })?;
    usize::try_from(value)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or(ScheduleError::NonPositive { position, value })
}

impl ReduceSchedule {
    /// Parses a comma-separated list such as `"40,10,1"` or `"s100,10,1"`. Whitespace
    /// around entries is ignored.
    pub fn parse(text: &str) -> Result<Self, ScheduleError> {
        if text.trim().is_empty() {
            return Err(ScheduleError::Empty);
        }
        let mut spread = None;
        let mut fan_ins = Vec::new();
        for (index, entry) in text.split(',').map(str::trim).enumerate() {
            let position = index + 1;
            match entry.strip_prefix(['s', 'S']) {
                Some(digits) if index == 0 => {
                    spread = Some(parse_count(position, entry, digits)?);
                }
                Some(_) => {
                    return Err(ScheduleError::SpreadNotFirst {
                        position,
                        entry: entry.to_string(),
                    });
                }
                None => fan_ins.push(parse_count(position, entry, entry)?),
            }
        }
        match fan_ins.last() {
            Some(last) if last.get() == 1 => Ok(Self { spread, fan_ins }),
            Some(last) => Err(ScheduleError::LastNotOne(last.get())),
            None => Err(ScheduleError::SpreadOnly),
        }
    }

    /// All stages, the spread stage included.
    pub fn stages(&self) -> usize {
        self.fan_ins.len() + usize::from(self.spread.is_some())
    }

    /// Parts written by the spread stage, if there is one.
    pub fn spread(&self) -> Option<NonZeroUsize> {
        self.spread
    }

    /// Fan-ins of the reduce stages.
    pub fn fan_ins(&self) -> &[NonZeroUsize] {
        &self.fan_ins
    }
}

impl Default for ReduceSchedule {
    fn default() -> Self {
        Self {
            spread: None,
            fan_ins: vec![NonZeroUsize::MIN],
        }
    }
}

impl FromStr for ReduceSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ReduceSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parts) = self.spread {
            write!(f, "s{parts},")?;
        }
        for (i, fan_in) in self.fan_ins.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{fan_in}")?;
        }
        Ok(())
    }
}

/// `<base>-qrr.<ext>` next to `input`, or `<name>-qrr` when it has no extension.
pub fn default_output_path(input: &Path) -> PathBuf {
    let mut name = OsString::new();
    match (input.file_stem(), input.extension()) {
        (Some(stem), Some(ext)) => {
            name.push(stem);
            name.push(DEFAULT_OUTPUT_SUFFIX);
            name.push(".");
            name.push(ext);
        }
        (Some(stem), None) => {
            name.push(stem);
            name.push(DEFAULT_OUTPUT_SUFFIX);
        }
        (None, _) => {
            let mut whole = input.as_os_str().to_os_string();
            whole.push(DEFAULT_OUTPUT_SUFFIX);
            return PathBuf::from(whole);
        }
    }
    input.with_file_name(name)
}

/// Where stage `stage` (1-based) writes when it is not the last: `<output>_iter<stage>`.
pub fn intermediate_output_path(output: &Path, stage: usize) -> PathBuf {
    let mut path = output.as_os_str().to_os_string();
    path.push(format!("_iter{stage}"));
    PathBuf::from(path)
}
