//! Append-only run log.
//!
//! One CSV line per accepted tick, or per frame in deploy mode. The RPM
//! column is always written; the frame tick, wall-clock timestamp, and
//! color metrics (delta / mode / threshold) columns are independently
//! toggleable. The file is opened in append mode so repeated runs against
//! the same path accumulate rather than overwrite.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

/// Log destination and field selection, immutable for a run.
#[derive(Clone, Debug)]
pub struct OutputConfig {
    pub path: PathBuf,
    pub frame_tick: bool,
    pub timestamp: bool,
    pub color_metrics: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("rpm_log.csv"),
            frame_tick: true,
            timestamp: false,
            color_metrics: true,
        }
    }
}

/// One loggable observation.
#[derive(Clone, Copy, Debug)]
pub struct LogRecord {
    pub frame: u64,
    pub delta: f64,
    pub mode: f64,
    pub threshold: f64,
    pub rpm: f64,
}

/// Append-only CSV writer for one run.
pub struct RunLog {
    writer: BufWriter<File>,
    config: OutputConfig,
    records: u64,
}

impl RunLog {
    pub fn create(config: OutputConfig) -> Result<Self> {
        let is_new = !config.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .with_context(|| format!("open run log {}", config.path.display()))?;
        let mut log = Self {
            writer: BufWriter::new(file),
            config,
            records: 0,
        };
        if is_new {
            log.write_header()?;
        }
        Ok(log)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut columns = Vec::new();
        if self.config.frame_tick {
            columns.push("frame");
        }
        if self.config.timestamp {
            columns.push("timestamp");
        }
        if self.config.color_metrics {
            columns.extend(["delta", "mode", "threshold"]);
        }
        columns.push("rpm");
        writeln!(self.writer, "{}", columns.join(","))
            .with_context(|| format!("write header to {}", self.config.path.display()))?;
        Ok(())
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let mut fields = Vec::new();
        if self.config.frame_tick {
            fields.push(record.frame.to_string());
        }
        if self.config.timestamp {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .context("system clock before unix epoch")?
                .as_secs();
            fields.push(now.to_string());
        }
        if self.config.color_metrics {
            fields.push(format!("{:.4}", record.delta));
            fields.push(format!("{:.4}", record.mode));
            fields.push(format!("{:.4}", record.threshold));
        }
        fields.push(format!("{:.3}", record.rpm));
        writeln!(self.writer, "{}", fields.join(","))
            .with_context(|| format!("append to {}", self.config.path.display()))?;
        self.records += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("flush {}", self.config.path.display()))
    }

    pub fn records(&self) -> u64 {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> LogRecord {
        LogRecord {
            frame: 42,
            delta: 1.25,
            mode: 0.1,
            threshold: 0.6,
            rpm: 12.345,
        }
    }

    #[test]
    fn writes_header_and_all_fields() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.csv");
        let config = OutputConfig {
            path: path.clone(),
            frame_tick: true,
            timestamp: false,
            color_metrics: true,
        };

        let mut log = RunLog::create(config)?;
        log.append(&record())?;
        log.flush()?;

        let contents = std::fs::read_to_string(&path)?;
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("frame,delta,mode,threshold,rpm"));
        assert_eq!(lines.next(), Some("42,1.2500,0.1000,0.6000,12.345"));
        Ok(())
    }

    #[test]
    fn rpm_is_always_written() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("minimal.csv");
        let config = OutputConfig {
            path: path.clone(),
            frame_tick: false,
            timestamp: false,
            color_metrics: false,
        };

        let mut log = RunLog::create(config)?;
        log.append(&record())?;
        log.flush()?;

        let contents = std::fs::read_to_string(&path)?;
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("rpm"));
        assert_eq!(lines.next(), Some("12.345"));
        Ok(())
    }

    #[test]
    fn reopening_appends_without_second_header() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("append.csv");
        let config = OutputConfig {
            path: path.clone(),
            ..OutputConfig::default()
        };

        let mut log = RunLog::create(config.clone())?;
        log.append(&record())?;
        log.flush()?;
        drop(log);

        let mut log = RunLog::create(config)?;
        log.append(&record())?;
        log.flush()?;

        let contents = std::fs::read_to_string(&path)?;
        let headers = contents
            .lines()
            .filter(|l| l.starts_with("frame"))
            .count();
        assert_eq!(headers, 1);
        assert_eq!(contents.lines().count(), 3);
        Ok(())
    }
}
