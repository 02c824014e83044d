//! Rendering attendance reports.

use crate::types::AttendanceReport;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io::{self, Write};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// `Attendance for <classroom>` followed by `<name> -> <status>` lines.
    #[default]
    Text,
    /// One JSON object per classroom, one per line.
    Json,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            other => Err(format!("unknown report format {other:?} (expected text or json)")),
        }
    }
}

/// Render one report. Rows keep gallery order.
pub fn render(report: &AttendanceReport, format: ReportFormat) -> Result<String, serde_json::Error> {
    match format {
        ReportFormat::Text => {
            let mut out = format!("Attendance for {}\n", report.classroom);
            for rec in &report.records {
                // Writing to a String cannot fail.
                let _ = writeln!(out, "{} -> {}", rec.identity, rec.status);
            }
            Ok(out)
        }
        ReportFormat::Json => {
            let mut line = serde_json::to_string(report)?;
            line.push('\n');
            Ok(line)
        }
    }
}

/// Writes reports to a sink as they are produced.
pub struct ReportEmitter<W> {
    out: W,
    format: ReportFormat,
    emitted: usize,
}

impl<W: Write> ReportEmitter<W> {
    pub fn new(out: W, format: ReportFormat) -> Self {
        Self {
            out,
            format,
            emitted: 0,
        }
    }

    pub fn emit(&mut self, report: &AttendanceReport) -> io::Result<()> {
        let rendered = render(report, self.format).map_err(io::Error::other)?;
        if self.format == ReportFormat::Text && self.emitted > 0 {
            self.out.write_all(b"\n")?;
        }
        self.out.write_all(rendered.as_bytes())?;
        self.out.flush()?;
        self.emitted += 1;
        Ok(())
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
