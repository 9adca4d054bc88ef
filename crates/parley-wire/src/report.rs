//! `report-status` parsing and writing.
//!
//! After a push the receiver answers with `unpack ok` (or `unpack <error>`),
//! then one `ok <ref>` or `ng <ref> <reason>` line per command, then a flush.

use crate::capabilities::trim_newline;
use crate::pktline::{PktLineWriter, WritePkt};
use crate::sideband::{Channel, SidebandMode, SidebandWriter};
use crate::{Result, WireError};
use std::collections::BTreeMap;

/// Outcome of one ref update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefStatus {
    /// The ref was updated.
    Ok,
    /// The ref was left alone, with the reason.
    Rejected(String),
}

impl RefStatus {
    /// Returns true if the update was applied.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Incremental parser for a status report.
#[derive(Debug, Default)]
pub struct ReportStatusParser {
    unpack: Option<String>,
    statuses: BTreeMap<String, RefStatus>,
    done: bool,
}

impl ReportStatusParser {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one packet; `None` is the terminating flush.
    pub fn handle_packet(&mut self, pkt: Option<&[u8]>) -> Result<()> {
        if self.done {
            return Err(WireError::protocol("status report continued after flush"));
        }
        let Some(line) = pkt else {
            self.done = true;
            return Ok(());
        };
        let line = std::str::from_utf8(trim_newline(line))
            .map_err(|_| WireError::protocol("status line is not valid UTF-8"))?;

        if self.unpack.is_none() {
            let status = line.strip_prefix("unpack ").ok_or_else(|| {
                WireError::protocol(format!("expected unpack status, got {:?}", line))
            })?;
            self.unpack = Some(status.to_string());
            return Ok(());
        }

        let (word, rest) = line
            .split_once(' ')
            .ok_or_else(|| WireError::protocol(format!("malformed status line {:?}", line)))?;
        let (name, status) = match word {
            "ok" => (rest, RefStatus::Ok),
            "ng" => {
                let (name, reason) = rest.split_once(' ').unwrap_or((rest, ""));
                (name, RefStatus::Rejected(reason.to_string()))
            }
            other => {
                return Err(WireError::protocol(format!(
                    "invalid ref status {:?}",
                    other
                )))
            }
        };
        if let RefStatus::Rejected(reason) = &status {
            tracing::warn!(ref_name = %name, reason = %reason, "ref update rejected");
        }
        self.statuses.insert(name.to_string(), status);
        Ok(())
    }

    /// Returns true once the terminating flush was seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Per-ref outcome, failing if the receiver could not unpack or the
    /// report never reached its flush.
    pub fn check(&self) -> Result<BTreeMap<String, RefStatus>> {
        if !self.done {
            return Err(WireError::protocol("status report ended before its flush"));
        }
        match self.unpack.as_deref() {
            Some("ok") => Ok(self.statuses.clone()),
            Some(error) => Err(WireError::UnpackFailed(error.to_string())),
            None => Err(WireError::protocol("status report without unpack line")),
        }
    }
}

/// Writes a status report (receiver side).
///
/// `unpack_error` is `None` when the pack was stored. With a sideband the
/// report travels inside channel 1, terminated by an outer flush.
pub fn write_report_status<W: WritePkt>(
    mut writer: W,
    mode: SidebandMode,
    unpack_error: Option<&str>,
    statuses: &[(String, RefStatus)],
) -> Result<()> {
    let mut report = PktLineWriter::new(Vec::new());
    report.write_line(&format!("unpack {}", unpack_error.unwrap_or("ok")))?;
    for (name, status) in statuses {
        match status {
            RefStatus::Ok => report.write_line(&format!("ok {}", name))?,
            RefStatus::Rejected(reason) => report.write_line(&format!("ng {} {}", name, reason))?,
        }
    }
    report.flush_pkt()?;
    let report = report.into_inner();

    if mode.is_multiplexed() {
        let mut sideband = SidebandWriter::new(writer, mode);
        sideband.write_channel(Channel::PackData, &report)?;
        sideband.finish()?;
    } else {
        writer.write_raw(&report)?;
        writer.flush()?;
    }
    Ok(())
}
