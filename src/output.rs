//! Where classification results go: a line per packet on a console stream
//! for live mode, a CSV table written once for offline mode.

use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::Result;
use crate::model::Label;

/// Outcome for one classified packet. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub index: usize,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub label: Label,
}

pub trait ResultSink {
    fn emit(&mut self, result: &ClassificationResult) -> Result<()>;
}

/// Writes one line per result and flushes it straight away.
pub struct ConsoleSink<W: Write> {
    out: W,
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        ConsoleSink { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        ConsoleSink::new(std::io::stdout())
    }
}

impl<W: Write> ResultSink for ConsoleSink<W> {
    fn emit(&mut self, result: &ClassificationResult) -> Result<()> {
        // Whole line in one write so an interrupt never leaves half of it
        let line = format!(
            "[LIVE] {} → {} | {}\n",
            result.source, result.destination, result.label
        );
        self.out.write_all(line.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct TableRow {
    index: usize,
    src: String,
    dst: String,
    prediction: &'static str,
}

/// Offline results, kept in input order until the run ends.
#[derive(Debug, Default, Clone)]
pub struct ResultTable {
    rows: Vec<ClassificationResult>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: ClassificationResult) {
        self.rows.push(result);
    }

    pub fn rows(&self) -> &[ClassificationResult] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn attacks(&self) -> usize {
        self.rows.iter().filter(|r| r.label.is_attack()).count()
    }

    /// Write the table to `path` in one step: the rows go to a temporary
    /// file beside the target which is then renamed over it.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
            for row in &self.rows {
                writer.serialize(TableRow {
                    index: row.index,
                    src: row.source.to_string(),
                    dst: row.destination.to_string(),
                    prediction: row.label.table_name(),
                })?;
            }
            if self.rows.is_empty() {
                writer.write_record(["index", "src", "dst", "prediction"])?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl ResultSink for ResultTable {
    fn emit(&mut self, result: &ClassificationResult) -> Result<()> {
        self.push(result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn result(index: usize, label: Label) -> ClassificationResult {
        ClassificationResult {
            index,
            source: Ipv4Addr::new(192, 168, 1, 10),
            destination: Ipv4Addr::new(192, 168, 1, 1),
            label,
        }
    }

    #[test]
    fn test_console_line_format() {
        let mut sink = ConsoleSink::new(Vec::new());
        sink.emit(&result(0, Label::Attack)).unwrap();
        sink.emit(&result(1, Label::Normal)).unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[LIVE] 192.168.1.10 → 192.168.1.1 | DDoS Attack");
        assert_eq!(lines[1], "[LIVE] 192.168.1.10 → 192.168.1.1 | Normal");
    }

    #[test]
    fn test_table_written_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictions.csv");

        let mut table = ResultTable::new();
        table.push(result(3, Label::Normal));
        table.push(result(7, Label::Attack));
        table.write_atomic(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "index,src,dst,prediction");
        assert_eq!(lines[1], "3,192.168.1.10,192.168.1.1,Normal");
        assert_eq!(lines[2], "7,192.168.1.10,192.168.1.1,DDoS");
        assert_eq!(table.attacks(), 1);

        // Only the target remains, no temporary leftovers
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_empty_table_still_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        ResultTable::new().write_atomic(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "index,src,dst,prediction");
    }

    #[test]
    fn test_overwrite_replaces_previous_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "stale contents\n").unwrap();

        let mut table = ResultTable::new();
        table.push(result(0, Label::Normal));
        table.write_atomic(&path).unwrap();
        assert!(!fs::read_to_string(&path).unwrap().contains("stale"));
    }
}
