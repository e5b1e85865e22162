//! Training-table alignment.
//!
//! The two labelled datasets describe packets with different columns. Each
//! source gets a [`SourceProfile`] (column renames, kept columns, label
//! wording). The prepared tables are then pushed through the same
//! [`Reconciler`] that aligns live packets, so training rows and inference
//! vectors share one column order.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};

use crate::error::{DetectorError, Result};
use crate::features::{names, FeatureValue, RawFeatureMap};
use crate::model::Label;
use crate::reconcile::{FeatureVector, MissingLabelPolicy, Reconciler};
use crate::schema::CanonicalSchema;

/// Header of the label column in aligned output.
pub const LABEL_COLUMN: &str = "Label";

/// How a source writes its class labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelEncoding {
    /// `-1` benign, `1` attack.
    Signed,
    /// `Benign` / `Normal` (or `0`) benign, any other text attack.
    Named,
}

impl LabelEncoding {
    /// `None` when the cell is empty or cannot be read.
    pub fn decode(&self, cell: Option<&FeatureValue>) -> Option<Label> {
        let cell = cell?;
        match self {
            LabelEncoding::Signed => {
                let v = cell.as_f64()?;
                Some(if v > 0.0 { Label::Attack } else { Label::Normal })
            }
            LabelEncoding::Named => {
                if let Some(v) = cell.as_f64() {
                    return Some(if v == 0.0 { Label::Normal } else { Label::Attack });
                }
                match cell {
                    FeatureValue::Text(s) => match s.trim() {
                        "Benign" | "Normal" => Some(Label::Normal),
                        _ => Some(Label::Attack),
                    },
                    _ => None,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub name: &'static str,
    pub label_column: &'static str,
    pub label_encoding: LabelEncoding,
    /// Source column name to canonical name.
    pub renames: &'static [(&'static str, &'static str)],
    /// Canonical columns taken from this source; everything else is dropped.
    pub keep: &'static [&'static str],
    /// Columns holding category names instead of numbers.
    pub categorical: &'static [&'static str],
}

impl SourceProfile {
    /// Simulated traffic export.
    pub fn simulation() -> Self {
        SourceProfile {
            name: "simulation",
            label_column: "label",
            label_encoding: LabelEncoding::Signed,
            renames: &[
                ("timestamp", "time"),
                ("src_ip", "ip.src"),
                ("dst_ip", "ip.dst"),
                ("protocol", names::IP_PROTO),
                ("packet_length", names::FRAME_LEN),
                ("tcp_flags", names::TCP_FLAGS),
            ],
            keep: &[names::FRAME_LEN, names::IP_PROTO, names::TCP_FLAGS],
            categorical: &[names::IP_PROTO],
        }
    }

    /// Wireshark field export of real captures.
    pub fn real_world() -> Self {
        SourceProfile {
            name: "real-world",
            label_column: "Label",
            label_encoding: LabelEncoding::Named,
            renames: &[],
            keep: &[
                names::FRAME_LEN,
                names::IP_PROTO,
                names::TCP_SRCPORT,
                names::TCP_DSTPORT,
                names::TCP_FLAGS_SYN,
                names::TCP_FLAGS_PUSH,
                names::TCP_FLAGS_ACK,
            ],
            categorical: &[names::IP_PROTO],
        }
    }
}

/// A raw CSV table, one feature map per row.
#[derive(Debug, Clone)]
pub struct DatasetTable {
    pub headers: Vec<String>,
    pub rows: Vec<RawFeatureMap>,
}

impl DatasetTable {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| DetectorError::Dataset(format!("cannot open {}: {}", path.display(), e)))?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers: Vec<String> = rdr.headers()?.iter().map(|s| s.to_string()).collect();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let mut row = RawFeatureMap::new();
            for (header, cell) in headers.iter().zip(record.iter()) {
                row.insert(header.clone(), cell);
            }
            rows.push(row);
        }
        Ok(DatasetTable { headers, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Rows of one source after its profile was applied. A `None` label means
/// the cell was empty or unreadable.
#[derive(Debug, Clone)]
pub struct PreparedTable {
    pub source: String,
    pub columns: Vec<String>,
    pub has_label_column: bool,
    pub rows: Vec<(RawFeatureMap, Option<Label>)>,
}

pub fn prepare(table: DatasetTable, profile: &SourceProfile) -> PreparedTable {
    let has_label_column = table.headers.iter().any(|h| h == profile.label_column);

    let renamed: Vec<String> = table
        .headers
        .iter()
        .map(|h| {
            profile
                .renames
                .iter()
                .find(|(from, _)| *from == h.as_str())
                .map(|(_, to)| to.to_string())
                .unwrap_or_else(|| h.clone())
        })
        .collect();
    let columns: Vec<String> = profile
        .keep
        .iter()
        .filter(|k| renamed.iter().any(|h| h.as_str() == **k))
        .map(|k| k.to_string())
        .collect();

    let mut rows: Vec<(RawFeatureMap, Option<Label>)> = table
        .rows
        .into_iter()
        .map(|mut raw| {
            let label = profile.label_encoding.decode(raw.get(profile.label_column));
            for (from, to) in profile.renames {
                raw.rename(from, to);
            }
            let mut kept = RawFeatureMap::new();
            for column in &columns {
                if let Some(value) = raw.remove(column) {
                    kept.insert(column.clone(), value);
                }
            }
            (kept, label)
        })
        .collect();

    for column in profile.categorical {
        encode_categories(&mut rows, column);
    }

    PreparedTable {
        source: profile.name.to_string(),
        columns,
        has_label_column,
        rows,
    }
}

/// Replace category names by their index among the sorted distinct names.
/// Columns that are already numeric are left alone.
fn encode_categories(rows: &mut [(RawFeatureMap, Option<Label>)], column: &str) {
    let mut categories = BTreeSet::new();
    let mut textual = false;
    for (raw, _) in rows.iter() {
        if let Some(FeatureValue::Text(text)) = raw.get(column) {
            if text.trim().parse::<f64>().is_err() {
                textual = true;
            }
            categories.insert(text.trim().to_string());
        }
    }
    if !textual {
        return;
    }

    let codes: BTreeMap<String, usize> = categories.into_iter().enumerate().map(|(i, c)| (c, i)).collect();
    for (raw, _) in rows.iter_mut() {
        let code = match raw.get(column) {
            Some(FeatureValue::Text(text)) => codes.get(text.trim()).copied(),
            _ => None,
        };
        if let Some(code) = code {
            raw.insert(column, code);
        }
    }
}

/// Sorted union of the columns the sources contribute.
pub fn derive_feature_list(tables: &[PreparedTable]) -> Vec<String> {
    let union: BTreeSet<&str> = tables
        .iter()
        .flat_map(|t| t.columns.iter().map(|c| c.as_str()))
        .collect();
    union.into_iter().map(|c| c.to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct AlignedTable {
    pub feature_names: Vec<String>,
    pub rows: Vec<(FeatureVector, Label)>,
}

impl AlignedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn attacks(&self) -> usize {
        self.rows.iter().filter(|(_, label)| label.is_attack()).count()
    }

    /// Canonical feature columns followed by `Label` as 0/1.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header: Vec<&str> = self.feature_names.iter().map(|s| s.as_str()).collect();
        header.push(LABEL_COLUMN);
        writer.write_record(&header)?;

        for (vector, label) in &self.rows {
            let mut record: Vec<String> = vector.as_slice().iter().map(|v| v.to_string()).collect();
            record.push(if label.is_attack() { "1" } else { "0" }.to_string());
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Align every table onto `feature_names`. Missing features become 0 and
/// extra ones are dropped. Missing labels follow `policy`.
pub fn align_tables(
    tables: &[PreparedTable],
    feature_names: Vec<String>,
    policy: MissingLabelPolicy,
) -> Result<AlignedTable> {
    let schema = CanonicalSchema::unscaled(feature_names)?;
    let reconciler = Reconciler::new(Arc::new(schema));
    let mut rows = Vec::new();

    for table in tables {
        if !table.has_label_column {
            match policy {
                MissingLabelPolicy::Reject => {
                    return Err(DetectorError::Dataset(format!(
                        "{} dataset has no label column",
                        table.source
                    )))
                }
                MissingLabelPolicy::DefaultBenign => {
                    warn!("{} dataset has no label column; every row is treated as Normal", table.source)
                }
            }
        }

        let mut defaulted = 0usize;
        let mut incomplete = 0usize;
        for (i, (raw, label)) in table.rows.iter().enumerate() {
            let label = match (label, policy) {
                (Some(label), _) => *label,
                (None, MissingLabelPolicy::Reject) => {
                    return Err(DetectorError::Dataset(format!(
                        "{} dataset row {} has no usable label",
                        table.source,
                        i + 1
                    )))
                }
                (None, MissingLabelPolicy::DefaultBenign) => {
                    defaulted += 1;
                    Label::Normal
                }
            };
            let (vector, report) = reconciler.reconcile_with_report(raw);
            if !report.is_clean() {
                incomplete += 1;
            }
            rows.push((vector, label));
        }

        if defaulted > 0 && table.has_label_column {
            warn!("{} dataset: {} rows without a label treated as Normal", table.source, defaulted);
        }
        info!(
            "{} dataset: {} rows aligned, {} with zero-filled features",
            table.source,
            table.rows.len(),
            incomplete
        );
    }

    Ok(AlignedTable {
        feature_names: reconciler.schema().feature_names().to_vec(),
        rows,
    })
}

pub fn write_feature_list(path: &Path, feature_names: &[String]) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, feature_names)?;
    Ok(())
}

pub fn read_feature_list(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)
        .map_err(|e| DetectorError::Dataset(format!("cannot open {}: {}", path.display(), e)))?;
    Ok(serde_json::from_reader(file)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMULATION: &str = "\
timestamp,src_ip,dst_ip,protocol,packet_length,tcp_flags,label
0.1,10.0.0.1,10.0.0.2,TCP,60,2,1
0.2,10.0.0.3,10.0.0.2,UDP,1200,0,-1
0.3,10.0.0.4,10.0.0.2,ICMP,98,,-1
";

    const REAL_WORLD: &str = "\
frame.time,ip.src,ip.dst,frame.len,ip.proto,tcp.srcport,tcp.dstport,tcp.flags.syn,tcp.flags.push,tcp.flags.ack,Label
t0,192.168.0.1,192.168.0.9,74,6,51000,80,1,0,0,DDoS-SYN
t1,192.168.0.2,192.168.0.9,66,6,51001,443,0,0,1,Benign
";

    fn prepared() -> Vec<PreparedTable> {
        vec![
            prepare(DatasetTable::from_reader(SIMULATION.as_bytes()).unwrap(), &SourceProfile::simulation()),
            prepare(DatasetTable::from_reader(REAL_WORLD.as_bytes()).unwrap(), &SourceProfile::real_world()),
        ]
    }

    #[test]
    fn test_feature_list_is_sorted_union() {
        let features = derive_feature_list(&prepared());
        assert_eq!(features, names::PACKET_FEATURES.to_vec());
    }

    #[test]
    fn test_disjoint_columns_zero_filled() {
        let tables = prepared();
        let aligned = align_tables(&tables, derive_feature_list(&tables), MissingLabelPolicy::Reject).unwrap();
        assert_eq!(aligned.len(), 5);

        let col = |name: &str| aligned.feature_names.iter().position(|n| n == name).unwrap();
        // Simulation rows have no port columns, real-world rows no tcp.flags
        let (sim_row, sim_label) = &aligned.rows[0];
        assert_eq!(sim_row.as_slice()[col(names::TCP_SRCPORT)], 0.0);
        assert_eq!(sim_row.as_slice()[col(names::FRAME_LEN)], 60.0);
        assert_eq!(*sim_label, Label::Attack);

        let (real_row, real_label) = &aligned.rows[3];
        assert_eq!(real_row.as_slice()[col(names::TCP_FLAGS)], 0.0);
        assert_eq!(real_row.as_slice()[col(names::TCP_DSTPORT)], 80.0);
        assert_eq!(*real_label, Label::Attack);
        assert_eq!(aligned.rows[4].1, Label::Normal);

        // Empty tcp_flags cell becomes 0
        assert_eq!(aligned.rows[2].0.as_slice()[col(names::TCP_FLAGS)], 0.0);
        assert!(aligned.rows.iter().all(|(v, _)| v.len() == 8));
    }

    #[test]
    fn test_protocol_names_label_encoded() {
        let tables = prepared();
        let sim = &tables[0];
        let protos: Vec<Option<f64>> = sim
            .rows
            .iter()
            .map(|(raw, _)| raw.get(names::IP_PROTO).and_then(|v| v.as_f64()))
            .collect();
        // ICMP, TCP, UDP in sorted order
        assert_eq!(protos, vec![Some(1.0), Some(2.0), Some(0.0)]);

        // Numeric protocols stay as they are
        let real = &tables[1];
        assert_eq!(real.rows[0].0.get(names::IP_PROTO).and_then(|v| v.as_f64()), Some(6.0));
    }

    #[test]
    fn test_missing_label_column_rejected() {
        let unlabeled = "frame.len,ip.proto\n60,6\n";
        let tables = vec![prepare(
            DatasetTable::from_reader(unlabeled.as_bytes()).unwrap(),
            &SourceProfile::real_world(),
        )];
        let features = derive_feature_list(&tables);
        let err = align_tables(&tables, features, MissingLabelPolicy::Reject).unwrap_err();
        assert!(matches!(err, DetectorError::Dataset(_)));
    }

    #[test]
    fn test_missing_label_defaults_to_benign() {
        let unlabeled = "frame.len,ip.proto\n60,6\n";
        let tables = vec![prepare(
            DatasetTable::from_reader(unlabeled.as_bytes()).unwrap(),
            &SourceProfile::real_world(),
        )];
        let features = derive_feature_list(&tables);
        let aligned = align_tables(&tables, features, MissingLabelPolicy::DefaultBenign).unwrap();
        assert_eq!(aligned.rows[0].1, Label::Normal);
    }

    #[test]
    fn test_empty_label_cell_follows_policy() {
        let csv = "frame.len,ip.proto,Label\n60,6,\n70,6,Benign\n";
        let tables = vec![prepare(DatasetTable::from_reader(csv.as_bytes()).unwrap(), &SourceProfile::real_world())];
        let features = derive_feature_list(&tables);

        let err = align_tables(&tables, features.clone(), MissingLabelPolicy::Reject).unwrap_err();
        assert!(err.to_string().contains("row 1"));

        let aligned = align_tables(&tables, features, MissingLabelPolicy::DefaultBenign).unwrap();
        assert_eq!(aligned.attacks(), 0);
    }

    #[test]
    fn test_label_decoding() {
        let text = |s: &str| FeatureValue::from(s);
        assert_eq!(LabelEncoding::Signed.decode(Some(&text("-1"))), Some(Label::Normal));
        assert_eq!(LabelEncoding::Signed.decode(Some(&text("1"))), Some(Label::Attack));
        assert_eq!(LabelEncoding::Signed.decode(Some(&text("x"))), None);
        assert_eq!(LabelEncoding::Named.decode(Some(&text("Normal"))), Some(Label::Normal));
        assert_eq!(LabelEncoding::Named.decode(Some(&text("DDoS-ACK"))), Some(Label::Attack));
        assert_eq!(LabelEncoding::Named.decode(Some(&FeatureValue::Null)), None);
        assert_eq!(LabelEncoding::Named.decode(None), None);
    }

    #[test]
    fn test_write_aligned_csv_and_feature_list() {
        let dir = tempfile::tempdir().unwrap();
        let tables = prepared();
        let features = derive_feature_list(&tables);
        let aligned = align_tables(&tables, features.clone(), MissingLabelPolicy::Reject).unwrap();

        let csv_path = dir.path().join("aligned.csv");
        aligned.write_csv(&csv_path).unwrap();
        let text = std::fs::read_to_string(&csv_path).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(
            header,
            "frame.len,ip.proto,tcp.dstport,tcp.flags,tcp.flags.ack,tcp.flags.push,tcp.flags.syn,tcp.srcport,Label"
        );
        assert_eq!(text.lines().count(), 6);

        let list_path = dir.path().join("feature_list.json");
        write_feature_list(&list_path, &features).unwrap();
        assert_eq!(read_feature_list(&list_path).unwrap(), features);
    }
}
