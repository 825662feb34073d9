use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Read, Write};
use std::path::Path;

/// Name of the identifier column in every annotation file.
pub const ID_COLUMN: &str = "image_name";

/// Stable identifier for an annotation table (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

/// A row of the raw annotation file: an image name and its space-separated tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAnnotation {
    pub image_name: String,
    #[serde(default)]
    pub tags: String,
}

/// One sample: identifier plus a multi-hot vector over the table's tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub image_name: String,
    pub labels: Vec<u8>,
}

/// An ordered collection of records sharing one tag vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnnotationTable {
    tags: Vec<String>,
    records: Vec<AnnotationRecord>,
}

impl AnnotationTable {
    /// Build a table, checking every record against the tag vocabulary.
    pub fn new(tags: Vec<String>, records: Vec<AnnotationRecord>) -> TrainingResult<Self> {
        let table = Self { tags, records };
        table.validate_shape()?;
        Ok(table)
    }

    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    #[must_use]
    pub fn records(&self) -> &[AnnotationRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn image_names(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.image_name.as_str()).collect()
    }

    #[must_use]
    pub fn label_rows(&self) -> Vec<&[u8]> {
        self.records.iter().map(|r| r.labels.as_slice()).collect()
    }

    /// Rows at `indices`, in the order given.
    #[must_use]
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            tags: self.tags.clone(),
            records: indices.iter().map(|&i| self.records[i].clone()).collect(),
        }
    }

    /// Number of positive samples per tag, in column order.
    #[must_use]
    pub fn positive_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.tags.len()];
        for record in &self.records {
            for (count, &v) in counts.iter_mut().zip(&record.labels) {
                *count += usize::from(v);
            }
        }
        counts
    }

    /// Fraction of samples carrying each tag. Empty tables report zeros.
    #[must_use]
    pub fn positive_rates(&self) -> Vec<f64> {
        let n = self.records.len().max(1) as f64;
        self.positive_counts().into_iter().map(|c| c as f64 / n).collect()
    }

    /// Drop exact duplicate rows, keeping the first occurrence.
    ///
    /// Returns the number of rows removed. The same image name with two
    /// different label rows is not a duplicate and is rejected.
    pub fn dedup(&mut self) -> TrainingResult<usize> {
        let before = self.records.len();
        let mut seen = HashSet::with_capacity(before);
        self.records.retain(|r| seen.insert(r.clone()));
        self.validate_unique_ids()?;
        Ok(before - self.records.len())
    }

    pub fn validate_unique_ids(&self) -> TrainingResult<()> {
        let mut seen: HashMap<&str, usize> = HashMap::with_capacity(self.records.len());
        for (idx, r) in self.records.iter().enumerate() {
            if let Some(first) = seen.insert(r.image_name.as_str(), idx) {
                return Err(TrainingError::Dataset(format!(
                    "image `{}` appears at rows {first} and {idx}",
                    r.image_name
                )));
            }
        }
        Ok(())
    }

    fn validate_shape(&self) -> TrainingResult<()> {
        let width = self.tags.len();
        for (idx, r) in self.records.iter().enumerate() {
            if r.labels.len() != width {
                return Err(TrainingError::Dataset(format!(
                    "record[{idx}] has {} labels, expected {width}",
                    r.labels.len()
                )));
            }
            if r.labels.iter().any(|&v| v > 1) {
                return Err(TrainingError::Dataset(format!("record[{idx}] has a non-binary label")));
            }
        }
        Ok(())
    }
}

/// Expand space-separated tags into a multi-hot table.
///
/// The vocabulary is every tag seen, sorted lexically; that order is the column order.
#[must_use]
pub fn one_hot_encode(raw: &[RawAnnotation]) -> AnnotationTable {
    let vocab: BTreeSet<&str> = raw.iter().flat_map(|r| r.tags.split_whitespace()).collect();
    let tags: Vec<String> = vocab.iter().map(|t| (*t).to_string()).collect();
    let column: HashMap<&str, usize> = vocab.iter().enumerate().map(|(i, t)| (*t, i)).collect();

    let records = raw
        .iter()
        .map(|r| {
            let mut labels = vec![0u8; tags.len()];
            for tag in r.tags.split_whitespace() {
                labels[column[tag]] = 1;
            }
            AnnotationRecord { image_name: r.image_name.clone(), labels }
        })
        .collect();

    AnnotationTable { tags, records }
}

pub fn read_raw_annotations(path: &Path) -> TrainingResult<Vec<RawAnnotation>> {
    let file = std::fs::File::open(path).map_err(|e| {
        TrainingError::Dataset(format!("failed to open annotations {}: {e}", path.display()))
    })?;
    let mut reader = csv::Reader::from_reader(file);
    let mut out = Vec::new();
    for row in reader.deserialize() {
        out.push(row?);
    }
    Ok(out)
}

/// Read a one-hot table: `image_name` then one 0/1 column per tag.
pub fn read_table(path: &Path) -> TrainingResult<AnnotationTable> {
    let file = std::fs::File::open(path).map_err(|e| {
        TrainingError::Dataset(format!("failed to open table {}: {e}", path.display()))
    })?;
    read_table_from(file)
}

pub fn read_table_from<R: Read>(reader: R) -> TrainingResult<AnnotationTable> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader.headers()?.clone();
    match headers.get(0) {
        Some(first) if first == ID_COLUMN => {}
        other => {
            return Err(TrainingError::Dataset(format!(
                "first column must be `{ID_COLUMN}`, found {:?}",
                other.unwrap_or("<none>")
            )));
        }
    }
    let tags: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();

    let mut records = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row?;
        let image_name = row.get(0).unwrap_or_default().to_string();
        let labels = row
            .iter()
            .skip(1)
            .map(|v| match v.trim() {
                "0" => Ok(0u8),
                "1" => Ok(1u8),
                other => Err(TrainingError::Dataset(format!("row {idx}: label value `{other}` is not 0/1"))),
            })
            .collect::<TrainingResult<Vec<u8>>>()?;
        records.push(AnnotationRecord { image_name, labels });
    }

    AnnotationTable::new(tags, records)
}

/// Write a table with a header row and no index column.
pub fn write_table<W: Write>(writer: W, table: &AnnotationTable) -> TrainingResult<()> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(writer);

    let mut header = Vec::with_capacity(table.tags.len() + 1);
    header.push(ID_COLUMN.to_string());
    header.extend(table.tags.iter().cloned());
    writer.write_record(&header)?;

    for r in &table.records {
        let mut row = Vec::with_capacity(r.labels.len() + 1);
        row.push(r.image_name.clone());
        row.extend(r.labels.iter().map(u8::to_string));
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}

pub fn compute_dataset_id(table: &AnnotationTable) -> DatasetId {
    let mut hasher = Sha256::new();
    hasher.update(table.tags.join(",").as_bytes());
    hasher.update(b"\n");
    for r in &table.records {
        hasher.update(r.image_name.as_bytes());
        hasher.update(b",");
        hasher.update(&r.labels);
        hasher.update(b"\n");
    }
    DatasetId(hex::encode(hasher.finalize()))
}
