//! Split-and-persist step run once before training.
//!
//! The persisted `df_{train,valid,test}.csv` files are the source of truth for
//! every later run: when all three exist they are reused as-is, so repeated
//! runs never reshuffle the split.

use crate::annotations::{one_hot_encode, read_raw_annotations, read_table, write_table, AnnotationTable};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::DataLayout;
use crate::splitter::{stratify_subsets, Subset, Subsets};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SplitOutcome {
    /// All three subset files were already present.
    Reused,
    Created { original: usize, deduplicated: usize, train: usize, valid: usize, test: usize },
}

/// Exclusive marker held while subsets are being written.
///
/// Created with `create_new`, so a second writer fails instead of racing.
#[derive(Debug)]
pub struct SplitLock {
    path: PathBuf,
}

impl SplitLock {
    pub fn acquire(path: PathBuf) -> TrainingResult<Self> {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "unknown".to_string());
                Err(TrainingError::SplitLocked { path: path.display().to_string(), holder })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SplitLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove split lock");
        }
    }
}

#[must_use]
pub fn subsets_exist(layout: &DataLayout) -> bool {
    Subset::ALL.iter().all(|&s| layout.subset_path(s).is_file())
}

/// Load raw annotations, one-hot encode, dedup, stratify and persist.
///
/// No-op when every subset file already exists.
pub fn split_and_save_datasets(layout: &DataLayout, train_fraction: f64, seed: u64) -> TrainingResult<SplitOutcome> {
    if subsets_exist(layout) {
        info!(data_path = %layout.root().display(), "Reusing existing dataset split");
        return Ok(SplitOutcome::Reused);
    }
    if Subset::ALL.iter().any(|&s| layout.subset_path(s).exists()) {
        warn!(data_path = %layout.root().display(), "Incomplete dataset split found; recomputing");
    }

    let _lock = SplitLock::acquire(layout.split_lock_path())?;

    let raw = read_raw_annotations(&layout.raw_annotations_path())?;
    let mut table = one_hot_encode(&raw);
    let original = table.len();
    info!("Original dataset: {original}");
    table.dedup()?;
    let deduplicated = table.len();
    info!("Final dataset: {deduplicated}");
    if table.is_empty() {
        return Err(TrainingError::Dataset("annotation file has no rows".to_string()));
    }

    let subsets = stratify_subsets(&table, train_fraction, seed)?;
    info!("Train dataset: {}", subsets.train.len());
    info!("Valid dataset: {}", subsets.valid.len());
    info!("Test dataset: {}", subsets.test.len());

    save_subsets(layout, &subsets)?;
    info!("Datasets successfully saved!");

    Ok(SplitOutcome::Created {
        original,
        deduplicated,
        train: subsets.train.len(),
        valid: subsets.valid.len(),
        test: subsets.test.len(),
    })
}

/// Write all three subsets to temp files first, then rename each into place.
pub fn save_subsets(layout: &DataLayout, subsets: &Subsets) -> TrainingResult<()> {
    let mut staged = Vec::with_capacity(Subset::ALL.len());
    for subset in Subset::ALL {
        let mut tmp = NamedTempFile::new_in(layout.root())?;
        write_table(&mut tmp, subsets.get(subset))?;
        tmp.as_file().sync_all()?;
        staged.push((subset, tmp));
    }
    for (subset, tmp) in staged {
        tmp.persist(layout.subset_path(subset)).map_err(|e| TrainingError::Io(e.error))?;
    }
    Ok(())
}

pub fn read_subset(layout: &DataLayout, subset: Subset) -> TrainingResult<AnnotationTable> {
    let path = layout.subset_path(subset);
    if !path.is_file() {
        return Err(TrainingError::Dataset(format!(
            "subset file missing: {} (run the split step first)",
            path.display()
        )));
    }
    read_table(&path)
}

/// Read all three subsets, checking they share train's tag columns and no image twice.
pub fn read_subsets(layout: &DataLayout) -> TrainingResult<Subsets> {
    let subsets = Subsets {
        train: read_subset(layout, Subset::Train)?,
        valid: read_subset(layout, Subset::Valid)?,
        test: read_subset(layout, Subset::Test)?,
    };
    for subset in [Subset::Valid, Subset::Test] {
        if subsets.get(subset).tags() != subsets.train.tags() {
            return Err(TrainingError::Dataset(format!(
                "{} has tag columns [{}], expected train's [{}]",
                layout.subset_path(subset).display(),
                subsets.get(subset).tags().join(", "),
                subsets.train.tags().join(", ")
            )));
        }
    }
    let rows: usize = Subset::ALL.iter().map(|&s| subsets.get(s).len()).sum();
    let distinct = subsets.assignment().len();
    if distinct != rows {
        return Err(TrainingError::Dataset(format!(
            "{} image(s) appear in more than one subset file under {}",
            rows - distinct,
            layout.root().display()
        )));
    }
    Ok(subsets)
}

/// Stems of the `.jpg` files directly inside `dir`.
pub fn scan_image_folder(dir: &Path) -> TrainingResult<HashSet<String>> {
    if !dir.is_dir() {
        return Err(TrainingError::Dataset(format!("image folder does not exist: {}", dir.display())));
    }

    let mut stems = HashSet::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| TrainingError::Dataset(format!("failed to scan {}: {e}", dir.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_jpg = path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("jpg"));
        if let (true, Some(stem)) = (is_jpg, path.file_stem().and_then(|s| s.to_str())) {
            stems.insert(stem.to_string());
        }
    }
    Ok(stems)
}

/// Image names in `table` with no matching file in the image folder.
pub fn missing_images(layout: &DataLayout, table: &AnnotationTable) -> TrainingResult<Vec<String>> {
    let available = scan_image_folder(&layout.image_dir())?;
    Ok(table
        .records()
        .iter()
        .filter(|r| !available.contains(&r.image_name))
        .map(|r| r.image_name.clone())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_raw(dir: &Path, rows: usize) {
        let mut out = String::from("image_name,tags\n");
        for i in 0..rows {
            let tags = match i % 4 {
                0 => "clear primary",
                1 => "haze primary water",
                2 => "clear",
                _ => "cloudy",
            };
            out.push_str(&format!("train_{i},{tags}\n"));
        }
        std::fs::write(dir.join("train_classes.csv"), out).unwrap();
    }

    #[test]
    fn test_split_and_save_creates_three_files() {
        let temp = TempDir::new().unwrap();
        write_raw(temp.path(), 120);
        let layout = DataLayout::new(temp.path().to_path_buf());

        let outcome = split_and_save_datasets(&layout, 0.8, 42).unwrap();
        let SplitOutcome::Created { original, deduplicated, train, valid, test } = outcome else {
            panic!("expected a fresh split, got {outcome:?}");
        };
        assert_eq!(original, 120);
        assert_eq!(deduplicated, 120);
        assert_eq!(train + valid + test, 120);
        assert!(subsets_exist(&layout));
        assert!(!layout.split_lock_path().exists());

        let header = std::fs::read_to_string(layout.subset_path(Subset::Train)).unwrap();
        assert!(header.starts_with("image_name,clear,cloudy,haze,primary,water\n"));
    }

    #[test]
    fn test_split_and_save_is_idempotent() {
        let temp = TempDir::new().unwrap();
        write_raw(temp.path(), 80);
        let layout = DataLayout::new(temp.path().to_path_buf());

        split_and_save_datasets(&layout, 0.8, 1).unwrap();
        let before: Vec<String> =
            Subset::ALL.iter().map(|&s| std::fs::read_to_string(layout.subset_path(s)).unwrap()).collect();

        let outcome = split_and_save_datasets(&layout, 0.8, 2).unwrap();
        assert_eq!(outcome, SplitOutcome::Reused);
        let after: Vec<String> =
            Subset::ALL.iter().map(|&s| std::fs::read_to_string(layout.subset_path(s)).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_split_drops_duplicate_rows() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("train_classes.csv"),
            "image_name,tags\na,x\nb,y\na,x\nc,x y\nd,\n",
        )
        .unwrap();
        let layout = DataLayout::new(temp.path().to_path_buf());

        let outcome = split_and_save_datasets(&layout, 0.5, 3).unwrap();
        assert!(matches!(outcome, SplitOutcome::Created { original: 5, deduplicated: 4, .. }));
        let subsets = read_subsets(&layout).unwrap();
        assert_eq!(subsets.assignment().len(), 4);
    }

    #[test]
    fn test_existing_lock_blocks_split() {
        let temp = TempDir::new().unwrap();
        write_raw(temp.path(), 10);
        let layout = DataLayout::new(temp.path().to_path_buf());
        std::fs::write(layout.split_lock_path(), "123").unwrap();

        let err = split_and_save_datasets(&layout, 0.8, 42).unwrap_err();
        assert!(matches!(&err, TrainingError::SplitLocked { holder, .. } if holder == "123"));
        let message = err.to_string();
        assert!(message.contains(".split.lock"));
        assert!(message.contains("pid 123"));
        assert!(message.contains("delete it"));
        assert!(!subsets_exist(&layout));
    }

    #[test]
    fn test_empty_lock_file_reports_unknown_holder() {
        let temp = TempDir::new().unwrap();
        write_raw(temp.path(), 10);
        let layout = DataLayout::new(temp.path().to_path_buf());
        std::fs::write(layout.split_lock_path(), "").unwrap();

        let err = split_and_save_datasets(&layout, 0.8, 42).unwrap_err();
        assert!(matches!(err, TrainingError::SplitLocked { holder, .. } if holder == "unknown"));
    }

    #[test]
    fn test_read_subsets_rejects_mismatched_columns() {
        let temp = TempDir::new().unwrap();
        write_raw(temp.path(), 20);
        let layout = DataLayout::new(temp.path().to_path_buf());
        split_and_save_datasets(&layout, 0.8, 42).unwrap();

        let narrow = AnnotationTable::new(
            vec!["x".to_string()],
            vec![crate::annotations::AnnotationRecord { image_name: "extra".into(), labels: vec![1] }],
        )
        .unwrap();
        let mut file = std::fs::File::create(layout.subset_path(Subset::Valid)).unwrap();
        write_table(&mut file, &narrow).unwrap();

        let err = read_subsets(&layout).unwrap_err();
        assert!(matches!(err, TrainingError::Dataset(_)));
        assert!(err.to_string().contains("df_valid.csv"));
    }

    #[test]
    fn test_read_subsets_rejects_shared_images() {
        let temp = TempDir::new().unwrap();
        write_raw(temp.path(), 20);
        let layout = DataLayout::new(temp.path().to_path_buf());
        split_and_save_datasets(&layout, 0.8, 42).unwrap();

        std::fs::copy(layout.subset_path(Subset::Valid), layout.subset_path(Subset::Test)).unwrap();
        let err = read_subsets(&layout).unwrap_err();
        assert!(err.to_string().contains("more than one subset"));
    }

    #[test]
    fn test_invalid_fraction_persists_nothing() {
        let temp = TempDir::new().unwrap();
        write_raw(temp.path(), 10);
        let layout = DataLayout::new(temp.path().to_path_buf());

        assert!(split_and_save_datasets(&layout, 1.5, 42).is_err());
        assert!(Subset::ALL.iter().all(|&s| !layout.subset_path(s).exists()));
        assert!(!layout.split_lock_path().exists());
    }

    #[test]
    fn test_read_subset_reports_missing_file() {
        let temp = TempDir::new().unwrap();
        let layout = DataLayout::new(temp.path().to_path_buf());
        let err = read_subset(&layout, Subset::Test).unwrap_err();
        assert!(err.to_string().contains("df_test.csv"));
    }

    #[test]
    fn test_missing_images() {
        let temp = TempDir::new().unwrap();
        let layout = DataLayout::new(temp.path().to_path_buf());
        std::fs::create_dir_all(layout.image_dir()).unwrap();
        std::fs::write(layout.image_dir().join("a.jpg"), b"").unwrap();
        std::fs::write(layout.image_dir().join("notes.txt"), b"").unwrap();

        let table = one_hot_encode(&[
            crate::annotations::RawAnnotation { image_name: "a".into(), tags: "x".into() },
            crate::annotations::RawAnnotation { image_name: "b".into(), tags: "x".into() },
        ]);
        assert_eq!(missing_images(&layout, &table).unwrap(), vec!["b".to_string()]);
    }
}
