//! Tabular documents (procedures and stimuli) and their seeded shuffling.
//!
//! Rows sharing a value in the `Shuffle` column trade places with each other;
//! rows with an empty or `off` value keep their position.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::SourceError;
use crate::Row;

pub const SHUFFLE_COLUMN: &str = "Shuffle";

/// Supplies tabular documents by logical name. The same document and seed
/// must always yield the same row order.
pub trait TabularSource {
    fn fetch(&self, document: &str, seed: Option<&str>) -> Result<Vec<Row>, SourceError>;
}

/// CSV files below a root directory.
#[derive(Debug, Clone)]
pub struct CsvDirectory {
    root: PathBuf,
}

impl CsvDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TabularSource for CsvDirectory {
    fn fetch(&self, document: &str, seed: Option<&str>) -> Result<Vec<Row>, SourceError> {
        let path = self.root.join(document);
        if !path.is_file() {
            return Err(SourceError::UnknownDocument(document.to_string()));
        }
        let mut rows = read_csv(&path)?;
        if let Some(seed) = seed {
            shuffle_rows(&mut rows, seed);
        }
        Ok(rows)
    }
}

pub fn read_csv(path: &Path) -> Result<Vec<Row>, SourceError> {
    let csv_err = |source: csv::Error| SourceError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;
    let headers = reader.headers().map_err(csv_err)?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        let row: Row = headers
            .iter()
            .enumerate()
            .map(|(i, header)| (header.to_string(), record.get(i).unwrap_or("").to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// In-memory documents.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    documents: BTreeMap<String, Vec<Row>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, name: impl Into<String>, rows: Vec<Row>) -> Self {
        self.documents.insert(name.into(), rows);
        self
    }
}

impl TabularSource for MemorySource {
    fn fetch(&self, document: &str, seed: Option<&str>) -> Result<Vec<Row>, SourceError> {
        let mut rows = self
            .documents
            .get(document)
            .cloned()
            .ok_or_else(|| SourceError::UnknownDocument(document.to_string()))?;
        if let Some(seed) = seed {
            shuffle_rows(&mut rows, seed);
        }
        Ok(rows)
    }
}

fn rng_for(seed: &str) -> StdRng {
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    StdRng::from_seed(bytes)
}

/// Shuffles `items` with an RNG derived from the SHA-256 of `seed`.
pub fn seeded_shuffle<T>(items: &mut [T], seed: &str) {
    items.shuffle(&mut rng_for(seed));
}

/// Shuffles rows within their `Shuffle` groups.
pub fn shuffle_rows(rows: &mut [Row], seed: &str) {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, row) in rows.iter().enumerate() {
        let Some(label) = row.get(SHUFFLE_COLUMN).map(|l| l.trim()) else {
            continue;
        };
        if label.is_empty() || label.eq_ignore_ascii_case("off") {
            continue;
        }
        groups.entry(label).or_default().push(i);
    }
    let groups: Vec<Vec<usize>> = groups.into_values().collect();

    let mut rng = rng_for(seed);
    for positions in groups {
        let mut order = positions.clone();
        order.shuffle(&mut rng);
        let moved: Vec<Row> = order.iter().map(|&i| rows[i].clone()).collect();
        for (slot, row) in positions.into_iter().zip(moved) {
            rows[slot] = row;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "exp_source_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp dir");
        root
    }

    #[test]
    fn csv_rows_are_keyed_by_header_and_padded() {
        let root = temp_root("csv");
        fs::create_dir_all(root.join("stimuli")).expect("dir");
        fs::write(
            root.join("stimuli/words.csv"),
            "Cue,Answer\nsun,moon\nday\n,\ncat,dog\n",
        )
        .expect("write");

        let rows = CsvDirectory::new(&root)
            .fetch("stimuli/words.csv", None)
            .expect("fetch");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["Answer"], "moon");
        assert_eq!(rows[1]["Cue"], "day");
        assert_eq!(rows[1]["Answer"], "");
        assert_eq!(rows[2]["Cue"], "cat");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_document_is_reported() {
        let root = temp_root("missing");
        let err = CsvDirectory::new(&root)
            .fetch("procedures/none.csv", None)
            .expect_err("missing");
        assert!(matches!(err, SourceError::UnknownDocument(name) if name == "procedures/none.csv"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn seeded_shuffle_is_deterministic_per_seed() {
        let original: Vec<u32> = (0..50).collect();
        let mut a = original.clone();
        let mut b = original.clone();
        seeded_shuffle(&mut a, "seed-stim");
        seeded_shuffle(&mut b, "seed-stim");
        assert_eq!(a, b);

        let mut c = original.clone();
        seeded_shuffle(&mut c, "seed-proc");
        assert_ne!(a, c);

        a.sort_unstable();
        assert_eq!(a, original);
    }

    fn labelled(pairs: &[(&str, &str)]) -> Vec<Row> {
        pairs
            .iter()
            .map(|(item, group)| {
                let mut row = Row::new();
                row.insert("Item".to_string(), item.to_string());
                row.insert(SHUFFLE_COLUMN.to_string(), group.to_string());
                row
            })
            .collect()
    }

    fn items(rows: &[Row]) -> Vec<&str> {
        rows.iter().map(|r| r["Item"].as_str()).collect()
    }

    #[test]
    fn shuffle_rows_keeps_unshuffled_rows_in_place() {
        let mut pairs = vec![("intro", "off")];
        let names: Vec<String> = (0..12).map(|i| format!("w{}", i)).collect();
        for name in &names {
            pairs.push((name.as_str(), "words"));
        }
        pairs.push(("outro", ""));
        let original = labelled(&pairs);

        let mut a = original.clone();
        let mut b = original.clone();
        shuffle_rows(&mut a, "s1-proc");
        shuffle_rows(&mut b, "s1-proc");
        assert_eq!(a, b);
        assert_eq!(items(&a)[0], "intro");
        assert_eq!(items(&a)[13], "outro");
        assert_ne!(items(&a), items(&original));

        let mut middle = items(&a)[1..13].to_vec();
        middle.sort_unstable();
        let mut expected = items(&original)[1..13].to_vec();
        expected.sort_unstable();
        assert_eq!(middle, expected);
    }

    #[test]
    fn rows_without_shuffle_column_are_untouched() {
        let mut rows: Vec<Row> = (0..5)
            .map(|i| {
                let mut row = Row::new();
                row.insert("Item".to_string(), i.to_string());
                row
            })
            .collect();
        let original = rows.clone();
        shuffle_rows(&mut rows, "seed");
        assert_eq!(rows, original);
    }
}
