//! Bidirectional mapping between class names and integer label ids.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from building or comparing label mappings.
#[derive(Debug, Error)]
pub enum LabelError {
    #[error("label set is empty")]
    Empty,
    #[error("duplicate label name: {0}")]
    Duplicate(String),
    #[error("label ids are not dense: missing id {0}")]
    SparseIds(u32),
    #[error("invalid label id key: {0}")]
    InvalidId(String),
    #[error("label mapping mismatch at id {id}: expected {expected:?}, found {found:?}")]
    Mismatch {
        id: u32,
        expected: Option<String>,
        found: Option<String>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse labels: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Class-name <-> id mapping with ids dense in `0..len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    names: Vec<String>,
    ids: HashMap<String, u32>,
}

impl LabelMap {
    /// Build a mapping where `names[i]` gets id `i`.
    pub fn from_names<I, S>(names: I) -> Result<Self, LabelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(LabelError::Empty);
        }

        let mut ids = HashMap::with_capacity(names.len());
        for (id, name) in names.iter().enumerate() {
            if ids.insert(name.clone(), id as u32).is_some() {
                return Err(LabelError::Duplicate(name.clone()));
            }
        }

        Ok(Self { names, ids })
    }

    /// Numeric names `"0"`, `"1"`, ... for datasets that ship no class names.
    pub fn numeric(num_labels: usize) -> Result<Self, LabelError> {
        Self::from_names((0..num_labels).map(|i| i.to_string()))
    }

    /// Build from an HF-style `id2label` object (`{"0": "apple_pie", ...}`).
    pub fn from_id2label(id2label: &HashMap<String, String>) -> Result<Self, LabelError> {
        let mut ordered = BTreeMap::new();
        for (key, name) in id2label {
            let id: u32 = key
                .parse()
                .map_err(|_| LabelError::InvalidId(key.clone()))?;
            ordered.insert(id, name.clone());
        }

        for (expected, id) in ordered.keys().enumerate() {
            if *id != expected as u32 {
                return Err(LabelError::SparseIds(expected as u32));
            }
        }

        Self::from_names(ordered.into_values())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Class name for an id.
    pub fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    /// Id for a class name.
    pub fn id(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ids.contains_key(name)
    }

    /// Class names ordered by id.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// `id2label` as written into HF `config.json` files.
    pub fn id2label(&self) -> BTreeMap<String, String> {
        self.names
            .iter()
            .enumerate()
            .map(|(id, name)| (id.to_string(), name.clone()))
            .collect()
    }

    /// `label2id` as written into HF `config.json` files.
    pub fn label2id(&self) -> BTreeMap<String, String> {
        self.names
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id.to_string()))
            .collect()
    }

    /// Fails with the first differing id when `other` is not identical.
    pub fn ensure_matches(&self, other: &LabelMap) -> Result<(), LabelError> {
        let n = self.len().max(other.len());
        for id in 0..n as u32 {
            let expected = self.name(id);
            let found = other.name(id);
            if expected != found {
                return Err(LabelError::Mismatch {
                    id,
                    expected: expected.map(str::to_string),
                    found: found.map(str::to_string),
                });
            }
        }
        Ok(())
    }

    /// Write as `labels.json`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LabelError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Read a `labels.json` written by [`LabelMap::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LabelError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Serialize, Deserialize)]
struct LabelFile {
    id2label: HashMap<String, String>,
    #[serde(default)]
    label2id: HashMap<String, String>,
}

impl Serialize for LabelMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Ordered {
            id2label: BTreeMap<String, String>,
            label2id: BTreeMap<String, String>,
        }
        Ordered {
            id2label: self.id2label(),
            label2id: self.label2id(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LabelMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let file = LabelFile::deserialize(deserializer)?;
        LabelMap::from_id2label(&file.id2label).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_names_assigns_dense_ids() {
        let labels = LabelMap::from_names(["cat", "dog"]).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.id("cat"), Some(0));
        assert_eq!(labels.id("dog"), Some(1));
        assert_eq!(labels.name(1), Some("dog"));
        assert_eq!(labels.name(2), None);
        assert!(labels.contains("cat"));
        assert!(!labels.contains("bird"));
    }

    #[test]
    fn test_rejects_empty_and_duplicates() {
        assert!(matches!(
            LabelMap::from_names(Vec::<String>::new()),
            Err(LabelError::Empty)
        ));
        assert!(matches!(
            LabelMap::from_names(["a", "b", "a"]),
            Err(LabelError::Duplicate(name)) if name == "a"
        ));
    }

    #[test]
    fn test_from_id2label_orders_by_numeric_id() {
        let mut raw = HashMap::new();
        for (id, name) in [(10, "k"), (2, "c"), (0, "a"), (1, "b")] {
            raw.insert(id.to_string(), name.to_string());
        }
        // id 3..9 are missing
        assert!(matches!(
            LabelMap::from_id2label(&raw),
            Err(LabelError::SparseIds(3))
        ));

        raw.remove("10");
        let labels = LabelMap::from_id2label(&raw).unwrap();
        assert_eq!(labels.names(), &["a", "b", "c"]);
    }

    #[test]
    fn test_ensure_matches() {
        let a = LabelMap::from_names(["apple_pie", "baklava"]).unwrap();
        let same = LabelMap::from_names(["apple_pie", "baklava"]).unwrap();
        let swapped = LabelMap::from_names(["baklava", "apple_pie"]).unwrap();
        let longer = LabelMap::from_names(["apple_pie", "baklava", "bibimbap"]).unwrap();

        assert!(a.ensure_matches(&same).is_ok());
        assert!(matches!(
            a.ensure_matches(&swapped),
            Err(LabelError::Mismatch { id: 0, .. })
        ));
        match a.ensure_matches(&longer) {
            Err(LabelError::Mismatch {
                id,
                expected,
                found,
            }) => {
                assert_eq!(id, 2);
                assert_eq!(expected, None);
                assert_eq!(found.as_deref(), Some("bibimbap"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_json_shape_matches_hf_config() {
        let labels = LabelMap::from_names(["cat", "dog"]).unwrap();
        let value = serde_json::to_value(&labels).unwrap();
        assert_eq!(value["id2label"]["0"], "cat");
        assert_eq!(value["label2id"]["dog"], "1");

        let back: LabelMap = serde_json::from_value(value).unwrap();
        assert_eq!(back, labels);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.json");
        let labels = LabelMap::numeric(3).unwrap();
        labels.save(&path).unwrap();
        assert_eq!(LabelMap::load(&path).unwrap(), labels);
    }
}
