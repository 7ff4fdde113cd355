//! Reading image/label rows from HF dataset parquet shards.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};

use super::{DatasetError, ImageRecord, RecordImage};

/// Key of the footer metadata entry the `datasets` library writes.
const HF_METADATA_KEY: &str = "huggingface";

/// Reads `(image, label)` rows from one parquet shard.
pub struct ParquetShardReader {
    path: PathBuf,
    reader: SerializedFileReader<File>,
}

impl ParquetShardReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let reader = SerializedFileReader::new(file)?;
        Ok(Self { path, reader })
    }

    /// Number of rows in the shard.
    pub fn num_rows(&self) -> usize {
        self.reader.metadata().file_metadata().num_rows().max(0) as usize
    }

    /// The JSON document stored under the `huggingface` footer key, if any.
    pub fn hf_metadata(&self) -> Option<serde_json::Value> {
        self.reader
            .metadata()
            .file_metadata()
            .key_value_metadata()?
            .iter()
            .find(|kv| kv.key == HF_METADATA_KEY)
            .and_then(|kv| kv.value.as_deref())
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Read the records at `rows` (ascending row indices), or every record.
    ///
    /// `label_column` is read under whatever name the shard uses and becomes the
    /// record's canonical `label`. Rows whose label is null are skipped.
    pub fn read_records(
        &self,
        image_column: &str,
        label_column: &str,
        rows: Option<&[usize]>,
    ) -> Result<Vec<ImageRecord>, DatasetError> {
        let wanted = rows.map_or(self.num_rows(), <[usize]>::len);
        let mut selected = rows.map(|rows| rows.iter().copied().peekable());
        let mut records = Vec::with_capacity(wanted);

        for (index, row) in self.reader.get_row_iter(None)?.enumerate() {
            if let Some(selected) = selected.as_mut() {
                match selected.peek().copied() {
                    None => break,
                    Some(next) if next != index => continue,
                    Some(_) => {
                        selected.next();
                    }
                }
            }
            let row = row?;
            let image = self.image_bytes(&row, image_column)?;
            let Some(label) = self.label_value(&row, label_column)? else {
                continue;
            };
            if label < 0 {
                return Err(DatasetError::UnknownLabel {
                    id: label,
                    num_labels: 0,
                });
            }
            records.push(ImageRecord::new(
                RecordImage::Encoded(Arc::from(image)),
                label as u32,
            ));
        }

        Ok(records)
    }

    fn column<'r>(&self, row: &'r Row, name: &str) -> Result<&'r Field, DatasetError> {
        row.get_column_iter()
            .find(|(column, _)| column.as_str() == name)
            .map(|(_, field)| field)
            .ok_or_else(|| DatasetError::MissingColumn {
                column: name.to_string(),
                file: self.path.display().to_string(),
            })
    }

    fn image_bytes(&self, row: &Row, column: &str) -> Result<Vec<u8>, DatasetError> {
        match self.column(row, column)? {
            // datasets' Image feature: struct<bytes: binary, path: string>
            Field::Group(inner) => match self.column(inner, "bytes")? {
                Field::Bytes(bytes) => Ok(bytes.data().to_vec()),
                other => Err(unsupported(column, other)),
            },
            Field::Bytes(bytes) => Ok(bytes.data().to_vec()),
            other => Err(unsupported(column, other)),
        }
    }

    fn label_value(&self, row: &Row, column: &str) -> Result<Option<i64>, DatasetError> {
        let value = match self.column(row, column)? {
            Field::Null => return Ok(None),
            Field::Byte(v) => *v as i64,
            Field::Short(v) => *v as i64,
            Field::Int(v) => *v as i64,
            Field::Long(v) => *v,
            Field::UByte(v) => *v as i64,
            Field::UShort(v) => *v as i64,
            Field::UInt(v) => *v as i64,
            Field::ULong(v) => *v as i64,
            other => return Err(unsupported(column, other)),
        };
        Ok(Some(value))
    }
}

fn unsupported(column: &str, field: &Field) -> DatasetError {
    DatasetError::UnsupportedValue {
        column: column.to_string(),
        found: format!("{field:?}").chars().take(64).collect(),
    }
}

/// Class names of a `ClassLabel` column from `datasets` footer metadata.
///
/// The document looks like
/// `{"info": {"features": {"label": {"names": [...], "_type": "ClassLabel"}}}}`.
pub fn hf_label_names(metadata: &serde_json::Value, label_column: &str) -> Option<Vec<String>> {
    metadata
        .get("info")?
        .get("features")?
        .get(label_column)?
        .get("names")?
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hf_label_names() {
        let metadata: serde_json::Value = serde_json::from_str(
            r#"{"info": {"features": {
                "image": {"_type": "Image"},
                "labels": {"names": ["cat", "dog"], "_type": "ClassLabel"}
            }}}"#,
        )
        .unwrap();

        assert_eq!(
            hf_label_names(&metadata, "labels"),
            Some(vec!["cat".to_string(), "dog".to_string()])
        );
        assert_eq!(hf_label_names(&metadata, "label"), None);
        assert_eq!(hf_label_names(&metadata, "image"), None);
    }

    #[test]
    fn test_hf_label_names_rejects_non_string_names() {
        let metadata = serde_json::json!({
            "info": {"features": {"label": {"names": ["a", 1]}}}
        });
        assert_eq!(hf_label_names(&metadata, "label"), None);
    }

    #[test]
    fn test_open_missing_shard() {
        let err = ParquetShardReader::open("/nonexistent/train-00000.parquet").err();
        assert!(matches!(err, Some(DatasetError::Io(_))));
    }
}
