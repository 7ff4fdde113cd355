use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use image::{ImageFormat, Rgb, RgbImage};
use parquet::data_type::{ByteArray, ByteArrayType, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::format::KeyValue;
use parquet::schema::parser::parse_message_type;

/// A solid-color image with a faint deterministic gradient so no two images
/// of a class are byte-identical.
pub fn color_image(rgb: [u8; 3], width: u32, height: u32, variant: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let jitter = ((x + y + variant * 3) % 7) as u8;
        Rgb([
            rgb[0].saturating_add(jitter),
            rgb[1].saturating_add(jitter),
            rgb[2].saturating_add(jitter),
        ])
    })
}

/// PNG-encoded [`color_image`].
pub fn encoded_png(rgb: [u8; 3], width: u32, height: u32, variant: u32) -> anyhow::Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    color_image(rgb, width, height, variant).write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

/// Write `root/<class>/<i>.png` for every `(class, color)`; image sizes vary so
/// the resize/crop path is exercised.
pub fn write_color_image_folder(
    root: impl AsRef<Path>,
    classes: &[(&str, [u8; 3])],
    per_class: usize,
) -> anyhow::Result<()> {
    let root = root.as_ref();
    for (class, rgb) in classes {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir)?;
        for i in 0..per_class {
            let width = 40 + (i as u32 % 3) * 8;
            let height = 36 + (i as u32 % 2) * 12;
            color_image(*rgb, width, height, i as u32).save(dir.join(format!("{i:03}.png")))?;
        }
    }
    Ok(())
}

/// Write a parquet shard shaped like a `datasets` export: an `image` struct
/// column `{bytes, path}`, an integer label column, and the `huggingface`
/// footer metadata naming the classes.
pub fn write_parquet_shard(
    path: impl AsRef<Path>,
    label_column: &str,
    label_names: &[&str],
    rows: &[(Vec<u8>, Option<i64>)],
) -> anyhow::Result<()> {
    let schema = Arc::new(parse_message_type(&format!(
        "message schema {{
            REQUIRED GROUP image {{
                OPTIONAL BYTE_ARRAY bytes;
                OPTIONAL BYTE_ARRAY path (UTF8);
            }}
            OPTIONAL INT64 {label_column};
        }}"
    ))?);

    let metadata = serde_json::json!({
        "info": {"features": {
            "image": {"_type": "Image"},
            label_column: {"names": label_names, "_type": "ClassLabel"},
        }}
    });
    let props = Arc::new(
        WriterProperties::builder()
            .set_key_value_metadata(Some(vec![KeyValue::new(
                "huggingface".to_string(),
                metadata.to_string(),
            )]))
            .build(),
    );

    let mut writer = SerializedFileWriter::new(File::create(path.as_ref())?, schema, props)?;
    let mut row_group = writer.next_row_group()?;

    // image.bytes
    if let Some(mut column) = row_group.next_column()? {
        let values: Vec<ByteArray> = rows.iter().map(|(b, _)| ByteArray::from(b.clone())).collect();
        let defs = vec![1i16; rows.len()];
        column.typed::<ByteArrayType>().write_batch(&values, Some(&defs), None)?;
        column.close()?;
    }
    // image.path, all null
    if let Some(mut column) = row_group.next_column()? {
        let defs = vec![0i16; rows.len()];
        column.typed::<ByteArrayType>().write_batch(&[], Some(&defs), None)?;
        column.close()?;
    }
    // label
    if let Some(mut column) = row_group.next_column()? {
        let values: Vec<i64> = rows.iter().filter_map(|(_, l)| *l).collect();
        let defs: Vec<i16> = rows.iter().map(|(_, l)| i16::from(l.is_some())).collect();
        column.typed::<Int64Type>().write_batch(&values, Some(&defs), None)?;
        column.close()?;
    }

    row_group.close()?;
    writer.close()?;
    Ok(())
}
