//! Loading and saving candidate tables.
//!
//! Two on-disk forms are supported:
//! - columnar JSON: `{"fPt": [..], "fMassH3L": [..]}`
//! - Parquet (feature `arrow-io`): numeric and boolean columns, cast to `Float64`

use std::collections::BTreeMap;
use std::path::Path;

use hs_core::{Error, Result};

use crate::dataset::TabularDataset;

/// Read a columnar JSON table.
pub fn read_dataset_json(path: &Path) -> Result<TabularDataset> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Validation(format!("failed to open {}: {e}", path.display())))?;
    dataset_from_json_slice(&bytes)
}

/// Parse a columnar JSON table from bytes.
pub fn dataset_from_json_slice(bytes: &[u8]) -> Result<TabularDataset> {
    let cols: BTreeMap<String, Vec<f64>> = serde_json::from_slice(bytes)?;
    TabularDataset::from_columns(cols.into_iter().collect())
}

/// Write a columnar JSON table.
pub fn write_dataset_json(ds: &TabularDataset, path: &Path) -> Result<()> {
    let cols: BTreeMap<&str, &[f64]> = ds.iter_columns().collect();
    let file = std::fs::File::create(path)
        .map_err(|e| Error::Validation(format!("failed to create {}: {e}", path.display())))?;
    serde_json::to_writer(std::io::BufWriter::new(file), &cols)?;
    Ok(())
}

/// Read a table by file extension (`.json`, or `.parquet` with `arrow-io`).
///
/// `columns` restricts the loaded columns; `None` loads everything.
pub fn read_dataset(path: &Path, columns: Option<&[&str]>) -> Result<TabularDataset> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let ds = match ext {
        "json" => read_dataset_json(path)?,
        #[cfg(feature = "arrow-io")]
        "parquet" | "pq" => return parquet_io::read_dataset_parquet(path, columns),
        other => {
            return Err(Error::Validation(format!(
                "unsupported input format '.{other}' for {}",
                path.display()
            )));
        }
    };
    match columns {
        None => Ok(ds),
        Some(names) => {
            let mut cols = Vec::with_capacity(names.len());
            for name in names {
                cols.push((name.to_string(), ds.column(name)?.to_vec()));
            }
            TabularDataset::from_columns(cols)
        }
    }
}

#[cfg(feature = "arrow-io")]
pub mod parquet_io {
    //! Parquet / Arrow bridge.

    use std::path::Path;
    use std::sync::Arc;

    use arrow::array::{Array, AsArray, Float64Array};
    use arrow::datatypes::{DataType, Field, Float64Type, Schema};
    use arrow::record_batch::RecordBatch;
    use hs_core::{Error, Result};

    use crate::dataset::TabularDataset;

    fn is_loadable(dt: &DataType) -> bool {
        dt.is_numeric() || matches!(dt, DataType::Boolean)
    }

    /// Read a Parquet file into a dataset.
    ///
    /// Integer, float and boolean columns are cast to `f64`; other types are
    /// skipped unless named in `columns`, which is an error.
    pub fn read_dataset_parquet(path: &Path, columns: Option<&[&str]>) -> Result<TabularDataset> {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Validation(format!("failed to open {}: {e}", path.display())))?;
        let builder =
            ::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder::try_new(file)
                .map_err(|e| Error::Format(format!("failed to read Parquet: {e}")))?;
        let schema = builder.schema().clone();

        let wanted: Vec<String> = match columns {
            Some(names) => {
                for name in names {
                    let field = schema.field_with_name(name).map_err(|_| {
                        Error::UndefinedColumn {
                            column: name.to_string(),
                            expression: format!("load {}", path.display()),
                        }
                    })?;
                    if !is_loadable(field.data_type()) {
                        return Err(Error::Format(format!(
                            "column '{name}' has non-numeric type {}",
                            field.data_type()
                        )));
                    }
                }
                names.iter().map(|s| s.to_string()).collect()
            }
            None => schema
                .fields()
                .iter()
                .filter(|f| is_loadable(f.data_type()))
                .map(|f| f.name().clone())
                .collect(),
        };

        let reader = builder
            .build()
            .map_err(|e| Error::Format(format!("failed to build Parquet reader: {e}")))?;

        let mut out: Vec<Vec<f64>> = vec![Vec::new(); wanted.len()];
        for batch in reader {
            let batch =
                batch.map_err(|e| Error::Format(format!("failed to read Parquet batch: {e}")))?;
            for (slot, name) in wanted.iter().enumerate() {
                let col = batch.column_by_name(name).ok_or_else(|| {
                    Error::Format(format!("column '{name}' missing in record batch"))
                })?;
                let cast = arrow::compute::cast(col, &DataType::Float64)
                    .map_err(|e| Error::Format(format!("cannot cast '{name}' to f64: {e}")))?;
                let values = cast.as_primitive::<Float64Type>();
                out[slot].extend((0..values.len()).map(|i| {
                    if values.is_null(i) { f64::NAN } else { values.value(i) }
                }));
            }
        }

        TabularDataset::from_columns(wanted.into_iter().zip(out).collect())
    }

    /// Build an Arrow [`RecordBatch`] with one `Float64` column per dataset column.
    pub fn dataset_to_record_batch(ds: &TabularDataset) -> Result<RecordBatch> {
        let fields: Vec<Field> =
            ds.column_names().iter().map(|n| Field::new(n, DataType::Float64, false)).collect();
        let schema = Arc::new(Schema::new(fields));
        let arrays: Vec<Arc<dyn Array>> = ds
            .iter_columns()
            .map(|(_, col)| Arc::new(Float64Array::from(col.to_vec())) as Arc<dyn Array>)
            .collect();
        RecordBatch::try_new(schema, arrays)
            .map_err(|e| Error::Format(format!("failed to build RecordBatch: {e}")))
    }

    /// Write a dataset to a Parquet file (Snappy compressed).
    pub fn write_dataset_parquet(ds: &TabularDataset, path: &Path) -> Result<()> {
        let batch = dataset_to_record_batch(ds)?;
        let file = std::fs::File::create(path)
            .map_err(|e| Error::Validation(format!("failed to create {}: {e}", path.display())))?;
        let props = ::parquet::file::properties::WriterProperties::builder()
            .set_compression(::parquet::basic::Compression::SNAPPY)
            .build();
        let mut writer = ::parquet::arrow::ArrowWriter::try_new(file, batch.schema(), Some(props))
            .map_err(|e| Error::Format(format!("failed to create Parquet writer: {e}")))?;
        writer.write(&batch).map_err(|e| Error::Format(format!("failed to write Parquet: {e}")))?;
        writer
            .close()
            .map_err(|e| Error::Format(format!("failed to close Parquet writer: {e}")))?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use arrow::array::{BooleanArray, Int32Array};

        fn tmp_path(name: &str) -> std::path::PathBuf {
            let dir = std::env::temp_dir().join(format!("hs-data-pq-{}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            dir.join(name)
        }

        #[test]
        fn parquet_roundtrip() {
            let ds = TabularDataset::from_columns(vec![
                ("fPt".into(), vec![1.0, 2.0, 3.0]),
                ("fMassH3L".into(), vec![2.99, 2.98, 3.01]),
            ])
            .unwrap();
            let path = tmp_path("roundtrip.parquet");
            write_dataset_parquet(&ds, &path).unwrap();
            let back = read_dataset_parquet(&path, None).unwrap();
            assert_eq!(back.count(), 3);
            assert_eq!(back.column("fMassH3L").unwrap(), ds.column("fMassH3L").unwrap());
        }

        #[test]
        fn parquet_casts_bool_and_int() {
            let schema = Arc::new(Schema::new(vec![
                Field::new("fIsMatter", DataType::Boolean, false),
                Field::new("fNTPCclusHe", DataType::Int32, false),
            ]));
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(BooleanArray::from(vec![true, false])),
                    Arc::new(Int32Array::from(vec![120, 90])),
                ],
            )
            .unwrap();
            let path = tmp_path("cast.parquet");
            let file = std::fs::File::create(&path).unwrap();
            let mut w = ::parquet::arrow::ArrowWriter::try_new(file, schema, None).unwrap();
            w.write(&batch).unwrap();
            w.close().unwrap();

            let ds = read_dataset_parquet(&path, Some(&["fIsMatter", "fNTPCclusHe"])).unwrap();
            assert_eq!(ds.column("fIsMatter").unwrap(), &[1.0, 0.0]);
            assert_eq!(ds.column("fNTPCclusHe").unwrap(), &[120.0, 90.0]);
            assert!(read_dataset_parquet(&path, Some(&["fNope"])).is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_and_column_subset() {
        let dir = std::env::temp_dir().join(format!("hs-data-json-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("t.json");
        let ds = TabularDataset::from_columns(vec![
            ("b".into(), vec![1.0, 2.0]),
            ("a".into(), vec![3.0, 4.0]),
        ])
        .unwrap();
        write_dataset_json(&ds, &path).unwrap();
        let back = read_dataset(&path, Some(&["a"])).unwrap();
        assert_eq!(back.column_names(), &["a".to_string()]);
        assert_eq!(back.column("a").unwrap(), &[3.0, 4.0]);
    }

    #[test]
    fn json_ragged_columns_rejected() {
        let err = dataset_from_json_slice(br#"{"a": [1, 2], "b": [1]}"#).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn unknown_extension_rejected() {
        assert!(read_dataset(Path::new("x.root"), None).is_err());
    }
}
