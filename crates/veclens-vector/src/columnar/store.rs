//! Table storage behind the columnar adapter.
//!
//! A table is read and written whole. Tables created by the adapter start
//! with a sentinel row carrying a zero vector, so that the vector column has
//! a concrete width before any item is added. The sentinel is never
//! returned to callers.
//!
//! The vector column is not nullable. A row stored without an embedding
//! holds zeros and a cleared `has_vector` flag; it reads back without an
//! embedding and never takes part in a search.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use arrow_array::types::Float32Type;
use arrow_array::{
    Array, ArrayRef, BooleanArray, FixedSizeListArray, Float32Array, ListArray, RecordBatch,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use regex::Regex;
use veclens_core::{DistanceMetric, Item, Metadata};

use crate::error::{TransportError, TransportResult};

/// Id of the placeholder row of a freshly created table.
pub const SENTINEL_ID: &str = "__sentinel__";

/// Schema metadata key holding the distance metric.
pub const METRIC_KEY: &str = "veclens.metric";

/// File extension of table files.
const EXTENSION: &str = "parquet";

static TABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("table name pattern"));

/// One stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnarRow {
    pub id: String,
    pub document: Option<String>,
    pub metadata: Metadata,
    pub vector: Vec<f32>,
    /// False when `vector` is zero filler for an item without an embedding.
    pub has_vector: bool,
}

impl ColumnarRow {
    /// The placeholder row of a table of width `dimension`.
    pub fn sentinel(dimension: usize) -> Self {
        Self {
            id: SENTINEL_ID.to_string(),
            document: None,
            metadata: Metadata::new(),
            vector: vec![0.0; dimension],
            has_vector: false,
        }
    }

    /// Returns true for the placeholder row.
    pub fn is_sentinel(&self) -> bool {
        self.id == SENTINEL_ID
    }

    /// Builds a row from an item, substituting a zero vector of width
    /// `dimension` when the item has no embedding.
    pub fn from_item(item: Item, dimension: usize) -> Self {
        let has_vector = item.embedding.is_some();
        Self {
            id: item.id,
            document: item.document,
            metadata: item.metadata,
            vector: item.embedding.unwrap_or_else(|| vec![0.0; dimension]),
            has_vector,
        }
    }

    /// Converts back into an item. Filler vectors are dropped.
    pub fn to_item(&self) -> Item {
        Item {
            id: self.id.clone(),
            document: self.document.clone(),
            metadata: self.metadata.clone(),
            embedding: self.has_vector.then(|| self.vector.clone()),
        }
    }
}

/// A whole table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnarTable {
    /// Declared vector width. Tables written elsewhere with a variable-width
    /// vector column have none.
    pub dimension: Option<usize>,
    /// Distance metric recorded in the schema metadata.
    pub metric: DistanceMetric,
    /// Rows in insertion order, the sentinel included.
    pub rows: Vec<ColumnarRow>,
}

impl ColumnarTable {
    /// Creates a table holding only the sentinel row.
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension: Some(dimension),
            metric,
            rows: vec![ColumnarRow::sentinel(dimension)],
        }
    }

    /// Rows visible to callers.
    pub fn visible(&self) -> impl Iterator<Item = &ColumnarRow> {
        self.rows.iter().filter(|row| !row.is_sentinel())
    }

    /// Number of visible rows.
    pub fn len(&self) -> usize {
        self.visible().count()
    }

    /// Returns true when no visible row exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces rows with the same id and appends the others.
    pub fn upsert(&mut self, rows: Vec<ColumnarRow>) {
        let mut positions: HashMap<String, usize> = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| (row.id.clone(), i))
            .collect();
        for row in rows {
            match positions.get(&row.id) {
                Some(&i) => self.rows[i] = row,
                None => {
                    positions.insert(row.id.clone(), self.rows.len());
                    self.rows.push(row);
                }
            }
        }
    }

    /// Removes the rows with the given ids, returning how many went away.
    pub fn remove(&mut self, ids: &[String]) -> usize {
        let before = self.rows.len();
        self.rows
            .retain(|row| row.is_sentinel() || !ids.contains(&row.id));
        before - self.rows.len()
    }
}

/// Whole-table storage.
pub trait ColumnarStore: Send {
    /// Lists table names.
    fn list_tables(&self) -> TransportResult<Vec<String>>;

    /// Returns true if the table exists.
    fn contains(&self, name: &str) -> TransportResult<bool>;

    /// Reads a table, `NotFound` if absent.
    fn read(&self, name: &str) -> TransportResult<ColumnarTable>;

    /// Replaces a table, creating it if needed.
    fn write(&mut self, name: &str, table: &ColumnarTable) -> TransportResult<()>;

    /// Removes a table, `NotFound` if absent.
    fn drop_table(&mut self, name: &str) -> TransportResult<()>;
}

/// Tables held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: BTreeMap<String, ColumnarTable>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ColumnarStore for MemoryStore {
    fn list_tables(&self) -> TransportResult<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    fn contains(&self, name: &str) -> TransportResult<bool> {
        Ok(self.tables.contains_key(name))
    }

    fn read(&self, name: &str) -> TransportResult<ColumnarTable> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::not_found(format!("table '{}'", name)))
    }

    fn write(&mut self, name: &str, table: &ColumnarTable) -> TransportResult<()> {
        self.tables.insert(name.to_string(), table.clone());
        Ok(())
    }

    fn drop_table(&mut self, name: &str) -> TransportResult<()> {
        self.tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TransportError::not_found(format!("table '{}'", name)))
    }
}

/// One parquet file per table under a directory.
#[derive(Debug, Clone)]
pub struct ParquetStore {
    root: PathBuf,
}

impl ParquetStore {
    /// Opens a directory, creating it if needed.
    pub fn open(root: impl AsRef<Path>) -> TransportResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Returns the directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> TransportResult<PathBuf> {
        if !TABLE_NAME.is_match(name) {
            return Err(TransportError::malformed(format!(
                "'{}' is not a valid table name",
                name
            )));
        }
        Ok(self.root.join(format!("{}.{}", name, EXTENSION)))
    }
}

impl ColumnarStore for ParquetStore {
    fn list_tables(&self) -> TransportResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn contains(&self, name: &str) -> TransportResult<bool> {
        Ok(self.path(name)?.is_file())
    }

    fn read(&self, name: &str) -> TransportResult<ColumnarTable> {
        let path = self.path(name)?;
        if !path.is_file() {
            return Err(TransportError::not_found(format!("table '{}'", name)));
        }

        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(&path)?)?;
        let schema = builder.schema().clone();
        let mut table = ColumnarTable {
            dimension: schema
                .field_with_name("vector")
                .ok()
                .and_then(|field| fixed_width(field.data_type())),
            metric: schema
                .metadata()
                .get(METRIC_KEY)
                .map(|m| DistanceMetric::parse_lossy(m))
                .unwrap_or(DistanceMetric::Unknown),
            rows: Vec::new(),
        };

        for batch in builder.build()? {
            table.rows.extend(rows_from_batch(&batch?)?);
        }
        Ok(table)
    }

    fn write(&mut self, name: &str, table: &ColumnarTable) -> TransportResult<()> {
        let path = self.path(name)?;
        let batch = batch_from_table(table)?;

        let temp = path.with_extension("tmp");
        let mut writer = ArrowWriter::try_new(File::create(&temp)?, batch.schema(), None)?;
        writer.write(&batch)?;
        writer.close()?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn drop_table(&mut self, name: &str) -> TransportResult<()> {
        let path = self.path(name)?;
        if !path.is_file() {
            return Err(TransportError::not_found(format!("table '{}'", name)));
        }
        fs::remove_file(path)?;
        Ok(())
    }
}

fn fixed_width(data_type: &DataType) -> Option<usize> {
    match data_type {
        DataType::FixedSizeList(_, size) => usize::try_from(*size).ok(),
        _ => None,
    }
}

fn batch_from_table(table: &ColumnarTable) -> TransportResult<RecordBatch> {
    let ids = StringArray::from_iter_values(table.rows.iter().map(|row| row.id.as_str()));
    let documents: StringArray = table.rows.iter().map(|row| row.document.as_deref()).collect();
    let metadata = table
        .rows
        .iter()
        .map(|row| serde_json::to_string(&row.metadata))
        .collect::<Result<Vec<_>, _>>()?;
    let metadata = StringArray::from(metadata);
    let has_vector = BooleanArray::from_iter(table.rows.iter().map(|row| Some(row.has_vector)));

    let vectors = table
        .rows
        .iter()
        .map(|row| Some(row.vector.iter().copied().map(Some).collect::<Vec<_>>()));
    let vectors: ArrayRef = match table.dimension {
        Some(dimension) => {
            if let Some(row) = table.rows.iter().find(|row| row.vector.len() != dimension) {
                return Err(TransportError::malformed(format!(
                    "row '{}' has {} values in a column of width {}",
                    row.id,
                    row.vector.len(),
                    dimension
                )));
            }
            let width = i32::try_from(dimension)
                .map_err(|_| TransportError::malformed("vector width overflows the schema"))?;
            Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
                vectors, width,
            ))
        }
        None => Arc::new(ListArray::from_iter_primitive::<Float32Type, _, _>(vectors)),
    };

    let schema = Schema::new_with_metadata(
        vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("document", DataType::Utf8, true),
            Field::new("metadata", DataType::Utf8, false),
            Field::new("vector", vectors.data_type().clone(), false),
            Field::new("has_vector", DataType::Boolean, false),
        ],
        HashMap::from([(METRIC_KEY.to_string(), table.metric.to_string())]),
    );

    let columns: Vec<ArrayRef> = vec![
        Arc::new(ids),
        Arc::new(documents),
        Arc::new(metadata),
        vectors,
        Arc::new(has_vector),
    ];
    Ok(RecordBatch::try_new(Arc::new(schema), columns)?)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> TransportResult<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|column| column.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| TransportError::malformed(format!("missing string column '{}'", name)))
}

fn vector_at(column: &ArrayRef, row: usize) -> TransportResult<Vec<f32>> {
    let values = if let Some(list) = column.as_any().downcast_ref::<FixedSizeListArray>() {
        list.value(row)
    } else if let Some(list) = column.as_any().downcast_ref::<ListArray>() {
        list.value(row)
    } else {
        return Err(TransportError::malformed("vector column is not a float list"));
    };
    values
        .as_any()
        .downcast_ref::<Float32Array>()
        .map(|floats| floats.values().to_vec())
        .ok_or_else(|| TransportError::malformed("vector values are not float32"))
}

fn rows_from_batch(batch: &RecordBatch) -> TransportResult<Vec<ColumnarRow>> {
    let ids = string_column(batch, "id")?;
    let documents = string_column(batch, "document")?;
    let metadata = string_column(batch, "metadata")?;
    let vectors = batch
        .column_by_name("vector")
        .ok_or_else(|| TransportError::malformed("missing column 'vector'"))?;
    // Files written without the flag column hold a real vector in every row.
    let flags = batch
        .column_by_name("has_vector")
        .and_then(|column| column.as_any().downcast_ref::<BooleanArray>());

    (0..batch.num_rows())
        .map(|i| {
            let id = ids.value(i).to_string();
            let has_vector = match flags {
                Some(flags) => !flags.is_null(i) && flags.value(i),
                None => id != SENTINEL_ID,
            };
            Ok(ColumnarRow {
                id,
                document: (!documents.is_null(i)).then(|| documents.value(i).to_string()),
                metadata: serde_json::from_str(metadata.value(i))?,
                vector: vector_at(vectors, i)?,
                has_vector,
            })
        })
        .collect()
}
