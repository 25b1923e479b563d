//! Storage engines behind a common contract.
//!
//! Every engine stores objects as `(id, class name, packed field values)`.
//! Values are the raw bytes produced by the field codec; engines never
//! decode them. Both engines validate writes against the schema before
//! touching storage, so a rejected request leaves no trace.

pub mod document;
pub mod table;

use crate::error::BackendError;
use async_trait::async_trait;
use shared::{DoId, Schema};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

pub use document::DocumentBackend;
pub use table::TableBackend;

/// A stored object, or the requested subset of its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub do_id: DoId,
    pub class_name: String,
    pub fields: BTreeMap<String, Vec<u8>>,
}

impl StoredObject {
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// Keeps only the named fields.
    pub fn retain_fields(&mut self, names: &[String]) {
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        self.fields.retain(|name, _| wanted.contains(name.as_str()));
    }
}

/// Ids issued by the database, `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub min: DoId,
    pub max: DoId,
}

impl Default for IdRange {
    fn default() -> Self {
        Self {
            min: shared::DB_ID_MIN,
            max: shared::DB_ID_MAX,
        }
    }
}

/// Selectable storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Typed tables in a single redb database file
    Table,
    /// One binary document per object on the filesystem
    Document,
}

#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Creates tables, directories and the id counter if they do not exist.
    async fn setup(&self) -> Result<(), BackendError>;

    /// Stores a new object and returns its id.
    ///
    /// Every required persisted field of the class must be supplied and
    /// every supplied field must be a persisted field of the class.
    async fn create_object(
        &self,
        class_name: &str,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<DoId, BackendError>;

    async fn query_all(&self, do_id: DoId) -> Result<StoredObject, BackendError>;

    /// Like [`DatabaseBackend::query_all`], keeping only `names`. Fields
    /// that were never set are absent from the result.
    async fn query_fields(
        &self,
        do_id: DoId,
        names: &[String],
    ) -> Result<StoredObject, BackendError> {
        let mut object = self.query_all(do_id).await?;
        object.retain_fields(names);
        Ok(object)
    }

    async fn set_field(&self, do_id: DoId, name: &str, value: Vec<u8>) -> Result<(), BackendError> {
        self.set_fields(do_id, vec![(name.to_string(), value)]).await
    }

    /// Overwrites several fields at once. All or nothing.
    async fn set_fields(
        &self,
        do_id: DoId,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<(), BackendError>;
}

/// Opens the engine of `kind` under `data_dir`.
pub fn open(
    kind: BackendKind,
    data_dir: &Path,
    schema: Arc<Schema>,
    range: IdRange,
) -> Result<Arc<dyn DatabaseBackend>, BackendError> {
    std::fs::create_dir_all(data_dir)?;
    Ok(match kind {
        BackendKind::Table => Arc::new(TableBackend::open(
            &data_dir.join("otp.redb"),
            schema,
            range,
        )?),
        BackendKind::Document => Arc::new(DocumentBackend::new(
            data_dir.join("documents"),
            schema,
            range,
        )),
    })
}

/// Checks a create request against the schema.
pub fn validate_create(
    schema: &Schema,
    class_name: &str,
    fields: &[(String, Vec<u8>)],
) -> Result<(), BackendError> {
    let class = schema
        .class_by_name(class_name)
        .ok_or_else(|| BackendError::CreateFailed(format!("unknown class {}", class_name)))?;

    for field in schema.fields_of(class).filter(|f| f.is_required_persisted()) {
        if !fields.iter().any(|(name, _)| *name == field.name) {
            return Err(BackendError::CreateFailed(format!(
                "missing required db field {}",
                field.name
            )));
        }
    }

    for (name, _) in fields {
        match schema.class_field(class, name) {
            Some(field) if field.flags.db => {}
            _ => {
                return Err(BackendError::CreateFailed(format!(
                    "{} is not a db field of {}",
                    name, class_name
                )))
            }
        }
    }

    Ok(())
}

/// Checks an update of an object of `class_name` against the schema.
pub fn validate_write(
    schema: &Schema,
    class_name: &str,
    fields: &[(String, Vec<u8>)],
) -> Result<(), BackendError> {
    let class = schema
        .class_by_name(class_name)
        .ok_or_else(|| BackendError::WriteFailed(format!("unknown class {}", class_name)))?;

    for (name, _) in fields {
        match schema.class_field(class, name) {
            Some(field) if field.flags.db => {}
            _ => {
                return Err(BackendError::WriteFailed(format!(
                    "{} is not a db field of {}",
                    name, class_name
                )))
            }
        }
    }

    Ok(())
}

/// Id-range checks shared by both engines.
pub(crate) fn check_next_id(next: u64, range: IdRange) -> Result<DoId, BackendError> {
    if next < range.min as u64 || next >= range.max as u64 {
        return Err(BackendError::CreateFailed(format!(
            "id range [{}, {}) exhausted",
            range.min, range.max
        )));
    }
    Ok(next as DoId)
}
