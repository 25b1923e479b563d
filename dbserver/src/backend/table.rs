//! Table engine: one redb database, one table per persisted class.
//!
//! Layout:
//! - `objects`: id -> class name
//! - `meta`: `next_object_id` -> next id to hand out
//! - `class_<Name>`: (id, field name) -> packed value
//!
//! Every operation is a single redb transaction, so a create or a
//! multi-field write either lands completely or not at all.

use super::{check_next_id, validate_create, validate_write, DatabaseBackend, IdRange, StoredObject};
use crate::error::BackendError;
use async_trait::async_trait;
use log::debug;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use shared::{DoId, Schema};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

const OBJECTS: TableDefinition<u32, &str> = TableDefinition::new("objects");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
const NEXT_OBJECT_ID: &str = "next_object_id";

fn class_table_name(class_name: &str) -> String {
    format!("class_{}", class_name)
}

pub struct TableBackend {
    db: Arc<Database>,
    schema: Arc<Schema>,
    range: IdRange,
}

impl TableBackend {
    pub fn open(path: &Path, schema: Arc<Schema>, range: IdRange) -> Result<Self, BackendError> {
        let db = Database::create(path)?;
        Ok(Self {
            db: Arc::new(db),
            schema,
            range,
        })
    }

    /// Runs `work` on the blocking pool with the database and schema.
    async fn blocking<T, F>(&self, work: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&Database, &Schema) -> Result<T, BackendError> + Send + 'static,
    {
        let db = self.db.clone();
        let schema = self.schema.clone();
        tokio::task::spawn_blocking(move || work(&db, &schema)).await?
    }

    fn read_object(
        db: &Database,
        schema: &Schema,
        do_id: DoId,
        names: Option<&[String]>,
    ) -> Result<StoredObject, BackendError> {
        let txn = db.begin_read()?;
        let objects = txn.open_table(OBJECTS)?;
        let class_name = match objects.get(do_id)? {
            Some(guard) => guard.value().to_string(),
            None => return Err(BackendError::NotFound(do_id)),
        };

        let class = schema
            .class_by_name(&class_name)
            .ok_or_else(|| {
                BackendError::storage(format!("object {} has unknown class {}", do_id, class_name))
            })?;

        let table_name = class_table_name(&class_name);
        let definition: TableDefinition<(u32, &str), &[u8]> =
            TableDefinition::new(&table_name);
        let mut fields = BTreeMap::new();
        let values = match txn.open_table(definition) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => {
                return Ok(StoredObject {
                    do_id,
                    class_name,
                    fields,
                })
            }
            Err(e) => return Err(e.into()),
        };

        for field in schema.persisted_fields(class) {
            if let Some(names) = names {
                if !names.iter().any(|n| *n == field.name) {
                    continue;
                }
            }
            if let Some(guard) = values.get((do_id, field.name.as_str()))? {
                fields.insert(field.name.clone(), guard.value().to_vec());
            }
        }

        Ok(StoredObject {
            do_id,
            class_name,
            fields,
        })
    }
}

#[async_trait]
impl DatabaseBackend for TableBackend {
    async fn setup(&self) -> Result<(), BackendError> {
        self.blocking(|db, schema| {
            let txn = db.begin_write()?;
            {
                txn.open_table(OBJECTS)?;
                txn.open_table(META)?;
                for class in schema.persisted_classes() {
                    let table_name = class_table_name(&class.name);
                    let definition: TableDefinition<(u32, &str), &[u8]> =
                        TableDefinition::new(&table_name);
                    txn.open_table(definition)?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn create_object(
        &self,
        class_name: &str,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<DoId, BackendError> {
        validate_create(&self.schema, class_name, &fields)?;

        let class_name = class_name.to_string();
        let range = self.range;
        let do_id = self
            .blocking(move |db, _schema| {
                let txn = db.begin_write()?;
                let do_id = {
                    let mut meta = txn.open_table(META)?;
                    let next = match meta.get(NEXT_OBJECT_ID)? {
                        Some(guard) => guard.value(),
                        None => range.min as u64,
                    };
                    let do_id = check_next_id(next, range)?;
                    meta.insert(NEXT_OBJECT_ID, next + 1)?;
                    do_id
                };
                {
                    let mut objects = txn.open_table(OBJECTS)?;
                    objects.insert(do_id, class_name.as_str())?;
                }
                {
                    let table_name = class_table_name(&class_name);
                    let definition: TableDefinition<(u32, &str), &[u8]> =
                        TableDefinition::new(&table_name);
                    let mut values = txn.open_table(definition)?;
                    for (name, value) in &fields {
                        values.insert((do_id, name.as_str()), value.as_slice())?;
                    }
                }
                txn.commit()?;
                Ok(do_id)
            })
            .await?;

        debug!("Created object {} in table store", do_id);
        Ok(do_id)
    }

    async fn query_all(&self, do_id: DoId) -> Result<StoredObject, BackendError> {
        self.blocking(move |db, schema| Self::read_object(db, schema, do_id, None))
            .await
    }

    async fn query_fields(
        &self,
        do_id: DoId,
        names: &[String],
    ) -> Result<StoredObject, BackendError> {
        let names = names.to_vec();
        self.blocking(move |db, schema| {
            Self::read_object(db, schema, do_id, Some(names.as_slice()))
        })
        .await
    }

    async fn set_fields(
        &self,
        do_id: DoId,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<(), BackendError> {
        self.blocking(move |db, schema| {
            let txn = db.begin_write()?;
            let class_name = {
                let objects = txn.open_table(OBJECTS)?;
                let found = objects.get(do_id)?.map(|guard| guard.value().to_string());
                found.ok_or(BackendError::NotFound(do_id))?
            };
            validate_write(schema, &class_name, &fields)?;

            {
                let table_name = class_table_name(&class_name);
                let definition: TableDefinition<(u32, &str), &[u8]> =
                    TableDefinition::new(&table_name);
                let mut values = txn.open_table(definition)?;
                for (name, value) in &fields {
                    values.insert((do_id, name.as_str()), value.as_slice())?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }
}
