//! Document engine: one bincode document per object on the filesystem.
//!
//! Layout under the root directory:
//! - `counters.doc`: the next id to hand out
//! - `<Class>/<id>.doc`: the object's fields
//! - `objects/<id>.doc`: the object's header (its class)
//!
//! A create writes the counter, then the document, then the header. The
//! header is the commit point: an object without one does not exist.
//! Every file is replaced atomically by writing a temp file and renaming it.

use super::{check_next_id, validate_create, validate_write, DatabaseBackend, IdRange, StoredObject};
use crate::error::BackendError;
use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::{DoId, Schema};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

const OBJECTS_DIR: &str = "objects";
const COUNTERS_FILE: &str = "counters.doc";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Counters {
    next_object_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    class_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    do_id: DoId,
    fields: BTreeMap<String, Vec<u8>>,
}

pub struct DocumentBackend {
    root: PathBuf,
    schema: Arc<Schema>,
    range: IdRange,
    /// Serializes every mutation.
    write_lock: Mutex<()>,
}

impl DocumentBackend {
    pub fn new(root: PathBuf, schema: Arc<Schema>, range: IdRange) -> Self {
        Self {
            root,
            schema,
            range,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn counters_path(&self) -> PathBuf {
        self.root.join(COUNTERS_FILE)
    }

    fn header_path(&self, do_id: DoId) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(format!("{}.doc", do_id))
    }

    fn document_path(&self, class_name: &str, do_id: DoId) -> PathBuf {
        self.root.join(class_name).join(format!("{}.doc", do_id))
    }

    async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), BackendError> {
        let bytes = bincode::serialize(value)?;
        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        fs::write(&temp_path, &bytes).await?;
        fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, BackendError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_header(&self, do_id: DoId) -> Result<Header, BackendError> {
        Self::read(&self.header_path(do_id))
            .await?
            .ok_or(BackendError::NotFound(do_id))
    }

    async fn read_document(&self, class_name: &str, do_id: DoId) -> Result<Document, BackendError> {
        Ok(Self::read(&self.document_path(class_name, do_id))
            .await?
            .unwrap_or(Document {
                do_id,
                fields: BTreeMap::new(),
            }))
    }
}

#[async_trait]
impl DatabaseBackend for DocumentBackend {
    async fn setup(&self) -> Result<(), BackendError> {
        let _guard = self.write_lock.lock().await;

        fs::create_dir_all(self.root.join(OBJECTS_DIR)).await?;
        for class in self.schema.persisted_classes() {
            fs::create_dir_all(self.root.join(&class.name)).await?;
        }

        if Self::read::<Counters>(&self.counters_path()).await?.is_none() {
            let counters = Counters {
                next_object_id: self.range.min as u64,
            };
            Self::write_atomic(&self.counters_path(), &counters).await?;
        }
        Ok(())
    }

    async fn create_object(
        &self,
        class_name: &str,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<DoId, BackendError> {
        validate_create(&self.schema, class_name, &fields)?;

        let _guard = self.write_lock.lock().await;

        let next = Self::read::<Counters>(&self.counters_path())
            .await?
            .map(|c| c.next_object_id)
            .unwrap_or(self.range.min as u64);
        let do_id = check_next_id(next, self.range)?;
        Self::write_atomic(
            &self.counters_path(),
            &Counters {
                next_object_id: next + 1,
            },
        )
        .await?;

        let document = Document {
            do_id,
            fields: fields.into_iter().collect(),
        };
        fs::create_dir_all(self.root.join(class_name)).await?;
        Self::write_atomic(&self.document_path(class_name, do_id), &document).await?;

        let header = Header {
            class_name: class_name.to_string(),
        };
        Self::write_atomic(&self.header_path(do_id), &header).await?;

        debug!("Created object {} in document store", do_id);
        Ok(do_id)
    }

    async fn query_all(&self, do_id: DoId) -> Result<StoredObject, BackendError> {
        let header = self.read_header(do_id).await?;
        let document = self.read_document(&header.class_name, do_id).await?;

        Ok(StoredObject {
            do_id,
            class_name: header.class_name,
            fields: document.fields,
        })
    }

    async fn set_fields(
        &self,
        do_id: DoId,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<(), BackendError> {
        let _guard = self.write_lock.lock().await;

        let header = self.read_header(do_id).await?;
        validate_write(&self.schema, &header.class_name, &fields)?;

        let mut document = self.read_document(&header.class_name, do_id).await?;
        document.fields.extend(fields);
        Self::write_atomic(&self.document_path(&header.class_name, do_id), &document).await
    }
}
