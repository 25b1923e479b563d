//! Distributed class (dclass) schema.
//!
//! The schema is an externally-authored JSON document loaded once at startup
//! and shared read-only by every component of a node:
//!
//! ```json
//! {
//!   "version": 1,
//!   "classes": [
//!     { "name": "DistributedObject" },
//!     { "name": "DistributedDistrict", "parents": ["DistributedObject"],
//!       "fields": [
//!         { "name": "setName", "params": ["string"], "keywords": ["required", "broadcast", "ram"] }
//!       ] }
//!   ]
//! }
//! ```
//!
//! Classes are numbered in declaration order and fields are numbered
//! globally in declaration order, so the ids are stable for a given file.
//! A class inherits every field of its parents, which must be declared
//! earlier in the file.

use crate::datagram::{Datagram, DatagramError, DatagramIterator};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while loading a schema or packing values against it.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse schema: {0}")]
    Json(#[from] serde_json::Error),

    #[error("class {0} is declared twice")]
    DuplicateClass(String),

    #[error("class {class} names unknown parent {parent}")]
    UnknownParent { class: String, parent: String },

    #[error("schema declares more than 65535 {0}")]
    TooMany(&'static str),

    #[error("invalid parameter type {0:?}")]
    InvalidParamType(String),

    #[error("unknown class {0}")]
    UnknownClass(String),

    #[error("class {class} has no field {field}")]
    UnknownField { class: String, field: String },

    #[error("field {field} takes {expected} arguments, got {got}")]
    ArgumentCount {
        field: String,
        expected: usize,
        got: usize,
    },

    #[error("field {field}: expected {expected}")]
    TypeMismatch { field: String, expected: ParamType },

    #[error("field {field}: value out of range for {expected}")]
    OutOfRange { field: String, expected: ParamType },

    #[error("field {field}: {count} trailing bytes after value")]
    TrailingBytes { field: String, count: usize },

    #[error(transparent)]
    Datagram(#[from] DatagramError),
}

/// Wire codec of a single field parameter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ParamType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    /// UTF-8 text behind a u16 length
    String,
    /// Raw bytes behind a u16 length
    Blob,
    /// Packed elements behind a u16 byte length
    Array(Box<ParamType>),
}

impl FromStr for ParamType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(element) = s.strip_suffix("[]") {
            return Ok(ParamType::Array(Box::new(element.parse()?)));
        }

        Ok(match s {
            "uint8" => ParamType::Uint8,
            "uint16" => ParamType::Uint16,
            "uint32" => ParamType::Uint32,
            "uint64" => ParamType::Uint64,
            "int8" => ParamType::Int8,
            "int16" => ParamType::Int16,
            "int32" => ParamType::Int32,
            "int64" => ParamType::Int64,
            "string" => ParamType::String,
            "blob" => ParamType::Blob,
            other => return Err(SchemaError::InvalidParamType(other.to_string())),
        })
    }
}

impl TryFrom<String> for ParamType {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Uint8 => write!(f, "uint8"),
            ParamType::Uint16 => write!(f, "uint16"),
            ParamType::Uint32 => write!(f, "uint32"),
            ParamType::Uint64 => write!(f, "uint64"),
            ParamType::Int8 => write!(f, "int8"),
            ParamType::Int16 => write!(f, "int16"),
            ParamType::Int32 => write!(f, "int32"),
            ParamType::Int64 => write!(f, "int64"),
            ParamType::String => write!(f, "string"),
            ParamType::Blob => write!(f, "blob"),
            ParamType::Array(element) => write!(f, "{}[]", element),
        }
    }
}

/// A decoded field parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    UInt(u64),
    Int(i64),
    String(String),
    Blob(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::UInt(v as u64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::UInt(v as u64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v as u64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::UInt(v as u64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl ParamType {
    fn pack(&self, field: &str, dg: &mut Datagram, value: &Value) -> Result<(), SchemaError> {
        let mismatch = || SchemaError::TypeMismatch {
            field: field.to_string(),
            expected: self.clone(),
        };
        let out_of_range = || SchemaError::OutOfRange {
            field: field.to_string(),
            expected: self.clone(),
        };

        match self {
            ParamType::Uint8 | ParamType::Uint16 | ParamType::Uint32 | ParamType::Uint64 => {
                let v = match value {
                    Value::UInt(v) => *v,
                    Value::Int(v) => u64::try_from(*v).map_err(|_| out_of_range())?,
                    _ => return Err(mismatch()),
                };
                match self {
                    ParamType::Uint8 => dg.add_u8(u8::try_from(v).map_err(|_| out_of_range())?),
                    ParamType::Uint16 => {
                        dg.add_u16(u16::try_from(v).map_err(|_| out_of_range())?)
                    }
                    ParamType::Uint32 => {
                        dg.add_u32(u32::try_from(v).map_err(|_| out_of_range())?)
                    }
                    _ => dg.add_u64(v),
                }
            }
            ParamType::Int8 | ParamType::Int16 | ParamType::Int32 | ParamType::Int64 => {
                let v = match value {
                    Value::Int(v) => *v,
                    Value::UInt(v) => i64::try_from(*v).map_err(|_| out_of_range())?,
                    _ => return Err(mismatch()),
                };
                match self {
                    ParamType::Int8 => dg.add_i8(i8::try_from(v).map_err(|_| out_of_range())?),
                    ParamType::Int16 => {
                        dg.add_i16(i16::try_from(v).map_err(|_| out_of_range())?)
                    }
                    ParamType::Int32 => {
                        dg.add_i32(i32::try_from(v).map_err(|_| out_of_range())?)
                    }
                    _ => dg.add_i64(v),
                }
            }
            ParamType::String => {
                let s = value.as_str().ok_or_else(mismatch)?;
                dg.add_string16(s)?;
            }
            ParamType::Blob => {
                let bytes = value.as_bytes().ok_or_else(mismatch)?;
                dg.add_blob16(bytes)?;
            }
            ParamType::Array(element) => {
                let items = value.as_array().ok_or_else(mismatch)?;
                let mut inner = Datagram::new();
                for item in items {
                    element.pack(field, &mut inner, item)?;
                }
                dg.add_blob16(inner.as_bytes())?;
            }
        }
        Ok(())
    }

    fn unpack(&self, dgi: &mut DatagramIterator<'_>) -> Result<Value, DatagramError> {
        Ok(match self {
            ParamType::Uint8 => Value::UInt(dgi.get_u8()? as u64),
            ParamType::Uint16 => Value::UInt(dgi.get_u16()? as u64),
            ParamType::Uint32 => Value::UInt(dgi.get_u32()? as u64),
            ParamType::Uint64 => Value::UInt(dgi.get_u64()?),
            ParamType::Int8 => Value::Int(dgi.get_i8()? as i64),
            ParamType::Int16 => Value::Int(dgi.get_i16()? as i64),
            ParamType::Int32 => Value::Int(dgi.get_i32()? as i64),
            ParamType::Int64 => Value::Int(dgi.get_i64()?),
            ParamType::String => Value::String(dgi.get_string16()?),
            ParamType::Blob => Value::Blob(dgi.get_blob16()?.to_vec()),
            ParamType::Array(element) => {
                let mut inner = DatagramIterator::new(dgi.get_blob16()?);
                let mut items = Vec::new();
                while inner.remaining() > 0 {
                    items.push(element.unpack(&mut inner)?);
                }
                Value::Array(items)
            }
        })
    }
}

/// Field keywords.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldFlags {
    pub required: bool,
    pub broadcast: bool,
    pub ram: bool,
    /// Persisted by the database server
    pub db: bool,
    pub airecv: bool,
    pub ownrecv: bool,
    /// Any client may send this field
    pub clsend: bool,
    /// Only the owning avatar may send this field
    pub ownsend: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Keyword {
    Required,
    Broadcast,
    Ram,
    Db,
    Airecv,
    Ownrecv,
    Clsend,
    Ownsend,
}

impl FieldFlags {
    fn from_keywords(keywords: &[Keyword]) -> Self {
        let mut flags = FieldFlags::default();
        for keyword in keywords {
            match keyword {
                Keyword::Required => flags.required = true,
                Keyword::Broadcast => flags.broadcast = true,
                Keyword::Ram => flags.ram = true,
                Keyword::Db => flags.db = true,
                Keyword::Airecv => flags.airecv = true,
                Keyword::Ownrecv => flags.ownrecv = true,
                Keyword::Clsend => flags.clsend = true,
                Keyword::Ownsend => flags.ownsend = true,
            }
        }
        flags
    }
}

/// A field descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub number: u16,
    pub name: String,
    /// Class that declared the field
    pub class_id: u16,
    pub params: Vec<ParamType>,
    pub flags: FieldFlags,
}

impl FieldDef {
    /// Required and persisted: must be supplied when a stored object is created.
    pub fn is_required_persisted(&self) -> bool {
        self.flags.required && self.flags.db
    }

    /// Packs `args` onto `dg`, checking arity and types.
    pub fn pack(&self, dg: &mut Datagram, args: &[Value]) -> Result<(), SchemaError> {
        if args.len() != self.params.len() {
            return Err(SchemaError::ArgumentCount {
                field: self.name.clone(),
                expected: self.params.len(),
                got: args.len(),
            });
        }
        for (param, arg) in self.params.iter().zip(args) {
            param.pack(&self.name, dg, arg)?;
        }
        Ok(())
    }

    /// Packs `args` into a standalone byte string.
    pub fn pack_value(&self, args: &[Value]) -> Result<Vec<u8>, SchemaError> {
        let mut dg = Datagram::new();
        self.pack(&mut dg, args)?;
        Ok(dg.into_bytes())
    }

    /// Reads one packed value from `dgi`.
    pub fn unpack(&self, dgi: &mut DatagramIterator<'_>) -> Result<Vec<Value>, DatagramError> {
        let start = dgi.tell();
        let mut values = Vec::with_capacity(self.params.len());
        for param in &self.params {
            match param.unpack(dgi) {
                Ok(value) => values.push(value),
                Err(e) => {
                    dgi.seek(start);
                    return Err(e);
                }
            }
        }
        Ok(values)
    }

    /// Reads one packed value and returns its raw bytes instead of decoding it.
    pub fn unpack_raw<'a>(
        &self,
        dgi: &mut DatagramIterator<'a>,
    ) -> Result<&'a [u8], DatagramError> {
        let start = dgi.tell();
        self.unpack(dgi)?;
        Ok(dgi.slice_from(start))
    }

    /// Decodes a standalone byte string produced by [`FieldDef::pack_value`].
    pub fn unpack_value(&self, bytes: &[u8]) -> Result<Vec<Value>, SchemaError> {
        let mut dgi = DatagramIterator::new(bytes);
        let values = self.unpack(&mut dgi)?;
        if dgi.remaining() > 0 {
            return Err(SchemaError::TrailingBytes {
                field: self.name.clone(),
                count: dgi.remaining(),
            });
        }
        Ok(values)
    }
}

/// A class descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    pub id: u16,
    pub name: String,
    pub parents: Vec<u16>,
    /// Inherited and own field numbers, parents first
    fields: Vec<u16>,
    fields_by_name: HashMap<String, u16>,
}

impl ClassDef {
    /// Field numbers in inheritance order.
    pub fn field_numbers(&self) -> &[u16] {
        &self.fields
    }

    pub fn field_number(&self, name: &str) -> Option<u16> {
        self.fields_by_name.get(name).copied()
    }

    pub fn has_field(&self, number: u16) -> bool {
        self.fields.contains(&number)
    }
}

#[derive(Deserialize)]
struct SchemaFile {
    #[serde(default)]
    version: u32,
    classes: Vec<ClassFile>,
}

#[derive(Deserialize)]
struct ClassFile {
    name: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    fields: Vec<FieldFile>,
}

#[derive(Deserialize)]
struct FieldFile {
    name: String,
    #[serde(default)]
    params: Vec<ParamType>,
    #[serde(default)]
    keywords: Vec<Keyword>,
}

/// The immutable type and field catalog.
#[derive(Debug, Clone)]
pub struct Schema {
    version: u32,
    classes: Vec<ClassDef>,
    fields: Vec<FieldDef>,
    class_ids: HashMap<String, u16>,
}

impl Schema {
    /// Reads and parses a schema file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, SchemaError> {
        let file: SchemaFile = serde_json::from_str(text)?;

        let mut schema = Schema {
            version: file.version,
            classes: Vec::with_capacity(file.classes.len()),
            fields: Vec::new(),
            class_ids: HashMap::new(),
        };

        for class in file.classes {
            let id = u16::try_from(schema.classes.len())
                .map_err(|_| SchemaError::TooMany("classes"))?;
            if schema.class_ids.contains_key(&class.name) {
                return Err(SchemaError::DuplicateClass(class.name));
            }

            let mut parents = Vec::with_capacity(class.parents.len());
            let mut fields: Vec<u16> = Vec::new();
            let mut fields_by_name: HashMap<String, u16> = HashMap::new();

            for parent_name in &class.parents {
                let parent_id = *schema.class_ids.get(parent_name).ok_or_else(|| {
                    SchemaError::UnknownParent {
                        class: class.name.clone(),
                        parent: parent_name.clone(),
                    }
                })?;
                parents.push(parent_id);

                for &number in &schema.classes[parent_id as usize].fields {
                    let name = &schema.fields[number as usize].name;
                    if !fields_by_name.contains_key(name) {
                        fields_by_name.insert(name.clone(), number);
                        fields.push(number);
                    }
                }
            }

            for field in class.fields {
                let number =
                    u16::try_from(schema.fields.len()).map_err(|_| SchemaError::TooMany("fields"))?;

                // A redeclared name overrides the inherited field in place.
                match fields_by_name.insert(field.name.clone(), number) {
                    Some(old) => {
                        if let Some(slot) = fields.iter_mut().find(|n| **n == old) {
                            *slot = number;
                        }
                    }
                    None => fields.push(number),
                }

                schema.fields.push(FieldDef {
                    number,
                    name: field.name,
                    class_id: id,
                    params: field.params,
                    flags: FieldFlags::from_keywords(&field.keywords),
                });
            }

            schema.class_ids.insert(class.name.clone(), id);
            schema.classes.push(ClassDef {
                id,
                name: class.name,
                parents,
                fields,
                fields_by_name,
            });
        }

        Ok(schema)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn classes(&self) -> &[ClassDef] {
        &self.classes
    }

    pub fn class(&self, id: u16) -> Option<&ClassDef> {
        self.classes.get(id as usize)
    }

    pub fn class_by_name(&self, name: &str) -> Option<&ClassDef> {
        self.class_ids.get(name).and_then(|id| self.class(*id))
    }

    pub fn field(&self, number: u16) -> Option<&FieldDef> {
        self.fields.get(number as usize)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Looks up a field of `class` (own or inherited) by name.
    pub fn class_field(&self, class: &ClassDef, name: &str) -> Option<&FieldDef> {
        class.field_number(name).and_then(|n| self.field(n))
    }

    /// Like [`Schema::class_field`], resolving the class by name.
    pub fn field_by_name(
        &self,
        class_name: &str,
        field_name: &str,
    ) -> Result<&FieldDef, SchemaError> {
        let class = self
            .class_by_name(class_name)
            .ok_or_else(|| SchemaError::UnknownClass(class_name.to_string()))?;
        self.class_field(class, field_name)
            .ok_or_else(|| SchemaError::UnknownField {
                class: class_name.to_string(),
                field: field_name.to_string(),
            })
    }

    /// All fields of `class` in inheritance order.
    pub fn fields_of<'a>(&'a self, class: &'a ClassDef) -> impl Iterator<Item = &'a FieldDef> + 'a {
        class.fields.iter().filter_map(move |n| self.field(*n))
    }

    /// Fields packed into generate and enter messages, in order.
    pub fn required_fields<'a>(
        &'a self,
        class: &'a ClassDef,
    ) -> impl Iterator<Item = &'a FieldDef> + 'a {
        self.fields_of(class).filter(|f| f.flags.required)
    }

    /// Fields stored by the database server.
    pub fn persisted_fields<'a>(
        &'a self,
        class: &'a ClassDef,
    ) -> impl Iterator<Item = &'a FieldDef> + 'a {
        self.fields_of(class).filter(|f| f.flags.db)
    }

    /// Classes that carry at least one persisted field.
    pub fn persisted_classes(&self) -> impl Iterator<Item = &ClassDef> + '_ {
        self.classes
            .iter()
            .filter(move |c| self.persisted_fields(c).next().is_some())
    }
}
