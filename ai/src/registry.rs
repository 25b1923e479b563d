//! Type registry: maps schema class ids to behavior constructors.

use crate::district::DistrictBehavior;
use crate::error::AiError;
use crate::object::{ObjectBehavior, PassiveBehavior};
use log::debug;
use shared::Schema;
use std::collections::HashMap;

pub type Constructor = Box<dyn Fn() -> Box<dyn ObjectBehavior> + Send + Sync>;

/// How to build objects of one class.
pub struct TypeSpec {
    /// Objects of this class count toward the district population.
    pub session_bearing: bool,
    pub ctor: Constructor,
}

impl TypeSpec {
    pub fn new<F>(ctor: F) -> Self
    where
        F: Fn() -> Box<dyn ObjectBehavior> + Send + Sync + 'static,
    {
        Self {
            session_bearing: false,
            ctor: Box::new(ctor),
        }
    }

    pub fn session_bearing(mut self) -> Self {
        self.session_bearing = true;
        self
    }
}

#[derive(Default)]
pub struct TypeRegistry {
    by_class: HashMap<u16, TypeSpec>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `spec` for the schema class named `class_name`.
    pub fn register(
        &mut self,
        schema: &Schema,
        class_name: &str,
        spec: TypeSpec,
    ) -> Result<u16, AiError> {
        let class = schema
            .class_by_name(class_name)
            .ok_or_else(|| AiError::UnknownClass(class_name.to_string()))?;
        self.by_class.insert(class.id, spec);
        Ok(class.id)
    }

    /// The registry every AI node starts with: the district, and the avatar
    /// class as a session-bearing passive object. Classes missing from the
    /// schema are skipped.
    pub fn standard(schema: &Schema, district_class: &str, avatar_class: &str) -> Self {
        let mut registry = Self::new();

        if registry
            .register(
                schema,
                district_class,
                TypeSpec::new(|| Box::new(DistrictBehavior::default())),
            )
            .is_err()
        {
            debug!("Schema has no {} class", district_class);
        }
        if registry
            .register(
                schema,
                avatar_class,
                TypeSpec::new(|| Box::new(PassiveBehavior)).session_bearing(),
            )
            .is_err()
        {
            debug!("Schema has no {} class", avatar_class);
        }

        registry
    }

    pub fn lookup(&self, class_id: u16) -> Option<&TypeSpec> {
        self.by_class.get(&class_id)
    }

    pub fn is_session_bearing(&self, class_id: u16) -> bool {
        self.lookup(class_id).is_some_and(|spec| spec.session_bearing)
    }

    /// Builds a fresh behavior for `class_id`.
    pub fn construct(&self, class_id: u16) -> Result<Box<dyn ObjectBehavior>, AiError> {
        self.lookup(class_id)
            .map(|spec| (spec.ctor)())
            .ok_or(AiError::UnknownType(class_id))
    }

    pub fn len(&self) -> usize {
        self.by_class.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_class.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"{
        "classes": [
            { "name": "DistributedObject" },
            { "name": "DistributedDistrict", "parents": ["DistributedObject"] },
            { "name": "DistributedToon", "parents": ["DistributedObject"] }
        ]
    }"#;

    #[test]
    fn test_register_and_construct() {
        let schema = Schema::from_json(SCHEMA).unwrap();
        let mut registry = TypeRegistry::new();

        let id = registry
            .register(&schema, "DistributedObject", TypeSpec::new(|| Box::new(PassiveBehavior)))
            .unwrap();
        assert_eq!(id, 0);
        assert!(registry.construct(0).is_ok());
        assert!(matches!(registry.construct(2), Err(AiError::UnknownType(2))));
    }

    #[test]
    fn test_register_unknown_class() {
        let schema = Schema::from_json(SCHEMA).unwrap();
        let mut registry = TypeRegistry::new();

        assert!(matches!(
            registry.register(&schema, "Fish", TypeSpec::new(|| Box::new(PassiveBehavior))),
            Err(AiError::UnknownClass(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_standard_registry() {
        let schema = Schema::from_json(SCHEMA).unwrap();
        let registry = TypeRegistry::standard(&schema, "DistributedDistrict", "DistributedToon");

        assert_eq!(registry.len(), 2);
        assert!(!registry.is_session_bearing(1));
        assert!(registry.is_session_bearing(2));
        assert!(!registry.is_session_bearing(0));
    }

    #[test]
    fn test_standard_registry_skips_missing_classes() {
        let schema =
            Schema::from_json(r#"{ "classes": [ { "name": "DistributedObject" } ] }"#).unwrap();
        let registry = TypeRegistry::standard(&schema, "DistributedDistrict", "DistributedToon");

        assert!(registry.is_empty());
    }
}
