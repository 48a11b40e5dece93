//! Per-dialect registry of value parsers keyed by native type name.

use crate::error::{DbError, DbResult};
use crate::models::Dialect;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Converts the textual wire form of a value into JSON.
pub type TypeParser = Arc<dyn Fn(&str) -> Value + Send + Sync>;

/// A logical data type: its native type names per dialect and an optional parser.
#[derive(Clone)]
pub struct DataTypeDescriptor {
    pub key: String,
    pub types: HashMap<Dialect, Vec<String>>,
    pub parse: Option<TypeParser>,
}

impl DataTypeDescriptor {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            types: HashMap::new(),
            parse: None,
        }
    }

    pub fn with_types<I, S>(mut self, dialect: Dialect, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types
            .entry(dialect)
            .or_default()
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_parser(mut self, parse: impl Fn(&str) -> Value + Send + Sync + 'static) -> Self {
        self.parse = Some(Arc::new(parse));
        self
    }
}

impl std::fmt::Debug for DataTypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTypeDescriptor")
            .field("key", &self.key)
            .field("types", &self.types)
            .field("has_parser", &self.parse.is_some())
            .finish()
    }
}

/// Parsers for one dialect.
pub struct TypeParserRegistry {
    dialect: Dialect,
    parsers: HashMap<String, TypeParser>,
}

impl TypeParserRegistry {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            parsers: HashMap::new(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn normalize(&self, native_type: &str) -> String {
        match self.dialect {
            Dialect::Postgres | Dialect::Sqlite => native_type.to_lowercase(),
            _ => native_type.to_uppercase(),
        }
    }

    /// Register the parser of every descriptor that has one, under each of its
    /// native type names for this dialect.
    ///
    /// A descriptor with a parser but no native types for this dialect is an
    /// error. Descriptors before it stay registered.
    pub fn refresh(&mut self, descriptors: &[DataTypeDescriptor]) -> DbResult<()> {
        for descriptor in descriptors {
            let Some(parse) = &descriptor.parse else {
                continue;
            };
            let names = descriptor.types.get(&self.dialect).ok_or_else(|| {
                DbError::unsupported_type_parser(&descriptor.key, self.dialect.name())
            })?;
            for name in names {
                self.parsers.insert(self.normalize(name), Arc::clone(parse));
            }
        }
        Ok(())
    }

    pub fn get(&self, native_type: &str) -> Option<TypeParser> {
        self.parsers.get(&self.normalize(native_type)).cloned()
    }

    /// Parse `raw` with the parser registered for `native_type`, if any.
    pub fn parse(&self, native_type: &str, raw: &str) -> Option<Value> {
        self.parsers
            .get(&self.normalize(native_type))
            .map(|parse| parse(raw))
    }

    pub fn contains(&self, native_type: &str) -> bool {
        self.parsers.contains_key(&self.normalize(native_type))
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    pub fn clear(&mut self) {
        self.parsers.clear();
    }
}

impl std::fmt::Debug for TypeParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.parsers.keys().collect();
        keys.sort();
        f.debug_struct("TypeParserRegistry")
            .field("dialect", &self.dialect)
            .field("types", &keys)
            .finish()
    }
}
