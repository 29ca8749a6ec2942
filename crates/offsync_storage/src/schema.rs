//! Collection and index declarations.

use serde::{Deserialize, Serialize};

/// A secondary index over one top-level field of a collection's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    /// Index name used in queries.
    pub name: String,
    /// Top-level field the index is built from.
    pub field: String,
}

/// Declaration of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    /// Collection name.
    pub name: String,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

impl CollectionSchema {
    /// Declares a collection with no secondary indexes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    /// Adds an index named `name` over `field`.
    #[must_use]
    pub fn index(mut self, name: impl Into<String>, field: impl Into<String>) -> Self {
        self.indexes.push(IndexSchema {
            name: name.into(),
            field: field.into(),
        });
        self
    }

    /// Declares the conventional indexes for cached server records:
    /// `updatedAt` and `syncStatus`.
    pub fn records(name: impl Into<String>) -> Self {
        Self::new(name)
            .index("updatedAt", "updatedAt")
            .index("syncStatus", "syncStatus")
    }

    /// Looks up an index by name.
    pub fn find_index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// The full set of collections a store should contain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    /// Collections, in declaration order.
    pub collections: Vec<CollectionSchema>,
}

impl StoreSchema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a collection.
    #[must_use]
    pub fn collection(mut self, collection: CollectionSchema) -> Self {
        self.collections.push(collection);
        self
    }

    /// Merges another schema into this one, keeping existing declarations and
    /// appending indexes that are new.
    pub fn merge(&mut self, other: &StoreSchema) {
        for incoming in &other.collections {
            match self.collections.iter_mut().find(|c| c.name == incoming.name) {
                Some(existing) => {
                    for index in &incoming.indexes {
                        if existing.find_index(&index.name).is_none() {
                            existing.indexes.push(index.clone());
                        }
                    }
                }
                None => self.collections.push(incoming.clone()),
            }
        }
    }
}
