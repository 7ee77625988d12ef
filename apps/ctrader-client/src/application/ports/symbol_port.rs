//! Symbol Port (Driven Port)
//!
//! Resolves human symbol names to the broker's numeric ids. The symbol
//! catalog itself lives outside the engine; streams only need this lookup.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Resolved symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolInfo {
    /// Broker symbol id.
    pub id: i64,
    /// Canonical symbol name.
    pub name: String,
}

impl SymbolInfo {
    /// Create a resolved symbol.
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Symbol name lookup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SymbolResolver: Send + Sync {
    /// Resolve `symbol` to its broker id.
    ///
    /// Fails with `Error::SymbolNotFound` for unknown names.
    async fn resolve(&self, symbol: &str) -> Result<SymbolInfo>;
}

/// Fixed name to id table, matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct StaticSymbols {
    by_name: HashMap<String, SymbolInfo>,
}

impl StaticSymbols {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a symbol.
    #[must_use]
    pub fn with(mut self, name: &str, id: i64) -> Self {
        self.insert(name, id);
        self
    }

    /// Add or replace a symbol.
    pub fn insert(&mut self, name: &str, id: i64) {
        self.by_name
            .insert(name.to_uppercase(), SymbolInfo::new(id, name.to_uppercase()));
    }

    /// Number of known symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl<'a> FromIterator<(&'a str, i64)> for StaticSymbols {
    fn from_iter<I: IntoIterator<Item = (&'a str, i64)>>(iter: I) -> Self {
        let mut symbols = Self::new();
        for (name, id) in iter {
            symbols.insert(name, id);
        }
        symbols
    }
}

#[async_trait]
impl SymbolResolver for StaticSymbols {
    async fn resolve(&self, symbol: &str) -> Result<SymbolInfo> {
        self.by_name
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| Error::SymbolNotFound(symbol.to_string()))
    }
}
