//! Backend identification.

use serde::{Deserialize, Serialize};

/// Identifies the type of backend behind a [`Store`](super::Store).
///
/// Used in logs, error messages and capability tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process map.
    Memory,
    /// SQLite database (file-based or in-memory).
    Sqlite,
    /// PostgreSQL database.
    Postgres,
    /// MongoDB (document store).
    MongoDB,
    /// Elasticsearch (search index).
    Elasticsearch,
    /// One file per object.
    FileSystem,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Postgres => write!(f, "postgres"),
            BackendKind::MongoDB => write!(f, "mongodb"),
            BackendKind::Elasticsearch => write!(f, "elasticsearch"),
            BackendKind::FileSystem => write!(f, "filesystem"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_display_matches_serde() {
        for kind in [
            BackendKind::Memory,
            BackendKind::Sqlite,
            BackendKind::Postgres,
            BackendKind::MongoDB,
            BackendKind::Elasticsearch,
            BackendKind::FileSystem,
        ] {
            let serialized = serde_json::to_value(kind).unwrap();
            assert_eq!(serialized, serde_json::json!(kind.to_string()));
        }
    }
}
