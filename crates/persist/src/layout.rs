//! Storage layout of the snapshot table for SQL backends.

use revisionable_kernel::FieldKind;
use std::fmt;
use std::str::FromStr;

/// Largest payload a MySQL-family backend stores (`MEDIUMBLOB` capped at 5 MiB).
pub const MYSQL_PAYLOAD_LIMIT: usize = 5 * 1024 * 1024;

pub const DEFAULT_TABLE: &str = "revision_records";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    #[default]
    Sqlite,
    Mysql,
    Postgres,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Sqlite, Backend::Mysql, Backend::Postgres];

    pub fn name(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    /// Maximum payload size in bytes, if the backend imposes one.
    pub fn payload_limit(self) -> Option<usize> {
        match self {
            Self::Mysql => Some(MYSQL_PAYLOAD_LIMIT),
            Self::Sqlite | Self::Postgres => None,
        }
    }

    fn payload_type(self) -> &'static str {
        match self {
            Self::Sqlite => "BLOB",
            Self::Mysql => "MEDIUMBLOB",
            Self::Postgres => "BYTEA",
        }
    }

    fn timestamp_type(self) -> &'static str {
        match self {
            Self::Sqlite | Self::Mysql => "DATETIME",
            Self::Postgres => "TIMESTAMP",
        }
    }

    fn column_type(self, kind: FieldKind) -> &'static str {
        match (self, kind) {
            (_, FieldKind::Bool) => "BOOLEAN",
            (Self::Sqlite, FieldKind::Int) => "INTEGER",
            (_, FieldKind::Int) => "BIGINT",
            (Self::Postgres, FieldKind::Float) => "DOUBLE PRECISION",
            (_, FieldKind::Float) => "DOUBLE",
            (Self::Postgres, FieldKind::Uuid) => "UUID",
            (_, FieldKind::Uuid) => "CHAR(36)",
            (_, FieldKind::Bytes) => self.payload_type(),
            (_, FieldKind::Timestamp) => self.timestamp_type(),
            (_, FieldKind::Text | FieldKind::Any) => "VARCHAR(255)",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!("unknown backend `{other}` (expected sqlite, mysql or postgres)")),
        }
    }
}

/// Snapshot table definition: the fixed columns plus caller-defined
/// extension columns filled from meta values.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotTable {
    pub name: String,
    pub extensions: Vec<(String, FieldKind)>,
    /// Store `entity_id` as text, for composite or non-integer identities.
    pub encoded_ids: bool,
}

impl Default for SnapshotTable {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE)
    }
}

impl SnapshotTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extensions: Vec::new(),
            encoded_ids: false,
        }
    }

    pub fn with_extension(mut self, column: impl Into<String>, kind: FieldKind) -> Self {
        self.extensions.push((column.into(), kind));
        self
    }

    pub fn with_encoded_ids(mut self) -> Self {
        self.encoded_ids = true;
        self
    }

    pub fn id_index(&self) -> String {
        format!("{}_id", self.name)
    }

    pub fn trash_index(&self) -> String {
        format!("{}_type_and_created_at", self.name)
    }

    /// Statements creating the table and its two indexes.
    pub fn ddl(&self, backend: Backend) -> Vec<String> {
        let id_type = if self.encoded_ids {
            "VARCHAR(255)"
        } else {
            backend.column_type(FieldKind::Int)
        };
        let mut columns = vec![
            format!("id {}", primary_key(backend)),
            "entity_type VARCHAR(100) NOT NULL".to_owned(),
            format!("entity_id {id_type} NOT NULL"),
            format!("revision {} NOT NULL", backend.column_type(FieldKind::Int)),
            format!("payload {}", backend.payload_type()),
            format!("created_at {} NOT NULL", backend.timestamp_type()),
            "trash BOOLEAN DEFAULT FALSE".to_owned(),
        ];
        columns.extend(
            self.extensions
                .iter()
                .map(|(column, kind)| format!("{column} {}", backend.column_type(*kind))),
        );

        vec![
            format!("CREATE TABLE {} (\n  {}\n)", self.name, columns.join(",\n  ")),
            format!("CREATE INDEX {} ON {} (entity_id)", self.id_index(), self.name),
            format!(
                "CREATE INDEX {} ON {} (entity_type, created_at, trash)",
                self.trash_index(),
                self.name
            ),
        ]
    }
}

fn primary_key(backend: Backend) -> &'static str {
    match backend {
        Backend::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        Backend::Mysql => "BIGINT AUTO_INCREMENT PRIMARY KEY",
        Backend::Postgres => "BIGSERIAL PRIMARY KEY",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_has_both_indexes() {
        let ddl = SnapshotTable::default().ddl(Backend::Sqlite);
        assert_eq!(ddl.len(), 3);
        assert!(ddl[0].starts_with("CREATE TABLE revision_records ("));
        assert!(ddl[0].contains("entity_type VARCHAR(100) NOT NULL"));
        assert!(ddl[0].contains("trash BOOLEAN DEFAULT FALSE"));
        assert_eq!(ddl[1], "CREATE INDEX revision_records_id ON revision_records (entity_id)");
        assert_eq!(
            ddl[2],
            "CREATE INDEX revision_records_type_and_created_at ON revision_records (entity_type, created_at, trash)"
        );
    }

    #[test]
    fn payload_column_follows_backend() {
        let table = SnapshotTable::new("history");
        assert!(table.ddl(Backend::Mysql)[0].contains("payload MEDIUMBLOB"));
        assert!(table.ddl(Backend::Postgres)[0].contains("payload BYTEA"));
        assert_eq!(Backend::Mysql.payload_limit(), Some(5 * 1024 * 1024));
        assert_eq!(Backend::Postgres.payload_limit(), None);
    }

    #[test]
    fn extensions_and_encoded_ids() {
        let ddl = SnapshotTable::default()
            .with_extension("updated_by", FieldKind::Text)
            .with_extension("label", FieldKind::Int)
            .with_encoded_ids()
            .ddl(Backend::Postgres);
        assert!(ddl[0].contains("entity_id VARCHAR(255) NOT NULL"));
        assert!(ddl[0].contains("updated_by VARCHAR(255)"));
        assert!(ddl[0].contains("label BIGINT"));
    }

    #[test]
    fn backend_names_parse() {
        for backend in Backend::ALL {
            assert_eq!(backend.name().parse::<Backend>(), Ok(backend));
        }
        assert_eq!("PostgreSQL".parse::<Backend>(), Ok(Backend::Postgres));
        assert!("oracle".parse::<Backend>().is_err());
    }
}
