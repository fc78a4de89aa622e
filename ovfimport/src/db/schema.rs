//! Registry schema.

pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

const MACHINES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS machines (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    registered INTEGER NOT NULL DEFAULT 0,
    settings TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_machines_name ON machines(name);
";

pub fn all_schemas() -> [&'static str; 2] {
    [SCHEMA_VERSION_TABLE, MACHINES_TABLE]
}
