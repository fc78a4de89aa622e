//! Machine rows: settings as a JSON blob, name and registration as columns.

use chrono::{DateTime, Utc};

use ovfimport_shared::errors::{ImportError, ImportResult};

use super::{Database, db_err};
use crate::registry::{MachineId, MachineSettings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRecord {
    pub id: MachineId,
    pub registered: bool,
    pub settings: MachineSettings,
    pub created_at: DateTime<Utc>,
}

impl MachineRecord {
    pub fn name(&self) -> &str {
        &self.settings.spec.name
    }
}

/// Machine persistence on top of [`Database`].
#[derive(Clone)]
pub struct MachineStore {
    db: Database,
}

impl MachineStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, record: &MachineRecord) -> ImportResult<()> {
        let settings = encode(&record.settings)?;
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT INTO machines (id, name, registered, settings, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                record.id.to_string(),
                record.name(),
                record.registered,
                settings,
                record.created_at.to_rfc3339(),
            ],
        ))?;
        Ok(())
    }

    /// Overwrite settings and registration flag of an existing row.
    pub fn update(&self, record: &MachineRecord) -> ImportResult<()> {
        let settings = encode(&record.settings)?;
        let conn = self.db.conn();
        let changed = db_err!(conn.execute(
            "UPDATE machines SET name = ?2, registered = ?3, settings = ?4 WHERE id = ?1",
            rusqlite::params![
                record.id.to_string(),
                record.name(),
                record.registered,
                settings,
            ],
        ))?;
        if changed == 0 {
            return Err(ImportError::NotFound(format!("machine {}", record.id)));
        }
        Ok(())
    }

    pub fn delete(&self, id: &MachineId) -> ImportResult<bool> {
        let conn = self.db.conn();
        let changed = db_err!(conn.execute(
            "DELETE FROM machines WHERE id = ?1",
            rusqlite::params![id.to_string()],
        ))?;
        Ok(changed > 0)
    }

    pub fn list(&self) -> ImportResult<Vec<MachineRecord>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(
            "SELECT id, registered, settings, created_at FROM machines ORDER BY created_at, id"
        ))?;
        let rows = db_err!(stmt.query_map([], read_row))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(decode(db_err!(row)?)?);
        }
        Ok(records)
    }

}

type RawRow = (String, bool, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode((id, registered, settings, created_at): RawRow) -> ImportResult<MachineRecord> {
    let settings: MachineSettings = serde_json::from_str(&settings)
        .map_err(|e| ImportError::Database(format!("corrupt settings for machine {}: {}", id, e)))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| ImportError::Database(format!("corrupt timestamp for machine {}: {}", id, e)))?
        .with_timezone(&Utc);

    Ok(MachineRecord {
        id: id.parse()?,
        registered,
        settings,
        created_at,
    })
}

fn encode(settings: &MachineSettings) -> ImportResult<String> {
    serde_json::to_string(settings)
        .map_err(|e| ImportError::Internal(format!("failed to serialize machine settings: {}", e)))
}
