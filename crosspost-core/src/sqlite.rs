use std::time::Duration;

use rusqlite::Connection;

/// Several consumers, the CLI and the ledger may hold the same file open.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pragmas shared by every local store: WAL so readers never block the
/// broker's writers, and a busy timeout instead of immediate `SQLITE_BUSY`.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_databases_switch_to_wal() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("store.sqlite")).unwrap();
        configure_connection(&conn).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_ascii_lowercase(), "wal");
    }
}
