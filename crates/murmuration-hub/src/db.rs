use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use murmuration_protocol::model::{AclEntry, BanEntry, Channel, Group};

/// Hub schema version. Bump when the schema changes; a mismatch drops and
/// recreates every table rather than attempting an in-place migration.
const HUB_SCHEMA_VERSION: i64 = 1;

/// Open (or create) the Hub's `SQLite` database and run migrations.
pub fn open_hub_db(path: &str) -> Result<Arc<Mutex<Connection>>, String> {
    let conn = Connection::open(path).map_err(|e| format!("failed to open hub db: {e}"))?;

    conn.execute_batch("PRAGMA journal_mode=WAL;")
        .map_err(|e| format!("failed to set WAL mode: {e}"))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")
        .map_err(|e| format!("failed to enable foreign keys: {e}"))?;

    let current: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if current != HUB_SCHEMA_VERSION {
        if current != 0 {
            tracing::info!(
                old = current,
                new = HUB_SCHEMA_VERSION,
                "hub schema version mismatch — recreating"
            );
            drop_all_tables(&conn)?;
        }
        conn.execute_batch(HUB_SCHEMA)
            .map_err(|e| format!("failed to run hub schema: {e}"))?;
        conn.pragma_update(None, "user_version", HUB_SCHEMA_VERSION)
            .map_err(|e| format!("failed to set schema version: {e}"))?;
    }

    Ok(Arc::new(Mutex::new(conn)))
}

/// Drop every user table so the schema can be cleanly re-applied.
fn drop_all_tables(conn: &Connection) -> Result<(), String> {
    conn.execute_batch("PRAGMA foreign_keys=OFF;")
        .map_err(|e| format!("failed to disable fks: {e}"))?;

    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
        .map_err(|e| format!("failed to list tables: {e}"))?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| format!("failed to query tables: {e}"))?
        .filter_map(Result::ok)
        .collect();
    drop(stmt);

    for table in &tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))
            .map_err(|e| format!("failed to drop table {table}: {e}"))?;
    }

    conn.execute_batch("PRAGMA foreign_keys=ON;")
        .map_err(|e| format!("failed to re-enable fks: {e}"))?;

    Ok(())
}

const HUB_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS channels (
    id INTEGER PRIMARY KEY,
    parent INTEGER REFERENCES channels(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT,
    position INTEGER NOT NULL DEFAULT 0,
    temporary INTEGER NOT NULL DEFAULT 0,
    max_users INTEGER,
    inherit_acls INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS channel_links (
    channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    linked_channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    PRIMARY KEY (channel_id, linked_channel_id)
);

CREATE TABLE IF NOT EXISTS groups (
    channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    inherit INTEGER NOT NULL DEFAULT 1,
    inheritable INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (channel_id, name)
);

CREATE TABLE IF NOT EXISTS group_members (
    channel_id INTEGER NOT NULL,
    group_name TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    added INTEGER NOT NULL,
    PRIMARY KEY (channel_id, group_name, user_id, added),
    FOREIGN KEY (channel_id, group_name) REFERENCES groups(channel_id, name) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS acl_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    apply_here INTEGER NOT NULL DEFAULT 1,
    apply_subs INTEGER NOT NULL DEFAULT 1,
    user_id INTEGER,
    group_name TEXT,
    grant_mask INTEGER NOT NULL DEFAULT 0,
    deny_mask INTEGER NOT NULL DEFAULT 0,
    sort_order INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_acl_entries_channel ON acl_entries(channel_id, sort_order);

CREATE TABLE IF NOT EXISTS registered_users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    certificate_hash TEXT,
    password_hash TEXT,
    last_channel_id INTEGER,
    texture BLOB,
    comment TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS bans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address BLOB NOT NULL,
    mask INTEGER NOT NULL,
    name TEXT,
    certificate_hash TEXT,
    reason TEXT,
    start TEXT NOT NULL,
    duration_secs INTEGER
);

CREATE TABLE IF NOT EXISTS blobs (
    hash TEXT PRIMARY KEY,
    data BLOB NOT NULL
);
";

/// Everything the Hub needs to repopulate its in-memory state on startup.
pub struct PersistedState {
    pub channels: Vec<Channel>,
    pub groups: Vec<(u32, Group)>,
    pub acls: Vec<(u32, AclEntry)>,
    pub bans: Vec<BanEntry>,
}

/// Load the channel tree, ACLs, groups, and bans back out of the database
/// so a restarted Hub comes up with the same authoritative state it had
/// before it went down.
pub fn load_persisted_state(db: &Arc<Mutex<Connection>>) -> Result<PersistedState, String> {
    let conn = db.lock().map_err(|e| e.to_string())?;

    let mut channel_stmt = conn
        .prepare(
            "SELECT id, parent, name, description, position, temporary, max_users, inherit_acls FROM channels",
        )
        .map_err(|e| e.to_string())?;
    let channels: Vec<Channel> = channel_stmt
        .query_map([], |row| {
            Ok(Channel {
                id: row.get(0)?,
                parent: row.get(1)?,
                name: row.get(2)?,
                description: row.get(3)?,
                position: row.get(4)?,
                temporary: row.get(5)?,
                max_users: row.get(6)?,
                inherit_acls: row.get(7)?,
                links: Vec::new(),
            })
        })
        .map_err(|e| e.to_string())?
        .filter_map(Result::ok)
        .collect();
    drop(channel_stmt);

    let mut group_stmt = conn
        .prepare("SELECT channel_id, name, inherit, inheritable FROM groups")
        .map_err(|e| e.to_string())?;
    let groups: Vec<(u32, Group)> = group_stmt
        .query_map([], |row| {
            let channel_id: u32 = row.get(0)?;
            Ok((
                channel_id,
                Group {
                    name: row.get(1)?,
                    inherit: row.get(2)?,
                    inheritable: row.get(3)?,
                    add: Vec::new(),
                    remove: Vec::new(),
                },
            ))
        })
        .map_err(|e| e.to_string())?
        .filter_map(Result::ok)
        .collect();
    drop(group_stmt);

    let mut acl_stmt = conn
        .prepare(
            "SELECT channel_id, apply_here, apply_subs, user_id, group_name, grant_mask, deny_mask
             FROM acl_entries ORDER BY channel_id, sort_order",
        )
        .map_err(|e| e.to_string())?;
    let acls: Vec<(u32, AclEntry)> = acl_stmt
        .query_map([], |row| {
            let channel_id: u32 = row.get(0)?;
            Ok((
                channel_id,
                AclEntry {
                    apply_here: row.get(1)?,
                    apply_subs: row.get(2)?,
                    user_id: row.get(3)?,
                    group: row.get(4)?,
                    grant: row.get(5)?,
                    deny: row.get(6)?,
                },
            ))
        })
        .map_err(|e| e.to_string())?
        .filter_map(Result::ok)
        .collect();
    drop(acl_stmt);

    let mut ban_stmt = conn
        .prepare("SELECT address, mask, name, certificate_hash, reason, start, duration_secs FROM bans")
        .map_err(|e| e.to_string())?;
    let bans: Vec<BanEntry> = ban_stmt
        .query_map([], |row| {
            Ok(BanEntry {
                address: row.get(0)?,
                mask: row.get(1)?,
                name: row.get(2)?,
                hash: row.get(3)?,
                reason: row.get(4)?,
                start: row.get(5)?,
                duration_secs: row.get(6)?,
            })
        })
        .map_err(|e| e.to_string())?
        .filter_map(Result::ok)
        .collect();

    Ok(PersistedState {
        channels,
        groups,
        acls,
        bans,
    })
}
