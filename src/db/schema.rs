//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::NodeError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), NodeError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!(
            "Migrating schema from v{} to v{}",
            current_version, SCHEMA_VERSION
        );
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, NodeError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), NodeError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        [version],
    )?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), NodeError> {
    conn.execute_batch(QUEUE_SCHEMA)?;
    conn.execute_batch(MESSAGE_SCHEMA)?;
    conn.execute_batch(DERIVED_SCHEMA)?;
    conn.execute_batch(INDEXES_SCHEMA)?;
    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), NodeError> {
    // Add migration steps here as the schema evolves
    let current = from_version;
    set_schema_version(conn, current)?;
    Ok(())
}

/// Pending work queues. Both double as the crash-recovery log: rows are
/// written before the producing side acks its source and deleted only on a
/// terminal outcome.
const QUEUE_SCHEMA: &str = r#"
-- On-chain sync transactions waiting to be unpacked
CREATE TABLE IF NOT EXISTS pending_tx (
    chain TEXT NOT NULL,
    tx_hash TEXT NOT NULL,
    height INTEGER NOT NULL,
    tx_index INTEGER NOT NULL DEFAULT 0,
    publisher TEXT NOT NULL,
    protocol TEXT NOT NULL,             -- batch_inline | batch_ref
    payload TEXT NOT NULL,              -- JSON array (inline) or content hash (ref)
    retries INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER NOT NULL DEFAULT 0,
    claimed_at INTEGER,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (chain, tx_hash)
);

-- Message envelopes waiting for the processing pipeline
CREATE TABLE IF NOT EXISTS pending_message (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_hash TEXT NOT NULL,
    sender TEXT NOT NULL,
    chain TEXT NOT NULL,
    signature TEXT NOT NULL,
    type TEXT NOT NULL,
    channel TEXT NOT NULL,
    time REAL NOT NULL,
    item_type TEXT NOT NULL,            -- inline | storage | ipfs
    item_content TEXT,
    origin TEXT NOT NULL,               -- p2p | http | onchain
    conf_chain TEXT,
    conf_height INTEGER,
    conf_tx_hash TEXT,
    retries INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER NOT NULL DEFAULT 0,
    claimed_at INTEGER,
    check_message INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);

-- One row per (item_hash, confirmation) pair keeps chain rescans idempotent
CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_message_dedup
    ON pending_message(item_hash, COALESCE(conf_tx_hash, ''));

-- Terminal failures, kept for inspection
CREATE TABLE IF NOT EXISTS rejected_message (
    item_hash TEXT PRIMARY KEY NOT NULL,
    sender TEXT NOT NULL,
    type TEXT NOT NULL,
    reason TEXT NOT NULL,
    rejected_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS rejected_tx (
    chain TEXT NOT NULL,
    tx_hash TEXT NOT NULL,
    reason TEXT NOT NULL,
    rejected_at INTEGER NOT NULL,
    PRIMARY KEY (chain, tx_hash)
);
"#;

/// Confirmed messages and their on-chain confirmations.
const MESSAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS message (
    item_hash TEXT PRIMARY KEY NOT NULL,
    sender TEXT NOT NULL,
    chain TEXT NOT NULL,
    signature TEXT NOT NULL,
    type TEXT NOT NULL,
    channel TEXT NOT NULL,
    time REAL NOT NULL,
    item_type TEXT NOT NULL,
    content TEXT,                       -- nulled when forgotten
    size INTEGER NOT NULL DEFAULT 0,
    forgotten_by TEXT,
    processed_at INTEGER NOT NULL
);

-- Set of (chain, height, tx_hash) confirmations, merged idempotently
CREATE TABLE IF NOT EXISTS message_confirmation (
    item_hash TEXT NOT NULL,
    chain TEXT NOT NULL,
    height INTEGER NOT NULL,
    tx_hash TEXT NOT NULL,
    PRIMARY KEY (item_hash, chain, tx_hash)
);
"#;

/// Tables derived from message effects by the per-type handlers.
const DERIVED_SCHEMA: &str = r#"
-- Raw aggregate elements, kept for replay when the view is refolded
CREATE TABLE IF NOT EXISTS aggregate_element (
    item_hash TEXT PRIMARY KEY NOT NULL,
    address TEXT NOT NULL,
    key TEXT NOT NULL,
    content TEXT NOT NULL,
    creation_time REAL NOT NULL
);

-- Materialised per-(address, key) view
CREATE TABLE IF NOT EXISTS aggregate (
    address TEXT NOT NULL,
    key TEXT NOT NULL,
    content TEXT NOT NULL,
    creation_time REAL NOT NULL,
    last_revision_time REAL NOT NULL,
    last_revision_hash TEXT NOT NULL,
    PRIMARY KEY (address, key)
);

CREATE TABLE IF NOT EXISTS post (
    item_hash TEXT PRIMARY KEY NOT NULL,
    address TEXT NOT NULL,
    type TEXT NOT NULL,
    ref_hash TEXT,                      -- original post when this is an amendment
    content TEXT,
    time REAL NOT NULL,
    channel TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stored_file (
    file_hash TEXT PRIMARY KEY NOT NULL,
    storage TEXT NOT NULL,              -- local | ipfs
    size INTEGER NOT NULL DEFAULT 0,
    pin_count INTEGER NOT NULL DEFAULT 0,
    pin_delete_at INTEGER,
    last_access INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

-- Links a confirmed STORE message to the file it pins. The tag groups a
-- chain of STORE updates: the original message hash, shared by every
-- ref-update of it
CREATE TABLE IF NOT EXISTS file_pin (
    item_hash TEXT PRIMARY KEY NOT NULL,
    file_hash TEXT NOT NULL,
    owner TEXT NOT NULL,
    tag TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Current file per tag: the newest non-forgotten STORE in the chain wins
CREATE TABLE IF NOT EXISTS file_tag (
    tag TEXT PRIMARY KEY NOT NULL,
    owner TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS balance (
    address TEXT NOT NULL,
    chain TEXT NOT NULL,
    token TEXT NOT NULL DEFAULT 'ALEPH',
    amount REAL NOT NULL DEFAULT 0,
    last_update INTEGER NOT NULL,
    PRIMARY KEY (address, chain, token)
);

CREATE TABLE IF NOT EXISTS chain_cursor (
    chain TEXT PRIMARY KEY NOT NULL,
    last_height INTEGER NOT NULL,
    last_tx_hash TEXT,
    updated_at INTEGER NOT NULL
);

-- Program descriptors indexed by trigger; execution happens elsewhere
CREATE TABLE IF NOT EXISTS program (
    item_hash TEXT PRIMARY KEY NOT NULL,
    owner TEXT NOT NULL,
    http_trigger INTEGER NOT NULL DEFAULT 0,
    cron_schedule TEXT,
    aleph_filters TEXT,
    descriptor TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pending_tx_due ON pending_tx(next_attempt_at);
CREATE INDEX IF NOT EXISTS idx_pending_message_due ON pending_message(next_attempt_at, type);
CREATE INDEX IF NOT EXISTS idx_pending_message_hash ON pending_message(item_hash);

CREATE INDEX IF NOT EXISTS idx_message_sender ON message(sender);
CREATE INDEX IF NOT EXISTS idx_message_type ON message(type);
CREATE INDEX IF NOT EXISTS idx_message_channel ON message(channel);
CREATE INDEX IF NOT EXISTS idx_message_time ON message(time);

CREATE INDEX IF NOT EXISTS idx_aggregate_element_key ON aggregate_element(address, key);
CREATE INDEX IF NOT EXISTS idx_post_ref ON post(ref_hash);
CREATE INDEX IF NOT EXISTS idx_post_address ON post(address);

CREATE INDEX IF NOT EXISTS idx_stored_file_gc ON stored_file(pin_count, pin_delete_at);
CREATE INDEX IF NOT EXISTS idx_file_pin_file ON file_pin(file_hash);
CREATE INDEX IF NOT EXISTS idx_file_pin_owner ON file_pin(owner);
CREATE INDEX IF NOT EXISTS idx_file_pin_tag ON file_pin(tag);

CREATE INDEX IF NOT EXISTS idx_balance_address ON balance(address);
"#;
