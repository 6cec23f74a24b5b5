//! DDL for the entry and history tables
//!
//! Table names are configurable, so the schema is generated rather than
//! shipped as a fixed migration. Callers must pass identifiers that passed
//! [`validate_identifier`](crate::config::validate_identifier).

/// Columns shared by the primary and history tables, in select order
pub(crate) const ENTRY_COLUMNS: &str = "id, queue_name, search_key1, search_key2, user_token, \
     payload, available_time, state, owner_id, claimed_time, error_count, creating_owner, \
     created_time";

/// Statements creating both tables and their indexes (idempotent)
pub fn schema_statements(table_name: &str, history_table_name: &str) -> Vec<String> {
    let base = index_prefix(table_name);
    let history_base = index_prefix(history_table_name);

    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table_name} (
                id BIGSERIAL PRIMARY KEY,
                queue_name TEXT NOT NULL,
                search_key1 BIGINT NOT NULL DEFAULT 0,
                search_key2 BIGINT NOT NULL DEFAULT 0,
                user_token UUID,
                payload JSONB NOT NULL,
                available_time TIMESTAMPTZ NOT NULL,
                state TEXT NOT NULL
                    CHECK (state IN ('AVAILABLE', 'IN_PROCESSING', 'PROCESSED', 'FAILED')),
                owner_id TEXT,
                claimed_time TIMESTAMPTZ,
                error_count INTEGER NOT NULL DEFAULT 0 CHECK (error_count >= 0),
                creating_owner TEXT NOT NULL,
                created_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CHECK (
                    (state = 'IN_PROCESSING' AND owner_id IS NOT NULL AND claimed_time IS NOT NULL)
                    OR (state <> 'IN_PROCESSING' AND owner_id IS NULL AND claimed_time IS NULL)
                )
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {base}_ready_idx \
             ON {table_name} (queue_name, available_time, id) WHERE state = 'AVAILABLE'"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {base}_claimed_idx \
             ON {table_name} (claimed_time) WHERE state = 'IN_PROCESSING'"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {base}_search_idx \
             ON {table_name} (queue_name, search_key1, search_key2)"
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {history_table_name} (
                id BIGINT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                search_key1 BIGINT NOT NULL,
                search_key2 BIGINT NOT NULL,
                user_token UUID,
                payload JSONB NOT NULL,
                available_time TIMESTAMPTZ NOT NULL,
                state TEXT NOT NULL CHECK (state IN ('PROCESSED', 'FAILED')),
                owner_id TEXT,
                claimed_time TIMESTAMPTZ,
                error_count INTEGER NOT NULL,
                creating_owner TEXT NOT NULL,
                created_time TIMESTAMPTZ NOT NULL,
                processed_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {history_base}_search_idx \
             ON {history_table_name} (queue_name, search_key1, search_key2)"
        ),
    ]
}

/// Index names cannot be schema-qualified
fn index_prefix(table_name: &str) -> &str {
    table_name.rsplit('.').next().unwrap_or(table_name)
}
