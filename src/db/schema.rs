/// Queued actions keyed by id, ordered by enqueue time.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queued_actions (
    id TEXT PRIMARY KEY,
    enqueued_at INTEGER NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB
);

CREATE INDEX IF NOT EXISTS idx_queued_actions_enqueued
    ON queued_actions(enqueued_at);
"#;
