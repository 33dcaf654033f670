//! Conversation state persistence.
//!
//! Single-file SQLite store owned exclusively by the orchestrator. Holds
//! user profiles, conversation turns, care plans, device activity and
//! learned facts; JSON-typed fields are stored as TEXT. Thread-safe via an
//! internal `Mutex<Connection>` — the orchestrator serializes access anyway,
//! the lock just keeps the type honest.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::pipeline::messages::{CarePlan, ChatTurn, Role, UserProfile};

/// A stored fact learned from conversation.
#[derive(Debug, Clone)]
pub struct LearnedFact {
    pub fact_type: String,
    pub fact_key: String,
    pub fact_value: String,
    pub confidence: f64,
}

/// SQLite-backed conversation store.
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    /// Open (or create) the store at the given path and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| PipelineError::State(format!("open {path}: {e}")))?;
        apply_schema(&conn)?;

        info!(database = path, "state_store_initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PipelineError::State(format!("open :memory:: {e}")))?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Fetch the profile for a device, creating a default one on first
    /// contact.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn get_or_create_profile(&self, device_id: &str) -> Result<UserProfile> {
        let conn = self.lock()?;

        let existing = conn
            .query_row(
                "SELECT user_id, device_id, name, preferred_name, timezone,
                        life_details, preferences
                 FROM user_profiles WHERE device_id = ?1",
                params![device_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| PipelineError::State(format!("profile query: {e}")))?;

        if let Some((user_id, device_id, name, preferred_name, timezone, details, prefs)) = existing
        {
            return Ok(UserProfile {
                user_id,
                device_id,
                name,
                preferred_name,
                timezone,
                life_details: parse_json_map(&details),
                preferences: parse_json_map(&prefs),
            });
        }

        let user_id = format!("user_{device_id}");
        conn.execute(
            "INSERT INTO user_profiles (user_id, device_id, name) VALUES (?1, ?2, ?3)",
            params![user_id, device_id, "Friend"],
        )
        .map_err(|e| PipelineError::State(format!("profile insert: {e}")))?;

        info!(device_id, user_id = %user_id, "profile_created");
        Ok(UserProfile {
            user_id,
            device_id: device_id.to_owned(),
            name: "Friend".to_owned(),
            preferred_name: None,
            timezone: "America/Los_Angeles".to_owned(),
            life_details: serde_json::Map::new(),
            preferences: serde_json::Map::new(),
        })
    }

    /// Persist mutable profile fields.
    ///
    /// # Errors
    ///
    /// Returns an error on update failure.
    pub fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE user_profiles
             SET name = ?2, preferred_name = ?3, timezone = ?4,
                 life_details = ?5, preferences = ?6, updated_at = ?7
             WHERE user_id = ?1",
            params![
                profile.user_id,
                profile.name,
                profile.preferred_name,
                profile.timezone,
                serde_json::Value::Object(profile.life_details.clone()).to_string(),
                serde_json::Value::Object(profile.preferences.clone()).to_string(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| PipelineError::State(format!("profile update: {e}")))?;
        Ok(())
    }

    /// Append one conversation turn.
    ///
    /// # Errors
    ///
    /// Returns an error on insert failure.
    pub fn add_turn(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        role: Role,
        content: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO conversation_turns (session_id, user_id, role, content)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, user_id, role.as_str(), content],
        )
        .map_err(|e| PipelineError::State(format!("turn insert: {e}")))?;
        Ok(())
    }

    /// The most recent `limit` turns of a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn conversation_history(&self, session_id: &str, limit: usize) -> Result<Vec<ChatTurn>> {
        let conn = self.lock()?;
        let mut statement = conn
            .prepare(
                "SELECT role, content FROM conversation_turns
                 WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| PipelineError::State(format!("history prepare: {e}")))?;

        let rows = statement
            .query_map(params![session_id, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| PipelineError::State(format!("history query: {e}")))?;

        let mut turns = Vec::new();
        for row in rows {
            let (role, content) = row.map_err(|e| PipelineError::State(format!("history row: {e}")))?;
            // System turns never enter history; anything unrecognized is
            // dropped rather than misattributed.
            let role = match role.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                other => {
                    warn!(role = other, "unknown_turn_role_skipped");
                    continue;
                }
            };
            turns.push(ChatTurn { role, content });
        }

        turns.reverse();
        Ok(turns)
    }

    /// The care plan for a user, or an empty default.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn care_plan(&self, user_id: &str) -> Result<CarePlan> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT medications, routines, contacts, notes
                 FROM care_plans WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| PipelineError::State(format!("care plan query: {e}")))?;

        match row {
            Some((medications, routines, contacts, notes)) => Ok(CarePlan {
                user_id: user_id.to_owned(),
                medications: parse_json_list(&medications),
                routines: parse_json_list(&routines),
                contacts: parse_json_list(&contacts),
                notes,
            }),
            None => Ok(CarePlan {
                user_id: user_id.to_owned(),
                ..CarePlan::default()
            }),
        }
    }

    /// Upsert the device activity row, bumping the session counter.
    ///
    /// # Errors
    ///
    /// Returns an error on upsert failure.
    pub fn record_device_activity(&self, device_id: &str, user_id: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO device_sessions (device_id, user_id, last_activity, session_count)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(device_id) DO UPDATE SET
                 last_activity = excluded.last_activity,
                 session_count = session_count + 1",
            params![device_id, user_id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| PipelineError::State(format!("activity upsert: {e}")))?;
        Ok(())
    }

    /// Devices with activity in the last hour.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn active_devices(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut statement = conn
            .prepare(
                "SELECT device_id FROM device_sessions
                 WHERE datetime(last_activity) > datetime('now', '-1 hour')",
            )
            .map_err(|e| PipelineError::State(format!("devices prepare: {e}")))?;

        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| PipelineError::State(format!("devices query: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::State(format!("devices rows: {e}")))
    }

    /// Store a fact learned about the user.
    ///
    /// # Errors
    ///
    /// Returns an error on insert failure.
    pub fn add_learned_fact(
        &self,
        user_id: &str,
        fact_type: &str,
        fact_key: &str,
        fact_value: &str,
        source: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO learned_facts (user_id, fact_type, fact_key, fact_value, source)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, fact_type, fact_key, fact_value, source],
        )
        .map_err(|e| PipelineError::State(format!("fact insert: {e}")))?;
        debug!(user_id, fact_type, fact_key, "fact_learned");
        Ok(())
    }

    /// All learned facts for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn learned_facts(&self, user_id: &str) -> Result<Vec<LearnedFact>> {
        let conn = self.lock()?;
        let mut statement = conn
            .prepare(
                "SELECT fact_type, fact_key, fact_value, confidence
                 FROM learned_facts WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
            )
            .map_err(|e| PipelineError::State(format!("facts prepare: {e}")))?;

        let rows = statement
            .query_map(params![user_id], |row| {
                Ok(LearnedFact {
                    fact_type: row.get(0)?,
                    fact_key: row.get(1)?,
                    fact_value: row.get(2)?,
                    confidence: row.get(3)?,
                })
            })
            .map_err(|e| PipelineError::State(format!("facts query: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::State(format!("facts rows: {e}")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::State("store lock poisoned".to_owned()))
    }
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_profiles (
             user_id TEXT PRIMARY KEY,
             device_id TEXT NOT NULL,
             name TEXT,
             preferred_name TEXT,
             timezone TEXT DEFAULT 'America/Los_Angeles',
             life_details TEXT DEFAULT '{}',
             preferences TEXT DEFAULT '{}',
             created_at TEXT DEFAULT CURRENT_TIMESTAMP,
             updated_at TEXT DEFAULT CURRENT_TIMESTAMP
         );

         CREATE TABLE IF NOT EXISTS conversation_turns (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             session_id TEXT NOT NULL,
             user_id TEXT,
             role TEXT NOT NULL,
             content TEXT NOT NULL,
             intent TEXT,
             created_at TEXT DEFAULT CURRENT_TIMESTAMP
         );
         CREATE INDEX IF NOT EXISTS idx_turns_session ON conversation_turns(session_id);

         CREATE TABLE IF NOT EXISTS care_plans (
             user_id TEXT PRIMARY KEY,
             medications TEXT DEFAULT '[]',
             routines TEXT DEFAULT '[]',
             contacts TEXT DEFAULT '[]',
             notes TEXT,
             updated_at TEXT DEFAULT CURRENT_TIMESTAMP
         );

         CREATE TABLE IF NOT EXISTS device_sessions (
             device_id TEXT PRIMARY KEY,
             user_id TEXT,
             last_activity TEXT,
             session_count INTEGER DEFAULT 0
         );

         CREATE TABLE IF NOT EXISTS learned_facts (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             user_id TEXT NOT NULL,
             fact_type TEXT,
             fact_key TEXT,
             fact_value TEXT,
             confidence REAL DEFAULT 1.0,
             source TEXT,
             created_at TEXT DEFAULT CURRENT_TIMESTAMP
         );
         CREATE INDEX IF NOT EXISTS idx_facts_user ON learned_facts(user_id);",
    )
    .map_err(|e| PipelineError::State(format!("schema: {e}")))
}

fn parse_json_map(text: &str) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

fn parse_json_list(text: &str) -> Vec<serde_json::Value> {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Array(list)) => list,
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConversationStore {
        ConversationStore::open_in_memory().unwrap()
    }

    #[test]
    fn profile_is_created_once_per_device() {
        let store = store();
        let first = store.get_or_create_profile("companion-001").unwrap();
        assert_eq!(first.user_id, "user_companion-001");
        assert_eq!(first.name, "Friend");

        let second = store.get_or_create_profile("companion-001").unwrap();
        assert_eq!(second.user_id, first.user_id);
    }

    #[test]
    fn profile_updates_persist_json_fields() {
        let store = store();
        let mut profile = store.get_or_create_profile("companion-001").unwrap();
        profile.name = "Margaret".to_owned();
        profile.preferred_name = Some("Peggy".to_owned());
        profile.life_details.insert(
            "hobbies".to_owned(),
            serde_json::json!(["gardening", "bridge"]),
        );
        store.save_profile(&profile).unwrap();

        let back = store.get_or_create_profile("companion-001").unwrap();
        assert_eq!(back.name, "Margaret");
        assert_eq!(back.preferred_name.as_deref(), Some("Peggy"));
        assert_eq!(
            back.life_details.get("hobbies"),
            Some(&serde_json::json!(["gardening", "bridge"]))
        );
    }

    #[test]
    fn history_returns_recent_turns_chronologically() {
        let store = store();
        for i in 0..15 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .add_turn("s1", Some("user-001"), role, &format!("turn {i}"))
                .unwrap();
        }

        let history = store.conversation_history("s1", 10).unwrap();
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].content, "turn 5");
        assert_eq!(history[9].content, "turn 14");
        // Oldest first, alternating roles preserved.
        assert_eq!(history[0].role, Role::Assistant);
        assert_eq!(history[1].role, Role::User);
    }

    #[test]
    fn history_is_scoped_to_the_session() {
        let store = store();
        store.add_turn("s1", None, Role::User, "first session").unwrap();
        store.add_turn("s2", None, Role::User, "second session").unwrap();

        let history = store.conversation_history("s2", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "second session");
    }

    #[test]
    fn duplicate_turns_preserve_ordering() {
        // At-least-once delivery can replay a turn; ordering must survive.
        let store = store();
        store.add_turn("s1", None, Role::User, "hello").unwrap();
        store.add_turn("s1", None, Role::Assistant, "hi there").unwrap();
        store.add_turn("s1", None, Role::Assistant, "hi there").unwrap();

        let history = store.conversation_history("s1", 10).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].content, "hi there");
        assert_eq!(history[2].content, "hi there");
    }

    #[test]
    fn missing_care_plan_defaults_to_empty() {
        let store = store();
        let plan = store.care_plan("user-001").unwrap();
        assert_eq!(plan.user_id, "user-001");
        assert!(plan.medications.is_empty());
        assert!(plan.notes.is_none());
    }

    #[test]
    fn device_activity_upsert_marks_device_active() {
        let store = store();
        store.record_device_activity("companion-001", None).unwrap();
        store
            .record_device_activity("companion-001", Some("user-001"))
            .unwrap();

        let active = store.active_devices().unwrap();
        assert_eq!(active, vec!["companion-001".to_owned()]);
    }

    #[test]
    fn learned_facts_round_trip() {
        let store = store();
        store
            .add_learned_fact("user-001", "preference", "tea", "earl grey", "conversation")
            .unwrap();
        store
            .add_learned_fact("user-001", "family", "daughter", "Sarah", "conversation")
            .unwrap();

        let facts = store.learned_facts("user-001").unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].fact_key, "daughter");
        assert_eq!(facts[1].fact_value, "earl grey");
        assert_eq!(facts[0].confidence, 1.0);

        assert!(store.learned_facts("user-002").unwrap().is_empty());
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hearth.db");
        let store = ConversationStore::open(path.to_str().unwrap()).unwrap();
        store.get_or_create_profile("companion-001").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn unknown_roles_are_skipped_in_history() {
        let store = store();
        store.add_turn("s1", None, Role::User, "hello").unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO conversation_turns (session_id, role, content)
                 VALUES ('s1', 'system', 'never show this')",
                [],
            )
            .unwrap();
        }

        let history = store.conversation_history("s1", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hello");
    }
}
