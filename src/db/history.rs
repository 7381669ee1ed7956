//! Conversation history repository

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{DbPool, parse_datetime};
use crate::{Error, Result};

/// Speaker of a stored turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Role name as stored and as sent to the language model
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One side of a stored exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub session_id: String,
    pub turn_id: u64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Conversation history repository
#[derive(Clone)]
pub struct HistoryRepo {
    pool: DbPool,
}

impl HistoryRepo {
    /// Create a new history repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append a turn to a session's history
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn append(
        &self,
        session_id: &str,
        user_id: &str,
        turn_id: u64,
        role: Role,
        content: &str,
    ) -> Result<ConversationTurn> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now();
        conn.execute(
            "INSERT INTO conversation_turns (id, session_id, user_id, turn_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                session_id,
                user_id,
                i64::try_from(turn_id).unwrap_or(i64::MAX),
                role.as_str(),
                content,
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(ConversationTurn {
            session_id: session_id.to_string(),
            turn_id,
            role,
            content: content.to_string(),
            created_at: now,
        })
    }

    /// Most recent turns of a session, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT session_id, turn_id, role, content, created_at
                 FROM conversation_turns WHERE session_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let turns = stmt
            .query_map(
                rusqlite::params![session_id, i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| {
                    Ok(ConversationTurn {
                        session_id: row.get(0)?,
                        turn_id: u64::try_from(row.get::<_, i64>(1)?).unwrap_or(0),
                        role: Role::from_str(&row.get::<_, String>(2)?).unwrap_or(Role::User),
                        content: row.get(3)?,
                        created_at: parse_datetime(&row.get::<_, String>(4)?),
                    })
                },
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        Ok(turns)
    }

    /// Number of stored turns for a session
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count(&self, session_id: &str) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM conversation_turns WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> HistoryRepo {
        let pool = init_memory().unwrap();
        HistoryRepo::new(pool)
    }

    #[test]
    fn test_append_and_recent() {
        let repo = setup();

        repo.append("dev-1", "user-001", 1, Role::User, "Hello")
            .unwrap();
        repo.append("dev-1", "user-001", 1, Role::Assistant, "Hi there!")
            .unwrap();
        repo.append("dev-1", "user-001", 2, Role::User, "How are you?")
            .unwrap();

        let recent = repo.recent("dev-1", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "Hi there!");
        assert_eq!(recent[0].role, Role::Assistant);
        assert_eq!(recent[1].content, "How are you?");
        assert_eq!(recent[1].turn_id, 2);
    }

    #[test]
    fn test_sessions_are_separate() {
        let repo = setup();

        repo.append("dev-1", "user-001", 1, Role::User, "one")
            .unwrap();
        repo.append("dev-2", "user-001", 1, Role::User, "two")
            .unwrap();

        assert_eq!(repo.count("dev-1").unwrap(), 1);
        assert_eq!(repo.recent("dev-2", 10).unwrap()[0].content, "two");
        assert!(repo.recent("dev-3", 10).unwrap().is_empty());
    }
}
