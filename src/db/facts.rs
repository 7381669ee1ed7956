//! Learned fact repository

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{DbPool, parse_datetime};
use crate::{Error, Result};

/// Something the companion learned about the user
#[derive(Debug, Clone, PartialEq)]
pub struct LearnedFact {
    pub user_id: String,
    /// Category such as `identity`, `preference` or `family`
    pub fact_type: String,
    pub key: String,
    pub value: String,
    pub confidence: f32,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

impl LearnedFact {
    /// A fact learned from conversation
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        fact_type: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            fact_type: fact_type.into(),
            key: key.into(),
            value: value.into(),
            confidence: 1.0,
            source: "conversation".to_string(),
            updated_at: Utc::now(),
        }
    }
}

/// Learned fact repository
#[derive(Clone)]
pub struct FactRepo {
    pool: DbPool,
}

impl FactRepo {
    /// Create a new fact repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a fact or replace the value stored under its (user, type, key)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn upsert(&self, fact: &LearnedFact) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO learned_facts
                (id, user_id, fact_type, key, value, confidence, source, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(user_id, fact_type, key) DO UPDATE SET
                value = excluded.value,
                confidence = excluded.confidence,
                source = excluded.source,
                updated_at = excluded.updated_at",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                fact.user_id,
                fact.fact_type,
                fact.key,
                fact.value,
                f64::from(fact.confidence),
                fact.source,
                now,
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// All facts for a user, ordered by type then key
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, user_id: &str) -> Result<Vec<LearnedFact>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT user_id, fact_type, key, value, confidence, source, updated_at
                 FROM learned_facts WHERE user_id = ?1
                 ORDER BY fact_type, key",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        #[allow(clippy::cast_possible_truncation)]
        let facts = stmt
            .query_map([user_id], |row| {
                Ok(LearnedFact {
                    user_id: row.get(0)?,
                    fact_type: row.get(1)?,
                    key: row.get(2)?,
                    value: row.get(3)?,
                    confidence: row.get::<_, f64>(4)? as f32,
                    source: row.get(5)?,
                    updated_at: parse_datetime(&row.get::<_, String>(6)?),
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> FactRepo {
        let pool = init_memory().unwrap();
        FactRepo::new(pool)
    }

    #[test]
    fn test_upsert_replaces_value() {
        let repo = setup();

        repo.upsert(&LearnedFact::new("user-001", "preference", "likes", "gardening"))
            .unwrap();
        repo.upsert(&LearnedFact::new("user-001", "preference", "likes", "jigsaw puzzles"))
            .unwrap();

        let facts = repo.list("user-001").unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, "jigsaw puzzles");
    }

    #[test]
    fn test_list_is_ordered() {
        let repo = setup();

        repo.upsert(&LearnedFact::new("user-001", "preference", "likes", "tea"))
            .unwrap();
        repo.upsert(&LearnedFact::new("user-001", "family", "daughter", "Anne"))
            .unwrap();
        repo.upsert(&LearnedFact::new("user-001", "family", "cat", "Whiskers"))
            .unwrap();
        repo.upsert(&LearnedFact::new("user-002", "family", "son", "Tom"))
            .unwrap();

        let keys: Vec<_> = repo
            .list("user-001")
            .unwrap()
            .into_iter()
            .map(|f| (f.fact_type, f.key))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("family".to_string(), "cat".to_string()),
                ("family".to_string(), "daughter".to_string()),
                ("preference".to_string(), "likes".to_string()),
            ]
        );
    }
}
