//! User profile and care plan repository

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DbPool, parse_datetime};
use crate::{Error, Result};

/// Name used until the user tells us theirs
pub const DEFAULT_NAME: &str = "Friend";

/// The person the companion talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub name: String,
    pub preferred_name: Option<String>,
    pub timezone: Option<String>,
    pub preferences: BTreeMap<String, String>,
    /// Free-form personal details (hometown, family, interests...)
    pub life_details: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    /// A fresh profile with the default name
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            name: DEFAULT_NAME.to_string(),
            preferred_name: None,
            timezone: None,
            preferences: BTreeMap::new(),
            life_details: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// How the companion addresses the user
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.preferred_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.name)
    }
}

/// A medication and the times (HH:MM) it is taken
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medication {
    pub name: String,
    #[serde(default)]
    pub dosage: Option<String>,
    #[serde(default)]
    pub times: Vec<String>,
}

/// A daily routine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routine {
    pub name: String,
    #[serde(default)]
    pub time: Option<String>,
}

/// Someone to call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    #[serde(default)]
    pub relationship: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Care plan for a user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarePlan {
    pub user_id: String,
    pub medications: Vec<Medication>,
    pub routines: Vec<Routine>,
    pub contacts: Vec<Contact>,
}

impl CarePlan {
    /// Every scheduled medication time
    #[must_use]
    pub fn medication_times(&self) -> Vec<String> {
        self.medications
            .iter()
            .flat_map(|m| m.times.iter().cloned())
            .collect()
    }

    /// Whether there is anything to mention
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.medications.is_empty() && self.routines.is_empty() && self.contacts.is_empty()
    }
}

/// Profile and care plan repository
#[derive(Clone)]
pub struct ProfileRepo {
    pool: DbPool,
}

impl ProfileRepo {
    /// Create a new profile repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Find or create a profile
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_or_create(&self, user_id: &str) -> Result<UserProfile> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let existing = conn
            .query_row(
                "SELECT user_id, name, preferred_name, timezone, preferences, life_details,
                        created_at, updated_at
                 FROM user_profiles WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok(UserProfile {
                        user_id: row.get(0)?,
                        name: row.get(1)?,
                        preferred_name: row.get(2)?,
                        timezone: row.get(3)?,
                        preferences: parse_map(&row.get::<_, String>(4)?),
                        life_details: parse_map(&row.get::<_, String>(5)?),
                        created_at: parse_datetime(&row.get::<_, String>(6)?),
                        updated_at: parse_datetime(&row.get::<_, String>(7)?),
                    })
                },
            )
            .ok();

        if let Some(profile) = existing {
            return Ok(profile);
        }

        let now = Utc::now();
        let now_str = now.to_rfc3339();
        conn.execute(
            "INSERT INTO user_profiles (user_id, name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            [user_id, DEFAULT_NAME, &now_str],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tracing::debug!(user_id, "created user profile");

        Ok(UserProfile {
            created_at: now,
            updated_at: now,
            ..UserProfile::new(user_id)
        })
    }

    /// Save a profile's editable fields
    ///
    /// # Errors
    ///
    /// Returns error if the profile does not exist or the update fails
    pub fn update(&self, profile: &UserProfile) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let preferences = serde_json::to_string(&profile.preferences)?;
        let life_details = serde_json::to_string(&profile.life_details)?;

        let updated = conn
            .execute(
                "UPDATE user_profiles
                 SET name = ?1, preferred_name = ?2, timezone = ?3, preferences = ?4,
                     life_details = ?5, updated_at = ?6
                 WHERE user_id = ?7",
                rusqlite::params![
                    profile.name,
                    profile.preferred_name,
                    profile.timezone,
                    preferences,
                    life_details,
                    Utc::now().to_rfc3339(),
                    profile.user_id,
                ],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if updated == 0 {
            return Err(Error::NotFound(format!("user profile {}", profile.user_id)));
        }
        Ok(())
    }

    /// Read a user's care plan; an empty plan if none is stored
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails or stored JSON is invalid
    pub fn care_plan(&self, user_id: &str) -> Result<CarePlan> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let row = conn
            .query_row(
                "SELECT medications, routines, contacts FROM care_plans WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .ok();

        let Some((medications, routines, contacts)) = row else {
            return Ok(CarePlan {
                user_id: user_id.to_string(),
                ..CarePlan::default()
            });
        };

        Ok(CarePlan {
            user_id: user_id.to_string(),
            medications: serde_json::from_str(&medications)?,
            routines: serde_json::from_str(&routines)?,
            contacts: serde_json::from_str(&contacts)?,
        })
    }

    /// Store a care plan, replacing any previous one
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_care_plan(&self, plan: &CarePlan) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO care_plans (user_id, medications, routines, contacts, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                medications = excluded.medications,
                routines = excluded.routines,
                contacts = excluded.contacts,
                updated_at = excluded.updated_at",
            rusqlite::params![
                plan.user_id,
                serde_json::to_string(&plan.medications)?,
                serde_json::to_string(&plan.routines)?,
                serde_json::to_string(&plan.contacts)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}

fn parse_map(s: &str) -> BTreeMap<String, String> {
    serde_json::from_str(s).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> ProfileRepo {
        let pool = init_memory().unwrap();
        ProfileRepo::new(pool)
    }

    #[test]
    fn test_get_or_create_profile() {
        let repo = setup();

        let profile = repo.get_or_create("user-001").unwrap();
        assert_eq!(profile.name, DEFAULT_NAME);
        assert_eq!(profile.display_name(), "Friend");

        // Should return same profile
        let again = repo.get_or_create("user-001").unwrap();
        assert_eq!(again.user_id, profile.user_id);
    }

    #[test]
    fn test_update_profile() {
        let repo = setup();

        let mut profile = repo.get_or_create("user-001").unwrap();
        profile.name = "Margaret".to_string();
        profile.preferred_name = Some("Maggie".to_string());
        profile
            .life_details
            .insert("hometown".to_string(), "Dublin".to_string());
        repo.update(&profile).unwrap();

        let stored = repo.get_or_create("user-001").unwrap();
        assert_eq!(stored.display_name(), "Maggie");
        assert_eq!(stored.life_details.get("hometown").unwrap(), "Dublin");
    }

    #[test]
    fn test_update_missing_profile() {
        let repo = setup();
        let mut profile = repo.get_or_create("user-001").unwrap();
        profile.user_id = "nobody".to_string();
        assert!(matches!(repo.update(&profile), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_care_plan_roundtrip() {
        let repo = setup();

        let empty = repo.care_plan("user-001").unwrap();
        assert!(empty.is_empty());

        let plan = CarePlan {
            user_id: "user-001".to_string(),
            medications: vec![Medication {
                name: "Lisinopril".to_string(),
                dosage: Some("10mg".to_string()),
                times: vec!["08:00".to_string(), "20:00".to_string()],
            }],
            routines: vec![Routine {
                name: "Morning walk".to_string(),
                time: Some("09:30".to_string()),
            }],
            contacts: vec![],
        };
        repo.set_care_plan(&plan).unwrap();

        let stored = repo.care_plan("user-001").unwrap();
        assert_eq!(stored, plan);
        assert_eq!(stored.medication_times(), vec!["08:00", "20:00"]);
    }
}
