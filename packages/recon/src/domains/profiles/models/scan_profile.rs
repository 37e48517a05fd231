use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use typed_builder::TypedBuilder;

use crate::common::{StoreResult, ValidationError};
use crate::domains::scans::models::SCAN_TYPES;
use crate::domains::scans::targets::parse_ports;

/// Used when no other profile scores above zero for a host.
pub const DEFAULT_PROFILE_ID: &str = "generic-default";

const OS_MATCH_SCORE: i32 = 50;
const GENERIC_SCORE: i32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScanProfile {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// OS families this profile is written for; empty means any host.
    pub os_family: Vec<String>,
    pub ports: String,
    pub scan_type: String,
    pub priority: i32,
    /// Shipped with the schema and never deleted.
    pub built_in: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewScanProfile {
    pub id: String,
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
    #[builder(default)]
    pub os_family: Vec<String>,
    pub ports: String,
    #[builder(default = "connect".to_string())]
    pub scan_type: String,
    #[builder(default)]
    pub priority: i32,
}

impl NewScanProfile {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let id_ok = self
            .id
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !id_ok {
            return Err(ValidationError::new(format!(
                "profile id '{}' must be lowercase letters, digits, '-' or '_'",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("profile name must not be empty"));
        }
        parse_ports(&self.ports)?;
        if !SCAN_TYPES.contains(&self.scan_type.as_str()) {
            return Err(ValidationError::new(format!(
                "unknown scan type '{}'",
                self.scan_type
            )));
        }
        Ok(())
    }
}

impl ScanProfile {
    pub fn is_generic(&self) -> bool {
        self.os_family.is_empty()
    }

    fn matches_family(&self, family: &str) -> bool {
        self.os_family.iter().any(|f| f.eq_ignore_ascii_case(family))
    }

    /// How well this profile fits a host. Without OS information only
    /// generic profiles score; with it, a family match dominates and
    /// priority breaks ties.
    pub fn score(&self, os_family: Option<&str>) -> i32 {
        match os_family {
            None => {
                if self.is_generic() {
                    GENERIC_SCORE
                } else {
                    0
                }
            }
            Some(family) => {
                let matched = if self.matches_family(family) {
                    OS_MATCH_SCORE
                } else {
                    0
                };
                matched + self.priority
            }
        }
    }

    /// Picks the best profile for a host of `os_family` from `profiles`.
    ///
    /// Profiles for some other family are never chosen. Ties go to the
    /// earlier profile, so callers pass them in priority order. Falls back
    /// to [`DEFAULT_PROFILE_ID`] when nothing scores above zero.
    pub fn select_best<'a>(
        profiles: &'a [ScanProfile],
        os_family: Option<&str>,
    ) -> Option<&'a ScanProfile> {
        let os_family = os_family.map(str::trim).filter(|f| !f.is_empty());
        let mut best: Option<(&ScanProfile, i32)> = None;
        for profile in profiles {
            if let Some(family) = os_family {
                if !profile.is_generic() && !profile.matches_family(family) {
                    continue;
                }
            }
            let score = profile.score(os_family);
            if score > best.map_or(0, |(_, s)| s) {
                best = Some((profile, score));
            }
        }
        best.map(|(p, _)| p)
            .or_else(|| profiles.iter().find(|p| p.id == DEFAULT_PROFILE_ID))
    }

    pub async fn insert(new: &NewScanProfile, pool: &PgPool) -> StoreResult<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO scan_profiles (id, name, description, os_family, ports, scan_type, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(&new.id)
        .bind(new.name.trim())
        .bind(&new.description)
        .bind(&new.os_family)
        .bind(&new.ports)
        .bind(&new.scan_type)
        .bind(new.priority)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id<'e>(id: &str, executor: impl PgExecutor<'e>) -> StoreResult<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM scan_profiles WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
            .map_err(Into::into)
    }

    /// All profiles, highest priority first.
    pub async fn list(pool: &PgPool) -> StoreResult<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM scan_profiles ORDER BY priority DESC, name, id")
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    /// Removes a custom profile. Built-in profiles are left alone and
    /// report `false`.
    pub async fn delete(id: &str, pool: &PgPool) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM scan_profiles WHERE id = $1 AND NOT built_in")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
