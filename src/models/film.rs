use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==================================================================================================
// Movie metadata, as stored in the `movies` collection
// ==================================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movie {
    /// IMDb identifier, e.g. `tt0133093`
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poster_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub genres: Vec<String>,
}

// ==================================================================================================
// Watchlist membership
// ==================================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRecord {
    pub movie_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poster_url: Option<String>,
    /// Set by the privileged process when the record is stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_at: Option<DateTime<Utc>>,
}

impl MembershipRecord {
    pub fn new(movie_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            movie_id: movie_id.into(),
            title: title.into(),
            year: None,
            poster_url: None,
            added_at: None,
        }
    }
}

// ==================================================================================================
// Ratings
// ==================================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub movie_id: String,
    pub title: String,
    /// 0.0 to 10.0
    pub rating: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Highest accepted rating value
pub const MAX_RATING: f64 = 10.0;
