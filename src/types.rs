//! Core types for the sync layer.

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Seconds since Unix epoch, as stored in the remote documents.
pub type UnixTime = i64;

/// Read a timestamp stored either as an integer or as a float (truncated).
pub(crate) fn coerce_time(value: &Value) -> Option<UnixTime> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|secs| secs.trunc() as UnixTime))
}

fn deserialize_time<'de, D>(deserializer: D) -> std::result::Result<UnixTime, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    coerce_time(&value)
        .ok_or_else(|| de::Error::custom(format!("expected a timestamp, found {value}")))
}

/// A remote collection (or single document) the sync layer keeps live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Locations,
    Users,
    Feats,
    /// Global pointer document naming the live year.
    ActiveYear,
    /// The chosen year's own properties document.
    YearProperties,
    /// Global collection listing every year that exists.
    AvailableYears,
}

impl Collection {
    /// Every monitored collection, in the order subscriptions are opened.
    pub const ALL: [Collection; 6] = [
        Collection::Locations,
        Collection::Users,
        Collection::Feats,
        Collection::ActiveYear,
        Collection::YearProperties,
        Collection::AvailableYears,
    ];

    /// Whether the collection lives under a specific year.
    pub fn is_year_scoped(self) -> bool {
        !matches!(self, Collection::ActiveYear | Collection::AvailableYears)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Locations => "locations",
            Collection::Users => "users",
            Collection::Feats => "feats",
            Collection::ActiveYear => "active_year",
            Collection::YearProperties => "year_properties",
            Collection::AvailableYears => "available_years",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a user account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Member,
    Team,
    Admin,
}

/// A participant (person or team) with accumulated points.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub user_type: UserType,
    pub points: i64,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.user_type == UserType::Admin
    }
}

/// A logged achievement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feat {
    pub id: String,
    /// Id of the user who logged the feat.
    pub user: String,
    #[serde(deserialize_with = "deserialize_time")]
    pub date: UnixTime,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
}

/// Free-form event information shown on the year's home page.
///
/// Only these fields are carried over from the properties document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearInfo {
    pub what: Option<String>,
    pub why: Option<String>,
    pub when: Option<String>,
    #[serde(rename = "where")]
    pub where_: Option<String>,
    pub start: Option<String>,
    pub finish: Option<String>,
    pub registration: Option<String>,
    pub details: Option<String>,
    pub important: Option<String>,
}

/// Timing and metadata for one year.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearProperties {
    pub start_date: Option<UnixTime>,
    pub realtime_cutoff_time: Option<UnixTime>,
    pub finished: Option<bool>,
    pub info: YearInfo,
}

/// An authenticated session, as persisted between runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user: User,
    /// Year the token was issued for.
    #[serde(default)]
    pub year: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// One remote document: its key plus loosely-typed fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            data,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

/// A full point-in-time materialization delivered by a live subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum Snapshot {
    /// Every document currently in a collection, in source order.
    Documents(Vec<Document>),
    /// A single document, `None` if it does not exist.
    Document(Option<Document>),
}

/// Everything consumers read. Replaced field-group by field-group through
/// [`crate::Action`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AppState {
    pub user: Option<User>,
    pub active_year: Option<String>,
    /// Newest first.
    pub available_years: Vec<String>,
    /// Case-insensitive name order.
    pub locations: Vec<Location>,
    /// Highest points first.
    pub users: Vec<User>,
    /// Newest first, embargo applied for the current viewer.
    pub feats: Vec<Feat>,
    pub chosen_year: Option<String>,
    pub start_date: Option<UnixTime>,
    pub realtime_cutoff_time: Option<UnixTime>,
    pub finished: bool,
    pub info: YearInfo,
}
