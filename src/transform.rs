//! Snapshot transformation.
//!
//! Pure functions turning a raw [`Snapshot`] into the sorted, filtered lists
//! kept in [`AppState`]. Nothing here touches the store; callers read the
//! viewer/cutoff context first and pass it in.
//!
//! Malformed collection documents are skipped with a warning instead of
//! failing the whole snapshot. Optional scalar fields that are missing or of
//! the wrong type come through as `None`.

use crate::error::SyncError;
use crate::types::{
    coerce_time, AppState, Collection, Document, Feat, Location, Snapshot, UnixTime, User,
    YearInfo, YearProperties,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

/// Who is looking at the feats, and under which embargo.
#[derive(Clone, Copy, Debug, Default)]
pub struct FeatVisibility<'a> {
    pub cutoff: Option<UnixTime>,
    pub finished: bool,
    pub viewer: Option<&'a User>,
}

impl<'a> FeatVisibility<'a> {
    /// Build the visibility context from the current store contents.
    pub fn from_state(state: &'a AppState) -> Self {
        Self {
            cutoff: state.realtime_cutoff_time,
            finished: state.finished,
            viewer: state.user.as_ref(),
        }
    }

    /// Whether `feat` may be shown.
    ///
    /// Feats dated after the cutoff stay hidden until the year is finished,
    /// except from their author and from admins. Without a cutoff nothing is
    /// public before the year finishes.
    pub fn allows(&self, feat: &Feat) -> bool {
        let public = self.finished || self.cutoff.map_or(false, |cutoff| feat.date <= cutoff);
        public
            || self
                .viewer
                .map_or(false, |viewer| feat.user == viewer.id || viewer.is_admin())
    }
}

/// Locations ordered by case-insensitive name. Ties keep source order.
pub fn locations(snapshot: &Snapshot) -> Vec<Location> {
    let mut locations: Vec<Location> = parse_documents(snapshot, Collection::Locations);
    locations.sort_by_cached_key(|location| location.name.to_lowercase());
    locations
}

/// Users ordered by points, highest first. Ties keep source order.
pub fn users(snapshot: &Snapshot) -> Vec<User> {
    let mut users: Vec<User> = parse_documents(snapshot, Collection::Users);
    users.sort_by(|a, b| b.points.cmp(&a.points));
    users
}

/// Feats ordered newest first, then filtered for `visibility`.
pub fn feats(snapshot: &Snapshot, visibility: &FeatVisibility<'_>) -> Vec<Feat> {
    let mut feats: Vec<Feat> = parse_documents(snapshot, Collection::Feats);
    feats.sort_by(|a, b| b.date.cmp(&a.date));
    filter_visible(feats, visibility)
}

/// Drop every feat `visibility` does not allow. Order is preserved.
pub fn filter_visible(mut feats: Vec<Feat>, visibility: &FeatVisibility<'_>) -> Vec<Feat> {
    feats.retain(|feat| visibility.allows(feat));
    feats
}

/// The live year named by the active-year document.
pub fn active_year(snapshot: &Snapshot) -> Option<String> {
    let doc = single_document(snapshot)?;
    let year = doc.get("activeYear").and_then(coerce_string);
    if year.is_none() {
        report_malformed(Collection::ActiveYear, &doc.id, "missing activeYear");
    }
    year
}

/// Timing and whitelisted info fields from a year's properties document.
pub fn year_properties(snapshot: &Snapshot) -> Option<YearProperties> {
    let doc = single_document(snapshot)?;

    let text = |field: &str| doc.get(field).and_then(coerce_string);

    Some(YearProperties {
        start_date: doc.get("startDate").and_then(coerce_time),
        realtime_cutoff_time: doc.get("realtimeCutoffTime").and_then(coerce_time),
        finished: doc.get("finished").and_then(Value::as_bool),
        info: YearInfo {
            what: text("what"),
            why: text("why"),
            when: text("when"),
            where_: text("where"),
            start: text("start"),
            finish: text("finish"),
            registration: text("registration"),
            details: text("details"),
            important: text("important"),
        },
    })
}

/// Years newest first.
///
/// The years collection is stored oldest first, so the source order is
/// reversed rather than sorted.
pub fn available_years(snapshot: &Snapshot) -> Vec<String> {
    let mut years: Vec<String> = documents(snapshot)
        .iter()
        .filter_map(|doc| {
            let year = doc.get("year").and_then(coerce_string);
            if year.is_none() {
                report_malformed(Collection::AvailableYears, &doc.id, "missing year");
            }
            year
        })
        .collect();
    years.reverse();
    years
}

fn documents(snapshot: &Snapshot) -> &[Document] {
    match snapshot {
        Snapshot::Documents(docs) => docs,
        Snapshot::Document(Some(doc)) => std::slice::from_ref(doc),
        Snapshot::Document(None) => &[],
    }
}

fn single_document(snapshot: &Snapshot) -> Option<&Document> {
    match snapshot {
        Snapshot::Document(doc) => doc.as_ref(),
        Snapshot::Documents(docs) => docs.first(),
    }
}

/// Deserialize every document of a collection, skipping the ones that do not
/// fit the schema. A missing `id` field is filled from the document key.
fn parse_documents<T: DeserializeOwned>(snapshot: &Snapshot, collection: Collection) -> Vec<T> {
    documents(snapshot)
        .iter()
        .filter_map(|doc| {
            let mut data = doc.data.clone();
            data.entry("id")
                .or_insert_with(|| Value::String(doc.id.clone()));
            match serde_json::from_value(Value::Object(data)) {
                Ok(item) => Some(item),
                Err(e) => {
                    report_malformed(collection, &doc.id, &e.to_string());
                    None
                }
            }
        })
        .collect()
}

fn report_malformed(collection: Collection, doc_id: &str, reason: &str) {
    let err = SyncError::MalformedData {
        collection,
        reason: format!("document {doc_id}: {reason}"),
    };
    warn!(%collection, "{err}");
}

fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
