//! Core record model for design-review projects.

use std::fmt;
use std::str::FromStr;

use chrono::{Local, NaiveDate};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub const CRATE_NAME: &str = "drw-core";

/// Date format used by the feed and by persisted batches.
pub const US_DATE_FORMAT: &str = "%m/%d/%Y";

/// Calendar date rendered as `MM/DD/YYYY`, ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsDate(NaiveDate);

impl UsDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn today() -> Self {
        Self(Local::now().date_naive())
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }
}

impl FromStr for UsDate {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), US_DATE_FORMAT).map(Self)
    }
}

impl fmt::Display for UsDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(US_DATE_FORMAT))
    }
}

impl Serialize for UsDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UsDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|e| de::Error::custom(format!("invalid MM/DD/YYYY date {raw:?}: {e}")))
    }
}

/// Fields taken from a single feed item. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectIdentity {
    pub title: String,
    pub published_date: UsDate,
    pub project_review_date: String,
    pub design_review_link: String,
    pub review_board: String,
    pub meeting_details: String,
    pub found_date: UsDate,
}

/// Values scraped from a project's detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalDetails {
    pub description: String,
    pub address: String,
    pub project_num: String,
    pub design_proposal_link: Option<String>,
    pub report_link: Option<String>,
    pub past_reviews_link: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Geocoding state as recorded on a project.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeoState {
    /// No geocode has been attempted; the fields are absent.
    Unresolved,
    /// A geocode was attempted and produced nulls.
    Failed,
    Resolved(GeoPoint),
}

/// A design-review project, accumulated stage by stage.
///
/// Enrichment setters only fill empty fields. Latitude and longitude are
/// tri-state: absent (never attempted), `null` (attempted, failed), or a
/// number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    #[serde(flatten)]
    identity: ProjectIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    project_num: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    design_proposal_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    report_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    past_reviews_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    latitude: Option<Option<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "nullable")]
    longitude: Option<Option<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dpimage_url: Option<String>,
}

impl ProjectRecord {
    pub fn new(identity: ProjectIdentity) -> Self {
        Self {
            identity,
            address: None,
            description: None,
            project_num: None,
            design_proposal_link: None,
            report_link: None,
            past_reviews_link: None,
            latitude: None,
            longitude: None,
            dpimage_url: None,
        }
    }

    pub fn identity(&self) -> &ProjectIdentity {
        &self.identity
    }

    pub fn title(&self) -> &str {
        &self.identity.title
    }

    pub fn published_date(&self) -> UsDate {
        self.identity.published_date
    }

    pub fn design_review_link(&self) -> &str {
        &self.identity.design_review_link
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn project_num(&self) -> Option<&str> {
        self.project_num.as_deref()
    }

    pub fn design_proposal_link(&self) -> Option<&str> {
        self.design_proposal_link.as_deref()
    }

    pub fn report_link(&self) -> Option<&str> {
        self.report_link.as_deref()
    }

    pub fn past_reviews_link(&self) -> Option<&str> {
        self.past_reviews_link.as_deref()
    }

    pub fn dpimage_url(&self) -> Option<&str> {
        self.dpimage_url.as_deref()
    }

    pub fn has_enrichment(&self) -> bool {
        self.address.is_some()
            || self.description.is_some()
            || self.project_num.is_some()
            || self.design_proposal_link.is_some()
            || self.report_link.is_some()
            || self.past_reviews_link.is_some()
    }

    /// Fill enrichment fields that are still empty. Returns how many were set.
    pub fn apply_details(&mut self, details: ProposalDetails) -> usize {
        let mut filled = 0;
        filled += fill_empty(&mut self.description, Some(details.description));
        filled += fill_empty(&mut self.address, Some(details.address));
        filled += fill_empty(&mut self.project_num, Some(details.project_num));
        filled += fill_empty(&mut self.design_proposal_link, details.design_proposal_link);
        filled += fill_empty(&mut self.report_link, details.report_link);
        filled += fill_empty(&mut self.past_reviews_link, details.past_reviews_link);
        filled
    }

    pub fn geo_state(&self) -> GeoState {
        match (self.latitude, self.longitude) {
            (None, _) => GeoState::Unresolved,
            (Some(Some(latitude)), Some(Some(longitude))) => {
                GeoState::Resolved(GeoPoint::new(latitude, longitude))
            }
            _ => GeoState::Failed,
        }
    }

    pub fn latitude(&self) -> Option<f64> {
        self.latitude.flatten()
    }

    pub fn longitude(&self) -> Option<f64> {
        self.longitude.flatten()
    }

    /// Backfill retries anything without a numeric latitude.
    pub fn needs_geo_backfill(&self) -> bool {
        !matches!(self.latitude, Some(Some(_)))
    }

    /// Record the outcome of a first geocode attempt. A failed attempt is
    /// stored as nulls. No-op once coordinates exist.
    pub fn record_geocode(&mut self, point: Option<GeoPoint>) -> bool {
        if matches!(self.geo_state(), GeoState::Resolved(_)) {
            return false;
        }
        self.latitude = Some(point.map(|p| p.latitude));
        self.longitude = Some(point.map(|p| p.longitude));
        true
    }

    pub fn set_image_url(&mut self, url: String) -> bool {
        fill_empty(&mut self.dpimage_url, Some(url)) == 1
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            project_num: self.project_num.clone(),
            address: self.address.clone(),
            description: self.description.clone(),
            design_review_link: self.identity.design_review_link.clone(),
        }
    }
}

fn fill_empty<T>(slot: &mut Option<T>, value: Option<T>) -> usize {
    match (slot.as_ref(), value) {
        (None, Some(value)) => {
            *slot = Some(value);
            1
        }
        _ => 0,
    }
}

/// Storage uniqueness tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub project_num: Option<String>,
    pub address: Option<String>,
    pub description: Option<String>,
    pub design_review_link: String,
}

impl DedupKey {
    /// Unambiguous single-string form, suitable for hashing.
    pub fn canonical_string(&self) -> String {
        fn part(value: Option<&str>) -> String {
            match value {
                Some(v) => format!("s{}:{}", v.len(), v),
                None => "n".to_string(),
            }
        }
        [
            part(self.project_num.as_deref()),
            part(self.address.as_deref()),
            part(self.description.as_deref()),
            part(Some(&self.design_review_link)),
        ]
        .join("|")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMeta {
    pub last_pub_date: Option<UsDate>,
    pub last_run_date: UsDate,
}

/// On-disk batch: `{ meta: {...}, data: [...] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectBatch {
    pub meta: BatchMeta,
    pub data: Vec<ProjectRecord>,
}

impl ProjectBatch {
    pub fn package(data: Vec<ProjectRecord>, run_date: UsDate) -> Self {
        Self {
            meta: BatchMeta {
                last_pub_date: latest_published(&data),
                last_run_date: run_date,
            },
            data,
        }
    }

    pub fn append(&mut self, records: Vec<ProjectRecord>, run_date: UsDate) {
        self.data.extend(records);
        self.meta.last_pub_date = latest_published(&self.data);
        self.meta.last_run_date = run_date;
    }
}

/// Either a packaged batch or a bare list of records.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BatchContents {
    Packaged(ProjectBatch),
    Bare(Vec<ProjectRecord>),
}

impl BatchContents {
    pub fn into_records(self) -> Vec<ProjectRecord> {
        match self {
            Self::Packaged(batch) => batch.data,
            Self::Bare(records) => records,
        }
    }

    /// Bare arrays are packaged with meta computed from their records.
    pub fn into_batch(self, run_date: UsDate) -> ProjectBatch {
        match self {
            Self::Packaged(batch) => batch,
            Self::Bare(records) => ProjectBatch::package(records, run_date),
        }
    }
}

pub fn latest_published(records: &[ProjectRecord]) -> Option<UsDate> {
    records.iter().map(ProjectRecord::published_date).max()
}

mod nullable {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Option<f64>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Option<f64>>, D::Error> {
        Option::<f64>::deserialize(deserializer).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(published: &str) -> ProjectIdentity {
        ProjectIdentity {
            title: "03/20/2024 - 1600 Dexter Ave N".into(),
            published_date: published.parse().unwrap(),
            project_review_date: "03/20/2024".into(),
            design_review_link: "http://web6.seattle.gov/dpd/Detail.aspx?id=3030000".into(),
            review_board: "West Design Review Board".into(),
            meeting_details: "6:30 pm, Queen Anne Community Center".into(),
            found_date: "03/02/2024".parse().unwrap(),
        }
    }

    fn details() -> ProposalDetails {
        ProposalDetails {
            description: "Seven-story apartment building".into(),
            address: "1600 Dexter Ave N".into(),
            project_num: "3030000".into(),
            design_proposal_link: Some("http://example.org/proposal.pdf".into()),
            report_link: None,
            past_reviews_link: None,
        }
    }

    #[test]
    fn us_date_orders_across_year_boundary() {
        let dec: UsDate = "12/31/2023".parse().unwrap();
        let jan: UsDate = "01/05/2024".parse().unwrap();
        assert!(jan > dec);
        assert_eq!(dec.to_string(), "12/31/2023");
    }

    #[test]
    fn us_date_rejects_other_formats() {
        assert!("2024-03-01".parse::<UsDate>().is_err());
        assert!("".parse::<UsDate>().is_err());
    }

    #[test]
    fn geo_fields_distinguish_absent_from_null() {
        let mut record = ProjectRecord::new(identity("03/01/2024"));
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("latitude").is_none());
        assert_eq!(record.geo_state(), GeoState::Unresolved);

        record.record_geocode(None);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("latitude").unwrap().is_null());
        assert_eq!(record.geo_state(), GeoState::Failed);

        let back: ProjectRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.geo_state(), GeoState::Failed);
        assert!(back.needs_geo_backfill());
    }

    #[test]
    fn record_geocode_does_not_replace_coordinates() {
        let mut record = ProjectRecord::new(identity("03/01/2024"));
        assert!(record.record_geocode(Some(GeoPoint::new(47.6, -122.3))));
        assert!(!record.record_geocode(None));
        assert_eq!(record.latitude(), Some(47.6));
        assert!(!record.needs_geo_backfill());
    }

    #[test]
    fn apply_details_only_fills_empty_fields() {
        let mut record = ProjectRecord::new(identity("03/01/2024"));
        assert_eq!(record.apply_details(details()), 4);

        let mut other = details();
        other.address = "somewhere else".into();
        other.report_link = Some("http://example.org/report.pdf".into());
        assert_eq!(record.apply_details(other), 1);
        assert_eq!(record.address(), Some("1600 Dexter Ave N"));
        assert_eq!(record.report_link(), Some("http://example.org/report.pdf"));
    }

    #[test]
    fn record_json_uses_flat_field_names() {
        let mut record = ProjectRecord::new(identity("03/01/2024"));
        record.apply_details(details());
        record.set_image_url("https://s3-us-west-2.amazonaws.com/builtby/a.png".into());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["published_date"], "03/01/2024");
        assert_eq!(json["project_num"], "3030000");
        assert_eq!(json["dpimage_url"], "https://s3-us-west-2.amazonaws.com/builtby/a.png");
        assert!(json.get("past_reviews_link").is_none());

        let back: ProjectRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn stored_documents_with_foreign_keys_still_load() {
        let json = serde_json::json!({
            "_id": {"$oid": "5b0b0b0b0b0b0b0b0b0b0b0b"},
            "title": "03/20/2024 - 1600 Dexter Ave N",
            "published_date": "03/01/2024",
            "project_review_date": "03/20/2024",
            "design_review_link": "http://web6.seattle.gov/dpd/Detail.aspx?id=3030000",
            "review_board": "West Design Review Board",
            "meeting_details": "6:30 pm",
            "found_date": "03/02/2024",
            "latitude": 47.63,
            "longitude": -122.34
        });
        let record: ProjectRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.geo_state(), GeoState::Resolved(GeoPoint::new(47.63, -122.34)));
    }

    #[test]
    fn dedup_key_canonical_string_is_unambiguous() {
        let a = DedupKey {
            project_num: Some("1|2".into()),
            address: None,
            description: None,
            design_review_link: "x".into(),
        };
        let b = DedupKey {
            project_num: Some("1".into()),
            address: Some("2".into()),
            description: None,
            design_review_link: "x".into(),
        };
        assert_ne!(a.canonical_string(), b.canonical_string());
    }

    #[test]
    fn batch_meta_tracks_latest_published_date() {
        let run: UsDate = "03/20/2024".parse().unwrap();
        let mut batch = ProjectBatch::package(
            vec![
                ProjectRecord::new(identity("12/31/2023")),
                ProjectRecord::new(identity("01/05/2024")),
            ],
            run,
        );
        assert_eq!(batch.meta.last_pub_date.unwrap().to_string(), "01/05/2024");

        batch.append(vec![ProjectRecord::new(identity("03/15/2024"))], run);
        assert_eq!(batch.meta.last_pub_date.unwrap().to_string(), "03/15/2024");
        assert_eq!(batch.data.len(), 3);

        let empty = ProjectBatch::package(Vec::new(), run);
        assert!(empty.meta.last_pub_date.is_none());
    }

    #[test]
    fn batch_contents_accepts_bare_arrays() {
        let records = vec![ProjectRecord::new(identity("03/01/2024"))];
        let bare = serde_json::to_string(&records).unwrap();
        let parsed: BatchContents = serde_json::from_str(&bare).unwrap();
        assert_eq!(parsed.into_records().len(), 1);

        let packaged = serde_json::to_string(&ProjectBatch::package(records, UsDate::today())).unwrap();
        let parsed: BatchContents = serde_json::from_str(&packaged).unwrap();
        assert!(matches!(parsed, BatchContents::Packaged(_)));
    }
}
