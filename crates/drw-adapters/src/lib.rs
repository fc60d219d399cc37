//! Feed, detail-page and external-service adapters for design-review watch.

use async_trait::async_trait;
use drw_core::{GeoPoint, ProjectIdentity, ProjectRecord, ProposalDetails, UsDate};
use drw_storage::{FetchError, PageSource};
use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "drw-adapters";

pub const DEFAULT_FEED_URL: &str =
    "http://www.seattle.gov/DPD/aboutus/news/events/DesignReview/upcomingreviews/RSS.aspx";

/// Separator used in feed titles and descriptions.
pub const FIELD_SEPARATOR: &str = " - ";

/// Detail links are truncated here to find the past-reviews base URL.
pub const DETAIL_PATH_MARKER: &str = "/Detail";

const SEL_DESCRIPTION: &str = "div#dvDataFound p span#lblDescription";
const SEL_ADDRESS: &str = "span#lblAddress";
const SEL_PROJECT_NUM: &str = "div span#lblProject";
const SEL_PROPOSAL: &str = "a#hypProposal";
const SEL_REPORT: &str = "a#hypReport";
const SEL_PAST_REVIEWS: &str = "a#hypPastReviews";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed feed xml: {0}")]
    Xml(String),
    #[error("feed item {index} is missing <{field}>")]
    MissingFeedField { index: usize, field: &'static str },
    #[error("feed item {index}: {reason}")]
    InvalidFeedItem { index: usize, reason: String },
    #[error("detail page has no element matching `{0}`")]
    MissingElement(&'static str),
    #[error("invalid selector `{0}`")]
    Selector(String),
    #[error("geocoder error: {0}")]
    Geocoder(String),
    #[error("image render error: {0}")]
    Render(String),
}

impl AdapterError {
    /// True when the document could not be retrieved at all.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Http(_))
    }
}

/// One `<item>` from the RSS document, before any interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub pub_date: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemField {
    Title,
    Link,
    PubDate,
    Description,
}

impl ItemField {
    fn from_name(name: &[u8]) -> Option<Self> {
        if name.eq_ignore_ascii_case(b"title") {
            Some(Self::Title)
        } else if name.eq_ignore_ascii_case(b"link") {
            Some(Self::Link)
        } else if name.eq_ignore_ascii_case(b"pubdate") {
            Some(Self::PubDate)
        } else if name.eq_ignore_ascii_case(b"description") {
            Some(Self::Description)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct PartialEntry {
    title: Option<String>,
    link: Option<String>,
    pub_date: Option<String>,
    description: Option<String>,
}

impl PartialEntry {
    fn slot(&mut self, field: ItemField) -> &mut Option<String> {
        match field {
            ItemField::Title => &mut self.title,
            ItemField::Link => &mut self.link,
            ItemField::PubDate => &mut self.pub_date,
            ItemField::Description => &mut self.description,
        }
    }

    fn push_text(&mut self, field: ItemField, text: &str) {
        self.slot(field).get_or_insert_with(String::new).push_str(text);
    }

    fn finish(self, index: usize) -> Result<FeedEntry, AdapterError> {
        let missing = |field| AdapterError::MissingFeedField { index, field };
        Ok(FeedEntry {
            title: self.title.ok_or_else(|| missing("title"))?,
            link: self.link.ok_or_else(|| missing("link"))?,
            pub_date: self.pub_date.ok_or_else(|| missing("pubDate"))?,
            description: self.description.ok_or_else(|| missing("description"))?,
        })
    }
}

/// Parse every `<item>` in an RSS document, in document order.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>, AdapterError> {
    let mut reader = Reader::from_str(xml);
    let mut entries = Vec::new();
    let mut current: Option<PartialEntry> = None;
    let mut field: Option<ItemField> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name();
                if name.as_ref().eq_ignore_ascii_case(b"item") {
                    current = Some(PartialEntry::default());
                    field = None;
                } else if let Some(entry) = current.as_mut() {
                    field = ItemField::from_name(name.as_ref());
                    if let Some(f) = field {
                        entry.slot(f).get_or_insert_with(String::new);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let (Some(entry), Some(f)) = (current.as_mut(), field) {
                    let text = e.unescape().map_err(|err| AdapterError::Xml(err.to_string()))?;
                    entry.push_text(f, &text);
                }
            }
            Ok(Event::CData(e)) => {
                if let (Some(entry), Some(f)) = (current.as_mut(), field) {
                    entry.push_text(f, &String::from_utf8_lossy(&e));
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                if name.as_ref().eq_ignore_ascii_case(b"item") {
                    if let Some(entry) = current.take() {
                        entries.push(entry.finish(entries.len())?);
                    }
                }
                field = None;
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(AdapterError::Xml(err.to_string())),
            _ => {}
        }
    }

    Ok(entries)
}

/// Build the identity fields of a project from one feed entry.
pub fn create_project(
    entry: &FeedEntry,
    index: usize,
    found_date: UsDate,
) -> Result<ProjectRecord, AdapterError> {
    let invalid = |reason: String| AdapterError::InvalidFeedItem { index, reason };

    let title = entry.title.trim().to_string();
    if title.is_empty() {
        return Err(invalid("empty title".to_string()));
    }
    let link = entry.link.trim().to_string();

    let date_token = entry
        .pub_date
        .split_whitespace()
        .next()
        .ok_or_else(|| invalid("empty pubDate".to_string()))?;
    let published_date: UsDate = date_token
        .parse()
        .map_err(|e| invalid(format!("pubDate {date_token:?} is not MM/DD/YYYY: {e}")))?;

    let project_review_date = title
        .split(FIELD_SEPARATOR)
        .next()
        .unwrap_or(title.as_str())
        .to_string();

    let review_desc = entry.description.trim();
    let (review_board, meeting_details) = review_desc
        .split_once(FIELD_SEPARATOR)
        .ok_or_else(|| invalid(format!("description {review_desc:?} has no {FIELD_SEPARATOR:?}")))?;

    Ok(ProjectRecord::new(ProjectIdentity {
        title,
        published_date,
        project_review_date,
        design_review_link: link,
        review_board: review_board.to_string(),
        meeting_details: meeting_details.to_string(),
        found_date,
    }))
}

/// Fetches the RSS feed and turns each item into a project record.
#[derive(Debug, Clone)]
pub struct FeedReader {
    feed_url: String,
}

impl FeedReader {
    pub fn new(feed_url: impl Into<String>) -> Self {
        Self {
            feed_url: feed_url.into(),
        }
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    /// All-or-nothing: one bad item fails the whole feed.
    pub async fn fetch_projects(
        &self,
        pages: &dyn PageSource,
        found_date: UsDate,
    ) -> Result<Vec<ProjectRecord>, AdapterError> {
        let response = pages.get(&self.feed_url).await?.ensure_success()?;
        let entries = parse_feed(&response.text())?;
        info!(items = entries.len(), feed = %self.feed_url, "parsed feed");
        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| create_project(entry, index, found_date))
            .collect()
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector(format!("{selector}: {e}")))
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string()))
}

fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

fn required_text(document: &Html, selector: &'static str) -> Result<String, AdapterError> {
    select_first_text(document, selector)?.ok_or(AdapterError::MissingElement(selector))
}

/// Base for relative past-review links: the detail URL cut at `/Detail`.
pub fn past_reviews_base(detail_url: &str) -> &str {
    match detail_url.find(DETAIL_PATH_MARKER) {
        Some(idx) => &detail_url[..idx],
        None => detail_url,
    }
}

pub fn resolve_past_reviews_link(detail_url: &str, href: &str) -> String {
    format!(
        "{}{}",
        past_reviews_base(detail_url),
        href.trim_start_matches('.')
    )
}

/// Extract proposal details from a loaded detail page.
pub fn parse_proposal_page(html: &str, detail_url: &str) -> Result<ProposalDetails, AdapterError> {
    let document = Html::parse_document(html);

    let description = required_text(&document, SEL_DESCRIPTION)?;
    let address = required_text(&document, SEL_ADDRESS)?;
    let project_num = required_text(&document, SEL_PROJECT_NUM)?;

    let design_proposal_link = select_first_attr(&document, SEL_PROPOSAL, "href")?;
    let report_link = select_first_attr(&document, SEL_REPORT, "href")?;
    let past_reviews_link = select_first_attr(&document, SEL_PAST_REVIEWS, "href")?
        .map(|href| resolve_past_reviews_link(detail_url, &href));

    Ok(ProposalDetails {
        description,
        address,
        project_num,
        design_proposal_link,
        report_link,
        past_reviews_link,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalOutcome {
    Enriched { fields_added: usize },
    /// The page could not be fetched; the record is untouched.
    PageUnavailable(String),
    /// The page loaded but lacked a mandatory element; the record is untouched.
    MalformedPage(String),
}

/// Scrapes a project's detail page into its enrichment fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProposalEnricher;

impl ProposalEnricher {
    pub async fn enrich(&self, record: &mut ProjectRecord, pages: &dyn PageSource) -> ProposalOutcome {
        info!(title = record.title(), "parsing design proposal info");
        let url = record.design_review_link().to_string();

        let response = match pages.get(&url).await.and_then(|r| r.ensure_success()) {
            Ok(response) => response,
            Err(err) => {
                warn!(%url, error = %err, "detail page unavailable; skipping enrichment");
                return ProposalOutcome::PageUnavailable(err.to_string());
            }
        };

        match parse_proposal_page(&response.text(), &url) {
            Ok(details) => ProposalOutcome::Enriched {
                fields_added: record.apply_details(details),
            },
            Err(err) => {
                warn!(%url, final_url = %response.final_url, error = %err, "detail page malformed; skipping enrichment");
                ProposalOutcome::MalformedPage(err.to_string())
            }
        }
    }
}

/// Resolves a free-text address to coordinates.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` means the service answered but found nothing.
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>, AdapterError>;
}

/// Used when no geocoding service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGeocoder;

#[async_trait]
impl Geocoder for NullGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>, AdapterError> {
        debug!(address, "no geocoder configured");
        Ok(None)
    }
}

pub const GOOGLE_GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: GeocodeGeometry,
}

#[derive(Debug, Deserialize)]
struct GeocodeGeometry {
    location: GeocodeLocation,
}

#[derive(Debug, Deserialize)]
struct GeocodeLocation {
    lat: f64,
    lng: f64,
}

fn point_from_response(response: GeocodeResponse) -> Result<Option<GeoPoint>, AdapterError> {
    match response.status.as_str() {
        "OK" => Ok(response
            .results
            .first()
            .map(|r| GeoPoint::new(r.geometry.location.lat, r.geometry.location.lng))),
        "ZERO_RESULTS" => Ok(None),
        other => Err(AdapterError::Geocoder(match response.error_message {
            Some(msg) => format!("{other}: {msg}"),
            None => other.to_string(),
        })),
    }
}

/// Google Geocoding API client.
#[derive(Debug, Clone)]
pub struct GoogleGeocoder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GoogleGeocoder {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>, AdapterError> {
        let url = reqwest::Url::parse_with_params(
            &self.endpoint,
            &[("address", address), ("key", self.api_key.as_str())],
        )
        .map_err(|e| AdapterError::Geocoder(format!("bad endpoint {}: {e}", self.endpoint)))?;

        let response: GeocodeResponse = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        point_from_response(response)
    }
}

/// Append the fixed city/state suffix used for every lookup.
pub fn full_address(address: &str, suffix: &str) -> String {
    format!("{address}{suffix}")
}

/// Renders the first page of a PDF and uploads it, returning the stored filename.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn render_first_page(&self, pdf_url: &str) -> Result<String, AdapterError>;
}

/// True when the text after the last `.` is exactly `pdf`.
pub fn is_pdf_link(link: &str) -> bool {
    link.rsplit('.').next() == Some("pdf")
}

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    pdf_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct RenderResponse {
    filename: String,
}

/// Client for an HTTP render-and-upload service.
#[derive(Debug, Clone)]
pub struct RenderServiceResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl RenderServiceResolver {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ImageResolver for RenderServiceResolver {
    async fn render_first_page(&self, pdf_url: &str) -> Result<String, AdapterError> {
        let response: RenderResponse = self
            .client
            .post(&self.endpoint)
            .json(&RenderRequest { pdf_url })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let filename = response.filename.trim();
        if filename.is_empty() {
            return Err(AdapterError::Render(format!("empty filename for {pdf_url}")));
        }
        Ok(filename.to_string())
    }
}
