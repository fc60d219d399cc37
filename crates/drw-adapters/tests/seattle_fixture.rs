use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use drw_adapters::{FeedReader, ProposalEnricher, ProposalOutcome};
use drw_core::UsDate;
use drw_storage::{FetchError, FetchedResponse, PageSource, StatusCode};

const FEED_URL: &str = "http://feeds.test/design-review/rss";
const DEXTER: &str = "http://web6.seattle.gov/DPD/DesignReview/Detail.aspx?id=3030000";
const JACKSON: &str = "http://web6.seattle.gov/DPD/DesignReview/Detail.aspx?id=3031234";
const LAKE_CITY: &str = "http://web6.seattle.gov/DPD/DesignReview/Detail.aspx?id=3035555";

fn fixture(name: &str) -> String {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    std::fs::read_to_string(root.join("fixtures/seattle-design-review").join(name))
        .expect("fixture exists")
}

struct FixturePages {
    pages: HashMap<String, (StatusCode, String)>,
}

impl FixturePages {
    fn seattle() -> Self {
        let mut pages = HashMap::new();
        pages.insert(FEED_URL.to_string(), (StatusCode::OK, fixture("rss.xml")));
        pages.insert(DEXTER.to_string(), (StatusCode::OK, fixture("detail.html")));
        pages.insert(JACKSON.to_string(), (StatusCode::OK, fixture("detail_minimal.html")));
        pages.insert(
            LAKE_CITY.to_string(),
            (StatusCode::SERVICE_UNAVAILABLE, "maintenance".to_string()),
        );
        Self { pages }
    }
}

#[async_trait]
impl PageSource for FixturePages {
    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        match self.pages.get(url) {
            Some((status, body)) if status.is_success() => Ok(FetchedResponse {
                status: *status,
                final_url: url.to_string(),
                body: body.clone().into_bytes(),
            }),
            Some((status, _)) => Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

#[tokio::test]
async fn feed_fixture_yields_three_projects() {
    let pages = FixturePages::seattle();
    let found = UsDate::from_ymd(2024, 3, 16).unwrap();
    let projects = FeedReader::new(FEED_URL).fetch_projects(&pages, found).await.unwrap();

    let links: Vec<_> = projects.iter().map(|p| p.design_review_link()).collect();
    assert_eq!(links, vec![DEXTER, JACKSON, LAKE_CITY]);
    assert_eq!(projects[1].identity().meeting_details, "5:30 pm - Seattle Vocational Institute, 2120 S Jackson St");
    assert_eq!(projects[2].published_date(), UsDate::from_ymd(2024, 2, 15).unwrap());
    assert!(projects.iter().all(|p| p.identity().found_date == found));
}

#[tokio::test]
async fn unreachable_feed_is_an_error() {
    let pages = FixturePages::seattle();
    let err = FeedReader::new("http://feeds.test/missing")
        .fetch_projects(&pages, UsDate::today())
        .await
        .unwrap_err();
    assert!(err.is_fetch_failure());
}

#[tokio::test]
async fn enricher_fills_fields_per_detail_page() {
    let pages = FixturePages::seattle();
    let mut projects = FeedReader::new(FEED_URL)
        .fetch_projects(&pages, UsDate::today())
        .await
        .unwrap();
    let enricher = ProposalEnricher;

    let outcome = enricher.enrich(&mut projects[0], &pages).await;
    assert_eq!(outcome, ProposalOutcome::Enriched { fields_added: 6 });
    assert_eq!(projects[0].project_num(), Some("3030000"));
    assert_eq!(
        projects[0].past_reviews_link(),
        Some("http://web6.seattle.gov/DPD/DesignReview/PastReviews.aspx?id=3030000")
    );

    let outcome = enricher.enrich(&mut projects[1], &pages).await;
    assert_eq!(outcome, ProposalOutcome::Enriched { fields_added: 3 });
    assert_eq!(projects[1].address(), Some("2020 S Jackson St"));
    assert!(projects[1].design_proposal_link().is_none());

    let before = projects[2].clone();
    let outcome = enricher.enrich(&mut projects[2], &pages).await;
    assert!(matches!(outcome, ProposalOutcome::PageUnavailable(_)));
    assert_eq!(projects[2], before);
}

/// Hands back every page as `Ok`, whatever its status.
struct PassThroughPages {
    status: StatusCode,
    body: String,
}

#[async_trait]
impl PageSource for PassThroughPages {
    async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        Ok(FetchedResponse {
            status: self.status,
            final_url: url.to_string(),
            body: self.body.clone().into_bytes(),
        })
    }
}

#[tokio::test]
async fn error_status_page_is_not_scraped() {
    let pages = PassThroughPages {
        status: StatusCode::NOT_FOUND,
        body: fixture("detail.html"),
    };
    let mut projects = FeedReader::new(FEED_URL)
        .fetch_projects(&FixturePages::seattle(), UsDate::today())
        .await
        .unwrap();
    let before = projects[0].clone();

    let outcome = ProposalEnricher.enrich(&mut projects[0], &pages).await;
    assert!(matches!(outcome, ProposalOutcome::PageUnavailable(ref reason) if reason.contains("404")));
    assert_eq!(projects[0], before);
    assert!(!projects[0].has_enrichment());
}

#[tokio::test]
async fn error_status_feed_is_unavailable() {
    let pages = PassThroughPages {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: fixture("rss.xml"),
    };
    let err = FeedReader::new(FEED_URL)
        .fetch_projects(&pages, UsDate::today())
        .await
        .unwrap_err();
    assert!(err.is_fetch_failure());
}
