//! Site capability contract + fixture-first site adapter.
//!
//! The scheduler and workers only see [`SiteAdapter`]; everything that knows
//! about a particular site's markup lives here.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hrs_core::{ErrorClass, HotelCandidate, PoolCounts, PriceTier, RawReview, ReviewPool, StratificationCell};
use hrs_storage::{classify_status_code, stable_review_id};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "hrs-adapters";

/// Markers of the slider captcha the site throws up when it wants a human.
pub const CHALLENGE_SELECTORS: [&str; 5] = [
    "#nc_1_n1z",
    ".nc-container",
    ".nc_wrapper",
    "#baxia-dialog-content",
    ".J_MIDDLEWARE_FRAME_WIDGET",
];

const HOTEL_ROW: &str = ".list-row.J_ListRow[data-shid]";
const HOTEL_SCORE: &str = ".comment-score .score";
const HOTEL_REVIEW_COUNT: &str = ".comment-score .count";
const REVIEW_ITEM: &str = "li.tb-r-comment";
const REVIEW_NICK: &str = ".tb-r-nick a";
const REVIEW_CONTENT: &str = ".tb-r-cnt";
const REVIEW_DATE: &str = ".tb-r-date";
const REVIEW_STARS: &str = ".starscore li em";
const REVIEW_PHOTOS: &str = ".tb-r-photos img";
const REVIEW_REPLY: &str = ".tb-r-seller";
const NEXT_PAGE: &str = ".pi-pagination-next:not(.pi-pagination-disabled)";

/// Fetch failures as classified by the adapter. Workers hand the class to the
/// scheduler; they never decide retries themselves.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient fetch error: {0}")]
    Transient(String),
    #[error("challenge detected: {0}")]
    ChallengeDetected(String),
    #[error("permanent fetch error: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::Transient(_) => ErrorClass::Transient,
            FetchError::ChallengeDetected(_) => ErrorClass::Challenge,
            FetchError::Permanent(_) => ErrorClass::Permanent,
        }
    }

    pub fn from_status(code: u16, what: &str) -> Self {
        let message = format!("http status {code} for {what}");
        match classify_status_code(code) {
            ErrorClass::Transient => FetchError::Transient(message),
            ErrorClass::Challenge => FetchError::ChallengeDetected(message),
            ErrorClass::Permanent => FetchError::Permanent(message),
        }
    }
}

/// One page of reviews for a (hotel, pool) pair.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReviewPage {
    pub reviews: Vec<RawReview>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[async_trait]
pub trait SiteAdapter: Send + Sync {
    fn site_id(&self) -> &'static str;

    async fn fetch_hotel_candidates(&self, cell: &StratificationCell) -> Result<Vec<HotelCandidate>, FetchError>;

    /// `cursor` is `None` for the first page, otherwise a previous `next_cursor`.
    async fn fetch_review_page(
        &self,
        hotel_id: &str,
        pool: ReviewPool,
        cursor: Option<&str>,
    ) -> Result<ReviewPage, FetchError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub site_id: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub hotel_lists: Vec<FixtureHotelList>,
    #[serde(default)]
    pub review_pages: Vec<FixtureReviewPage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureHotelList {
    pub region: String,
    pub business_zone: String,
    pub price_tier: PriceTier,
    /// Non-2xx status the capture answered with, if any.
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub html: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureReviewPage {
    pub hotel_id: String,
    pub pool: ReviewPool,
    pub page: u32,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub html: String,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn fixture_bundle_path(fixtures_dir: &Path, site_id: &str) -> PathBuf {
    fixtures_dir.join(site_id).join("sample").join("bundle.json")
}

fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|e| FetchError::Permanent(format!("bad selector {css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(elem: ElementRef<'_>, sel: &Selector) -> Option<String> {
    elem.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        // thousands separators
        if ch == ',' && !current.is_empty() && !seen_dot {
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

/// `Some(selector)` when the page carries a known challenge marker.
pub fn detect_challenge(document: &Html) -> Result<Option<&'static str>, FetchError> {
    for css in CHALLENGE_SELECTORS {
        let sel = selector(css)?;
        if document.select(&sel).next().is_some() {
            return Ok(Some(css));
        }
    }
    Ok(None)
}

fn ensure_no_challenge(document: &Html, what: &str) -> Result<(), FetchError> {
    match detect_challenge(document)? {
        Some(marker) => Err(FetchError::ChallengeDetected(format!("{marker} on {what}"))),
        None => Ok(()),
    }
}

/// Parse a hotel list page. Ranking follows page order: the first row scores highest.
pub fn parse_hotel_list(html: &str, cell: &StratificationCell) -> Result<Vec<HotelCandidate>, FetchError> {
    let document = Html::parse_document(html);
    ensure_no_challenge(&document, &format!("hotel list {cell}"))?;

    let row_sel = selector(HOTEL_ROW)?;
    let score_sel = selector(HOTEL_SCORE)?;
    let count_sel = selector(HOTEL_REVIEW_COUNT)?;

    let rows: Vec<ElementRef<'_>> = document.select(&row_sel).collect();
    let total = rows.len();
    let mut out = Vec::with_capacity(total);
    for (idx, row) in rows.into_iter().enumerate() {
        let attrs = row.value();
        let Some(external_id) = attrs.attr("data-shid").and_then(|s| text_or_none(s.to_string())) else {
            continue;
        };
        let Some(name) = attrs.attr("data-name").and_then(|s| text_or_none(s.to_string())) else {
            debug!(hotel_id = %external_id, "hotel row without name skipped");
            continue;
        };
        let rating = first_text(row, &score_sel)
            .and_then(|t| extract_numbers(&t).first().copied())
            .map(|v| v as f32);
        let review_count_hint = first_text(row, &count_sel)
            .and_then(|t| extract_numbers(&t).first().copied())
            .map(|v| v as u32)
            .unwrap_or(0);
        let attr_count = |name: &str| attrs.attr(name).and_then(|v| v.trim().parse::<u32>().ok());

        out.push(HotelCandidate {
            external_id,
            name,
            cell: cell.clone(),
            ranking_score: (total - idx) as f64,
            review_count_hint,
            rating,
            pool_counts: PoolCounts {
                negative: attr_count("data-negative-count"),
                evidence: attr_count("data-evidence-count"),
            },
        });
    }
    Ok(out)
}

/// Star widths are percentages of five stars.
fn parse_star_width(style: &str) -> Option<f32> {
    let width = style
        .split(';')
        .filter_map(|decl| decl.split_once(':'))
        .find(|(prop, _)| prop.trim() == "width")?
        .1;
    let pct = extract_numbers(width).first().copied()?;
    Some((pct / 20.0) as f32)
}

/// Parse one review page. Returns the reviews and whether a next page exists.
pub fn parse_review_page(
    html: &str,
    hotel_id: &str,
    pool: ReviewPool,
    fetched_at: DateTime<Utc>,
) -> Result<(Vec<RawReview>, bool), FetchError> {
    let document = Html::parse_document(html);
    ensure_no_challenge(&document, &format!("reviews {hotel_id}/{pool}"))?;

    let item_sel = selector(REVIEW_ITEM)?;
    let nick_sel = selector(REVIEW_NICK)?;
    let content_sel = selector(REVIEW_CONTENT)?;
    let date_sel = selector(REVIEW_DATE)?;
    let stars_sel = selector(REVIEW_STARS)?;
    let photos_sel = selector(REVIEW_PHOTOS)?;
    let reply_sel = selector(REVIEW_REPLY)?;
    let next_sel = selector(NEXT_PAGE)?;

    let mut reviews = Vec::new();
    for item in document.select(&item_sel) {
        let Some(content) = first_text(item, &content_sel) else {
            continue;
        };
        let user_nick = item.select(&nick_sel).next().and_then(|n| {
            n.value()
                .attr("title")
                .and_then(|t| text_or_none(t.to_string()))
                .or_else(|| text_or_none(n.text().collect()))
        });
        let stars: Vec<f32> = item
            .select(&stars_sel)
            .filter_map(|em| em.value().attr("style").and_then(parse_star_width))
            .collect();
        let overall_score = (!stars.is_empty()).then(|| {
            let avg = stars.iter().sum::<f32>() / stars.len() as f32;
            (avg * 10.0).round() / 10.0
        });
        let image_urls = item
            .select(&photos_sel)
            .filter_map(|img| img.value().attr("data-val").or_else(|| img.value().attr("src")))
            .filter_map(|u| text_or_none(u.to_string()))
            .collect();

        reviews.push(RawReview {
            review_id: stable_review_id(hotel_id, item.value().attr("data-id"), &content, user_nick.as_deref()),
            hotel_id: hotel_id.to_string(),
            pool,
            user_nick,
            content,
            overall_score,
            room_type: None,
            review_date: first_text(item, &date_sel),
            image_urls,
            reply: first_text(item, &reply_sel),
            fetched_at,
        });
    }

    let has_next = document.select(&next_sel).next().is_some();
    Ok((reviews, has_next))
}

/// Serves captured pages instead of a live browser session. Cursors are page numbers.
#[derive(Debug, Clone)]
pub struct FixtureSiteAdapter {
    site_id: &'static str,
    bundle: FixtureBundle,
    review_index: BTreeMap<(String, ReviewPool, u32), usize>,
}

impl FixtureSiteAdapter {
    pub fn new(site_id: &'static str, bundle: FixtureBundle) -> Result<Self> {
        if bundle.site_id != site_id {
            bail!(
                "bundle site_id={} does not match adapter site_id={}",
                bundle.site_id,
                site_id
            );
        }
        let review_index = bundle
            .review_pages
            .iter()
            .enumerate()
            .map(|(idx, p)| ((p.hotel_id.clone(), p.pool, p.page), idx))
            .collect();
        Ok(Self {
            site_id,
            bundle,
            review_index,
        })
    }

    pub fn bundle(&self) -> &FixtureBundle {
        &self.bundle
    }
}

fn parse_cursor(cursor: Option<&str>) -> Result<u32, FetchError> {
    match cursor {
        None => Ok(1),
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|page| *page >= 1)
            .ok_or_else(|| FetchError::Permanent(format!("invalid page cursor {raw:?}"))),
    }
}

#[async_trait]
impl SiteAdapter for FixtureSiteAdapter {
    fn site_id(&self) -> &'static str {
        self.site_id
    }

    async fn fetch_hotel_candidates(&self, cell: &StratificationCell) -> Result<Vec<HotelCandidate>, FetchError> {
        let Some(list) = self.bundle.hotel_lists.iter().find(|l| {
            l.region == cell.region && l.business_zone == cell.business_zone && l.price_tier == cell.price_tier
        }) else {
            debug!(%cell, "no captured hotel list for cell");
            return Ok(Vec::new());
        };
        if let Some(code) = list.status.filter(|c| !(200..300).contains(c)) {
            return Err(FetchError::from_status(code, &format!("hotel list {cell}")));
        }
        parse_hotel_list(&list.html, cell)
    }

    async fn fetch_review_page(
        &self,
        hotel_id: &str,
        pool: ReviewPool,
        cursor: Option<&str>,
    ) -> Result<ReviewPage, FetchError> {
        let page = parse_cursor(cursor)?;
        let Some(captured) = self
            .review_index
            .get(&(hotel_id.to_string(), pool, page))
            .and_then(|idx| self.bundle.review_pages.get(*idx))
        else {
            return Ok(ReviewPage::default());
        };
        if let Some(code) = captured.status.filter(|c| !(200..300).contains(c)) {
            return Err(FetchError::from_status(code, &format!("reviews {hotel_id}/{pool} page {page}")));
        }
        let (reviews, has_more) = parse_review_page(&captured.html, hotel_id, pool, Utc::now())?;
        debug!(hotel_id, %pool, page, reviews = reviews.len(), has_more, "served captured review page");
        Ok(ReviewPage {
            reviews,
            next_cursor: has_more.then(|| (page + 1).to_string()),
            has_more,
        })
    }
}

pub fn supported_sites() -> &'static [&'static str] {
    &["fliggy"]
}

pub fn adapter_for_site(site_id: &str, fixtures_dir: &Path) -> Result<Box<dyn SiteAdapter>> {
    match site_id {
        "fliggy" => {
            let path = fixture_bundle_path(fixtures_dir, "fliggy");
            let bundle = load_fixture_bundle(&path)?;
            Ok(Box::new(FixtureSiteAdapter::new("fliggy", bundle)?))
        }
        other => bail!(
            "unsupported site {other:?}; supported: {}",
            supported_sites().join(", ")
        ),
    }
}
