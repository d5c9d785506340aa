//! Racing API client.
//!
//! Typed client for the third-party horse-racing REST API. Every request
//! acquires a token from the shared [`ApiRateLimiter`] before going out,
//! uses HTTP basic auth, and retries transient failures (429 and 5xx) with
//! exponential backoff. People endpoints are paginated server-side; the
//! client walks all pages internally so callers always receive the full
//! list for the requested filter.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::AppError;
use crate::services::limiter::ApiRateLimiter;

/// HTTP request timeout for racing API calls (seconds).
const API_HTTP_TIMEOUT_SECS: u64 = 30;
/// Maximum attempts per logical request: the first try plus up to five
/// retries, one per step of the backoff schedule.
const RETRY_MAX_ATTEMPTS: u32 = 6;
/// Base retry delay; doubles per retry (5, 10, 20, 40, 80 seconds).
const RETRY_BASE_DELAY_SECS: u64 = 5;
/// Page size requested from paginated people endpoints.
const PEOPLE_PAGE_SIZE: usize = 500;

// ---------------------------------------------------------------------------
// API documents
// ---------------------------------------------------------------------------

/// Accept an integer that the API sometimes serialises as a string ("4").
fn de_opt_i32_lenient<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_i64().map(|n| n as i32),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

/// Accept a string that the API sometimes serialises as a number (draw, position).
fn de_opt_string_lenient<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct CourseDoc {
    pub id: String,
    pub course: String,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookmakerDoc {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Jockey, trainer or owner document. `location` is only exposed by the
/// trainer endpoint and the racecard runner block.
#[derive(Debug, Clone, Deserialize)]
pub struct PersonDoc {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
}

/// A runner entry inside a pro racecard document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RacecardRunnerDoc {
    #[serde(default)]
    pub horse_id: Option<String>,
    #[serde(default)]
    pub horse: Option<String>,
    #[serde(default)]
    pub dob: Option<NaiveDate>,
    #[serde(default, deserialize_with = "de_opt_i32_lenient")]
    pub age: Option<i32>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub sex_code: Option<String>,
    #[serde(default)]
    pub colour: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i32_lenient")]
    pub number: Option<i32>,
    #[serde(default, deserialize_with = "de_opt_i32_lenient")]
    pub draw: Option<i32>,
    /// Weight carried in display form ("8-13").
    #[serde(default)]
    pub weight: Option<String>,
    /// Weight carried in pounds, when the API provides it directly.
    #[serde(default, deserialize_with = "de_opt_i32_lenient")]
    pub lbs: Option<i32>,
    #[serde(default)]
    pub headgear: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i32_lenient")]
    pub ofr: Option<i32>,
    #[serde(default)]
    pub form: Option<String>,
    #[serde(default)]
    pub jockey_id: Option<String>,
    #[serde(default)]
    pub jockey: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i32_lenient")]
    pub jockey_claim_lbs: Option<i32>,
    #[serde(default)]
    pub trainer_id: Option<String>,
    #[serde(default)]
    pub trainer: Option<String>,
    #[serde(default)]
    pub trainer_location: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub silk_url: Option<String>,
    #[serde(default)]
    pub sire_id: Option<String>,
    #[serde(default)]
    pub sire: Option<String>,
    #[serde(default)]
    pub dam_id: Option<String>,
    #[serde(default)]
    pub dam: Option<String>,
    #[serde(default)]
    pub damsire_id: Option<String>,
    #[serde(default)]
    pub damsire: Option<String>,
    #[serde(default)]
    pub breeder: Option<String>,
}

/// A pro racecard document (one race, pre-race).
#[derive(Debug, Clone, Deserialize)]
pub struct RacecardDoc {
    pub race_id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub off_dt: Option<String>,
    #[serde(default)]
    pub off_time: Option<String>,
    #[serde(default)]
    pub course_id: Option<String>,
    #[serde(default)]
    pub course: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub race_name: Option<String>,
    #[serde(default)]
    pub race_class: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default, rename = "type")]
    pub race_type: Option<String>,
    #[serde(default)]
    pub distance: Option<String>,
    #[serde(default)]
    pub going: Option<String>,
    #[serde(default)]
    pub prize: Option<String>,
    #[serde(default)]
    pub age_band: Option<String>,
    #[serde(default)]
    pub rating_band: Option<String>,
    #[serde(default)]
    pub field_size: Option<i32>,
    #[serde(default)]
    pub runners: Vec<RacecardRunnerDoc>,
}

/// A runner entry inside a results document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultRunnerDoc {
    #[serde(default)]
    pub horse_id: Option<String>,
    #[serde(default)]
    pub horse: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string_lenient")]
    pub position: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i32_lenient")]
    pub draw: Option<i32>,
    /// Starting price in fractional form ("9/4").
    #[serde(default)]
    pub sp: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string_lenient")]
    pub sp_dec: Option<String>,
    /// Distance beaten by the runner in front.
    #[serde(default, deserialize_with = "de_opt_string_lenient")]
    pub btn: Option<String>,
    /// Overall distance beaten behind the winner.
    #[serde(default, deserialize_with = "de_opt_string_lenient")]
    pub ovr_btn: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub prize: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub jockey_id: Option<String>,
    #[serde(default)]
    pub trainer_id: Option<String>,
}

/// A results document (one race, post-race).
#[derive(Debug, Clone, Deserialize)]
pub struct RaceResultDoc {
    pub race_id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub course_id: Option<String>,
    #[serde(default)]
    pub course: Option<String>,
    #[serde(default)]
    pub winning_time_detail: Option<String>,
    #[serde(default)]
    pub tote_win: Option<String>,
    #[serde(default)]
    pub tote_pl: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub runners: Vec<ResultRunnerDoc>,
}

/// Detail document from the horse enrichment endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HorseProDoc {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub dob: Option<NaiveDate>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub sex_code: Option<String>,
    #[serde(default)]
    pub colour: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub breeder: Option<String>,
    #[serde(default)]
    pub sire_id: Option<String>,
    #[serde(default)]
    pub sire: Option<String>,
    #[serde(default)]
    pub dam_id: Option<String>,
    #[serde(default)]
    pub dam: Option<String>,
    #[serde(default)]
    pub damsire_id: Option<String>,
    #[serde(default)]
    pub damsire: Option<String>,
}

// --- response envelopes ---

#[derive(Debug, Deserialize)]
struct CoursesResponse {
    #[serde(default)]
    courses: Vec<CourseDoc>,
}

#[derive(Debug, Deserialize)]
struct BookmakersResponse {
    #[serde(default)]
    bookmakers: Vec<BookmakerDoc>,
}

#[derive(Debug, Deserialize)]
struct RacecardsResponse {
    #[serde(default)]
    racecards: Vec<RacecardDoc>,
}

#[derive(Debug, Deserialize)]
struct ResultsResponse {
    #[serde(default)]
    results: Vec<RaceResultDoc>,
}

/// Page envelope shared by the three people endpoints; the payload key
/// differs per endpoint, hence the aliases.
#[derive(Debug, Deserialize)]
struct PeoplePage {
    #[serde(default, alias = "jockeys", alias = "trainers", alias = "owners")]
    people: Vec<PersonDoc>,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Abstract contract consumed by all fetchers. Implementations must be safe
/// for concurrent callers; the concrete client serialises on the shared
/// rate limiter internally.
#[async_trait]
pub trait RacingApi: Send + Sync {
    async fn get_courses(&self, regions: &[String]) -> Result<Vec<CourseDoc>, AppError>;

    async fn get_bookmakers(&self) -> Result<Vec<BookmakerDoc>, AppError>;

    async fn get_jockeys(&self, regions: &[String]) -> Result<Vec<PersonDoc>, AppError>;

    async fn get_trainers(&self, regions: &[String]) -> Result<Vec<PersonDoc>, AppError>;

    async fn get_owners(&self, regions: &[String]) -> Result<Vec<PersonDoc>, AppError>;

    async fn get_racecards_pro(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
        regions: &[String],
    ) -> Result<Vec<RacecardDoc>, AppError>;

    async fn get_results(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
        regions: &[String],
    ) -> Result<Vec<RaceResultDoc>, AppError>;

    async fn get_horse_pro(&self, horse_id: &str) -> Result<HorseProDoc, AppError>;
}

// ---------------------------------------------------------------------------
// Concrete client
// ---------------------------------------------------------------------------

/// Client for the racing API over HTTP basic auth.
#[derive(Debug, Clone)]
pub struct RacingApiClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    limiter: Arc<ApiRateLimiter>,
    retry_base_delay: Duration,
    /// Maximum pages walked per paginated listing; `None` means unbounded.
    page_cap: Option<usize>,
}

impl RacingApiClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        limiter: Arc<ApiRateLimiter>,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(API_HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            limiter,
            retry_base_delay: Duration::from_secs(RETRY_BASE_DELAY_SECS),
            page_cap: None,
        })
    }

    /// Override the retry base delay. Tests use millisecond delays so the
    /// 429/5xx retry paths run quickly.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Cap the number of pages walked per paginated listing (smoke runs).
    pub fn with_page_cap(mut self, cap: usize) -> Self {
        self.page_cap = Some(cap);
        self
    }

    /// Exponential backoff delay for the given attempt (1-based).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Perform a GET with rate limiting and the retry policy: 429 waits the
    /// provider-advised duration (Retry-After) or the backoff schedule; 5xx
    /// follows the backoff schedule; 401/403 fail immediately as
    /// authentication errors; other 4xx fail as fetch errors.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, AppError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = String::new();

        for attempt in 1..=RETRY_MAX_ATTEMPTS {
            self.limiter.acquire().await;

            let response = self
                .client
                .get(&url)
                .basic_auth(&self.username, Some(&self.password))
                .query(query)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("request failed: {e}");
                    tracing::warn!(
                        "APIClient: {} attempt {}/{} failed: {}",
                        path,
                        attempt,
                        RETRY_MAX_ATTEMPTS,
                        e,
                    );
                    if attempt < RETRY_MAX_ATTEMPTS {
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                    }
                    continue;
                }
            };

            let status = response.status();

            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(AppError::Authentication(format!(
                    "{path} returned HTTP {status}"
                )));
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let delay = retry_after(&response).unwrap_or_else(|| self.backoff_delay(attempt));
                last_error = format!("HTTP 429 after {attempt} attempts");
                tracing::warn!(
                    "APIClient: {} rate limited, waiting {:?} (attempt {}/{})",
                    path,
                    delay,
                    attempt,
                    RETRY_MAX_ATTEMPTS,
                );
                if attempt < RETRY_MAX_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }

            if status.is_server_error() {
                last_error = format!("HTTP {status}");
                tracing::warn!(
                    "APIClient: {} returned {} (attempt {}/{})",
                    path,
                    status,
                    attempt,
                    RETRY_MAX_ATTEMPTS,
                );
                if attempt < RETRY_MAX_ATTEMPTS {
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
                continue;
            }

            if !status.is_success() {
                return Err(AppError::Fetch(format!("{path} returned HTTP {status}")));
            }

            return response
                .json::<T>()
                .await
                .map_err(|e| AppError::Fetch(format!("{path} JSON parse error: {e}")));
        }

        Err(AppError::Fetch(format!(
            "{path}: retries exhausted ({last_error})"
        )))
    }

    /// Walk all pages of a people endpoint.
    async fn get_people(
        &self,
        path: &str,
        regions: &[String],
    ) -> Result<Vec<PersonDoc>, AppError> {
        let mut all = Vec::new();
        let mut skip = 0usize;
        let mut pages = 0usize;

        loop {
            let mut query = region_query(regions);
            query.push(("limit", PEOPLE_PAGE_SIZE.to_string()));
            query.push(("skip", skip.to_string()));

            let page: PeoplePage = self.get_json(path, &query).await?;
            let count = page.people.len();
            all.extend(page.people);
            skip += count;
            pages += 1;

            if count < PEOPLE_PAGE_SIZE {
                break;
            }
            if let Some(cap) = self.page_cap {
                if pages >= cap {
                    tracing::warn!(
                        "APIClient: {} page cap {} reached, stopping with {} rows",
                        path,
                        cap,
                        all.len(),
                    );
                    break;
                }
            }
        }

        Ok(all)
    }
}

fn region_query(regions: &[String]) -> Vec<(&'static str, String)> {
    regions.iter().map(|r| ("region", r.clone())).collect()
}

/// Provider-advised retry delay from a 429 response, if present.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn date_range_query(
    date_from: NaiveDate,
    date_to: NaiveDate,
    regions: &[String],
) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("date_from", date_from.format("%Y-%m-%d").to_string()),
        ("date_to", date_to.format("%Y-%m-%d").to_string()),
    ];
    query.extend(region_query(regions));
    query
}

#[async_trait]
impl RacingApi for RacingApiClient {
    async fn get_courses(&self, regions: &[String]) -> Result<Vec<CourseDoc>, AppError> {
        let response: CoursesResponse = self
            .get_json("/v1/courses", &region_query(regions))
            .await?;
        Ok(response.courses)
    }

    async fn get_bookmakers(&self) -> Result<Vec<BookmakerDoc>, AppError> {
        let response: BookmakersResponse = self.get_json("/v1/bookmakers", &[]).await?;
        Ok(response.bookmakers)
    }

    async fn get_jockeys(&self, regions: &[String]) -> Result<Vec<PersonDoc>, AppError> {
        self.get_people("/v1/jockeys", regions).await
    }

    async fn get_trainers(&self, regions: &[String]) -> Result<Vec<PersonDoc>, AppError> {
        self.get_people("/v1/trainers", regions).await
    }

    async fn get_owners(&self, regions: &[String]) -> Result<Vec<PersonDoc>, AppError> {
        self.get_people("/v1/owners", regions).await
    }

    async fn get_racecards_pro(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
        regions: &[String],
    ) -> Result<Vec<RacecardDoc>, AppError> {
        let response: RacecardsResponse = self
            .get_json(
                "/v1/racecards/pro",
                &date_range_query(date_from, date_to, regions),
            )
            .await?;
        Ok(response.racecards)
    }

    async fn get_results(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
        regions: &[String],
    ) -> Result<Vec<RaceResultDoc>, AppError> {
        let response: ResultsResponse = self
            .get_json(
                "/v1/results",
                &date_range_query(date_from, date_to, regions),
            )
            .await?;
        Ok(response.results)
    }

    async fn get_horse_pro(&self, horse_id: &str) -> Result<HorseProDoc, AppError> {
        self.get_json(&format!("/v1/horses/{horse_id}/pro"), &[])
            .await
    }
}
