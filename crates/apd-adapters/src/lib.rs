//! External collaborator contracts + production implementations: the AIS
//! geocoding API, the citizen-services permit portal, and the public object
//! store. The pipeline depends only on the traits, so tests swap these out.

use std::time::Duration;

use apd_core::GeoPoint;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info};

pub const CRATE_NAME: &str = "apd-adapters";

const AIS_BASE_URL: &str = "https://api.phila.gov/ais/v1";
const PORTAL_BASE_URL: &str = "https://www.citizenserve.com";
const PORTAL_INSTALLATION_ID: &str = "173";

// Fixed portal download polling: one-second probes, twenty-second ceiling.
const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DOWNLOAD_POLL_ATTEMPTS: u32 = 20;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("missing configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn required_env(name: &str) -> Result<String, AdapterError> {
    std::env::var(name)
        .map_err(|_| AdapterError::Config(format!("set the `{name}` environment variable")))
}

/// Resolves a street address to coordinates, or reports that the service
/// could not place it.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>, AdapterError>;
}

/// Client for the city's Address Information System.
#[derive(Debug)]
pub struct AisGeocoder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AisGeocoder {
    pub fn new(api_key: String, base_url: String) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    pub fn from_env() -> Result<Self, AdapterError> {
        let api_key = required_env("AIS_API_KEY")?;
        Self::new(api_key, AIS_BASE_URL.to_string())
    }
}

/// Pull (lat, lng) out of an AIS search response. AIS answers with a GeoJSON
/// feature collection; an empty feature list means the address is unknown.
pub fn parse_ais_response(value: &JsonValue) -> Option<GeoPoint> {
    let coords = value
        .get("features")?
        .as_array()?
        .first()?
        .get("geometry")?
        .get("coordinates")?
        .as_array()?;
    let lng = coords.first()?.as_f64()?;
    let lat = coords.get(1)?.as_f64()?;
    Some(GeoPoint { lat, lng })
}

#[async_trait]
impl Geocoder for AisGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>, AdapterError> {
        let url = format!(
            "{}/search/{}",
            self.base_url,
            urlencode_path_segment(address)
        );
        let response = self
            .client
            .get(&url)
            .query(&[("gatekeeperKey", self.api_key.as_str())])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: JsonValue = response.error_for_status()?.json().await?;
        Ok(parse_ais_response(&body))
    }
}

fn urlencode_path_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Inclusive date window covered by one report download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ReportWindow {
    /// Window ending today and reaching `ndays` back.
    pub fn lookback(ndays: i64) -> Self {
        let end = Utc::now().date_naive();
        Self {
            start: end - ChronoDuration::days(ndays),
            end,
        }
    }
}

/// Downloads the raw notifications report for a date window.
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn fetch_report(&self, window: ReportWindow) -> Result<Vec<u8>, AdapterError>;
}

/// Drives the portal's report export over HTTP: one request to queue the
/// export, then fixed-interval polling until the file is ready.
#[derive(Debug)]
pub struct PortalReportClient {
    client: reqwest::Client,
    base_url: String,
}

impl PortalReportClient {
    pub fn new(base_url: String) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn from_env() -> Result<Self, AdapterError> {
        let base_url =
            std::env::var("PORTAL_BASE_URL").unwrap_or_else(|_| PORTAL_BASE_URL.to_string());
        Self::new(base_url)
    }

    async fn request_export(&self, window: ReportWindow) -> Result<String, AdapterError> {
        let start = window.start.format("%m-%d-%Y").to_string();
        let end = window.end.format("%m-%d-%Y").to_string();
        info!(%start, %end, "requesting asbestos notifications report export");
        let body: JsonValue = self
            .client
            .get(format!("{}/philagov/Reports/export", self.base_url))
            .query(&[
                ("report", "ElectronicAsbestosNotifications"),
                ("format", "csv"),
                ("Param_0", start.as_str()),
                ("Param_1", end.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        body.get("downloadUrl")
            .and_then(|v| v.as_str())
            .map(|path| format!("{}{}", self.base_url, path))
            .ok_or_else(|| {
                AdapterError::Message("export response did not include a download URL".into())
            })
    }
}

#[async_trait]
impl ReportSource for PortalReportClient {
    async fn fetch_report(&self, window: ReportWindow) -> Result<Vec<u8>, AdapterError> {
        let download_url = match self.request_export(window).await {
            Ok(url) => url,
            Err(err) => {
                error!(?window, %err, "report export request failed");
                return Err(err);
            }
        };

        for _ in 0..DOWNLOAD_POLL_ATTEMPTS {
            let response = self.client.get(&download_url).send().await?;
            if response.status().is_success() {
                return Ok(response.bytes().await?.to_vec());
            }
            tokio::time::sleep(DOWNLOAD_POLL_INTERVAL).await;
        }

        let err = AdapterError::Message(format!(
            "report download did not become available within {}s",
            DOWNLOAD_POLL_ATTEMPTS
        ));
        error!(?window, %err, "report download timed out");
        Err(err)
    }
}

/// Resolves a permit number to its portal detail-page URL.
#[async_trait]
pub trait PermitUrlResolver: Send + Sync {
    async fn resolve(&self, permit_number: &str) -> Result<Option<String>, AdapterError>;
}

/// Searches the public portal for a permit and extracts the detail link
/// from the result table.
#[derive(Debug)]
pub struct PortalUrlScraper {
    client: reqwest::Client,
    base_url: String,
}

impl PortalUrlScraper {
    pub fn new(base_url: String) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn from_env() -> Result<Self, AdapterError> {
        let base_url =
            std::env::var("PORTAL_BASE_URL").unwrap_or_else(|_| PORTAL_BASE_URL.to_string());
        Self::new(base_url)
    }
}

/// Pull the detail link out of the search-results page. The portal renders
/// the link as a `javascript:openURLLink(...)` wrapper around a
/// PortalController URL fragment.
pub fn extract_permit_url(html: &str) -> Result<Option<String>, AdapterError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("#resultContent table tbody tr td a")
        .map_err(|e| AdapterError::Message(e.to_string()))?;
    for anchor in document.select(&selector) {
        if let Some(href) = anchor.value().attr("href") {
            if let Some(url) = unwrap_portal_link(href) {
                return Ok(Some(url));
            }
        }
    }
    Ok(None)
}

/// Unwrap `javascript:openURLLink('...PortalController...%...')` into the
/// direct portal URL.
pub fn unwrap_portal_link(href: &str) -> Option<String> {
    if !href.starts_with("javascript:openURLLink") {
        return None;
    }
    let start = href.find("PortalController")?;
    let tail = &href[start..];
    let end = tail.find('%')?;
    Some(format!(
        "https://www.citizenserve.com/Portal/{}",
        &tail[..end]
    ))
}

#[async_trait]
impl PermitUrlResolver for PortalUrlScraper {
    async fn resolve(&self, permit_number: &str) -> Result<Option<String>, AdapterError> {
        let result = self
            .client
            .get(format!("{}/Portal/PortalController", self.base_url))
            .query(&[
                ("Action", "searchPermits"),
                ("ctzPagePrefix", "Portal_"),
                ("installationID", PORTAL_INSTALLATION_ID),
                ("PermitNumber", permit_number),
            ])
            .send()
            .await;

        let html = match result.and_then(reqwest::Response::error_for_status) {
            Ok(response) => response.text().await?,
            Err(err) => {
                error!(permit_number, %err, "permit search failed");
                return Err(err.into());
            }
        };

        let url = extract_permit_url(&html)?;
        // Stay polite to the portal between searches.
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(url)
    }
}

/// Publicly readable blob storage keyed by file name.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), AdapterError>;
}

/// Minimal SigV4 request signing, enough for an S3 object PUT.
pub mod sigv4 {
    use super::*;

    type HmacSha256 = Hmac<Sha256>;

    fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Canonical request for a PUT of `key` with the given signed headers.
    /// Header names must already be lowercase and sorted.
    pub fn canonical_request(key: &str, headers: &[(String, String)], payload_hash: &str) -> String {
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();
        let signed_headers = signed_header_names(headers);
        format!("PUT\n/{key}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}")
    }

    pub fn signed_header_names(headers: &[(String, String)]) -> String {
        headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn string_to_sign(amz_date: &str, scope: &str, canonical_request: &str) -> String {
        format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        )
    }

    pub fn signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
        let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, region.as_bytes());
        let k_service = hmac_sha256(&k_region, service.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }

    pub fn signature(signing_key: &[u8], string_to_sign: &str) -> String {
        hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
    }
}

/// S3 bucket where the dashboard JSON artifacts are published.
#[derive(Debug)]
pub struct S3Bucket {
    client: reqwest::Client,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3Bucket {
    pub fn new(
        bucket: String,
        region: String,
        access_key: String,
        secret_key: String,
    ) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            bucket,
            region,
            access_key,
            secret_key,
        })
    }

    pub fn from_env() -> Result<Self, AdapterError> {
        let access_key = required_env("AWS_ACCESS_KEY_ID")?;
        let secret_key = required_env("AWS_SECRET_ACCESS_KEY")?;
        let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let bucket =
            std::env::var("APD_S3_BUCKET").unwrap_or_else(|_| "asbestos-dashboard".to_string());
        Self::new(bucket, region, access_key, secret_key)
    }

    fn host(&self) -> String {
        format!("{}.s3.{}.amazonaws.com", self.bucket, self.region)
    }

    fn signed_put(
        &self,
        key: &str,
        content_type: &str,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> (String, Vec<(String, String)>) {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{date}/{}/s3/aws4_request", self.region);

        let headers = vec![
            ("content-type".to_string(), content_type.to_string()),
            ("host".to_string(), self.host()),
            ("x-amz-acl".to_string(), "public-read".to_string()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];

        let canonical = sigv4::canonical_request(key, &headers, payload_hash);
        let to_sign = sigv4::string_to_sign(&amz_date, &scope, &canonical);
        let key_material = sigv4::signing_key(&self.secret_key, &date, &self.region, "s3");
        let signature = sigv4::signature(&key_material, &to_sign);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={}, Signature={signature}",
            self.access_key,
            sigv4::signed_header_names(&headers),
        );
        (authorization, headers)
    }
}

#[async_trait]
impl ObjectStore for S3Bucket {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), AdapterError> {
        let payload_hash = sigv4::sha256_hex(&bytes);
        let (authorization, headers) = self.signed_put(key, content_type, &payload_hash, Utc::now());

        let mut request = self
            .client
            .put(format!("https://{}/{key}", self.host()))
            .body(bytes);
        for (name, value) in &headers {
            if name != "host" {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        let response = request.header("authorization", authorization).send().await?;
        if let Err(err) = response.error_for_status() {
            error!(key, %err, "object store upload failed");
            return Err(err.into());
        }
        info!(key, "uploaded object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ais_feature_collections_yield_coordinates() {
        let body: JsonValue = serde_json::from_str(
            r#"{"features":[{"geometry":{"type":"Point","coordinates":[-75.16,39.96]}}]}"#,
        )
        .unwrap();
        let point = parse_ais_response(&body).expect("point");
        assert_eq!(point.lng, -75.16);
        assert_eq!(point.lat, 39.96);

        let empty: JsonValue = serde_json::from_str(r#"{"features":[]}"#).unwrap();
        assert!(parse_ais_response(&empty).is_none());
    }

    #[test]
    fn portal_links_unwrap_the_javascript_opener() {
        let href = "javascript:openURLLink('PortalController?Action=showPermit&permitID=12345%20')";
        assert_eq!(
            unwrap_portal_link(href).as_deref(),
            Some("https://www.citizenserve.com/Portal/PortalController?Action=showPermit&permitID=12345")
        );

        assert!(unwrap_portal_link("https://elsewhere.example/direct").is_none());
        assert!(unwrap_portal_link("javascript:openURLLink('NoControllerHere%')").is_none());
    }

    #[test]
    fn result_table_anchor_is_extracted() {
        let html = r#"
            <div id="resultContent">
              <table><tbody><tr>
                <td><a href="javascript:openURLLink('PortalController?Action=showPermit&permitID=777%20')">A-777</a></td>
              </tr></tbody></table>
            </div>"#;
        let url = extract_permit_url(html).unwrap().expect("url");
        assert!(url.ends_with("permitID=777"));

        assert_eq!(extract_permit_url("<html><body>no results</body></html>").unwrap(), None);
    }

    #[test]
    fn lookback_window_spans_the_requested_days() {
        let window = ReportWindow::lookback(30);
        assert_eq!((window.end - window.start).num_days(), 30);
    }

    #[test]
    fn address_path_segments_are_percent_encoded() {
        assert_eq!(urlencode_path_segment("440 N Broad St"), "440%20N%20Broad%20St");
        assert_eq!(urlencode_path_segment("safe-chars_1.2~"), "safe-chars_1.2~");
    }

    #[test]
    fn canonical_request_shape_matches_sigv4_layout() {
        let headers = vec![
            ("host".to_string(), "bucket.s3.us-east-1.amazonaws.com".to_string()),
            ("x-amz-date".to_string(), "20260801T060000Z".to_string()),
        ];
        let canonical = sigv4::canonical_request("schools.json", &headers, "abc123");
        let lines: Vec<&str> = canonical.split('\n').collect();
        assert_eq!(lines[0], "PUT");
        assert_eq!(lines[1], "/schools.json");
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], "host:bucket.s3.us-east-1.amazonaws.com");
        assert_eq!(lines[4], "x-amz-date:20260801T060000Z");
        assert_eq!(lines[5], "");
        assert_eq!(lines[6], "host;x-amz-date");
        assert_eq!(lines[7], "abc123");
    }

    #[test]
    fn signatures_are_deterministic_hex() {
        let key = sigv4::signing_key("secret", "20260801", "us-east-1", "s3");
        let first = sigv4::signature(&key, "payload");
        let second = sigv4::signature(&key, "payload");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, sigv4::signature(&key, "other payload"));
    }
}
