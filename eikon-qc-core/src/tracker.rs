//! Asset tracker client.
//!
//! Tracker calls never fail the caller: transport errors, timeouts and
//! non-2xx responses collapse into [`TrackerLookup`] status fields or a
//! `false` from [`AssetTracker::set_qc`].

use std::{fmt, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    config::TrackerSettings,
    error::{QcError, Result},
    sidecar::SidecarRecord,
};

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_UNAUTHORIZED: &str = "unauthorized";
pub const STATUS_DISABLED: &str = "disabled";

/// Result of a lookup-by-path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackerLookup {
    pub asset_id: Option<String>,
    pub status: Option<String>,
    pub http_code: Option<u16>,
}

impl TrackerLookup {
    fn failed(status: &str, http_code: Option<u16>) -> Self {
        Self {
            asset_id: None,
            status: Some(status.to_string()),
            http_code,
        }
    }
}

#[async_trait]
pub trait AssetTracker: Send + Sync + fmt::Debug {
    async fn lookup_by_path(&self, path: &Path) -> TrackerLookup;

    /// Post a verdict. Returns `false` without contacting the tracker when
    /// there is no id or the verdict is still pending.
    async fn set_qc(&self, asset_id: Option<&str>, record: &SidecarRecord) -> bool;
}

/// Tracker used when no endpoint is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledTracker;

#[async_trait]
impl AssetTracker for DisabledTracker {
    async fn lookup_by_path(&self, _path: &Path) -> TrackerLookup {
        TrackerLookup::failed(STATUS_DISABLED, None)
    }

    async fn set_qc(&self, _asset_id: Option<&str>, _record: &SidecarRecord) -> bool {
        false
    }
}

/// HTTP/JSON tracker client.
pub struct HttpTracker {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl fmt::Debug for HttpTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTracker")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl HttpTracker {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QcError::Config(format!("tracker client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/plain"));
        if let Some(key) = &self.api_key
            && let Ok(value) = HeaderValue::from_str(key)
        {
            headers.insert("x-api-key", value);
        }
        headers
    }
}

#[async_trait]
impl AssetTracker for HttpTracker {
    async fn lookup_by_path(&self, path: &Path) -> TrackerLookup {
        let url = format!("{}/asset/asset-search", self.base_url);
        let body = json!({
            "searchPage": {"pageSize": 100},
            "assetSearchType": 2,
            "includeCustomer": false,
            "assetPath": path.to_string_lossy().replace('\\', "/"),
            "tagIds": [],
        });

        let response = match self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                debug!("tracker lookup for {:?} failed: {}", path, err);
                return TrackerLookup::failed(STATUS_ERROR, None);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let label = match status.as_u16() {
                401 | 403 => STATUS_UNAUTHORIZED,
                _ => STATUS_ERROR,
            };
            debug!("tracker lookup for {:?} returned {}", path, status);
            return TrackerLookup::failed(label, Some(status.as_u16()));
        }

        match response.json::<Value>().await {
            Ok(data) => TrackerLookup {
                asset_id: asset_id_from_search(&data),
                status: Some(STATUS_OK.to_string()),
                http_code: Some(status.as_u16()),
            },
            Err(err) => {
                debug!("tracker lookup for {:?} returned junk: {}", path, err);
                TrackerLookup::failed(STATUS_ERROR, Some(status.as_u16()))
            }
        }
    }

    async fn set_qc(&self, asset_id: Option<&str>, record: &SidecarRecord) -> bool {
        let Some(asset_id) = asset_id.filter(|id| !id.is_empty()) else {
            return false;
        };
        if record.qc_result.is_pending() {
            return false;
        }

        let url = format!("{}/assets/{}/qc", self.base_url, asset_id);
        match self
            .http
            .post(&url)
            .headers(self.headers())
            .json(record)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!("tracker set_qc for {} failed: {}", asset_id, err);
                false
            }
        }
    }
}

/// `items[0].asset_id`, falling back to a top-level `asset_id`.
fn asset_id_from_search(data: &Value) -> Option<String> {
    let first_item = data
        .get("items")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("asset_id"));

    first_item
        .and_then(id_string)
        .or_else(|| data.get("asset_id").and_then(id_string))
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// HTTP tracker when a base URL is configured, otherwise [`DisabledTracker`].
pub fn tracker_from_settings(settings: &TrackerSettings) -> Result<Arc<dyn AssetTracker>> {
    match settings.base_url.as_deref().map(str::trim) {
        Some(base) if !base.is_empty() => Ok(Arc::new(HttpTracker::new(
            base,
            settings.api_key.clone(),
            Duration::from_secs(settings.timeout_secs.max(1)),
        )?)),
        _ => Ok(Arc::new(DisabledTracker)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::QcResult;

    #[test]
    fn search_prefers_first_item_id() {
        let data = json!({"items": [{"asset_id": "A-1"}, {"asset_id": "A-2"}], "asset_id": "top"});
        assert_eq!(asset_id_from_search(&data).as_deref(), Some("A-1"));
    }

    #[test]
    fn search_falls_back_to_top_level_and_numbers() {
        assert_eq!(
            asset_id_from_search(&json!({"items": [], "asset_id": 77})).as_deref(),
            Some("77")
        );
        assert_eq!(asset_id_from_search(&json!({"items": [{}]})), None);
        assert_eq!(asset_id_from_search(&json!({})), None);
    }

    #[test]
    fn settings_without_base_url_disable_the_tracker() {
        let tracker = tracker_from_settings(&TrackerSettings::default()).expect("tracker");
        assert!(format!("{tracker:?}").contains("DisabledTracker"));
    }

    #[test]
    fn api_key_is_redacted_from_debug() {
        let tracker = HttpTracker::new(
            "https://trak.example/",
            Some("s3cret".into()),
            Duration::from_secs(5),
        )
        .expect("client");
        let rendered = format!("{tracker:?}");
        assert!(rendered.contains("https://trak.example\""));
        assert!(!rendered.contains("s3cret"));
    }

    #[tokio::test]
    async fn http_set_qc_short_circuits_without_network() {
        // Port 9 on localhost would refuse; these paths must not get that far.
        let tracker = HttpTracker::new("http://127.0.0.1:9", None, Duration::from_secs(1))
            .expect("client");

        let pending = SidecarRecord::default();
        assert!(!tracker.set_qc(Some("A-1"), &pending).await);

        let pass = SidecarRecord {
            qc_result: QcResult::Pass,
            ..SidecarRecord::default()
        };
        assert!(!tracker.set_qc(None, &pass).await);
    }

    #[tokio::test]
    async fn disabled_tracker_reports_status() {
        let lookup = DisabledTracker.lookup_by_path(Path::new("/x")).await;
        assert_eq!(lookup.status.as_deref(), Some(STATUS_DISABLED));
        assert_eq!(lookup.asset_id, None);
    }
}
