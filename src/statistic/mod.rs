//! Usage statistics reported through status requests
//!
//! Counters accumulate bytes transferred, page views and HTTPS request
//! domains. A flush happens when the interval elapses, when the number of
//! distinct entries reaches the threshold, or when forced at teardown. A
//! failed upload widens both thresholds and keeps the counters.

mod tracker;

pub use tracker::TrackedStream;

use crate::config::StatsConfig;
use crate::Result;
use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Bucket for entries no rule matched
pub const OTHER_ENTRY: &str = "(OTHER)";

/// Raw normalisation rule as delivered by the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexReplace {
    pub regex: String,
    pub replace: String,
}

struct Rule {
    regex: Regex,
    replace: String,
}

#[derive(Default)]
struct Rules {
    page_views: Vec<Rule>,
    https_requests: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageViewCount {
    pub page: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpsRequestCount {
    pub domain: String,
    pub count: u64,
}

/// JSON body of a status request
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub padding: String,
    pub bytes_transferred: u64,
    pub page_views: Vec<PageViewCount>,
    pub https_requests: Vec<HttpsRequestCount>,
}

/// Sends a status payload to the server
#[async_trait]
pub trait StatusUploader: Send + Sync {
    async fn upload(&self, payload: &StatusPayload, is_final: bool) -> Result<()>;
}

struct Schedule {
    last_send: Option<Instant>,
    interval: Duration,
    max_entries: usize,
}

/// Accumulates usage counters and decides when to upload them
pub struct StatsReporter {
    bytes_transferred: AtomicU64,
    page_views: DashMap<String, u64>,
    https_requests: DashMap<String, u64>,
    rules: RwLock<Rules>,
    schedule: Mutex<Schedule>,
    base_interval: Duration,
    base_max_entries: usize,
}

impl StatsReporter {
    pub fn new(config: &StatsConfig) -> Self {
        StatsReporter {
            bytes_transferred: AtomicU64::new(0),
            page_views: DashMap::new(),
            https_requests: DashMap::new(),
            rules: RwLock::new(Rules::default()),
            schedule: Mutex::new(Schedule {
                last_send: None,
                interval: config.interval(),
                max_entries: config.entry_threshold,
            }),
            base_interval: config.interval(),
            base_max_entries: config.entry_threshold,
        }
    }

    /// Install the normalisation rules from a handshake.
    ///
    /// Patterns are case-insensitive; invalid ones are skipped.
    pub fn set_regexes(&self, page_views: &[RegexReplace], https_requests: &[RegexReplace]) {
        let mut rules = self.rules.write();
        rules.page_views = compile_rules(page_views);
        rules.https_requests = compile_rules(https_requests);
    }

    pub fn add_bytes(&self, count: u64) {
        self.bytes_transferred.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn record_page_view(&self, url: &str) {
        let key = normalise(&self.rules.read().page_views, url);
        if let Some(key) = key {
            *self.page_views.entry(key).or_insert(0) += 1;
        }
    }

    pub fn record_https_request(&self, domain: &str) {
        let key = normalise(&self.rules.read().https_requests, domain);
        if let Some(key) = key {
            *self.https_requests.entry(key).or_insert(0) += 1;
        }
    }

    /// Number of distinct page view and HTTPS request entries
    pub fn entry_count(&self) -> usize {
        self.page_views.len() + self.https_requests.len()
    }

    pub fn page_view_count(&self, key: &str) -> u64 {
        self.page_views.get(key).map(|c| *c).unwrap_or(0)
    }

    pub fn https_request_count(&self, key: &str) -> u64 {
        self.https_requests.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Whether a periodic flush is due at `now`. The first check only
    /// starts the clock.
    pub fn is_due(&self, now: Instant) -> bool {
        let mut schedule = self.schedule.lock();
        let last = *schedule.last_send.get_or_insert(now);
        now.saturating_duration_since(last) >= schedule.interval
            || self.entry_count() >= schedule.max_entries
    }

    /// Build the status body from the current counters
    pub fn payload(&self) -> StatusPayload {
        let mut page_views: Vec<PageViewCount> = self
            .page_views
            .iter()
            .map(|e| PageViewCount {
                page: e.key().clone(),
                count: *e.value(),
            })
            .collect();
        page_views.sort_by(|a, b| a.page.cmp(&b.page));
        let mut https_requests: Vec<HttpsRequestCount> = self
            .https_requests
            .iter()
            .map(|e| HttpsRequestCount {
                domain: e.key().clone(),
                count: *e.value(),
            })
            .collect();
        https_requests.sort_by(|a, b| a.domain.cmp(&b.domain));

        StatusPayload {
            padding: random_padding(),
            bytes_transferred: self.bytes_transferred(),
            page_views,
            https_requests,
        }
    }

    /// Upload if due (or unconditionally when `is_final`).
    ///
    /// Returns true when an upload succeeded.
    pub async fn flush_if_due(
        &self,
        uploader: &dyn StatusUploader,
        now: Instant,
        is_final: bool,
    ) -> bool {
        if !is_final && !self.is_due(now) {
            return false;
        }

        let payload = self.payload();
        debug!(
            "Sending stats{}: {} bytes, {} entries",
            if is_final { " (final)" } else { "" },
            payload.bytes_transferred,
            payload.page_views.len() + payload.https_requests.len()
        );

        match uploader.upload(&payload, is_final).await {
            Ok(()) => {
                self.subtract(&payload);
                let jitter = rand::thread_rng().gen_range(0..self.base_interval.as_millis().max(1) as u64);
                let mut schedule = self.schedule.lock();
                schedule.last_send = Some(now);
                schedule.interval = self.base_interval + Duration::from_millis(jitter);
                schedule.max_entries = self.base_max_entries;
                true
            }
            Err(e) => {
                let mut schedule = self.schedule.lock();
                schedule.interval += self.base_interval;
                schedule.max_entries += self.base_max_entries;
                if is_final {
                    warn!("Final status request failed: {}", e);
                } else {
                    debug!("Sending stats failed: {}", e);
                }
                false
            }
        }
    }

    /// Clear counters and thresholds for a new session
    pub fn reset(&self) {
        self.bytes_transferred.store(0, Ordering::Relaxed);
        self.page_views.clear();
        self.https_requests.clear();
        let mut schedule = self.schedule.lock();
        schedule.last_send = None;
        schedule.interval = self.base_interval;
        schedule.max_entries = self.base_max_entries;
    }

    /// Remove what was uploaded, keeping anything counted meanwhile
    fn subtract(&self, payload: &StatusPayload) {
        self.bytes_transferred
            .fetch_sub(payload.bytes_transferred, Ordering::Relaxed);
        for item in &payload.page_views {
            self.page_views
                .remove_if_mut(&item.page, |_, count| {
                    *count = count.saturating_sub(item.count);
                    *count == 0
                });
        }
        for item in &payload.https_requests {
            self.https_requests
                .remove_if_mut(&item.domain, |_, count| {
                    *count = count.saturating_sub(item.count);
                    *count == 0
                });
        }
    }
}

fn compile_rules(raw: &[RegexReplace]) -> Vec<Rule> {
    raw.iter()
        .filter_map(|r| {
            match RegexBuilder::new(&r.regex).case_insensitive(true).build() {
                Ok(regex) => Some(Rule {
                    regex,
                    replace: r.replace.clone(),
                }),
                Err(e) => {
                    warn!("Ignoring invalid stats regex {:?}: {}", r.regex, e);
                    None
                }
            }
        })
        .collect()
}

/// First matching rule wins; unmatched input counts as OTHER; an empty
/// result is dropped.
fn normalise(rules: &[Rule], input: &str) -> Option<String> {
    let key = rules
        .iter()
        .find(|r| r.regex.is_match(input))
        .map(|r| r.regex.replace(input, r.replace.as_str()).into_owned())
        .unwrap_or_else(|| OTHER_ENTRY.to_string());
    (!key.is_empty()).then_some(key)
}

/// base64 of 0-255 random bytes, so status bodies vary in size
fn random_padding() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..=255usize);
    let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::AtomicBool;

    struct Uploader {
        fail: AtomicBool,
        sent: Mutex<Vec<(StatusPayload, bool)>>,
    }

    impl Uploader {
        fn new(fail: bool) -> Self {
            Uploader {
                fail: AtomicBool::new(fail),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StatusUploader for Uploader {
        async fn upload(&self, payload: &StatusPayload, is_final: bool) -> Result<()> {
            self.sent.lock().push((payload.clone(), is_final));
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::connection("status failed"))
            } else {
                Ok(())
            }
        }
    }

    fn reporter(interval_secs: u64, threshold: usize) -> StatsReporter {
        StatsReporter::new(&StatsConfig {
            interval_secs,
            entry_threshold: threshold,
        })
    }

    #[test]
    fn test_regex_normalisation() {
        let stats = reporter(300, 1000);
        stats.set_regexes(
            &[
                RegexReplace {
                    regex: r"^https?://(?:www\.)?([^/]+)/.*$".into(),
                    replace: "$1".into(),
                },
                RegexReplace {
                    regex: "never".into(),
                    replace: "x".into(),
                },
            ],
            &[RegexReplace {
                regex: r"^private\..*$".into(),
                replace: "".into(),
            }],
        );

        stats.record_page_view("http://www.Example.com/index.html");
        stats.record_page_view("HTTP://example.com/other");
        stats.record_page_view("not a url");
        stats.record_https_request("private.example");
        stats.record_https_request("example.org");

        assert_eq!(stats.page_view_count("Example.com"), 1);
        assert_eq!(stats.page_view_count("example.com"), 1);
        assert_eq!(stats.page_view_count(OTHER_ENTRY), 1);
        assert_eq!(stats.https_request_count(OTHER_ENTRY), 1);
        assert_eq!(stats.entry_count(), 4);
    }

    #[test]
    fn test_invalid_regex_skipped() {
        let stats = reporter(300, 1000);
        stats.set_regexes(
            &[RegexReplace {
                regex: "(".into(),
                replace: "x".into(),
            }],
            &[],
        );
        stats.record_page_view("http://example.com/");
        assert_eq!(stats.page_view_count(OTHER_ENTRY), 1);
    }

    #[test]
    fn test_padding_is_base64_and_bounded() {
        for _ in 0..20 {
            let padding = random_padding();
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(&padding)
                .unwrap();
            assert!(decoded.len() <= 255);
        }
    }

    #[tokio::test]
    async fn test_time_threshold() {
        let stats = reporter(10, 1000);
        let uploader = Uploader::new(false);
        let start = Instant::now();

        assert!(!stats.flush_if_due(&uploader, start, false).await);
        assert!(
            !stats
                .flush_if_due(&uploader, start + Duration::from_secs(5), false)
                .await
        );
        assert!(
            stats
                .flush_if_due(&uploader, start + Duration::from_secs(10), false)
                .await
        );
        assert_eq!(uploader.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_count_threshold_and_clear_on_success() {
        let stats = reporter(3600, 2);
        let uploader = Uploader::new(false);
        let now = Instant::now();
        stats.add_bytes(100);
        stats.record_page_view("a");
        assert!(!stats.flush_if_due(&uploader, now, false).await);

        stats.record_https_request("b");
        assert!(stats.flush_if_due(&uploader, now, false).await);
        assert_eq!(stats.entry_count(), 0);
        assert_eq!(stats.bytes_transferred(), 0);

        let sent = uploader.sent.lock();
        assert_eq!(sent[0].0.bytes_transferred, 100);
        assert_eq!(sent[0].0.page_views.len(), 1);
        assert_eq!(sent[0].0.https_requests.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_backs_off_and_keeps_counters() {
        let stats = reporter(10, 2);
        let uploader = Uploader::new(true);
        let start = Instant::now();
        stats.add_bytes(42);
        stats.record_page_view("a");
        stats.record_page_view("b");

        assert!(!stats.flush_if_due(&uploader, start, false).await);
        assert_eq!(uploader.sent.lock().len(), 1);
        assert_eq!(stats.bytes_transferred(), 42);
        assert_eq!(stats.entry_count(), 2);

        // Thresholds doubled: 2 entries and 10s no longer trigger
        assert!(!stats.is_due(start + Duration::from_secs(15)));
        assert!(stats.is_due(start + Duration::from_secs(20)));
    }

    #[tokio::test]
    async fn test_final_flush_is_forced() {
        let stats = reporter(3600, 1000);
        let uploader = Uploader::new(false);
        assert!(stats.flush_if_due(&uploader, Instant::now(), true).await);
        assert!(uploader.sent.lock()[0].1);
    }

    #[test]
    fn test_payload_json_shape() {
        let stats = reporter(300, 1000);
        stats.record_page_view("a");
        let json = serde_json::to_value(stats.payload()).unwrap();
        assert!(json["padding"].is_string());
        assert_eq!(json["bytes_transferred"], 0);
        assert_eq!(json["page_views"][0]["page"], OTHER_ENTRY);
        assert_eq!(json["page_views"][0]["count"], 1);
        assert!(json["https_requests"].as_array().unwrap().is_empty());
    }
}
