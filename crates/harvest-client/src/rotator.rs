use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
const EMERGENCY_LOG_EVERY: u64 = 50;
const HIGH_RISK_LOG_EVERY: u64 = 100;

const ACCEPT_LANGUAGE: &str = "ja-JP,ja;q=0.9,en;q=0.8";
const ACCEPT_ENCODING: &str = "gzip, deflate, br";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrowserFamily {
    Chrome,
    Firefox,
    Safari,
    Edge,
}

impl BrowserFamily {
    pub fn is_chromium(&self) -> bool {
        matches!(self, BrowserFamily::Chrome | BrowserFamily::Edge)
    }

    fn accept(&self) -> &'static str {
        match self {
            BrowserFamily::Firefox => {
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
            }
            BrowserFamily::Safari => {
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"
            }
            BrowserFamily::Chrome | BrowserFamily::Edge => {
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8"
            }
        }
    }

    fn brand(&self) -> &'static str {
        match self {
            BrowserFamily::Chrome => "Google Chrome",
            BrowserFamily::Edge => "Microsoft Edge",
            BrowserFamily::Firefox => "Firefox",
            BrowserFamily::Safari => "Safari",
        }
    }
}

impl fmt::Display for BrowserFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BrowserFamily::Chrome => "chrome",
            BrowserFamily::Firefox => "firefox",
            BrowserFamily::Safari => "safari",
            BrowserFamily::Edge => "edge",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserProfile {
    pub browser: BrowserFamily,
    pub platform: String,
    pub version: String,
    pub user_agent: String,
    pub mobile: bool,
}

impl BrowserProfile {
    pub fn new(browser: BrowserFamily, platform: &str, version: &str, user_agent: String) -> Self {
        Self {
            browser,
            platform: platform.to_string(),
            version: version.to_string(),
            user_agent,
            mobile: matches!(platform, "iOS" | "Android"),
        }
    }

    pub fn label(&self) -> String {
        format!("{}-{}", self.browser, self.platform.to_ascii_lowercase())
    }
}

/// The 18-profile desktop + mobile pool.
pub fn default_profiles() -> Vec<BrowserProfile> {
    let mut profiles = Vec::with_capacity(18);

    let chrome_platforms = [
        ("Windows", "Windows NT 10.0; Win64; x64"),
        ("macOS", "Macintosh; Intel Mac OS X 10_15_7"),
        ("Linux", "X11; Linux x86_64"),
    ];
    for version in ["120", "119"] {
        for (platform, os) in chrome_platforms {
            profiles.push(BrowserProfile::new(
                BrowserFamily::Chrome,
                platform,
                version,
                format!("Mozilla/5.0 ({os}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version}.0.0.0 Safari/537.36"),
            ));
        }
    }

    let firefox_platforms = [
        ("Windows", "Windows NT 10.0; Win64; x64"),
        ("macOS", "Macintosh; Intel Mac OS X 10.15"),
        ("Linux", "X11; Linux x86_64"),
    ];
    for version in ["121", "120"] {
        for (platform, os) in firefox_platforms {
            profiles.push(BrowserProfile::new(
                BrowserFamily::Firefox,
                platform,
                version,
                format!("Mozilla/5.0 ({os}; rv:{version}.0) Gecko/20100101 Firefox/{version}.0"),
            ));
        }
    }

    for version in ["17.2", "17.1"] {
        profiles.push(BrowserProfile::new(
            BrowserFamily::Safari,
            "macOS",
            version,
            format!(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/{version} Safari/605.1.15"
            ),
        ));
    }

    for version in ["120", "119"] {
        profiles.push(BrowserProfile::new(
            BrowserFamily::Edge,
            "Windows",
            version,
            format!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{version}.0.0.0 Safari/537.36 Edg/{version}.0.0.0"
            ),
        ));
    }

    profiles.push(BrowserProfile::new(
        BrowserFamily::Safari,
        "iOS",
        "17.2",
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1".to_string(),
    ));
    profiles.push(BrowserProfile::new(
        BrowserFamily::Chrome,
        "Android",
        "120",
        "Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36".to_string(),
    ));

    profiles
}

#[derive(Debug, Error)]
pub enum RotatorError {
    #[error("identity rotator configured with an empty profile pool")]
    EmptyPool,
    #[error("invalid header value for {header}")]
    InvalidHeader {
        header: &'static str,
        #[source]
        source: reqwest::header::InvalidHeaderValue,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DetectionRisk {
    Low,
    Medium,
    High,
}

impl DetectionRisk {
    fn from_variance(variance: f64) -> Self {
        if variance > 20.0 {
            DetectionRisk::High
        } else if variance > 10.0 {
            DetectionRisk::Medium
        } else {
            DetectionRisk::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RotatorStats {
    pub total_requests: u64,
    pub emergency_selections: u64,
    pub distribution: BTreeMap<String, u64>,
    pub last_rotation: Option<DateTime<Utc>>,
    pub usage_variance: f64,
    pub detection_risk: DetectionRisk,
}

#[derive(Debug, Clone)]
struct ProfileSlot {
    profile: BrowserProfile,
    last_used: Option<Instant>,
    use_count: u64,
}

#[derive(Debug)]
struct RotatorState {
    slots: Vec<ProfileSlot>,
    total_requests: u64,
    emergency_selections: u64,
    last_rotation: Option<DateTime<Utc>>,
    risk: DetectionRisk,
}

/// Picks a request fingerprint per call, spreading load across a fixed pool.
///
/// One instance per process; clone the surrounding `Arc` to share it.
#[derive(Debug)]
pub struct IdentityRotator {
    cooldown: Duration,
    state: Mutex<RotatorState>,
}

impl IdentityRotator {
    pub fn new(profiles: Vec<BrowserProfile>, cooldown: Duration) -> Result<Self, RotatorError> {
        if profiles.is_empty() {
            return Err(RotatorError::EmptyPool);
        }
        let slots = profiles
            .into_iter()
            .map(|profile| ProfileSlot {
                profile,
                last_used: None,
                use_count: 0,
            })
            .collect();
        Ok(Self {
            cooldown,
            state: Mutex::new(RotatorState {
                slots,
                total_requests: 0,
                emergency_selections: 0,
                last_rotation: None,
                risk: DetectionRisk::Low,
            }),
        })
    }

    pub fn with_default_profiles(cooldown: Duration) -> Result<Self, RotatorError> {
        Self::new(default_profiles(), cooldown)
    }

    pub fn pool_size(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Headers for the next outbound request.
    pub fn next_headers(&self, referer: Option<&str>) -> Result<HeaderMap, RotatorError> {
        let profile = self.select_at(Instant::now());
        build_headers(&profile, referer)
    }

    /// Selection step alone, with an explicit clock reading.
    pub fn select_at(&self, now: Instant) -> BrowserProfile {
        let mut state = self.state.lock();
        let cooldown = self.cooldown;

        let rested = |slot: &ProfileSlot| {
            slot.last_used
                .map(|used| now.saturating_duration_since(used) > cooldown)
                .unwrap_or(true)
        };

        let candidate = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| rested(slot))
            .min_by_key(|(_, slot)| (slot.use_count, slot.last_used))
            .map(|(idx, _)| idx);

        let idx = match candidate {
            Some(idx) => idx,
            None => {
                state.emergency_selections += 1;
                if state.total_requests % EMERGENCY_LOG_EVERY == 0 {
                    warn!(
                        total_requests = state.total_requests,
                        emergency_selections = state.emergency_selections,
                        "all identity profiles cooling down; using least recently used"
                    );
                }
                state
                    .slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.last_used)
                    .map(|(idx, _)| idx)
                    .unwrap_or(0)
            }
        };

        let slot = &mut state.slots[idx];
        slot.last_used = Some(now);
        slot.use_count += 1;
        let profile = slot.profile.clone();

        state.total_requests += 1;
        state.last_rotation = Some(Utc::now());
        state.risk = DetectionRisk::from_variance(usage_variance(&state.slots));
        if state.risk == DetectionRisk::High && state.total_requests % HIGH_RISK_LOG_EVERY == 0 {
            warn!(total_requests = state.total_requests, "identity usage skew is high");
        }

        profile
    }

    pub fn stats(&self) -> RotatorStats {
        let state = self.state.lock();
        let mut distribution = BTreeMap::new();
        for slot in &state.slots {
            *distribution.entry(slot.profile.label()).or_insert(0) += slot.use_count;
        }
        let usage_variance = usage_variance(&state.slots);
        RotatorStats {
            total_requests: state.total_requests,
            emergency_selections: state.emergency_selections,
            distribution,
            last_rotation: state.last_rotation,
            usage_variance,
            detection_risk: state.risk,
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        for slot in &mut state.slots {
            slot.last_used = None;
            slot.use_count = 0;
        }
        state.total_requests = 0;
        state.emergency_selections = 0;
        state.last_rotation = None;
        state.risk = DetectionRisk::Low;
    }

    pub fn log_summary(&self) {
        let stats = self.stats();
        info!(
            total_requests = stats.total_requests,
            emergency_selections = stats.emergency_selections,
            usage_variance = stats.usage_variance,
            risk = ?stats.detection_risk,
            distribution = ?stats.distribution,
            "identity rotation summary"
        );
    }
}

fn usage_variance(slots: &[ProfileSlot]) -> f64 {
    if slots.is_empty() {
        return 0.0;
    }
    let n = slots.len() as f64;
    let mean = slots.iter().map(|s| s.use_count as f64).sum::<f64>() / n;
    slots
        .iter()
        .map(|s| {
            let d = s.use_count as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n
}

fn header_value(header: &'static str, value: &str) -> Result<HeaderValue, RotatorError> {
    HeaderValue::from_str(value).map_err(|source| RotatorError::InvalidHeader { header, source })
}

pub fn build_headers(
    profile: &BrowserProfile,
    referer: Option<&str>,
) -> Result<HeaderMap, RotatorError> {
    let mut headers = HeaderMap::new();
    let mut put = |name: &'static str, value: &str| -> Result<(), RotatorError> {
        headers.insert(HeaderName::from_static(name), header_value(name, value)?);
        Ok(())
    };

    put("user-agent", &profile.user_agent)?;
    put("accept", profile.browser.accept())?;
    put("accept-language", ACCEPT_LANGUAGE)?;
    put("accept-encoding", ACCEPT_ENCODING)?;
    put("cache-control", "no-cache")?;
    put("pragma", "no-cache")?;
    put("upgrade-insecure-requests", "1")?;

    if profile.browser.is_chromium() {
        let major = profile.version.split('.').next().unwrap_or(&profile.version);
        put(
            "sec-ch-ua",
            &format!(
                "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{major}\", \"{}\";v=\"{major}\"",
                profile.browser.brand()
            ),
        )?;
        put("sec-ch-ua-mobile", if profile.mobile { "?1" } else { "?0" })?;
        put("sec-ch-ua-platform", &format!("\"{}\"", profile.platform))?;
        put("sec-fetch-dest", "document")?;
        put("sec-fetch-mode", "navigate")?;
        put("sec-fetch-site", if referer.is_some() { "same-origin" } else { "none" })?;
    }

    if let Some(referer) = referer {
        put("referer", referer)?;
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_has_eighteen_distinct_agents() {
        let profiles = default_profiles();
        assert_eq!(profiles.len(), 18);
        let mut agents: Vec<_> = profiles.iter().map(|p| p.user_agent.as_str()).collect();
        agents.sort_unstable();
        agents.dedup();
        assert_eq!(agents.len(), 18);
    }

    #[test]
    fn empty_pool_is_a_configuration_error() {
        assert!(matches!(
            IdentityRotator::new(Vec::new(), DEFAULT_COOLDOWN),
            Err(RotatorError::EmptyPool)
        ));
    }

    #[test]
    fn thousand_calls_stay_balanced() {
        let rotator = IdentityRotator::with_default_profiles(Duration::from_secs(30)).unwrap();
        let start = Instant::now();
        for i in 0..1000u64 {
            rotator.select_at(start + Duration::from_millis(i * 250));
        }

        let stats = rotator.stats();
        assert_eq!(stats.total_requests, 1000);
        let counts: Vec<u64> = {
            let state = rotator.state.lock();
            state.slots.iter().map(|s| s.use_count).collect()
        };
        let max = counts.iter().copied().max().unwrap();
        let min = counts.iter().copied().min().unwrap();
        assert!(max - min <= 1, "counts drifted: {counts:?}");
        assert_eq!(stats.detection_risk, DetectionRisk::Low);
    }

    #[test]
    fn rested_profiles_win_over_cooling_ones() {
        let profiles = default_profiles().into_iter().take(3).collect();
        let rotator = IdentityRotator::new(profiles, Duration::from_secs(30)).unwrap();
        let t0 = Instant::now();

        let a = rotator.select_at(t0);
        let b = rotator.select_at(t0 + Duration::from_secs(1));
        let c = rotator.select_at(t0 + Duration::from_secs(2));
        assert_ne!(a, b);
        assert_ne!(b, c);

        // every profile cooling: least recently used is `a`
        let emergency = rotator.select_at(t0 + Duration::from_secs(3));
        assert_eq!(emergency, a);
        assert_eq!(rotator.stats().emergency_selections, 1);

        // after the cooldown `b` has rested and has the lowest count
        let rested = rotator.select_at(t0 + Duration::from_secs(32));
        assert_eq!(rested, b);
    }

    #[test]
    fn reset_clears_usage() {
        let rotator = IdentityRotator::with_default_profiles(DEFAULT_COOLDOWN).unwrap();
        rotator.next_headers(None).unwrap();
        rotator.reset();
        let stats = rotator.stats();
        assert_eq!(stats.total_requests, 0);
        assert!(stats.last_rotation.is_none());
        assert!(stats.distribution.values().all(|count| *count == 0));
    }

    #[test]
    fn client_hints_only_for_chromium_profiles() {
        let profiles = default_profiles();
        let chrome = profiles.iter().find(|p| p.browser == BrowserFamily::Chrome).unwrap();
        let firefox = profiles.iter().find(|p| p.browser == BrowserFamily::Firefox).unwrap();

        let headers = build_headers(chrome, Some("https://example.test/")).unwrap();
        assert_eq!(headers["sec-fetch-site"], "same-origin");
        assert_eq!(headers["sec-ch-ua-platform"], "\"Windows\"");
        assert!(headers["sec-ch-ua"].to_str().unwrap().contains("\"Google Chrome\";v=\"120\""));
        assert_eq!(headers["referer"], "https://example.test/");
        assert_eq!(headers["accept-language"], ACCEPT_LANGUAGE);

        let headers = build_headers(firefox, None).unwrap();
        assert!(headers.get("sec-ch-ua").is_none());
        assert!(headers.get("sec-fetch-site").is_none());
        assert!(headers.get("referer").is_none());
        assert!(headers["accept"].to_str().unwrap().contains("image/avif"));
    }

    #[test]
    fn risk_levels_follow_variance() {
        assert_eq!(DetectionRisk::from_variance(4.0), DetectionRisk::Low);
        assert_eq!(DetectionRisk::from_variance(15.0), DetectionRisk::Medium);
        assert_eq!(DetectionRisk::from_variance(25.0), DetectionRisk::High);
    }
}
