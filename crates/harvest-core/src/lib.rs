//! Core domain model for the catalog harvester.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "harvest-core";

/// Marketplace product identifier: `RJ` followed by 6 to 8 digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemIdError {
    #[error("invalid item id {0:?}: expected RJ followed by 6-8 digits")]
    InvalidFormat(String),
}

impl ItemId {
    pub fn parse(raw: &str) -> Result<Self, ItemIdError> {
        let trimmed = raw.trim();
        let valid = trimmed
            .strip_prefix("RJ")
            .map(|digits| {
                (6..=8).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit())
            })
            .unwrap_or(false);
        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(ItemIdError::InvalidFormat(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ItemId {
    type Err = ItemIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ItemId {
    type Error = ItemIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ItemId> for String {
    fn from(value: ItemId) -> Self {
        value.0
    }
}

/// Upstream fields arrive as numbers, numeric strings or null depending on the item.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn f64_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.replace(',', "").trim().parse().ok(),
            _ => None,
        })
    }

    pub fn i64_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Some(Value::String(s)) => s.replace(',', "").trim().parse().ok(),
            _ => None,
        })
    }

    pub fn string_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn bool_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::Bool(b)) => Some(b),
            Some(Value::Number(n)) => n.as_i64().map(|v| v != 0),
            Some(Value::String(s)) => match s.trim() {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            },
            _ => None,
        })
    }
}

/// One element of the upstream product array, exactly as received.
///
/// Only the fields the harvester reads are typed; everything else is kept in
/// `extra` so the payload survives a round trip untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(
        default,
        deserialize_with = "lenient::string_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub workno: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::string_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub product_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::string_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub work_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::string_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub maker_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::string_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub maker_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::string_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub work_type: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::f64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub price: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient::f64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub official_price: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient::f64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub discount_rate: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient::string_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub campaign_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::f64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub rate_average_star: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient::i64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub rate_count: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient::i64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub dl_count: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient::bool_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub on_sale: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient::string_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub regist_date: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl RawRecord {
    /// The canonical identifier, preferring `workno` over `product_id`.
    pub fn identifier(&self) -> Option<&str> {
        self.workno.as_deref().or(self.product_id.as_deref())
    }

    pub fn has_identifier(&self) -> bool {
        self.identifier().is_some()
    }

    /// Price state carried by this payload, or `None` when no price field is present.
    pub fn price_point(&self) -> Option<PricePoint> {
        let regular_price = self.official_price.or(self.price)?;
        let discount_price = self.price.filter(|p| *p < regular_price);
        Some(PricePoint {
            regular_price,
            discount_price,
            discount_rate: self.discount_rate.unwrap_or(0.0).clamp(0.0, 100.0),
            campaign_id: self.campaign_id.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPrice {
    pub current: Option<f64>,
    pub original: Option<f64>,
    pub discount_rate: f64,
    pub campaign_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRating {
    pub stars: f64,
    pub count: i64,
}

/// Normalized current-state view of one item, keyed by `product_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDocument {
    pub product_id: String,
    pub title: String,
    pub circle: Option<String>,
    pub circle_id: Option<String>,
    pub category: Option<String>,
    pub price: DocumentPrice,
    pub rating: Option<DocumentRating>,
    pub download_count: Option<i64>,
    pub on_sale: bool,
    pub registered_at: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StorageDocument {
    pub fn key(&self) -> &str {
        &self.product_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("payload carries neither workno nor product_id")]
    MissingIdentifier,
}

/// Pure mapping from an upstream payload to its storage document.
pub fn map_raw_record(
    raw: &RawRecord,
    now: DateTime<Utc>,
) -> Result<StorageDocument, MappingError> {
    let product_id = raw
        .identifier()
        .map(str::to_string)
        .ok_or(MappingError::MissingIdentifier)?;

    let rating = match (raw.rate_average_star, raw.rate_count) {
        (Some(stars), count) if (0.0..=5.0).contains(&stars) => Some(DocumentRating {
            stars,
            count: count.unwrap_or(0),
        }),
        _ => None,
    };

    Ok(StorageDocument {
        title: raw.work_name.clone().unwrap_or_default(),
        circle: raw.maker_name.clone(),
        circle_id: raw.maker_id.clone(),
        category: raw.work_type.clone(),
        price: DocumentPrice {
            current: raw.price,
            original: raw.official_price,
            discount_rate: raw.discount_rate.unwrap_or(0.0).clamp(0.0, 100.0),
            campaign_id: raw.campaign_id.clone(),
        },
        rating,
        download_count: raw.dl_count,
        on_sale: raw.on_sale.unwrap_or(true),
        registered_at: raw.regist_date.clone(),
        created_at: now,
        updated_at: now,
        product_id,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    NotFound,
    AccessDenied,
    Timeout,
    ValidationError,
    RegionRestriction,
    Unknown,
}

impl FailureReason {
    pub const ALL: [FailureReason; 6] = [
        FailureReason::NotFound,
        FailureReason::AccessDenied,
        FailureReason::Timeout,
        FailureReason::ValidationError,
        FailureReason::RegionRestriction,
        FailureReason::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NotFound => "NOT_FOUND",
            FailureReason::AccessDenied => "ACCESS_DENIED",
            FailureReason::Timeout => "TIMEOUT",
            FailureReason::ValidationError => "VALIDATION_ERROR",
            FailureReason::RegionRestriction => "REGION_RESTRICTION",
            FailureReason::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = std::convert::Infallible;

    /// Unrecognized reasons collapse to `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(FailureReason::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .unwrap_or(FailureReason::Unknown))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub item_id: ItemId,
    pub reason: FailureReason,
    pub detail: String,
    pub failure_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub recovered_at: Option<DateTime<Utc>>,
}

impl FailureRecord {
    pub fn first(
        item_id: ItemId,
        reason: FailureReason,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id,
            reason,
            detail: detail.into(),
            failure_count: 1,
            first_failed_at: now,
            last_failed_at: now,
            recovered_at: None,
        }
    }

    /// A repeat failure bumps the count and reopens a recovered record.
    pub fn register_failure(
        &mut self,
        reason: FailureReason,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.reason = reason;
        self.detail = detail.into();
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failed_at = now;
        self.recovered_at = None;
    }

    /// Returns false when the record was already recovered.
    pub fn mark_recovered(&mut self, now: DateTime<Utc>) -> bool {
        if self.recovered_at.is_some() {
            return false;
        }
        self.recovered_at = Some(now);
        true
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered_at.is_some()
    }
}

/// Price state extracted from one payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub regular_price: f64,
    pub discount_price: Option<f64>,
    pub discount_rate: f64,
    pub campaign_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriceChange {
    pub price_changed: bool,
    pub new_campaign: bool,
}

impl PriceChange {
    /// Diff against the previous calendar day. No baseline means no change.
    pub fn between(today: &PricePoint, yesterday: Option<&PriceSnapshot>) -> Self {
        let Some(yesterday) = yesterday else {
            return Self::default();
        };
        let price_changed = (today.regular_price - yesterday.regular_price).abs() >= 1.0;
        let new_campaign = match &today.campaign_id {
            Some(campaign) => yesterday.campaign_id.as_ref() != Some(campaign),
            None => false,
        };
        Self {
            price_changed,
            new_campaign,
        }
    }
}

/// Marketplace calendar day (UTC+9) containing `now`.
pub fn market_day(now: DateTime<Utc>) -> NaiveDate {
    let offset = FixedOffset::east_opt(MARKET_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix());
    now.with_timezone(&offset).date_naive()
}

pub const MARKET_UTC_OFFSET_SECS: i32 = 9 * 3600;

/// One item's price state for one marketplace calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub item_id: ItemId,
    pub day: NaiveDate,
    pub regular_price: f64,
    pub discount_price: Option<f64>,
    pub discount_rate: f64,
    pub campaign_id: Option<String>,
    pub price_changed: bool,
    pub new_campaign: bool,
    pub captured_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PriceSnapshot {
    pub fn new(
        item_id: ItemId,
        day: NaiveDate,
        point: PricePoint,
        change: PriceChange,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id,
            day,
            regular_price: point.regular_price,
            discount_price: point.discount_price,
            discount_rate: point.discount_rate,
            campaign_id: point.campaign_id,
            price_changed: change.price_changed,
            new_campaign: change.new_campaign,
            captured_at: now,
            updated_at: now,
        }
    }

    /// Same-day rerun: take the new values, keep the first capture time.
    pub fn merge_same_day(&mut self, point: PricePoint, change: PriceChange, now: DateTime<Utc>) {
        self.regular_price = point.regular_price;
        self.discount_price = point.discount_price;
        self.discount_rate = point.discount_rate;
        self.campaign_id = point.campaign_id;
        self.price_changed = change.price_changed;
        self.new_campaign = change.new_campaign;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestState {
    NotStarted,
    InProgress,
    Completed,
    InterruptedByTimeBudget,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("checkpoint batch size is zero")]
    ZeroBatchSize,
    #[error("checkpoint id digest mismatch (stored {stored}, computed {computed})")]
    DigestMismatch { stored: String, computed: String },
    #[error("checkpoint declares {declared} batches but {ids} ids split into {expected}")]
    BatchCountMismatch { declared: usize, ids: usize, expected: usize },
    #[error("batch index {index} out of range (total {total})")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("batch index would move backwards from {current} to {requested}")]
    IndexRegression { current: usize, requested: usize },
    #[error("completed batch list is not strictly increasing")]
    UnorderedCompletedBatches,
    #[error("in-progress checkpoint has no item ids")]
    EmptyUniverse,
    #[error("completed batches {completed:?} do not match resume index {current}")]
    CompletedBatchesMismatch { completed: Vec<usize>, current: usize },
    #[error("{completed} of {total} batches completed")]
    Incomplete { completed: usize, total: usize },
}

/// Durable progress marker for one run type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestCheckpoint {
    pub run_type: String,
    pub state: HarvestState,
    pub is_in_progress: bool,
    #[serde(default)]
    pub all_item_ids: Vec<ItemId>,
    #[serde(default)]
    pub ids_digest: Option<String>,
    #[serde(default)]
    pub batch_size: usize,
    #[serde(default)]
    pub total_batches: usize,
    #[serde(default)]
    pub current_batch_index: usize,
    #[serde(default)]
    pub completed_batches: Vec<usize>,
    #[serde(default)]
    pub processed_count: usize,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_successful_completion: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_completed_total: Option<usize>,
}

pub fn digest_item_ids(ids: &[ItemId]) -> String {
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_str().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

impl HarvestCheckpoint {
    pub fn not_started(run_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            run_type: run_type.into(),
            state: HarvestState::NotStarted,
            is_in_progress: false,
            all_item_ids: Vec::new(),
            ids_digest: None,
            batch_size: 0,
            total_batches: 0,
            current_batch_index: 0,
            completed_batches: Vec::new(),
            processed_count: 0,
            last_error: None,
            started_at: None,
            updated_at: now,
            last_successful_completion: None,
            last_completed_total: None,
        }
    }

    /// Fresh in-progress checkpoint. Completion history carries over from `previous`.
    pub fn begin(
        run_type: impl Into<String>,
        item_ids: Vec<ItemId>,
        batch_size: usize,
        previous: Option<&HarvestCheckpoint>,
        now: DateTime<Utc>,
    ) -> Result<Self, CheckpointError> {
        if batch_size == 0 {
            return Err(CheckpointError::ZeroBatchSize);
        }
        if item_ids.is_empty() {
            return Err(CheckpointError::EmptyUniverse);
        }
        let total_batches = item_ids.len().div_ceil(batch_size);
        Ok(Self {
            run_type: run_type.into(),
            state: HarvestState::InProgress,
            is_in_progress: true,
            ids_digest: Some(digest_item_ids(&item_ids)),
            all_item_ids: item_ids,
            batch_size,
            total_batches,
            current_batch_index: 0,
            completed_batches: Vec::new(),
            processed_count: 0,
            last_error: None,
            started_at: Some(now),
            updated_at: now,
            last_successful_completion: previous.and_then(|p| p.last_successful_completion),
            last_completed_total: previous.and_then(|p| p.last_completed_total),
        })
    }

    /// Stand-in for a stored body that no longer parses. Never resumable; the
    /// completion history survives when those fields are still readable.
    pub fn salvage(
        run_type: impl Into<String>,
        body: &JsonValue,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut cp = Self::not_started(run_type, now);
        cp.last_successful_completion = body
            .get("last_successful_completion")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        cp.last_completed_total = body
            .get("last_completed_total")
            .and_then(JsonValue::as_u64)
            .and_then(|n| usize::try_from(n).ok());
        cp.last_error = Some(detail.into());
        cp
    }

    pub fn is_resumable(&self) -> bool {
        self.is_in_progress
            && matches!(
                self.state,
                HarvestState::InProgress | HarvestState::InterruptedByTimeBudget
            )
    }

    pub fn batch(&self, index: usize) -> Option<&[ItemId]> {
        if self.batch_size == 0 {
            return None;
        }
        self.all_item_ids.chunks(self.batch_size).nth(index)
    }

    pub fn is_complete(&self) -> bool {
        self.total_batches > 0 && self.completed_batches.len() == self.total_batches
    }

    pub fn mark_batch_completed(
        &mut self,
        index: usize,
        processed: usize,
        now: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        if index >= self.total_batches {
            return Err(CheckpointError::IndexOutOfRange {
                index,
                total: self.total_batches,
            });
        }
        if index < self.current_batch_index {
            return Err(CheckpointError::IndexRegression {
                current: self.current_batch_index,
                requested: index,
            });
        }
        if !self.completed_batches.contains(&index) {
            self.completed_batches.push(index);
        }
        self.current_batch_index = index + 1;
        self.processed_count += processed;
        self.state = HarvestState::InProgress;
        self.updated_at = now;
        Ok(())
    }

    pub fn interrupt_for_budget(
        &mut self,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        if index < self.current_batch_index {
            return Err(CheckpointError::IndexRegression {
                current: self.current_batch_index,
                requested: index,
            });
        }
        self.current_batch_index = index;
        self.state = HarvestState::InterruptedByTimeBudget;
        self.last_error = Some("time budget exceeded".to_string());
        self.updated_at = now;
        Ok(())
    }

    /// Clears every progress field and stamps the completion time.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.last_completed_total = Some(self.all_item_ids.len());
        self.state = HarvestState::Completed;
        self.is_in_progress = false;
        self.all_item_ids.clear();
        self.ids_digest = None;
        self.total_batches = 0;
        self.batch_size = 0;
        self.current_batch_index = 0;
        self.completed_batches.clear();
        self.processed_count = 0;
        self.last_error = None;
        self.started_at = None;
        self.updated_at = now;
        self.last_successful_completion = Some(now);
    }

    /// Error path: the next invocation starts from scratch.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.state = HarvestState::NotStarted;
        self.is_in_progress = false;
        self.last_error = Some(error.into());
        self.updated_at = now;
    }

    pub fn validate(&self) -> Result<(), CheckpointError> {
        if !self.is_resumable() {
            return Ok(());
        }
        if self.all_item_ids.is_empty() {
            return Err(CheckpointError::EmptyUniverse);
        }
        if self.batch_size == 0 {
            return Err(CheckpointError::ZeroBatchSize);
        }
        let computed = digest_item_ids(&self.all_item_ids);
        match &self.ids_digest {
            Some(stored) if *stored == computed => {}
            stored => {
                return Err(CheckpointError::DigestMismatch {
                    stored: stored.clone().unwrap_or_default(),
                    computed,
                })
            }
        }
        let expected = self.all_item_ids.len().div_ceil(self.batch_size);
        if expected != self.total_batches {
            return Err(CheckpointError::BatchCountMismatch {
                declared: self.total_batches,
                ids: self.all_item_ids.len(),
                expected,
            });
        }
        if self.current_batch_index > self.total_batches {
            return Err(CheckpointError::IndexOutOfRange {
                index: self.current_batch_index,
                total: self.total_batches,
            });
        }
        if !self.completed_batches.windows(2).all(|w| w[0] < w[1]) {
            return Err(CheckpointError::UnorderedCompletedBatches);
        }
        if let Some(&last) = self.completed_batches.last() {
            if last >= self.total_batches {
                return Err(CheckpointError::IndexOutOfRange {
                    index: last,
                    total: self.total_batches,
                });
            }
        }
        // batches run strictly in order, so the completed list is exactly 0..current
        if !self.completed_batches.iter().copied().eq(0..self.current_batch_index) {
            return Err(CheckpointError::CompletedBatchesMismatch {
                completed: self.completed_batches.clone(),
                current: self.current_batch_index,
            });
        }
        Ok(())
    }
}
