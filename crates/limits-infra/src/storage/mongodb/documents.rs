//! Document shapes and update pipelines shared by both MongoDB backends.
//!
//! Counters live in `counters` as `{_id, count, expireAt}`; moving windows
//! in `windows` as `{_id, entries, expireAt}` with `entries` kept
//! most-recent-first. Both collections carry a TTL index on `expireAt`.

use std::time::Duration;

use chrono::Utc;
use mongodb::IndexModel;
use mongodb::bson::{Bson, DateTime, Document, doc};
use mongodb::options::IndexOptions;
use serde::Deserialize;

use limits_core::domain::KeyPrefix;

pub const COUNTERS: &str = "counters";
pub const WINDOWS: &str = "windows";

#[derive(Debug, Default, Deserialize)]
pub struct CounterDocument {
    #[serde(default)]
    pub count: i64,
    #[serde(rename = "expireAt")]
    pub expire_at: Option<DateTime>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WindowDocument {
    #[serde(default)]
    pub entries: Vec<f64>,
}

pub fn to_bson_datetime(at: chrono::DateTime<Utc>) -> DateTime {
    DateTime::from_millis(at.timestamp_millis())
}

pub fn from_bson_datetime(at: DateTime) -> chrono::DateTime<Utc> {
    chrono::DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or_default()
}

/// Instant `expiry` from now, as stored in `expireAt`.
pub fn expiration_after(expiry: Duration) -> DateTime {
    let millis = i64::try_from(expiry.as_millis()).unwrap_or(i64::MAX);
    DateTime::from_millis(DateTime::now().timestamp_millis().saturating_add(millis))
}

pub fn by_key(key: &str) -> Document {
    doc! { "_id": key }
}

/// Counter at `key` whose window has not lapsed.
pub fn live_counter(key: &str, now: DateTime) -> Document {
    doc! { "_id": key, "expireAt": { "$gte": now } }
}

/// Every document owned by the engine.
pub fn owned_by(prefix: &KeyPrefix) -> Document {
    doc! { "_id": { "$regex": prefix.anchored_regex() } }
}

/// TTL index letting the server drop documents once `expireAt` passes.
pub fn expiry_index() -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "expireAt": 1 })
        .options(IndexOptions::builder().expire_after(Duration::ZERO).build())
        .build()
}

/// Increment pipeline: restart the window when it has lapsed (or the
/// document is new), otherwise add `amount` and keep `expireAt` unless the
/// expiry is elastic.
pub fn incr_pipeline(amount: i64, expiration: DateTime, elastic_expiry: bool) -> Vec<Document> {
    let lapsed = doc! { "$lt": ["$expireAt", "$$NOW"] };
    let live_expiry = if elastic_expiry {
        Bson::DateTime(expiration)
    } else {
        Bson::String("$expireAt".to_string())
    };

    vec![doc! {
        "$set": {
            "count": {
                "$cond": {
                    "if": lapsed.clone(),
                    "then": amount,
                    "else": { "$add": ["$count", amount] },
                }
            },
            "expireAt": {
                "$cond": {
                    "if": lapsed,
                    "then": expiration,
                    "else": live_expiry,
                }
            },
        }
    }]
}

/// Conditional append pipeline.
///
/// The server re-evaluates the slot `limit - 1` check against `threshold`
/// on the document it is about to update; only when the window has room is
/// `timestamp` prepended, the log capped at `cap` and `expireAt` moved.
/// `cap` must be at least one.
pub fn acquire_pipeline(
    timestamp: f64,
    cap: i32,
    threshold: f64,
    expiration: DateTime,
) -> Vec<Document> {
    let entries = doc! { "$ifNull": ["$entries", []] };
    let saturated = doc! {
        "$gte": [{ "$arrayElemAt": [entries.clone(), cap - 1] }, threshold]
    };

    vec![doc! {
        "$set": {
            "entries": {
                "$cond": {
                    "if": saturated.clone(),
                    "then": entries.clone(),
                    "else": { "$slice": [{ "$concatArrays": [[timestamp], entries] }, cap] },
                }
            },
            "expireAt": {
                "$cond": {
                    "if": saturated,
                    "then": "$expireAt",
                    "else": expiration,
                }
            },
        }
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(pipeline: &[Document]) -> &Document {
        assert_eq!(pipeline.len(), 1);
        pipeline[0].get_document("$set").unwrap()
    }

    #[test]
    fn test_incr_pipeline_fixed_expiry_keeps_expire_at() {
        let expiration = DateTime::from_millis(1_000);
        let pipeline = incr_pipeline(3, expiration, false);
        let expire_at = stage(&pipeline)
            .get_document("expireAt")
            .unwrap()
            .get_document("$cond")
            .unwrap();

        assert_eq!(expire_at.get_datetime("then").unwrap(), &expiration);
        assert_eq!(expire_at.get_str("else").unwrap(), "$expireAt");
    }

    #[test]
    fn test_incr_pipeline_elastic_expiry_refreshes() {
        let expiration = DateTime::from_millis(1_000);
        let pipeline = incr_pipeline(1, expiration, true);
        let expire_at = stage(&pipeline)
            .get_document("expireAt")
            .unwrap()
            .get_document("$cond")
            .unwrap();

        assert_eq!(expire_at.get_datetime("else").unwrap(), &expiration);
    }

    #[test]
    fn test_incr_pipeline_restarts_with_amount() {
        let pipeline = incr_pipeline(5, DateTime::from_millis(0), false);
        let count = stage(&pipeline)
            .get_document("count")
            .unwrap()
            .get_document("$cond")
            .unwrap();

        assert_eq!(count.get_i64("then").unwrap(), 5);
        assert_eq!(
            count.get_document("else").unwrap(),
            &doc! { "$add": ["$count", 5_i64] }
        );
    }

    #[test]
    fn test_acquire_pipeline_checks_last_slot() {
        let pipeline = acquire_pipeline(100.0, 3, 90.0, DateTime::from_millis(0));
        let cond = stage(&pipeline)
            .get_document("entries")
            .unwrap()
            .get_document("$cond")
            .unwrap();

        let saturated = cond.get_document("if").unwrap();
        assert_eq!(
            saturated,
            &doc! {
                "$gte": [
                    { "$arrayElemAt": [{ "$ifNull": ["$entries", []] }, 2_i32] },
                    90.0,
                ]
            }
        );
        assert_eq!(
            cond.get_document("else").unwrap(),
            &doc! {
                "$slice": [
                    { "$concatArrays": [[100.0], { "$ifNull": ["$entries", []] }] },
                    3_i32,
                ]
            }
        );
    }

    #[test]
    fn test_owned_by_anchors_prefix() {
        assert_eq!(
            owned_by(&KeyPrefix::default()),
            doc! { "_id": { "$regex": "^LIMITER" } }
        );
    }

    #[test]
    fn test_expiration_after() {
        let before = DateTime::now().timestamp_millis();
        let expiration = expiration_after(Duration::from_millis(1500)).timestamp_millis();
        let after = DateTime::now().timestamp_millis();

        assert!(expiration >= before + 1500);
        assert!(expiration <= after + 1500);
        assert_eq!(expiration_after(Duration::MAX).timestamp_millis(), i64::MAX);
    }

    #[test]
    fn test_bson_datetime_round_trip() {
        let now = chrono::DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(from_bson_datetime(to_bson_datetime(now)), now);
    }
}
