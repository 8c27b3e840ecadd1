//! Transfer ledger: which way value moved for a record, for display only.
//!
//! Movements are recorded keyed by lower-cased record hash. Lookups try the
//! ledger first and then fall back to inferring direction and amount from
//! conventionally-named fields on the record itself, tolerating every
//! historical spelling the encoders have used.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::now_ms;
use crate::payload::SigilPayload;
use crate::store::{self, Storage, TRANSFER_LEDGER_KEY};
use crate::transport::{SyncEvent, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Persisted ledger entry. Amounts are stored as the normalized strings
/// they arrived as, not floats, so re-serialization is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub hash: String,
    pub direction: TransferDirection,
    pub amount_phi: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_usd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_pulse: Option<u64>,
    pub updated_at: u64,
}

/// Where a resolved move came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveSource {
    Ledger,
    Payload,
}

/// A normalized movement for display.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferMove {
    pub direction: TransferDirection,
    pub amount: f64,
    pub amount_usd: Option<f64>,
    pub sent_pulse: Option<u64>,
    pub source: MoveSource,
}

/// Input to [`TransferLedger::record_movement`]. Amounts accept the raw
/// JSON value (string or number) the caller has.
#[derive(Debug, Clone)]
pub struct Movement {
    pub hash: String,
    pub direction: TransferDirection,
    pub amount_phi: Value,
    pub amount_usd: Option<Value>,
    pub sent_pulse: Option<u64>,
}

fn read_phi_amount(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => {
            let f = n.as_f64()?;
            (f.is_finite() && f.abs() >= 1e-12).then(|| f.abs())
        }
        Value::String(s) => {
            let f: f64 = s.trim().parse().ok()?;
            (f.is_finite() && f.abs() >= 1e-12).then(|| f.abs())
        }
        _ => None,
    }
}

fn read_usd_amount(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => {
            let f = n.as_f64()?;
            (f.is_finite() && f > 0.0).then_some(f)
        }
        Value::String(s) => {
            let f: f64 = s.trim().parse().ok()?;
            (f.is_finite() && f > 0.0).then_some(f)
        }
        _ => None,
    }
}

fn read_sent_pulse(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => {
            let f = n.as_f64()?;
            (f.is_finite() && f > 0.0).then(|| f as u64)
        }
        Value::String(s) => {
            let n: u64 = s.trim().parse().ok()?;
            (n > 0).then_some(n)
        }
        _ => None,
    }
}

fn read_direction(v: &Value) -> Option<TransferDirection> {
    let Value::String(s) = v else { return None };
    let t = s.trim().to_ascii_lowercase();
    if t.is_empty() {
        return None;
    }
    if t.contains("receive") || t.contains("received") || t.contains("inhale") {
        return Some(TransferDirection::Receive);
    }
    if t.contains("send") || t.contains("sent") || t.contains("exhale") {
        return Some(TransferDirection::Send);
    }
    None
}

fn normalize_hash(hash: &str) -> String {
    hash.trim().to_ascii_lowercase()
}

fn normalize_phi_amount(raw: &Value) -> Option<String> {
    match raw {
        Value::Number(_) => read_phi_amount(raw).map(|f| f.to_string()),
        Value::String(s) => {
            let cleaned = s.trim().trim_start_matches(['+', '-']).trim().to_string();
            if cleaned.is_empty() {
                return None;
            }
            let f: f64 = cleaned.parse().ok()?;
            (f.is_finite() && f.abs() >= 1e-12).then_some(cleaned)
        }
        _ => None,
    }
}

fn normalize_usd_amount(raw: &Value) -> Option<String> {
    read_usd_amount(raw).map(|f| format!("{f:.2}"))
}

fn get_in<'a>(src: Option<&'a Map<String, Value>>, key: &str) -> Option<&'a Value> {
    src.and_then(|m| m.get(key))
}

fn first_of<'a, T>(
    srcs: &[Option<&'a Map<String, Value>>],
    keys: &[&str],
    read: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    for src in srcs {
        for key in keys {
            if let Some(v) = get_in(*src, key) {
                if let Some(out) = read(v) {
                    return Some(out);
                }
            }
        }
    }
    None
}

/// Infer a movement from the record's own fields, without the ledger.
pub fn move_from_payload(payload: &SigilPayload) -> Option<TransferMove> {
    let value = serde_json::to_value(payload).ok()?;
    let record = value.as_object()?;
    let feed = record.get("feed").and_then(Value::as_object);
    let preview = record.get("preview").and_then(Value::as_object);
    let feed_preview = feed
        .and_then(|f| f.get("preview"))
        .and_then(Value::as_object);
    let srcs = [Some(record), feed];
    let all_srcs = [Some(record), feed, preview, feed_preview];

    let dir = first_of(
        &srcs,
        &[
            "phiDirection",
            "transferDirection",
            "transferMode",
            "transferKind",
        ],
        read_direction,
    );

    let delta = first_of(&srcs, &["phiDelta", "phiSigned", "phiChange"], |v| match v {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    });

    let direction = dir.or_else(|| {
        delta.map(|d| {
            if d >= 0.0 {
                TransferDirection::Receive
            } else {
                TransferDirection::Send
            }
        })
    })?;

    let amount = first_of(
        &srcs,
        &[
            "transferAmountPhi",
            "transferPhi",
            "amountPhi",
            "phiAmount",
            "childAllocationPhi",
            "branchBasePhi",
        ],
        read_phi_amount,
    )
    .or_else(|| first_of(&all_srcs, &["amountPhi"], read_phi_amount))
    .or_else(|| delta.map(f64::abs).filter(|a| *a >= 1e-12))?;

    let amount_usd = first_of(
        &all_srcs,
        &["amountUsd", "usdAmount", "usdValue", "valueUsd", "usd"],
        read_usd_amount,
    );
    let usd_per_phi = first_of(
        &all_srcs,
        &["usdPerPhi", "fxUsdPerPhi", "usd_per_phi"],
        read_usd_amount,
    );
    let sent_pulse = first_of(
        &all_srcs,
        &["atPulse", "sentPulse", "senderKaiPulse", "transferPulse"],
        read_sent_pulse,
    );

    Some(TransferMove {
        direction,
        amount,
        amount_usd: amount_usd.or_else(|| usd_per_phi.map(|fx| amount * fx)),
        sent_pulse,
        source: MoveSource::Payload,
    })
}

/// True when a record carries any transfer signal (direction, nonce, or a
/// parent hint). Used to exclude transfer glyphs from forest root election.
pub fn has_transfer_hints(payload: &SigilPayload) -> bool {
    let Ok(value) = serde_json::to_value(payload) else {
        return false;
    };
    let Some(record) = value.as_object() else {
        return false;
    };
    let feed = record.get("feed").and_then(Value::as_object);
    let srcs = [Some(record), feed];

    let has_dir = first_of(
        &srcs,
        &[
            "phiDirection",
            "transferDirection",
            "transferMode",
            "transferKind",
        ],
        read_direction,
    )
    .is_some();

    let is_str = |v: &Value| v.as_str().map(str::to_string);
    let has_nonce = first_of(
        &srcs,
        &["transferNonce", "nonce", "transferToken", "token"],
        is_str,
    )
    .is_some();
    let has_parent = first_of(
        &srcs,
        &["parentUrl", "parentHash", "parentCanonical"],
        is_str,
    )
    .is_some();

    has_dir || has_nonce || has_parent
}

/// The keyed movement store.
#[derive(Debug)]
pub struct TransferLedger {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    map: RwLock<HashMap<String, TransferRecord>>,
}

impl TransferLedger {
    pub fn new(storage: Arc<dyn Storage>, transport: Arc<dyn Transport>) -> Self {
        let ledger = Self {
            storage,
            transport,
            map: RwLock::new(HashMap::new()),
        };
        ledger.load();
        ledger
    }

    fn load(&self) {
        let raw = store::read_or_null(&*self.storage, TRANSFER_LEDGER_KEY);
        let mut map = self.map.write();
        map.clear();
        match raw {
            Value::Object(obj) => {
                for (key, v) in obj {
                    if let Ok(rec) = serde_json::from_value::<TransferRecord>(v) {
                        map.insert(normalize_hash(&key), rec);
                    }
                }
            }
            // Older snapshots persisted a bare list of records.
            Value::Array(items) => {
                for v in items {
                    if let Ok(rec) = serde_json::from_value::<TransferRecord>(v) {
                        map.insert(normalize_hash(&rec.hash), rec);
                    }
                }
            }
            _ => {}
        }
    }

    fn persist(&self) {
        let obj: Map<String, Value> = self
            .map
            .read()
            .iter()
            .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k.clone(), v)))
            .collect();
        store::write_quietly(&*self.storage, TRANSFER_LEDGER_KEY, &Value::Object(obj));
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Record a movement. Returns the stored record, or `None` when the
    /// hash is empty or the amount normalizes away (non-finite or ~zero).
    pub fn record_movement(&self, movement: Movement) -> Option<TransferRecord> {
        let hash = normalize_hash(&movement.hash);
        if hash.is_empty() {
            return None;
        }
        let amount_phi = normalize_phi_amount(&movement.amount_phi)?;
        let amount_usd = movement.amount_usd.as_ref().and_then(normalize_usd_amount);

        let record = TransferRecord {
            hash: hash.clone(),
            direction: movement.direction,
            amount_phi,
            amount_usd,
            sent_pulse: movement.sent_pulse.filter(|p| *p > 0),
            updated_at: now_ms(),
        };

        self.map.write().insert(hash, record.clone());
        self.persist();
        self.transport.publish(SyncEvent::Transfer {
            record: record.clone(),
        });
        Some(record)
    }

    /// Ledger lookup by hash.
    pub fn move_for_hash(&self, hash: &str) -> Option<TransferMove> {
        let rec = self.map.read().get(&normalize_hash(hash)).cloned()?;
        let amount = read_phi_amount(&Value::from(rec.amount_phi.clone()))?;
        Some(TransferMove {
            direction: rec.direction,
            amount,
            amount_usd: rec
                .amount_usd
                .as_ref()
                .and_then(|s| read_usd_amount(&Value::from(s.clone()))),
            sent_pulse: rec.sent_pulse,
            source: MoveSource::Ledger,
        })
    }

    /// Ledger first, then payload inference.
    pub fn resolve_move(
        &self,
        hash: Option<&str>,
        payload: Option<&SigilPayload>,
    ) -> Option<TransferMove> {
        if let Some(h) = hash {
            if let Some(m) = self.move_for_hash(h) {
                return Some(m);
            }
        }
        payload.and_then(move_from_payload)
    }
}
