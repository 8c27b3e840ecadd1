//! The sigil record type and the URL payload codec.
//!
//! A [`SigilPayload`] is the immutable, timestamped record this engine stores
//! and forwards. It is a closed struct for the fields the engine interprets
//! plus an open, typed extension map for everything future encoders may add.
//!
//! Two wire forms are embedded in URLs as the `p=` query value:
//!
//! - `c:<base64url>`: compact short-key JSON (`u b s c d k p r o`)
//! - `j:<base64url>` (or untagged): long-key JSON, lossless passthrough
//!
//! Stream URLs instead carry an opaque feed token which decodes to the same
//! shape. All decode paths are tolerant: numeric fields accept strings,
//! unknown fields survive in [`SigilPayload::extra`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use data_encoding::BASE64URL_NOPAD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Day tag of the seven-fold chakra cycle carried by every sigil.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChakraDay {
    Root,
    Sacral,
    SolarPlexus,
    Heart,
    Throat,
    ThirdEye,
    Crown,
    /// Forward-compatibility escape hatch for tags this build does not know.
    Other(String),
}

impl ChakraDay {
    pub fn as_str(&self) -> &str {
        match self {
            ChakraDay::Root => "Root",
            ChakraDay::Sacral => "Sacral",
            ChakraDay::SolarPlexus => "Solar Plexus",
            ChakraDay::Heart => "Heart",
            ChakraDay::Throat => "Throat",
            ChakraDay::ThirdEye => "Third Eye",
            ChakraDay::Crown => "Crown",
            ChakraDay::Other(s) => s,
        }
    }
}

impl From<String> for ChakraDay {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Root" => ChakraDay::Root,
            "Sacral" => ChakraDay::Sacral,
            "Solar Plexus" => ChakraDay::SolarPlexus,
            "Heart" => ChakraDay::Heart,
            "Throat" => ChakraDay::Throat,
            "Third Eye" => ChakraDay::ThirdEye,
            "Crown" => ChakraDay::Crown,
            _ => ChakraDay::Other(s),
        }
    }
}

impl From<ChakraDay> for String {
    fn from(d: ChakraDay) -> Self {
        d.as_str().to_string()
    }
}

impl fmt::Display for ChakraDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single sigil record.
///
/// `pulse`/`beat`/`step_index` are the nested units of the kai time
/// quantization; they order records but are never computed here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigilPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chakra_day: Option<ChakraDay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps_per_beat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kai_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_phi_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_nonce: Option<String>,
    /// Extension bag: every field the codec does not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SigilPayload {
    /// Order by `(pulse, beat, step_index)`, missing fields counting as zero.
    pub fn kai_cmp(&self, other: &SigilPayload) -> Ordering {
        let a = (
            self.pulse.unwrap_or(0),
            self.beat.unwrap_or(0),
            self.step_index.unwrap_or(0),
        );
        let b = (
            other.pulse.unwrap_or(0),
            other.beat.unwrap_or(0),
            other.step_index.unwrap_or(0),
        );
        a.cmp(&b)
    }

    /// Number of populated fields, the merge policy's richness proxy.
    ///
    /// Counted over the serialized object so the extension bag and the typed
    /// fields weigh the same.
    pub fn field_count(&self) -> usize {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.len(),
            _ => 0,
        }
    }

    /// The phi key, tolerating historical spellings in the extension bag.
    pub fn phi_key(&self) -> Option<&str> {
        if let Some(k) = self.user_phi_key.as_deref() {
            if !k.is_empty() {
                return Some(k);
            }
        }
        for key in ["phiKey", "phikey"] {
            if let Some(Value::String(s)) = self.extra.get(key) {
                if !s.is_empty() {
                    return Some(s);
                }
            }
        }
        None
    }

    /// Fill `parent_url`/`origin_url` from `other` without overwriting.
    pub fn fill_lineage_from(&mut self, parent: Option<&str>, origin: Option<&str>) {
        if self.parent_url.is_none() {
            self.parent_url = parent.map(str::to_string);
        }
        if self.origin_url.is_none() {
            self.origin_url = origin.map(str::to_string);
        }
    }

    /// Read a trimmed string field from the extension bag.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        match self.extra.get(key) {
            Some(Value::String(s)) => {
                let t = s.trim();
                (!t.is_empty()).then_some(t)
            }
            _ => None,
        }
    }
}

/// Failure to decode an embedded payload or token.
///
/// Observations that fail to decode are skipped, never fatal (the caller
/// treats `Err` as "this URL carries no record").
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64url payload")]
    Base64(#[from] data_encoding::DecodeError),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("history param must start with h:")]
    BadHistoryTag,
}

fn b64url_decode(s: &str) -> Result<Vec<u8>, DecodeError> {
    // Tolerate padded input from older encoders.
    let trimmed = s.trim_end_matches('=');
    Ok(BASE64URL_NOPAD.decode(trimmed.as_bytes())?)
}

fn b64url_encode(bytes: &[u8]) -> String {
    BASE64URL_NOPAD.encode(bytes)
}

fn coerce_u64(v: Option<&Value>) -> Option<u64> {
    match v {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn coerce_string(v: Option<&Value>) -> Option<String> {
    match v {
        Some(Value::String(s)) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        _ => None,
    }
}

/// Build a payload from a long-key JSON object, tolerantly.
///
/// Every key the engine does not interpret lands in the extension bag.
pub fn payload_from_value(value: Value) -> Result<SigilPayload, DecodeError> {
    let Value::Object(mut map) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let mut p = SigilPayload {
        pulse: coerce_u64(map.get("pulse")),
        beat: coerce_u64(map.get("beat")),
        step_index: coerce_u64(map.get("stepIndex")),
        chakra_day: coerce_string(map.get("chakraDay")).map(ChakraDay::from),
        steps_per_beat: coerce_u64(map.get("stepsPerBeat")),
        kai_signature: coerce_string(map.get("kaiSignature")),
        user_phi_key: coerce_string(map.get("userPhiKey")),
        parent_url: coerce_string(map.get("parentUrl")),
        origin_url: coerce_string(map.get("originUrl")),
        canonical_hash: coerce_string(map.get("canonicalHash")),
        transfer_nonce: coerce_string(map.get("transferNonce")),
        extra: BTreeMap::new(),
    };

    for key in [
        "pulse",
        "beat",
        "stepIndex",
        "chakraDay",
        "stepsPerBeat",
        "kaiSignature",
        "userPhiKey",
        "parentUrl",
        "originUrl",
        "canonicalHash",
        "transferNonce",
    ] {
        map.remove(key);
    }
    p.extra = map.into_iter().collect();
    Ok(p)
}

/// Encode the compact `c:` short-key form used in freshly minted URLs.
pub fn encode_sigil_payload(p: &SigilPayload) -> String {
    let mut compact = Map::new();
    compact.insert("u".into(), Value::from(p.pulse.unwrap_or(0)));
    compact.insert("b".into(), Value::from(p.beat.unwrap_or(0)));
    compact.insert("s".into(), Value::from(p.step_index.unwrap_or(0)));
    if let Some(day) = &p.chakra_day {
        compact.insert("c".into(), Value::from(day.as_str()));
    }
    compact.insert("d".into(), Value::from(p.steps_per_beat.unwrap_or(44)));
    if let Some(k) = &p.kai_signature {
        compact.insert("k".into(), Value::from(k.clone()));
    }
    if let Some(k) = &p.user_phi_key {
        compact.insert("p".into(), Value::from(k.clone()));
    }
    if let Some(r) = &p.parent_url {
        compact.insert("r".into(), Value::from(r.clone()));
    }
    if let Some(o) = &p.origin_url {
        compact.insert("o".into(), Value::from(o.clone()));
    }
    let json = Value::Object(compact).to_string();
    format!("c:{}", b64url_encode(json.as_bytes()))
}

/// Encode the lossless `j:` long-key form, extension bag included.
pub fn encode_sigil_payload_loose(p: &SigilPayload) -> String {
    let json = serde_json::to_string(p).unwrap_or_else(|_| "{}".to_string());
    format!("j:{}", b64url_encode(json.as_bytes()))
}

/// Decode a `p=` payload parameter in any of its wire forms.
pub fn decode_sigil_payload(param: &str) -> Result<SigilPayload, DecodeError> {
    if let Some(rest) = param.strip_prefix("c:") {
        let bytes = b64url_decode(rest)?;
        let value: Value = serde_json::from_slice(&bytes)?;
        let Value::Object(map) = value else {
            return Err(DecodeError::NotAnObject);
        };
        return Ok(SigilPayload {
            pulse: coerce_u64(map.get("u")),
            beat: coerce_u64(map.get("b")),
            step_index: coerce_u64(map.get("s")),
            chakra_day: coerce_string(map.get("c")).map(ChakraDay::from),
            steps_per_beat: coerce_u64(map.get("d")).or(Some(44)),
            kai_signature: coerce_string(map.get("k")),
            user_phi_key: coerce_string(map.get("p")),
            parent_url: coerce_string(map.get("r")),
            origin_url: coerce_string(map.get("o")),
            canonical_hash: None,
            transfer_nonce: None,
            extra: BTreeMap::new(),
        });
    }

    let raw = param.strip_prefix("j:").unwrap_or(param);
    let bytes = b64url_decode(raw)?;
    let value: Value = serde_json::from_slice(&bytes)?;
    payload_from_value(value)
}

/// Encode a feed object as an opaque stream token.
pub fn encode_stream_token(feed: &Value) -> String {
    b64url_encode(feed.to_string().as_bytes())
}

/// Decode a stream token into a payload, keeping the full feed object and
/// the token itself in the extension bag so identity derivation can reuse
/// them.
pub fn decode_stream_token(token: &str) -> Result<SigilPayload, DecodeError> {
    let bytes = b64url_decode(token.trim())?;
    let value: Value = serde_json::from_slice(&bytes)?;
    let Value::Object(map) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let mut p = SigilPayload {
        pulse: coerce_u64(map.get("pulse")),
        beat: coerce_u64(map.get("beat")).or_else(|| coerce_u64(map.get("beatIndex"))),
        step_index: coerce_u64(map.get("stepIndex")),
        chakra_day: coerce_string(map.get("chakraDay")).map(ChakraDay::from),
        steps_per_beat: coerce_u64(map.get("stepsPerBeat")).or(Some(44)),
        kai_signature: coerce_string(map.get("kaiSignature")),
        user_phi_key: coerce_string(map.get("phiKey")),
        parent_url: coerce_string(map.get("parentUrl")).or_else(|| coerce_string(map.get("parent"))),
        origin_url: coerce_string(map.get("originUrl")),
        canonical_hash: None,
        transfer_nonce: None,
        extra: BTreeMap::new(),
    };
    p.extra
        .insert("streamToken".into(), Value::from(token.trim()));
    p.extra.insert("feed".into(), Value::Object(map));
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> SigilPayload {
        SigilPayload {
            pulse: Some(100),
            beat: Some(2),
            step_index: Some(7),
            chakra_day: Some(ChakraDay::Heart),
            steps_per_beat: Some(44),
            kai_signature: Some("sig-abc".into()),
            user_phi_key: Some("phi-key-1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn compact_roundtrip() {
        let p = sample();
        let enc = encode_sigil_payload(&p);
        assert!(enc.starts_with("c:"));
        let out = decode_sigil_payload(&enc).unwrap();
        assert_eq!(out.pulse, Some(100));
        assert_eq!(out.beat, Some(2));
        assert_eq!(out.step_index, Some(7));
        assert_eq!(out.chakra_day, Some(ChakraDay::Heart));
        assert_eq!(out.kai_signature.as_deref(), Some("sig-abc"));
        assert_eq!(out.user_phi_key.as_deref(), Some("phi-key-1"));
    }

    #[test]
    fn loose_roundtrip_keeps_extension_fields() {
        let mut p = sample();
        p.extra.insert("expiresAtPulse".into(), json!(9000));
        p.extra.insert("customTag".into(), json!("x"));
        let enc = encode_sigil_payload_loose(&p);
        assert!(enc.starts_with("j:"));
        let out = decode_sigil_payload(&enc).unwrap();
        assert_eq!(out.extra.get("expiresAtPulse"), Some(&json!(9000)));
        assert_eq!(out.extra.get("customTag"), Some(&json!("x")));
        assert_eq!(out.pulse, Some(100));
    }

    #[test]
    fn legacy_untagged_long_key_decodes() {
        let json = json!({"pulse": 5, "beat": 1, "stepIndex": 3, "chakraDay": "Crown"});
        let enc = BASE64URL_NOPAD.encode(json.to_string().as_bytes());
        let out = decode_sigil_payload(&enc).unwrap();
        assert_eq!(out.pulse, Some(5));
        assert_eq!(out.chakra_day, Some(ChakraDay::Crown));
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let json = json!({"pulse": "42", "beat": "3", "stepIndex": "1"});
        let enc = BASE64URL_NOPAD.encode(json.to_string().as_bytes());
        let out = decode_sigil_payload(&enc).unwrap();
        assert_eq!(out.pulse, Some(42));
        assert_eq!(out.beat, Some(3));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(decode_sigil_payload("c:!!!not-base64!!!").is_err());
        let enc = BASE64URL_NOPAD.encode(b"[1,2,3]");
        assert!(matches!(
            decode_sigil_payload(&enc),
            Err(DecodeError::NotAnObject)
        ));
    }

    #[test]
    fn stream_token_roundtrip() {
        let feed = json!({
            "pulse": 777,
            "beatIndex": 4,
            "stepIndex": 12,
            "chakraDay": "Throat",
            "phiKey": "phi-key-2",
            "author": "somebody"
        });
        let token = encode_stream_token(&feed);
        let p = decode_stream_token(&token).unwrap();
        assert_eq!(p.pulse, Some(777));
        assert_eq!(p.beat, Some(4));
        assert_eq!(p.user_phi_key.as_deref(), Some("phi-key-2"));
        assert_eq!(p.extra_str("streamToken"), Some(token.as_str()));
    }

    #[test]
    fn kai_cmp_orders_by_pulse_beat_step() {
        let mut a = sample();
        let mut b = sample();
        assert_eq!(a.kai_cmp(&b), Ordering::Equal);
        b.step_index = Some(8);
        assert_eq!(a.kai_cmp(&b), Ordering::Less);
        a.pulse = Some(101);
        assert_eq!(a.kai_cmp(&b), Ordering::Greater);
    }

    #[test]
    fn field_count_tracks_richness() {
        let mut p = sample();
        let before = p.field_count();
        p.extra.insert("note".into(), json!("hello"));
        assert_eq!(p.field_count(), before + 1);
        p.parent_url = Some("/s/abc".into());
        assert_eq!(p.field_count(), before + 2);
    }
}
