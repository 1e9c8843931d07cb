//! Request and verdict types (§3).
//!
//! The upstream schema is open-ended, so a raw request keeps unrecognized
//! fields in `extra` rather than discarding them (§9, "dynamic dicts for
//! request payloads"). The merged, stored record is a plain JSON object —
//! the state store (§4.D) is intentionally untyped, matching the original
//! `cache.py`'s `dict`-shaped payloads — built by `merge_record`, which
//! lets verdict fields win on name collision with raw fields.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

fn de_flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdForm {
        Str(String),
        Num(serde_json::Number),
    }
    match IdForm::deserialize(deserializer)? {
        IdForm::Str(s) => Ok(s),
        IdForm::Num(n) => Ok(n.to_string()),
    }
}

/// One element of the upstream `requests.json` array.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRequest {
    #[serde(deserialize_with = "de_flexible_id")]
    pub service_request_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub requested_datetime: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub long: Option<f64>,
    /// Any fields the upstream sends that this crate doesn't model — carried
    /// verbatim into the stored record.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Fixed categorical tags a verdict can carry (§3). The original
/// `enums.py` that this was distilled from was not recoverable from
/// `original_source/`; this set is authored fresh for the municipal
/// service-request domain described in spec.md §1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestFlag {
    Safety,
    Infrastructure,
    Sanitation,
    Traffic,
    Environmental,
    Vandalism,
    Utilities,
    Other,
}

/// Rejects a priority outside `0..=100` during deserialization — the
/// original's `conint(ge=0, le=100)` fails the same way, at parse time,
/// so an out-of-range verdict surfaces as a malformed-response error rather
/// than a silently out-of-range stored value.
fn de_priority<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = u8::deserialize(deserializer)?;
    if value > 100 {
        return Err(serde::de::Error::custom(format!(
            "priority {value} out of range 0..=100"
        )));
    }
    Ok(value)
}

/// Structured classifier output, aligned positionally with its input
/// request (§4.C).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Verdict {
    #[serde(deserialize_with = "de_priority")]
    pub priority: u8,
    pub flag: Vec<RequestFlag>,
    pub priority_explanation: String,
    pub flag_explanation: String,
    pub incident_label: String,
}

/// Field names that a merged record always carries explicitly; used to keep
/// verbatim-preserved `extra` fields from shadowing them.
const KNOWN_FIELDS: &[&str] = &[
    "service_request_id",
    "status",
    "requested_datetime",
    "service_name",
    "description",
    "media_url",
    "address",
    "lat",
    "long",
    "city",
    "priority",
    "flag",
    "priority_explanation",
    "flag_explanation",
    "incident_label",
];

/// Build the stored record: raw fields, then unrecognized raw fields
/// verbatim, then verdict fields (which always win on collision), then
/// `city`. Mirrors `request | classified.model_dump() | {'city': city}`
/// from the original `ingest.py`.
pub fn merge_record(raw: &RawRequest, verdict: &Verdict, city: &str) -> Value {
    let mut obj = Map::new();

    obj.insert("service_request_id".to_string(), json!(raw.service_request_id));
    if let Some(v) = &raw.status {
        obj.insert("status".to_string(), json!(v));
    }
    if let Some(v) = &raw.requested_datetime {
        obj.insert("requested_datetime".to_string(), json!(v));
    }
    if let Some(v) = &raw.service_name {
        obj.insert("service_name".to_string(), json!(v));
    }
    if let Some(v) = &raw.description {
        obj.insert("description".to_string(), json!(v));
    }
    if let Some(v) = &raw.media_url {
        obj.insert("media_url".to_string(), json!(v));
    }
    if let Some(v) = &raw.address {
        obj.insert("address".to_string(), json!(v));
    }
    if let Some(v) = raw.lat {
        obj.insert("lat".to_string(), json!(v));
    }
    if let Some(v) = raw.long {
        obj.insert("long".to_string(), json!(v));
    }

    for (k, v) in &raw.extra {
        if !KNOWN_FIELDS.contains(&k.as_str()) {
            obj.insert(k.clone(), v.clone());
        }
    }

    obj.insert("priority".to_string(), json!(verdict.priority));
    obj.insert("flag".to_string(), json!(verdict.flag));
    obj.insert(
        "priority_explanation".to_string(),
        json!(verdict.priority_explanation),
    );
    obj.insert("flag_explanation".to_string(), json!(verdict.flag_explanation));
    obj.insert("incident_label".to_string(), json!(verdict.incident_label));
    obj.insert("city".to_string(), json!(city));

    Value::Object(obj)
}

/// Has an `https` media URL suitable for an image attachment (§4.C).
pub fn has_attachable_image(raw: &RawRequest) -> bool {
    raw.media_url.as_deref().is_some_and(|u| u.starts_with("https"))
}
