use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SENTINEL_EVENT_TYPE: &str = "unknown";

/// Normalized address used as the join key across every topic and store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressKey(String);

impl AddressKey {
    pub fn normalize(address: &str) -> Self {
        let collapsed = address
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        Self(collapsed)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AddressKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub address: String,
    pub event_type: String,
}

impl RawEvent {
    pub fn key(&self) -> AddressKey {
        AddressKey::normalize(&self.address)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyedEvent {
    pub key: AddressKey,
    pub event: RawEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupEntry {
    pub address: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl LookupEntry {
    pub fn resolved(key: &AddressKey, coordinates: Coordinates, resolved_at: DateTime<Utc>) -> Self {
        Self {
            address: key.to_string(),
            lat: Some(coordinates.lat),
            lng: Some(coordinates.lng),
            resolved_at: Some(resolved_at),
        }
    }

    /// Placeholders with a missing coordinate never count as a match.
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(Coordinates { lat, lng }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub address: String,
    pub event_type: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub pended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
}

impl PendingEntry {
    pub fn for_miss(missing: &MissingEvent, pended_at: DateTime<Utc>) -> Self {
        Self {
            address: missing.key.to_string(),
            event_type: missing.event_type.clone(),
            lat: None,
            lng: None,
            pended_at: Some(pended_at),
            attempts: 1,
        }
    }

    pub fn key(&self) -> AddressKey {
        AddressKey::normalize(&self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub address: String,
}

impl ResolutionRequest {
    pub fn key(&self) -> AddressKey {
        AddressKey::normalize(&self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResponse {
    pub address: String,
    pub lat: f64,
    pub lng: f64,
}

impl ResolutionResponse {
    pub fn key(&self) -> AddressKey {
        AddressKey::normalize(&self.address)
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedEvent {
    pub address: String,
    pub event_type: String,
    pub lat: f64,
    pub lng: f64,
}

impl EnrichedEvent {
    pub fn new(key: &AddressKey, event_type: impl Into<String>, coordinates: Coordinates) -> Self {
        Self {
            address: key.to_string(),
            event_type: event_type.into(),
            lat: coordinates.lat,
            lng: coordinates.lng,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissingEvent {
    pub key: AddressKey,
    pub event_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub address: String,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}
