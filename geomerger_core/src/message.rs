//! Decoded wire schema and its JSON codec.
//!
//! Upstream trackers publish one [`SaeMessage`] per camera frame. Object ids
//! travel as hex strings; coordinates are checked on the way in so that no
//! NaN or out-of-range position ever reaches the engines.

use crate::buffer::Timestamped;
use crate::geo::Coordinate;
use crate::identity::{IdentityKey, ObjectId};
use crate::world_model::{Observation, ObservedObject, SourceBatch};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid coordinate ({latitude}, {longitude}) for object {object_id}")]
    InvalidCoordinate {
        object_id: ObjectId,
        latitude: f64,
        longitude: f64,
    },

    #[error("Frame without source id")]
    MissingSourceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl From<GeoCoordinate> for Coordinate {
    fn from(c: GeoCoordinate) -> Self {
        Coordinate::new(c.latitude, c.longitude)
    }
}

impl From<Coordinate> for GeoCoordinate {
    fn from(c: Coordinate) -> Self {
        Self {
            latitude: c.lat,
            longitude: c.lon,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub object_id: ObjectId,
    pub class_id: u32,
    pub confidence: f32,
    pub geo_coordinate: GeoCoordinate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp_utc_ms: i64,
    pub source_id: String,
}

/// One frame of detections from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaeMessage {
    pub frame: Frame,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl SaeMessage {
    pub fn new(source_id: impl Into<String>, timestamp_utc_ms: i64, detections: Vec<Detection>) -> Self {
        Self {
            frame: Frame {
                timestamp_utc_ms,
                source_id: source_id.into(),
            },
            detections,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.frame.source_id
    }

    /// Identity of a detection of this message.
    pub fn key_of(&self, detection: &Detection) -> IdentityKey {
        IdentityKey {
            source_id: self.frame.source_id.clone(),
            object_id: detection.object_id.clone(),
        }
    }

    pub fn to_source_batch(&self) -> SourceBatch {
        let timestamp_ms = self.frame.timestamp_utc_ms;
        SourceBatch {
            source_id: self.frame.source_id.clone(),
            timestamp_ms,
            objects: self
                .detections
                .iter()
                .map(|d| ObservedObject {
                    object_id: d.object_id.clone(),
                    class_id: d.class_id,
                    confidence: d.confidence,
                    observation: Observation {
                        timestamp_ms,
                        coord: d.geo_coordinate.into(),
                    },
                })
                .collect(),
        }
    }

    /// Parses and validates a JSON-encoded message.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let msg: SaeMessage = serde_json::from_slice(bytes)?;
        if msg.frame.source_id.is_empty() {
            return Err(CodecError::MissingSourceId);
        }
        for detection in &msg.detections {
            validate_coordinate(detection)?;
        }
        Ok(msg)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Timestamped for SaeMessage {
    fn timestamp_ms(&self) -> i64 {
        self.frame.timestamp_utc_ms
    }
}

fn validate_coordinate(detection: &Detection) -> Result<(), CodecError> {
    let GeoCoordinate { latitude, longitude } = detection.geo_coordinate;
    let in_range = (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude);
    // LatLng rejects non-finite values
    if !in_range || h3o::LatLng::new(latitude, longitude).is_err() {
        return Err(CodecError::InvalidCoordinate {
            object_id: detection.object_id.clone(),
            latitude,
            longitude,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "frame": {"timestamp_utc_ms": 1700000000000, "source_id": "cam1"},
        "detections": [
            {"object_id": "0a0b", "class_id": 2, "confidence": 0.9,
             "geo_coordinate": {"latitude": 52.52, "longitude": 13.405}}
        ]
    }"#;

    #[test]
    fn test_decode_valid_message() {
        let msg = SaeMessage::decode(VALID.as_bytes()).unwrap();

        assert_eq!(msg.source_id(), "cam1");
        assert_eq!(msg.timestamp_ms(), 1_700_000_000_000);
        assert_eq!(msg.detections.len(), 1);
        assert_eq!(msg.detections[0].object_id, ObjectId::new(vec![0x0a, 0x0b]));
    }

    #[test]
    fn test_decode_without_detections() {
        let json = r#"{"frame": {"timestamp_utc_ms": 5, "source_id": "cam1"}}"#;
        let msg = SaeMessage::decode(json.as_bytes()).unwrap();
        assert!(msg.detections.is_empty());
    }

    #[test]
    fn test_decode_rejects_out_of_range_coordinate() {
        let json = VALID.replace("52.52", "152.52");
        let err = SaeMessage::decode(json.as_bytes()).unwrap_err();
        assert!(matches!(err, CodecError::InvalidCoordinate { .. }));
    }

    #[test]
    fn test_decode_rejects_missing_coordinate() {
        let json = r#"{
            "frame": {"timestamp_utc_ms": 1, "source_id": "cam1"},
            "detections": [{"object_id": "01", "class_id": 2, "confidence": 0.9}]
        }"#;
        assert!(matches!(SaeMessage::decode(json.as_bytes()), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_decode_rejects_empty_source() {
        let json = r#"{"frame": {"timestamp_utc_ms": 1, "source_id": ""}, "detections": []}"#;
        assert!(matches!(SaeMessage::decode(json.as_bytes()), Err(CodecError::MissingSourceId)));
    }

    #[test]
    fn test_encode_carries_object_id_as_hex() {
        let msg = SaeMessage::decode(VALID.as_bytes()).unwrap();
        let encoded = String::from_utf8(msg.encode().unwrap()).unwrap();

        assert!(encoded.contains(r#""object_id":"0a0b""#));
        assert_eq!(SaeMessage::decode(encoded.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_to_source_batch() {
        let msg = SaeMessage::decode(VALID.as_bytes()).unwrap();
        let batch = msg.to_source_batch();

        assert_eq!(batch.source_id, "cam1");
        assert_eq!(batch.objects.len(), 1);
        assert_eq!(batch.objects[0].observation.timestamp_ms, 1_700_000_000_000);
        assert_eq!(batch.objects[0].observation.coord, Coordinate::new(52.52, 13.405));
    }
}
