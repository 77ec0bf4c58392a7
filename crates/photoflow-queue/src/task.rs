//! Task payload taxonomy and producer-side validation
//!
//! Payloads are a closed tagged union discriminated by `type`. The queue core
//! is agnostic to what the stage handlers do with them; it only needs the
//! type tag for dispatch and the JSON form for storage.

use serde::{Deserialize, Serialize};

/// Default retry budget for a task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Inclusive priority range accepted from producers.
pub const PRIORITY_RANGE: std::ops::RangeInclusive<i64> = 0..=9;

/// Inclusive retry budget range accepted from producers.
pub const MAX_ATTEMPTS_RANGE: std::ops::RangeInclusive<u32> = 1..=5;

/// One unit of pipeline work, keyed by its `type` tag.
///
/// The serialized form is the wire/storage format: kebab-case type tags and
/// camelCase field names, stored as JSON text in the queue table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TaskPayload {
    /// Ingest a newly stored image: metadata, thumbnail, perceptual hash,
    /// live-photo pairing detection.
    Photo { storage_key: String },

    /// Pair a motion video artifact with an already-ingested photo.
    LivePhotoVideo { storage_key: String },

    /// Resolve coordinates to place names and patch the photo record.
    PhotoReverseGeocoding {
        photo_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latitude: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        longitude: Option<f64>,
    },

    /// Delete an object's original/thumbnail/video files from storage.
    CleanupStorage {
        storage_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thumbnail_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        live_photo_video_key: Option<String>,
    },

    /// Apply a metadata patch and re-persist the underlying file.
    WriteExif {
        photo_id: String,
        updates: serde_json::Value,
    },
}

impl TaskPayload {
    /// The wire-format type tag, as stored in the payload JSON.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Photo { .. } => "photo",
            Self::LivePhotoVideo { .. } => "live-photo-video",
            Self::PhotoReverseGeocoding { .. } => "photo-reverse-geocoding",
            Self::CleanupStorage { .. } => "cleanup-storage",
            Self::WriteExif { .. } => "write-exif",
        }
    }

    /// Structural validation, applied producer-side before a task is stored.
    ///
    /// A payload rejected here consumes no retry attempt. A stored payload
    /// that fails this check after claim (e.g. a hand-edited row) is treated
    /// by the worker as an immediate handler failure.
    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            Self::Photo { storage_key } | Self::LivePhotoVideo { storage_key } => {
                require_nonempty(storage_key, PayloadError::EmptyStorageKey)
            }
            Self::PhotoReverseGeocoding {
                photo_id,
                latitude,
                longitude,
            } => {
                require_nonempty(photo_id, PayloadError::EmptyPhotoId)?;
                if let Some(lat) = latitude {
                    if !(-90.0..=90.0).contains(lat) {
                        return Err(PayloadError::LatitudeOutOfRange(*lat));
                    }
                }
                if let Some(lon) = longitude {
                    if !(-180.0..=180.0).contains(lon) {
                        return Err(PayloadError::LongitudeOutOfRange(*lon));
                    }
                }
                Ok(())
            }
            Self::CleanupStorage { storage_key, .. } => {
                require_nonempty(storage_key, PayloadError::EmptyStorageKey)
            }
            Self::WriteExif { photo_id, updates } => {
                require_nonempty(photo_id, PayloadError::EmptyPhotoId)?;
                if !updates.is_object() {
                    return Err(PayloadError::UpdatesNotObject);
                }
                Ok(())
            }
        }
    }
}

fn require_nonempty(value: &str, err: PayloadError) -> Result<(), PayloadError> {
    if value.trim().is_empty() {
        Err(err)
    } else {
        Ok(())
    }
}

/// Structural payload validation failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("storage key must not be empty")]
    EmptyStorageKey,

    #[error("photo id must not be empty")]
    EmptyPhotoId,

    #[error("latitude {0} out of range [-90, 90]")]
    LatitudeOutOfRange(f64),

    #[error("longitude {0} out of range [-180, 180]")]
    LongitudeOutOfRange(f64),

    #[error("exif updates must be a JSON object")]
    UpdatesNotObject,
}

/// Producer-supplied task options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AddTaskOptions {
    /// Dispatch priority, 0-9; higher is more urgent.
    pub priority: i64,

    /// Retry budget for this task, 1-5.
    pub max_attempts: u32,
}

impl Default for AddTaskOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl AddTaskOptions {
    /// Set the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Range-check the options against the accepted producer limits.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if !PRIORITY_RANGE.contains(&self.priority) {
            return Err(OptionsError::PriorityOutOfRange(self.priority));
        }
        if !MAX_ATTEMPTS_RANGE.contains(&self.max_attempts) {
            return Err(OptionsError::MaxAttemptsOutOfRange(self.max_attempts));
        }
        Ok(())
    }
}

/// Out-of-range task options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    #[error("priority {0} out of range [0, 9]")]
    PriorityOutOfRange(i64),

    #[error("max attempts {0} out of range [1, 5]")]
    MaxAttemptsOutOfRange(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_photo_wire_format() {
        let payload = TaskPayload::Photo {
            storage_key: "photos/2024/img_0001.heic".to_string(),
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({"type": "photo", "storageKey": "photos/2024/img_0001.heic"})
        );

        let parsed: TaskPayload = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_geocoding_wire_format() {
        let payload: TaskPayload = serde_json::from_value(json!({
            "type": "photo-reverse-geocoding",
            "photoId": "p1",
            "latitude": 10.0,
            "longitude": 20.0,
        }))
        .unwrap();

        assert_eq!(
            payload,
            TaskPayload::PhotoReverseGeocoding {
                photo_id: "p1".to_string(),
                latitude: Some(10.0),
                longitude: Some(20.0),
            }
        );
        assert_eq!(payload.kind(), "photo-reverse-geocoding");
    }

    #[test]
    fn test_cleanup_storage_optional_keys() {
        let payload: TaskPayload = serde_json::from_value(json!({
            "type": "cleanup-storage",
            "storageKey": "photos/img.jpg",
        }))
        .unwrap();

        assert_eq!(
            payload,
            TaskPayload::CleanupStorage {
                storage_key: "photos/img.jpg".to_string(),
                thumbnail_key: None,
                live_photo_video_key: None,
            }
        );

        // Absent optional keys stay off the wire
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("thumbnailKey").is_none());
    }

    #[test]
    fn test_unknown_type_tag_rejected() {
        let result: Result<TaskPayload, _> =
            serde_json::from_value(json!({"type": "video-transcode", "storageKey": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_empty_keys() {
        let payload = TaskPayload::Photo {
            storage_key: "  ".to_string(),
        };
        assert_eq!(payload.validate(), Err(PayloadError::EmptyStorageKey));

        let payload = TaskPayload::WriteExif {
            photo_id: String::new(),
            updates: json!({}),
        };
        assert_eq!(payload.validate(), Err(PayloadError::EmptyPhotoId));
    }

    #[test]
    fn test_validate_coordinate_ranges() {
        let payload = TaskPayload::PhotoReverseGeocoding {
            photo_id: "p1".to_string(),
            latitude: Some(91.0),
            longitude: None,
        };
        assert_eq!(payload.validate(), Err(PayloadError::LatitudeOutOfRange(91.0)));

        let payload = TaskPayload::PhotoReverseGeocoding {
            photo_id: "p1".to_string(),
            latitude: Some(-45.0),
            longitude: Some(-200.0),
        };
        assert_eq!(
            payload.validate(),
            Err(PayloadError::LongitudeOutOfRange(-200.0))
        );
    }

    #[test]
    fn test_validate_exif_updates_shape() {
        let payload = TaskPayload::WriteExif {
            photo_id: "p1".to_string(),
            updates: json!(["not", "an", "object"]),
        };
        assert_eq!(payload.validate(), Err(PayloadError::UpdatesNotObject));
    }

    #[test]
    fn test_options_defaults_and_ranges() {
        let opts = AddTaskOptions::default();
        assert_eq!(opts.priority, 0);
        assert_eq!(opts.max_attempts, 3);
        assert!(opts.validate().is_ok());

        let opts = AddTaskOptions::default().with_priority(10);
        assert_eq!(opts.validate(), Err(OptionsError::PriorityOutOfRange(10)));

        let opts = AddTaskOptions::default().with_max_attempts(0);
        assert_eq!(opts.validate(), Err(OptionsError::MaxAttemptsOutOfRange(0)));
    }
}
