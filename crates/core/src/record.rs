//! Durable audio-processing record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, UserId};
use crate::stage::Stage;

/// One row of the durable job store.
///
/// Created once at submission with every result URL unset. Mutated only by
/// the result-write and manual-override paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioProcessingRecord {
    pub id: JobId,
    pub owner: UserId,
    pub name: String,
    pub size: i64,
    pub duration: i32,
    pub format: String,
    pub bitrate: i32,
    pub standard_audio_url: Option<String>,
    pub dynamic_audio_url: Option<String>,
    pub smooth_audio_url: Option<String>,
    pub manual_audio_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a record is first created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAudioProcessing {
    pub id: JobId,
    pub owner: UserId,
    pub name: String,
    pub size: i64,
    pub duration: i32,
    pub format: String,
    pub bitrate: i32,
}

/// The three automatically produced result URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultUrls {
    pub standard: String,
    pub dynamic: String,
    pub smooth: String,
}

impl AudioProcessingRecord {
    /// Build a pending record (no results) stamped with `now`.
    pub fn pending(new: NewAudioProcessing, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            owner: new.owner,
            name: new.name,
            size: new.size,
            duration: new.duration,
            format: new.format,
            bitrate: new.bitrate,
            standard_audio_url: None,
            dynamic_audio_url: None,
            smooth_audio_url: None,
            manual_audio_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// All three automatic results are present.
    pub fn has_all_results(&self) -> bool {
        self.standard_audio_url.is_some()
            && self.dynamic_audio_url.is_some()
            && self.smooth_audio_url.is_some()
    }

    /// Resolve the effective stage given what the progress cache holds.
    ///
    /// A complete record is stage 5 whatever the cache says (an evicted entry
    /// is a valid representation of "complete"). Otherwise the cache is
    /// authoritative; `None` means the stage is currently unknown.
    pub fn resolve_stage(&self, cached: Option<Stage>) -> Option<Stage> {
        if self.has_all_results() {
            Some(Stage::COMPLETE)
        } else {
            cached
        }
    }

    pub fn apply_results(&mut self, urls: ResultUrls, now: DateTime<Utc>) {
        self.standard_audio_url = Some(urls.standard);
        self.dynamic_audio_url = Some(urls.dynamic);
        self.smooth_audio_url = Some(urls.smooth);
        self.updated_at = now;
    }

    pub fn apply_manual(&mut self, url: String, now: DateTime<Utc>) {
        self.manual_audio_url = Some(url);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AudioProcessingRecord {
        let owner = UserId::new();
        let now = Utc::now();
        AudioProcessingRecord::pending(
            NewAudioProcessing {
                id: JobId::derive(owner, now, "take.wav"),
                owner,
                name: "take.wav".to_string(),
                size: 1024,
                duration: 42,
                format: "wav".to_string(),
                bitrate: 1411,
            },
            now,
        )
    }

    #[test]
    fn pending_record_defers_to_cache() {
        let r = record();
        assert!(!r.has_all_results());
        assert_eq!(r.resolve_stage(None), None);
        assert_eq!(r.resolve_stage(Some(Stage::PENDING)), Some(Stage::PENDING));
    }

    #[test]
    fn complete_record_is_stage_five_even_on_cache_miss() {
        let mut r = record();
        r.apply_results(
            ResultUrls {
                standard: "s3://b/standard.wav".into(),
                dynamic: "s3://b/dynamic.wav".into(),
                smooth: "s3://b/smooth.wav".into(),
            },
            Utc::now(),
        );

        assert_eq!(r.resolve_stage(None), Some(Stage::COMPLETE));
        assert_eq!(
            r.resolve_stage(Some(Stage::new(2).unwrap())),
            Some(Stage::COMPLETE)
        );
    }

    #[test]
    fn partial_results_are_not_complete() {
        let mut r = record();
        r.standard_audio_url = Some("s3://b/standard.wav".into());
        r.dynamic_audio_url = Some("s3://b/dynamic.wav".into());
        assert!(!r.has_all_results());

        r.apply_manual("s3://b/manual.wav".into(), Utc::now());
        assert!(!r.has_all_results());
    }
}
