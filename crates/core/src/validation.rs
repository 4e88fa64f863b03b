//! Submission validation rules.
//!
//! Every rule here is a fail-fast precondition: a violation is returned as
//! [`DomainError::Validation`] to the caller and is never retried.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{DomainError, DomainResult};

static YOUTUBE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?(www\.)?(youtube\.com/watch\?v=|youtu\.be/)[A-Za-z0-9_-]{11}(&.*)?$")
        .expect("youtube url pattern is valid")
});

/// An uploaded audio file together with metadata measured by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Duration in seconds.
    pub duration_secs: f64,
    /// Bitrate in kbit/s.
    pub bitrate: i32,
}

impl SourceFile {
    pub fn size(&self) -> i64 {
        self.bytes.len() as i64
    }

    /// Lower-cased extension without the dot, if any.
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.filename.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// Ceilings and allow-lists applied to every uploaded file.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionLimits {
    pub allowed_extensions: Vec<String>,
    pub max_size_bytes: i64,
    pub max_duration_secs: f64,
    /// Longest accepted filename, in characters. Matches the `name` column.
    pub max_filename_chars: usize,
}

impl Default for SubmissionLimits {
    fn default() -> Self {
        Self {
            allowed_extensions: vec!["wav".into(), "mp3".into(), "flac".into()],
            max_size_bytes: 100 * 1024 * 1024,
            max_duration_secs: 10.0 * 60.0,
            max_filename_chars: 255,
        }
    }
}

impl SubmissionLimits {
    /// Check one file against the allow-list and ceilings.
    ///
    /// `label` names the file in the error message (e.g. "voice file").
    pub fn check(&self, file: &SourceFile, label: &str) -> DomainResult<()> {
        let chars = file.filename.chars().count();
        if chars > self.max_filename_chars {
            return Err(DomainError::validation(format!(
                "{label} name is {chars} characters, limit is {}",
                self.max_filename_chars
            )));
        }

        let ext = file.extension().ok_or_else(|| {
            DomainError::validation(format!("{label} has no file extension"))
        })?;
        if !self.allowed_extensions.iter().any(|allowed| *allowed == ext) {
            return Err(DomainError::validation(format!(
                "{label} format .{ext} is not supported (allowed: {})",
                self.allowed_extensions.join(", ")
            )));
        }

        if file.size() > self.max_size_bytes {
            return Err(DomainError::validation(format!(
                "{label} is {} bytes, limit is {} bytes",
                file.size(),
                self.max_size_bytes
            )));
        }

        if !file.duration_secs.is_finite() || file.duration_secs < 0.0 {
            return Err(DomainError::validation(format!(
                "{label} has an invalid duration"
            )));
        }
        if file.duration_secs > self.max_duration_secs {
            return Err(DomainError::validation(format!(
                "{label} lasts {:.0}s, limit is {:.0}s",
                file.duration_secs, self.max_duration_secs
            )));
        }

        Ok(())
    }
}

/// Reference tracks must be a YouTube watch URL or short link.
pub fn validate_reference_url(url: &str) -> DomainResult<()> {
    if url.trim().is_empty() {
        return Err(DomainError::validation("reference URL is required"));
    }
    if !YOUTUBE_URL.is_match(url) {
        return Err(DomainError::validation(format!(
            "reference URL is not a YouTube link: {url}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, len: usize, duration: f64) -> SourceFile {
        SourceFile {
            filename: name.to_string(),
            bytes: vec![0; len],
            duration_secs: duration,
            bitrate: 320,
        }
    }

    #[test]
    fn accepts_allowed_formats_case_insensitively() {
        let limits = SubmissionLimits::default();
        for name in ["a.wav", "b.MP3", "c.flac"] {
            assert!(limits.check(&file(name, 10, 30.0), "voice file").is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_unknown_or_missing_extension() {
        let limits = SubmissionLimits::default();
        assert!(limits.check(&file("a.ogg", 10, 30.0), "voice file").is_err());
        assert!(limits.check(&file("noext", 10, 30.0), "voice file").is_err());
        assert!(limits.check(&file(".wav", 10, 30.0), "voice file").is_err());
    }

    #[test]
    fn enforces_size_and_duration_ceilings() {
        let limits = SubmissionLimits {
            max_size_bytes: 100,
            max_duration_secs: 60.0,
            ..Default::default()
        };
        assert!(limits.check(&file("a.wav", 100, 60.0), "voice file").is_ok());

        let err = limits.check(&file("a.wav", 101, 10.0), "voice file").unwrap_err();
        assert!(matches!(err, DomainError::Validation(ref m) if m.contains("bytes")));

        let err = limits.check(&file("a.wav", 10, 60.5), "voice file").unwrap_err();
        assert!(matches!(err, DomainError::Validation(ref m) if m.contains("lasts")));

        assert!(limits.check(&file("a.wav", 10, f64::NAN), "voice file").is_err());
    }

    #[test]
    fn rejects_overlong_filename() {
        let limits = SubmissionLimits::default();
        let at_limit = format!("{}.wav", "a".repeat(251));
        assert!(limits.check(&file(&at_limit, 10, 30.0), "voice file").is_ok());

        let too_long = format!("{}.wav", "é".repeat(252));
        let err = limits.check(&file(&too_long, 10, 30.0), "voice file").unwrap_err();
        assert!(matches!(err, DomainError::Validation(ref m) if m.contains("256 characters")));
    }

    #[test]
    fn reference_must_be_youtube() {
        assert!(validate_reference_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ").is_ok());
        assert!(validate_reference_url("youtu.be/dQw4w9WgXcQ").is_ok());
        assert!(validate_reference_url("https://youtube.com/watch?v=dQw4w9WgXcQ&t=42").is_ok());

        assert!(validate_reference_url("").is_err());
        assert!(validate_reference_url("https://vimeo.com/123").is_err());
        assert!(validate_reference_url("https://youtu.be/short").is_err());
    }
}
