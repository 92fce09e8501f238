// Feature extraction configuration
// JSON-loadable settings that size the standard feature columns and the store

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use super::types::{Schema, SchemaResult};
use crate::store::{CreateMode, ShuffleOptions, StoreOptions};

pub const ON_LABEL_COLUMN: &str = "on_label";
pub const ONSET_LABEL_COLUMN: &str = "onset_label";
pub const PEAK_LOCATIONS_COLUMN: &str = "peak_locations";
pub const PEAK_HEIGHTS_COLUMN: &str = "peak_heights";
pub const SPECTRUM_COLUMN: &str = "spectrum";
pub const SPECTRUM_FLUX_COLUMN: &str = "spectrum_flux";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Inclusive range of MIDI note numbers.
///
/// Serialized as a half-open range string such as `"21..<109"`; the closed
/// form `"21...108"` and an object `{"start": 21, "end": 108}` are accepted
/// when reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteRange {
    pub start: i32,
    pub end: i32,
}

impl NoteRange {
    pub const fn new(start: i32, end: i32) -> Self {
        NoteRange { start, end }
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start + 1) as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, note: i32) -> bool {
        note >= self.start && note <= self.end
    }
}

impl fmt::Display for NoteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..<{}", self.start, self.end + 1)
    }
}

impl FromStr for NoteRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid(format!("malformed note range '{}'", s));
        let bound = |text: &str| text.trim().parse::<i32>().map_err(|_| invalid());

        if let Some((start, end)) = s.split_once("..<") {
            Ok(NoteRange::new(bound(start)?, bound(end)? - 1))
        } else if let Some((start, end)) = s.split_once("...") {
            Ok(NoteRange::new(bound(start)?, bound(end)?))
        } else {
            Err(invalid())
        }
    }
}

impl Serialize for NoteRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NoteRangeRepr {
    Text(String),
    Bounds { start: i32, end: i32 },
}

impl<'de> Deserialize<'de> for NoteRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match NoteRangeRepr::deserialize(deserializer)? {
            NoteRangeRepr::Text(text) => text.parse::<NoteRange>().map_err(de::Error::custom),
            NoteRangeRepr::Bounds { start, end } => Ok(NoteRange::new(start, end)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureConfiguration {
    /// Input audio sampling frequency in Hz
    pub sampling_frequency: f64,

    /// Analysis window size in samples
    pub window_size: usize,

    /// Step between consecutive windows in samples
    pub step_size: usize,

    /// Notes that can appear in a label vector
    pub representable_note_range: NoteRange,

    /// Notes covered by the spectrum bands
    pub spectrum_note_range: NoteRange,

    /// Spectrum bands per note
    pub spectrum_resolution: f64,

    /// Minimum distance between peaks in notes
    pub minimum_peak_distance: f64,

    /// Peak height cutoff as a multiple of the RMS
    pub peak_height_cutoff_multiplier: f64,

    /// Windows in the RMS moving average
    pub rms_moving_average_size: usize,

    /// Rows per durable chunk in every column table
    pub chunk_size: usize,

    /// Rows per shuffle window
    pub shuffle_chunk_size: usize,

    /// Repeat factor for a shuffle pass
    pub shuffle_passes: usize,
}

impl Default for FeatureConfiguration {
    fn default() -> Self {
        FeatureConfiguration {
            sampling_frequency: 44100.0,
            window_size: 8192,
            step_size: 1024,
            representable_note_range: NoteRange::new(21, 108),
            spectrum_note_range: NoteRange::new(21, 120),
            spectrum_resolution: 1.0,
            minimum_peak_distance: 0.5,
            peak_height_cutoff_multiplier: 0.05,
            rms_moving_average_size: 20,
            chunk_size: 1024,
            shuffle_chunk_size: 1024,
            shuffle_passes: 1,
        }
    }
}

impl FeatureConfiguration {
    /// Load a configuration from a JSON file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: FeatureConfiguration = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.window_size == 0 || self.step_size == 0 {
            return Err(ConfigError::Invalid(
                "window and step sizes must be positive".to_string(),
            ));
        }
        if self.representable_note_range.is_empty() || self.spectrum_note_range.is_empty() {
            return Err(ConfigError::Invalid("note ranges must not be empty".to_string()));
        }
        if self.spectrum_resolution < 1.0 {
            return Err(ConfigError::Invalid(
                "spectrum resolution must be at least one band per note".to_string(),
            ));
        }
        if self.chunk_size == 0 || self.shuffle_chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk sizes must be positive".to_string()));
        }
        Ok(())
    }

    /// Frequency resolution of one FFT bin
    pub fn base_frequency(&self) -> f64 {
        self.sampling_frequency / self.window_size as f64
    }

    /// Width of the per-class label vectors
    pub fn label_count(&self) -> usize {
        self.representable_note_range.len()
    }

    /// Width of the spectral feature vectors
    pub fn band_count(&self) -> usize {
        self.spectrum_note_range.len() * self.spectrum_resolution as usize
    }

    /// Number of whole windows that fit in `samples`
    pub fn window_count_in_samples(&self, samples: usize) -> usize {
        if samples < self.window_size {
            return 0;
        }
        1 + (samples - self.window_size) / self.step_size
    }

    /// Number of samples spanned by `window_count` contiguous windows
    pub fn sample_count_in_windows(&self, window_count: usize) -> usize {
        if window_count < 1 {
            return 0;
        }
        (window_count - 1) * self.step_size + self.window_size
    }

    pub fn band_for_note(&self, note: f64) -> i64 {
        ((note - self.representable_note_range.start as f64) * self.spectrum_resolution).round()
            as i64
    }

    pub fn note_for_band(&self, band: i64) -> f64 {
        self.representable_note_range.start as f64 + band as f64 / self.spectrum_resolution
    }

    /// Label vector with a 1.0 for every note in `notes` that is representable
    pub fn vector_from_notes(&self, notes: &[i32]) -> Vec<f64> {
        let range = self.representable_note_range;
        let mut vector = vec![0.0; range.len()];
        for &note in notes.iter().filter(|&&n| range.contains(n)) {
            vector[(note - range.start) as usize] = 1.0;
        }
        vector
    }

    pub fn notes_from_vector(&self, vector: &[f64]) -> Vec<i32> {
        vector
            .iter()
            .enumerate()
            .filter(|&(_, &value)| value >= 0.5)
            .map(|(index, _)| self.representable_note_range.start + index as i32)
            .collect()
    }

    /// Standard column set produced by the feature extraction stage
    pub fn feature_schema(&self) -> SchemaResult<Schema> {
        let labels = self.label_count();
        let bands = self.band_count();
        Schema::builder()
            .vector_label(ON_LABEL_COLUMN, labels)
            .double(ONSET_LABEL_COLUMN, labels)
            .double(PEAK_LOCATIONS_COLUMN, bands)
            .double(PEAK_HEIGHTS_COLUMN, bands)
            .double(SPECTRUM_COLUMN, bands)
            .double(SPECTRUM_FLUX_COLUMN, bands)
            .offset(super::types::OFFSET_COLUMN)
            .file_name(super::types::FILE_NAME_COLUMN)
            .build()
    }

    pub fn store_options(&self, create_mode: CreateMode) -> StoreOptions {
        StoreOptions {
            chunk_size: self.chunk_size,
            create_mode,
        }
    }

    pub fn shuffle_options(&self) -> ShuffleOptions {
        ShuffleOptions {
            chunk_size: self.shuffle_chunk_size,
            passes: self.shuffle_passes,
            ..ShuffleOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::ColumnRole;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_widths() {
        let config = FeatureConfiguration::default();
        assert_eq!(config.label_count(), 88);
        assert_eq!(config.band_count(), 100);
        assert!((config.base_frequency() - 44100.0 / 8192.0).abs() < 1e-12);
    }

    #[test]
    fn test_window_sample_conversion() {
        let config = FeatureConfiguration::default();
        assert_eq!(config.window_count_in_samples(100), 0);
        assert_eq!(config.window_count_in_samples(8192), 1);
        assert_eq!(config.window_count_in_samples(8192 + 2048), 3);
        assert_eq!(config.sample_count_in_windows(0), 0);
        assert_eq!(config.sample_count_in_windows(3), 8192 + 2048);
    }

    #[test]
    fn test_note_vectors() {
        let config = FeatureConfiguration::default();
        let vector = config.vector_from_notes(&[21, 60, 200]);
        assert_eq!(vector.len(), 88);
        assert_eq!(vector[0], 1.0);
        assert_eq!(vector[39], 1.0);
        assert_eq!(config.notes_from_vector(&vector), vec![21, 60]);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = FeatureConfiguration::from_json(r#"{"windowSize": 4096, "chunkSize": 64}"#)
            .unwrap();
        assert_eq!(config.window_size, 4096);
        assert_eq!(config.chunk_size, 64);
        assert_eq!(config.step_size, 1024);
    }

    #[test]
    fn test_invalid_json_values_rejected() {
        let result = FeatureConfiguration::from_json(r#"{"chunkSize": 0}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"spectrumNoteRange": {{"start": 24, "end": 35}}, "spectrumResolution": 2.0}}"#
        )
        .unwrap();

        let config = FeatureConfiguration::from_file(file.path()).unwrap();
        assert_eq!(config.band_count(), 24);
    }

    #[test]
    fn test_note_range_text_forms() {
        assert_eq!("21..<109".parse::<NoteRange>().unwrap(), NoteRange::new(21, 108));
        assert_eq!("21...120".parse::<NoteRange>().unwrap(), NoteRange::new(21, 120));
        assert_eq!(" 24 ..< 36 ".parse::<NoteRange>().unwrap(), NoteRange::new(24, 35));
        assert!(matches!("21-108".parse::<NoteRange>(), Err(ConfigError::Invalid(_))));
        assert!(matches!("a..<b".parse::<NoteRange>(), Err(ConfigError::Invalid(_))));
        assert_eq!(NoteRange::new(21, 108).to_string(), "21..<109");
    }

    #[test]
    fn test_loads_legacy_configuration_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
  "samplingFrequency": 44100.0,
  "windowSize": 8192,
  "stepSize": 1024,
  "representableNoteRange": "21..<109",
  "spectrumNoteRange": "36..<96",
  "spectrumResolution": 2.0,
  "minimumPeakDistance": 0.5,
  "peakHeightCutoffMultiplier": 0.05,
  "rmsMovingAverageSize": 20,
  "features": ["onset_label", "spectrum"]
}}"#
        )
        .unwrap();

        let config = FeatureConfiguration::from_file(file.path()).unwrap();
        assert_eq!(config.representable_note_range, NoteRange::new(21, 108));
        assert_eq!(config.spectrum_note_range, NoteRange::new(36, 95));
        assert_eq!(config.band_count(), 120);
        assert_eq!(config.chunk_size, 1024);
    }

    #[test]
    fn test_note_ranges_written_as_text() {
        let json = FeatureConfiguration::default().to_json().unwrap();
        assert!(json.contains(r#""representableNoteRange": "21..<109""#));
        assert!(json.contains(r#""spectrumNoteRange": "21..<121""#));
    }

    #[test]
    fn test_malformed_note_range_rejected() {
        let result = FeatureConfiguration::from_json(r#"{"spectrumNoteRange": "21 to 108"}"#);
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_band_note_conversion() {
        let config = FeatureConfiguration {
            spectrum_resolution: 2.0,
            ..FeatureConfiguration::default()
        };
        assert_eq!(config.band_for_note(21.0), 0);
        assert_eq!(config.band_for_note(60.0), 78);
        assert_eq!(config.band_for_note(60.3), 79);
        assert_eq!(config.note_for_band(78), 60.0);
        assert_eq!(config.note_for_band(79), 60.5);
        assert_eq!(config.note_for_band(config.band_for_note(72.5)), 72.5);
    }

    #[test]
    fn test_feature_schema() {
        let config = FeatureConfiguration::default();
        let schema = config.feature_schema().unwrap();
        assert_eq!(schema.len(), 8);
        let label = schema.column_for_role(ColumnRole::Label).unwrap();
        assert_eq!(label.name, ON_LABEL_COLUMN);
        assert_eq!(label.width, 88);
        assert_eq!(schema.column(SPECTRUM_COLUMN).unwrap().width, 100);
    }

    #[test]
    fn test_json_round_trip_preserves_values() {
        let mut config = FeatureConfiguration::default();
        config.shuffle_passes = 3;
        let parsed = FeatureConfiguration::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
