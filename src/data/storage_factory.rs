//! Storage writer factory with automatic feature-based registration.
use crate::data::storage::TimeseriesWriter;
use crate::error::{AppResult, DaqError};
use std::collections::HashMap;

#[cfg(feature = "storage_hdf5")]
use crate::data::hdf5_writer::Hdf5TimeseriesWriter;
#[cfg(feature = "storage_csv")]
use crate::data::storage::CsvTimeseriesWriter;

type WriterFactory = Box<dyn Fn() -> Box<dyn TimeseriesWriter> + Send + Sync>;

/// Formats this crate knows how to write when the matching feature is enabled.
const KNOWN_FORMATS: [(&str, &str); 2] = [("csv", "storage_csv"), ("hdf5", "storage_hdf5")];

/// Registry for time series writer factories with automatic feature detection.
///
/// Writers are registered based on enabled Cargo features:
/// - `storage_csv` → CSV writer
/// - `storage_hdf5` → HDF5 writer
///
/// # Examples
///
/// ```
/// use phase_daq::data::storage_factory::StorageWriterRegistry;
///
/// let registry = StorageWriterRegistry::new();
/// for format in registry.list_formats() {
///     println!("Available format: {}", format);
/// }
/// # #[cfg(feature = "storage_csv")]
/// let writer = registry.create("csv")?;
/// # Ok::<(), phase_daq::error::DaqError>(())
/// ```
pub struct StorageWriterRegistry {
    factories: HashMap<String, WriterFactory>,
}

impl Default for StorageWriterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageWriterRegistry {
    /// Creates a new registry and registers all writers compiled in.
    pub fn new() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self {
            factories: HashMap::new(),
        };

        #[cfg(feature = "storage_csv")]
        registry.register("csv", || Box::new(CsvTimeseriesWriter::new()));

        #[cfg(feature = "storage_hdf5")]
        registry.register("hdf5", || Box::new(Hdf5TimeseriesWriter::new()));

        registry
    }

    /// Registers a custom writer factory.
    pub fn register<F>(&mut self, format: &str, factory: F)
    where
        F: Fn() -> Box<dyn TimeseriesWriter> + Send + Sync + 'static,
    {
        self.factories.insert(format.to_string(), Box::new(factory));
    }

    /// Creates a writer for the specified format.
    ///
    /// # Errors
    ///
    /// - [`DaqError::FeatureNotEnabled`] for a known format whose feature is off
    /// - [`DaqError::Configuration`] for an unknown format
    pub fn create(&self, format: &str) -> AppResult<Box<dyn TimeseriesWriter>> {
        if let Some(factory) = self.factories.get(format) {
            return Ok(factory());
        }
        if let Some((_, feature)) = KNOWN_FORMATS.iter().find(|(name, _)| *name == format) {
            return Err(DaqError::FeatureNotEnabled((*feature).to_string()));
        }
        Err(DaqError::Configuration(format!(
            "Unsupported storage format: '{}'. Available formats: [{}]",
            format,
            self.list_formats().join(", ")
        )))
    }

    /// Returns all registered format names, sorted.
    pub fn list_formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = self.factories.keys().cloned().collect();
        formats.sort();
        formats
    }

    /// Checks if a specific format is available.
    pub fn is_available(&self, format: &str) -> bool {
        self.factories.contains_key(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "storage_csv")]
    fn test_csv_writer_available_with_feature() {
        let registry = StorageWriterRegistry::new();
        assert!(registry.is_available("csv"));
        let writer = registry.create("csv").ok().unwrap();
        assert_eq!(writer.extension(), "csv");
    }

    #[test]
    #[cfg(not(feature = "storage_hdf5"))]
    fn test_disabled_format_reports_feature() {
        let registry = StorageWriterRegistry::new();
        let err = registry.create("hdf5").err().unwrap();
        assert!(matches!(err, DaqError::FeatureNotEnabled(ref f) if f == "storage_hdf5"));
    }

    #[test]
    fn test_invalid_format_returns_error() {
        let registry = StorageWriterRegistry::new();
        let err = registry.create("parquet").err().unwrap();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_list_formats_is_sorted() {
        let registry = StorageWriterRegistry::new();
        let formats = registry.list_formats();
        let mut sorted_formats = formats.clone();
        sorted_formats.sort();
        assert_eq!(formats, sorted_formats);
    }

    #[test]
    #[cfg(feature = "storage_csv")]
    fn test_custom_registration() {
        let mut registry = StorageWriterRegistry::new();
        let original_count = registry.list_formats().len();
        registry.register("custom", || Box::new(CsvTimeseriesWriter::new()));
        assert_eq!(registry.list_formats().len(), original_count + 1);
        assert!(registry.is_available("custom"));
    }
}
