//! # Defaults Catalog
//!
//! The static metrics each known entity shows until (or unless) live values
//! exist. Loaded from a JSON5 file of the shape:
//!
//! ```json5
//! {
//!   analytics: { queries: "1.2M/day", latency: "<50ms", uptime: "99.9%" },
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::model::{DefaultMetrics, MetricValue};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed defaults file: {0}")]
    ParseError(String),

    #[error("Defaults file declares no entities")]
    Empty,
}

/// Entity id to its default metrics, in stable order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefaultsCatalog {
    entries: BTreeMap<String, DefaultMetrics>,
}

impl DefaultsCatalog {
    /// The three demo entities the presentation layer ships with.
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        catalog.insert(
            "analytics",
            [("queries", "1.2M/day"), ("latency", "<50ms"), ("uptime", "99.9%")],
        );
        catalog.insert(
            "segmentation",
            [("segments", "12"), ("accuracy", "94%"), ("processing", "<2s")],
        );
        catalog.insert(
            "reporting",
            [("reports", "500/mo"), ("automation", "100%"), ("saved", "200h")],
        );
        catalog
    }

    /// Parses a JSON5 catalog.
    pub fn from_json5(text: &str) -> Result<Self, CatalogError> {
        let catalog: Self = json5::from_str(text).map_err(|e| CatalogError::ParseError(e.to_string()))?;
        if catalog.entries.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(catalog)
    }

    /// Reads and parses a JSON5 catalog file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let text = fs::read_to_string(path.as_ref())?;
        let catalog = Self::from_json5(&text)?;
        log::info!("Loaded {} default entities from {}", catalog.len(), path.as_ref().display());
        Ok(catalog)
    }

    /// Adds or replaces an entity's defaults.
    pub fn insert<'a, I>(&mut self, entity_id: &str, metrics: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let metrics = metrics
            .into_iter()
            .map(|(name, value)| (name.to_string(), MetricValue::from(value)))
            .collect();
        self.entries.insert(entity_id.to_string(), metrics);
    }

    pub fn get(&self, entity_id: &str) -> Option<&DefaultMetrics> {
        self.entries.get(entity_id)
    }

    /// Known entity ids, sorted.
    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for DefaultsCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DefaultsCatalog")?;
        for (entity, metrics) in &self.entries {
            let rendered: Vec<String> = metrics.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            writeln!(f, "    {}: {}", entity, rendered.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_builtin_has_demo_entities() {
        let catalog = DefaultsCatalog::builtin();
        assert_eq!(catalog.entities().collect::<Vec<_>>(), vec!["analytics", "reporting", "segmentation"]);
        assert_eq!(catalog.get("analytics").unwrap()["latency"], MetricValue::from("<50ms"));
        assert_eq!(catalog.get("reporting").unwrap()["saved"], MetricValue::from("200h"));
        assert!(catalog.get("billing").is_none());
    }

    #[test]
    fn test_load_json5_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "{{\n  // comments are fine\n  billing: {{ invoices: '40/day', errors: 0, }},\n}}"
        )
        .unwrap();

        let catalog = DefaultsCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        let billing = catalog.get("billing").unwrap();
        assert_eq!(billing["invoices"], MetricValue::from("40/day"));
        assert!(matches!(billing["errors"], MetricValue::Number(_)));
    }

    #[test]
    fn test_empty_and_malformed_files_are_rejected() {
        assert!(matches!(DefaultsCatalog::from_json5("{}"), Err(CatalogError::Empty)));
        assert!(matches!(DefaultsCatalog::from_json5("{ analytics: "), Err(CatalogError::ParseError(_))));
        assert!(matches!(DefaultsCatalog::load("/nonexistent/defaults.json5"), Err(CatalogError::IoError(_))));
    }
}
