//! Time-series backend implementations.

pub mod influx;
pub mod memory;

pub use influx::InfluxClient;
pub use memory::MemoryBackend;

use std::sync::Arc;

use chirpha_core::InfluxSettings;

use crate::{Result, TimeSeriesBackend};

/// Build the configured backend.
///
/// Returns `Ok(None)` when no backend is configured; reconciliation is then
/// a no-op.
pub fn create_backend(
    settings: Option<&InfluxSettings>,
) -> Result<Option<Arc<dyn TimeSeriesBackend>>> {
    match settings {
        Some(settings) => {
            let client = InfluxClient::new(settings)?;
            tracing::info!(
                category = "storage",
                backend = client.name(),
                url = %settings.url,
                "Time-series backend configured"
            );
            Ok(Some(Arc::new(client)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_backend_none() {
        assert!(create_backend(None).unwrap().is_none());
    }

    #[test]
    fn test_create_backend_v1() {
        let settings = InfluxSettings::v1("http://localhost:8086", "lora");
        let backend = create_backend(Some(&settings)).unwrap().unwrap();
        assert_eq!(backend.name(), "influxdb-v1");
    }
}
