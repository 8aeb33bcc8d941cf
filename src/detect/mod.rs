mod backend;
mod backends;
mod labels;
mod result;
pub mod suppress;

use anyhow::{anyhow, Result};

pub use backend::DetectorBackend;
pub use backends::{StubBackend, StubResponse};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use labels::LabelTable;
pub use result::{Detection, GridSize, InputShape};
pub use suppress::Suppressor;

use crate::config::DetectorSettings;

/// Build the configured detector backend.
pub fn open_backend(
    settings: &DetectorSettings,
    labels: &LabelTable,
) -> Result<Box<dyn DetectorBackend>> {
    match settings.backend.as_str() {
        "stub" => Ok(Box::new(
            StubBackend::new().with_geometry(settings.input, settings.grid),
        )),
        "tract" => open_tract(settings, labels),
        other => Err(anyhow!(
            "unknown detector backend '{}'; expected stub or tract",
            other
        )),
    }
}

#[cfg(feature = "backend-tract")]
fn open_tract(
    settings: &DetectorSettings,
    labels: &LabelTable,
) -> Result<Box<dyn DetectorBackend>> {
    let model_path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract backend requires detector.model_path"))?;
    let mut backend = TractBackend::new(model_path, settings.input, settings.grid, labels.len())?
        .with_threshold(settings.threshold);
    if let Some(anchors) = &settings.anchors {
        backend = backend.with_anchors(anchors.clone());
    }
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn open_tract(
    _settings: &DetectorSettings,
    _labels: &LabelTable,
) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow!("tract detector requires the backend-tract feature"))
}
