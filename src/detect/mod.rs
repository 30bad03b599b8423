mod backend;
mod backends;
mod result;

use anyhow::{anyhow, Result};

use crate::config::DetectorSettings;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{select_best, BestDetection, Detection, DetectionResult};

/// Build and warm up the backend named in the settings.
///
/// Load failures are fatal startup errors for the vision node.
pub fn build_backend(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    let mut backend: Box<dyn DetectorBackend> = match settings.backend.as_str() {
        "stub" => Box::new(StubBackend::new()),
        "tract" => build_tract(settings)?,
        other => {
            return Err(anyhow!(
                "unknown detector backend '{}': expected 'tract' or 'stub'",
                other
            ))
        }
    };
    backend.warm_up()?;
    log::info!("detector backend '{}' ready", backend.name());
    Ok(backend)
}

#[cfg(feature = "backend-tract")]
fn build_tract(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    let backend = TractBackend::new(
        &settings.model_path,
        settings.input_size,
        settings.class_names.clone(),
    )?
    .with_min_score(settings.min_score);
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow!(
        "detector backend 'tract' requires the 'backend-tract' feature.\n\
         Recompile with: cargo build --features backend-tract"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_stub_backend() {
        let settings = DetectorSettings {
            backend: "stub".to_string(),
            ..DetectorSettings::default()
        };
        let backend = build_backend(&settings).unwrap();
        assert_eq!(backend.name(), "stub");
    }

    #[test]
    fn rejects_unknown_backend() {
        let settings = DetectorSettings {
            backend: "opencv".to_string(),
            ..DetectorSettings::default()
        };
        let err = build_backend(&settings).err().unwrap();
        assert!(err.to_string().contains("unknown detector backend"));
    }
}
