//! Wake phrase detection on microphone frames

mod detector;
mod energy;
#[cfg(test)]
pub mod testing;

pub use detector::{ActivationDetector, Detection, WakeWordModel};
pub use energy::EnergyGate;

use crate::config::HotwordSettings;
use crate::error::ConfigError;

/// Build the detector described by the hotword settings
pub fn from_settings(settings: &HotwordSettings) -> Result<ActivationDetector, ConfigError> {
    let model: Box<dyn WakeWordModel> = match settings.model.as_str() {
        "energy" => {
            let phrase = settings
                .phrases
                .first()
                .cloned()
                .unwrap_or_else(|| "energy".to_string());
            Box::new(EnergyGate::new(phrase, settings.energy_full_scale))
        }
        other => {
            return Err(ConfigError::InvalidValue {
                key: "hotword.model".to_string(),
                reason: format!("unknown wake model '{other}'"),
            })
        }
    };

    tracing::debug!(
        model = %settings.model,
        phrases = ?settings.phrases,
        threshold = settings.threshold,
        "activation detector initialized"
    );

    Ok(
        ActivationDetector::new(model, settings.threshold, settings.cooldown())
            .with_debug_logging(settings.debug_logging),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_model_rejected() {
        let settings = HotwordSettings {
            model: "nonexistent".to_string(),
            ..HotwordSettings::default()
        };
        assert!(matches!(
            from_settings(&settings),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_energy_model_builds() {
        assert!(from_settings(&HotwordSettings::default()).is_ok());
    }
}
