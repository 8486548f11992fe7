//! Physical push-to-talk button
//!
//! An alternative activation source to the wake phrase.

#[cfg(feature = "gpio-button")]
mod gpio;
mod listener;

pub use listener::{ButtonError, ButtonLine, ButtonListener, Debouncer};

use crate::config::ButtonSettings;

/// Open the configured button line
pub fn open_line(settings: &ButtonSettings) -> Result<Box<dyn ButtonLine>, ButtonError> {
    #[cfg(feature = "gpio-button")]
    {
        let line = gpio::GpioLine::open(settings.gpio_pin)?;
        Ok(Box::new(line))
    }

    #[cfg(not(feature = "gpio-button"))]
    {
        Err(ButtonError::Unavailable(format!(
            "pin {} requested but built without the gpio-button feature",
            settings.gpio_pin
        )))
    }
}
