//! Raspberry Pi GPIO line with the internal pull-up enabled

use rppal::gpio::{Gpio, InputPin};

use super::listener::{ButtonError, ButtonLine};

/// Button wired between the pin and ground; pressed reads low
pub struct GpioLine {
    pin: InputPin,
}

impl GpioLine {
    pub fn open(bcm_pin: u32) -> Result<Self, ButtonError> {
        let bcm_pin = u8::try_from(bcm_pin)
            .map_err(|_| ButtonError::Gpio(format!("pin {bcm_pin} out of range")))?;
        let gpio = Gpio::new().map_err(|e| ButtonError::Gpio(e.to_string()))?;
        let pin = gpio
            .get(bcm_pin)
            .map_err(|e| ButtonError::Gpio(e.to_string()))?
            .into_input_pullup();
        Ok(Self { pin })
    }
}

impl ButtonLine for GpioLine {
    fn is_pressed(&mut self) -> Result<bool, ButtonError> {
        Ok(self.pin.is_low())
    }
}
