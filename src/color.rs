// LED color messages

use std::fmt;

use log::warn;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb { r, g, b }
    }

    /// Convert any CSS color (name, hex, `rgb()`, `hsl()`..). Unparsable
    /// input turns the LED off.
    pub fn parse(input: &str) -> Self {
        match csscolorparser::parse(input) {
            Ok(color) => {
                let [r, g, b, _] = color.to_rgba8();
                Rgb { r, g, b }
            }
            Err(e) => {
                warn!("unrecognized color {:?} ({}), using black", input, e);
                Rgb::BLACK
            }
        }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Inbound LED message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ColorMessage {
    pub color: String,
    #[serde(default)]
    pub on: Option<bool>,
}

impl ColorMessage {
    /// The color to write, if any. `on: false` always means black.
    pub fn rgb(&self) -> Option<Rgb> {
        if self.on == Some(false) {
            return Some(Rgb::BLACK);
        }
        if self.color.is_empty() {
            return None;
        }
        Some(Rgb::parse(&self.color))
    }
}
