//! Visual feedback. Fire-and-forget; nothing in the protocol waits on it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Green,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkRequest {
    pub color: Color,
    pub interval_ms: u16,
    pub count: u16,
}

impl BlinkRequest {
    pub fn green(interval_ms: u16, count: u16) -> Self {
        Self {
            color: Color::Green,
            interval_ms,
            count,
        }
    }
}

pub trait Indicator {
    fn blink(&mut self, request: BlinkRequest);
    fn set_led(&mut self, color: Color, on: bool);
}

/// Indicator for hosts without LEDs.
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn blink(&mut self, request: BlinkRequest) {
        log::info!(
            "Blink {:?} {} times every {}ms",
            request.color,
            request.count,
            request.interval_ms
        );
    }

    fn set_led(&mut self, color: Color, on: bool) {
        log::debug!("LED {:?} {}", color, if on { "on" } else { "off" });
    }
}

#[cfg(test)]
pub use testing::{LedEvent, RecordingIndicator};
