//! Colored console output for log events forwarded by monitors.

use colored::{Color, ColoredString, Colorize};
use gridwatch_core::contracts::LogEvent;
use std::collections::HashMap;

const PALETTE: [Color; 7] = [
    Color::Red,
    Color::Green,
    Color::Yellow,
    Color::Blue,
    Color::Magenta,
    Color::Cyan,
    Color::White,
];

/// Gives every sender its own color, round-robin in order of first appearance.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    colors: HashMap<String, Color>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn color_for(&mut self, sender: &str) -> Color {
        let next = PALETTE[self.colors.len() % PALETTE.len()];
        *self.colors.entry(sender.to_string()).or_insert(next)
    }

    pub fn line(event: &LogEvent) -> String {
        format!(
            "[{} {}] [{}]: {} - {}",
            event.kind, event.uuid, event.severity, event.time, event.message
        )
    }

    pub fn render(&mut self, event: &LogEvent) -> ColoredString {
        let color = self.color_for(&event.uuid);
        Self::line(event).color(color).reversed()
    }

    pub fn print(&mut self, event: &LogEvent) {
        println!("{}", self.render(event));
    }
}
