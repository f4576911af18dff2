//! # Display Rendering
//!
//! Builds a compact textual model of what the panel should show (clock,
//! weather, link state), compares it to what was last drawn, and only
//! renders and pushes a frame when something actually changed. The panel
//! is slow and visibly flickers on refresh, so redundant draws are worth
//! suppressing.
//!
//! Rendering targets a 128x64 monochrome framebuffer through
//! `embedded-graphics`; a terminal transport is provided for development
//! on desktop systems.

use crate::clock::{format_local_time, ClockState, SyncStatus};
use crate::connectivity::{ConnectivityState, LinkStatus};
use crate::scheduler::TaskError;
use crate::transport::DisplayTransport;
use crate::weather::{FetchStatus, WeatherState};
use crate::Tick;
use embedded_graphics::{
    mono_font::{
        ascii::{FONT_10X20, FONT_6X10},
        MonoTextStyle,
    },
    pixelcolor::BinaryColor,
    prelude::*,
    text::Text,
};
use log::debug;

pub const FRAME_WIDTH: u32 = 128;
pub const FRAME_HEIGHT: u32 = 64;
const FRAME_BYTES: usize = (FRAME_WIDTH as usize / 8) * FRAME_HEIGHT as usize;

/// A 1-bit-per-pixel framebuffer, packed row-major, MSB-first.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    bits: Vec<u8>,
}

impl Frame {
    pub fn new() -> Self {
        Frame {
            bits: vec![0u8; FRAME_BYTES],
        }
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, on: bool) {
        if x >= FRAME_WIDTH || y >= FRAME_HEIGHT {
            return;
        }
        let idx = (y * FRAME_WIDTH / 8 + x / 8) as usize;
        let mask = 0x80u8 >> (x % 8);
        if on {
            self.bits[idx] |= mask;
        } else {
            self.bits[idx] &= !mask;
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> bool {
        if x >= FRAME_WIDTH || y >= FRAME_HEIGHT {
            return false;
        }
        let idx = (y * FRAME_WIDTH / 8 + x / 8) as usize;
        self.bits[idx] & (0x80u8 >> (x % 8)) != 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

impl Default for Frame {
    fn default() -> Self {
        Frame::new()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lit = self.bits.iter().map(|b| b.count_ones()).sum::<u32>();
        write!(f, "Frame({}x{}, {} lit)", FRAME_WIDTH, FRAME_HEIGHT, lit)
    }
}

impl OriginDimensions for Frame {
    fn size(&self) -> Size {
        Size::new(FRAME_WIDTH, FRAME_HEIGHT)
    }
}

impl DrawTarget for Frame {
    type Color = BinaryColor;
    type Error = core::convert::Infallible;

    fn draw_iter<P>(&mut self, pixels: P) -> Result<(), Self::Error>
    where
        P: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if point.x >= 0 && point.y >= 0 {
                self.set_pixel(point.x as u32, point.y as u32, color.is_on());
            }
        }
        Ok(())
    }
}

/// Everything the panel shows, reduced to comparable text rows. Two equal
/// models always render to the same frame, so equality gates the draw.
#[derive(Clone, Debug, PartialEq, Eq)]
struct DisplayModel {
    clock_line: String,
    weather_line: String,
    link_line: String,
}

/// Diff-gated renderer. Owns the last successfully drawn model.
pub struct DisplayRenderer {
    last_model: Option<DisplayModel>,
    utc_offset_minutes: i32,
    units: String,
}

impl DisplayRenderer {
    pub fn new(utc_offset_minutes: i32, units: String) -> Self {
        DisplayRenderer {
            last_model: None,
            utc_offset_minutes,
            units,
        }
    }

    fn build_model(
        &self,
        now: Tick,
        clock: &ClockState,
        weather: &WeatherState,
        conn: ConnectivityState,
    ) -> DisplayModel {
        let clock_line = match clock.local_time(now, self.utc_offset_minutes) {
            Some(local) => {
                let mut line = format_local_time(&local);
                if clock.sync_status() == SyncStatus::Stale {
                    line.push('*');
                }
                line
            }
            None => "--:--:--".to_string(),
        };

        let weather_line = match &weather.report {
            Some(report) => {
                let mut line = report.display_line(&self.units);
                match weather.status {
                    FetchStatus::Stale => line.push('*'),
                    FetchStatus::Error(_) => line.push('!'),
                    _ => {}
                }
                line
            }
            None => match &weather.status {
                FetchStatus::Error(_) => "weather !".to_string(),
                _ => "weather --".to_string(),
            },
        };

        let link_line = match conn.status {
            LinkStatus::Connected => "wifi up".to_string(),
            LinkStatus::Connecting => "wifi connecting".to_string(),
            LinkStatus::Backoff { .. } => format!("wifi retry #{}", conn.retry_count + 1),
            LinkStatus::Disconnected => "wifi down".to_string(),
        };

        DisplayModel {
            clock_line,
            weather_line,
            link_line,
        }
    }

    fn render(model: &DisplayModel) -> Frame {
        let mut frame = Frame::new();
        let big = MonoTextStyle::new(&FONT_10X20, BinaryColor::On);
        let small = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);

        // Drawing into the framebuffer cannot fail (Error = Infallible).
        let _ = Text::new(&model.clock_line, Point::new(2, 22), big).draw(&mut frame);
        let _ = Text::new(&model.weather_line, Point::new(2, 44), small).draw(&mut frame);
        let _ = Text::new(&model.link_line, Point::new(2, 58), small).draw(&mut frame);
        frame
    }

    /// Render and draw if the model changed since the last successful
    /// draw. A failed draw leaves the last model untouched, so the next
    /// step retries.
    pub fn step<D: DisplayTransport + ?Sized>(
        &mut self,
        now: Tick,
        clock: &ClockState,
        weather: &WeatherState,
        conn: ConnectivityState,
        display: &mut D,
    ) -> Result<(), TaskError> {
        let model = self.build_model(now, clock, weather, conn);
        if self.last_model.as_ref() == Some(&model) {
            return Ok(());
        }
        debug!("display update: {:?}", model);
        let frame = Self::render(&model);
        display
            .draw(&frame)
            .map_err(|e| TaskError::Transport(e.to_string()))?;
        self.last_model = Some(model);
        Ok(())
    }

    /// Startup splash, drawn once before the loop begins.
    pub fn draw_boot<D: DisplayTransport + ?Sized>(
        &mut self,
        display: &mut D,
    ) -> Result<(), TaskError> {
        let mut frame = Frame::new();
        let big = MonoTextStyle::new(&FONT_10X20, BinaryColor::On);
        let small = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
        let _ = Text::new("mediadeck", Point::new(2, 28), big).draw(&mut frame);
        let _ = Text::new("starting...", Point::new(2, 48), small).draw(&mut frame);
        display
            .draw(&frame)
            .map_err(|e| TaskError::Transport(e.to_string()))?;
        // The boot splash never matches a real model, so the first real
        // step always draws.
        self.last_model = None;
        Ok(())
    }
}

/// Draws frames to stdout using half-block characters, two frame rows per
/// terminal line. Development stand-in for the panel.
pub struct TerminalDisplay;

impl DisplayTransport for TerminalDisplay {
    fn draw(&mut self, frame: &Frame) -> Result<(), crate::transport::DisplayError> {
        let mut out = String::with_capacity((FRAME_WIDTH as usize + 3) * (FRAME_HEIGHT as usize / 2 + 2));
        out.push('+');
        for _ in 0..FRAME_WIDTH {
            out.push('-');
        }
        out.push_str("+\n");
        for y in (0..FRAME_HEIGHT).step_by(2) {
            out.push('|');
            for x in 0..FRAME_WIDTH {
                let top = frame.pixel(x, y);
                let bottom = frame.pixel(x, y + 1);
                out.push(match (top, bottom) {
                    (true, true) => '█',
                    (true, false) => '▀',
                    (false, true) => '▄',
                    (false, false) => ' ',
                });
            }
            out.push_str("|\n");
        }
        out.push('+');
        for _ in 0..FRAME_WIDTH {
            out.push('-');
        }
        out.push_str("+\n");
        println!("{out}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockState;
    use crate::connectivity::ConnectivityState;
    use crate::sim::CountingDisplay;
    use crate::weather::{WeatherReport, WeatherState};
    use chrono::{TimeZone, Utc};

    fn disconnected() -> ConnectivityState {
        ConnectivityState {
            status: LinkStatus::Disconnected,
            retry_count: 0,
        }
    }

    #[test]
    fn test_unchanged_model_skips_draw() {
        let mut renderer = DisplayRenderer::new(0, "metric".to_string());
        let mut display = CountingDisplay::new();
        let clock = ClockState::new(20);
        let weather = WeatherState::new();

        renderer
            .step(1, &clock, &weather, disconnected(), &mut display)
            .unwrap();
        assert_eq!(display.draws, 1);

        // Clock is unsynced, so a later tick renders an identical model.
        renderer
            .step(2, &clock, &weather, disconnected(), &mut display)
            .unwrap();
        assert_eq!(display.draws, 1, "identical model must not redraw");
    }

    #[test]
    fn test_changed_model_redraws() {
        let mut renderer = DisplayRenderer::new(0, "metric".to_string());
        let mut display = CountingDisplay::new();
        let mut clock = ClockState::new(1000);
        let weather = WeatherState::new();

        renderer
            .step(1, &clock, &weather, disconnected(), &mut display)
            .unwrap();
        let wall = Utc.with_ymd_and_hms(2026, 3, 1, 15, 4, 5).single();
        clock.apply_sync(2, wall.expect("valid timestamp"));
        renderer
            .step(2, &clock, &weather, disconnected(), &mut display)
            .unwrap();
        assert_eq!(display.draws, 2);

        // With a 1s tick the displayed seconds change every tick.
        renderer
            .step(3, &clock, &weather, disconnected(), &mut display)
            .unwrap();
        assert_eq!(display.draws, 3);
    }

    #[test]
    fn test_failed_draw_retries_next_step() {
        let mut renderer = DisplayRenderer::new(0, "metric".to_string());
        let mut display = CountingDisplay::new();
        let clock = ClockState::new(20);
        let weather = WeatherState::new();

        display.fail_all = true;
        assert!(renderer
            .step(1, &clock, &weather, disconnected(), &mut display)
            .is_err());

        // Same model, but the last draw never landed.
        display.fail_all = false;
        renderer
            .step(2, &clock, &weather, disconnected(), &mut display)
            .unwrap();
        assert_eq!(display.draws, 1);
    }

    #[test]
    fn test_stale_markers_reach_the_model() {
        let mut renderer = DisplayRenderer::new(0, "metric".to_string());
        let mut clock = ClockState::new(1000);
        let wall = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single();
        clock.apply_sync(1, wall.expect("valid timestamp"));
        clock.mark_stale();

        let mut weather = WeatherState::new();
        weather.report = Some(WeatherReport {
            temp: 18.5,
            condition: "Clouds".to_string(),
            condition_id: 802,
            city: "Portland".to_string(),
        });
        weather.status = FetchStatus::Stale;

        let model = renderer.build_model(1, &clock, &weather, disconnected());
        assert!(model.clock_line.ends_with('*'), "stale clock gets a marker");
        assert!(model.weather_line.ends_with('*'), "stale weather gets a marker");
    }

    #[test]
    fn test_frame_text_lights_pixels() {
        let frame = DisplayRenderer::render(&DisplayModel {
            clock_line: "3:04:05 PM".to_string(),
            weather_line: "18.5°C Clouds".to_string(),
            link_line: "wifi up".to_string(),
        });
        let lit = frame.as_bytes().iter().map(|b| b.count_ones()).sum::<u32>();
        assert!(lit > 100, "rendered frame should contain visible text");
    }
}
