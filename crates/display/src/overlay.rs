//! Overlay state, text rendering and the render cache
//!
//! The overlay is a transparent RGBA layer with time, date, speed, fuel, CAN
//! status and a REC indicator. Rendering text is expensive, so the cache keeps
//! the last result keyed on an [`OverlayState`] snapshot and re-renders only
//! when a displayed value actually changes. The cached form is a tight
//! bounding box plus separate alpha and RGB planes, ready for blending.

use crate::DisplayError;
use ab_glyph::{FontVec, PxScale};
use chrono::{Local, TimeZone};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use telemetry::CanStatus;
use tracing::{debug, info, warn};

pub const KPH_PER_MPH: f64 = 1.60934;
pub const LITERS_PER_GALLON: f64 = 3.78541;

/// Background padding around each label
const TEXT_PADDING: i32 = 5;

const OUTLINE_OFFSETS: [(i32, i32); 8] = [
    (-1, -1),
    (-1, 1),
    (1, -1),
    (1, 1),
    (-1, 0),
    (1, 0),
    (0, -1),
    (0, 1),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedUnit {
    Mph,
    Kph,
}

impl SpeedUnit {
    pub fn label(&self) -> &'static str {
        match self {
            SpeedUnit::Mph => "MPH",
            SpeedUnit::Kph => "KPH",
        }
    }

    fn convert_mph(&self, mph: f64) -> f64 {
        match self {
            SpeedUnit::Mph => mph,
            SpeedUnit::Kph => mph * KPH_PER_MPH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuelUnit {
    Gallons,
    Liters,
}

impl FuelUnit {
    pub fn label(&self) -> &'static str {
        match self {
            FuelUnit::Gallons => "GAL",
            FuelUnit::Liters => "L",
        }
    }

    fn convert_liters(&self, liters: f64) -> f64 {
        match self {
            FuelUnit::Gallons => liters / LITERS_PER_GALLON,
            FuelUnit::Liters => liters,
        }
    }
}

/// Overlay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Draw the overlay at all
    pub enabled: bool,
    /// TrueType fonts to try, in order
    pub font_paths: Vec<PathBuf>,
    /// Main font size (px); the date and CAN line use 8 px less
    pub font_size: f32,
    /// strftime format of the clock
    pub time_format: String,
    /// strftime format of the date
    pub date_format: String,
    pub time_pos: (i32, i32),
    pub date_pos: (i32, i32),
    pub speed_pos: (i32, i32),
    /// Right edge of the REC indicator
    pub rec_pos: (i32, i32),
    pub can_pos: (i32, i32),
    pub fuel_pos: (i32, i32),
    pub font_color: [u8; 3],
    pub bg_color: [u8; 3],
    pub bg_alpha: u8,
    /// 1-px outline around glyphs
    pub outline: bool,
    pub outline_color: [u8; 3],
    pub show_speed: bool,
    pub speed_unit: SpeedUnit,
    pub show_can_status: bool,
    pub show_fuel: bool,
    pub fuel_unit: FuelUnit,
    /// Decimals shown for fuel consumed
    pub fuel_decimals: u32,
    pub rec_text: String,
    pub rec_color: [u8; 3],
    pub rec_blink: bool,
    /// Blink half-period (seconds)
    pub rec_blink_rate: f64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            font_paths: vec![
                PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf"),
                PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"),
            ],
            font_size: 32.0,
            time_format: "%H:%M:%S".to_string(),
            date_format: "%Y-%m-%d".to_string(),
            time_pos: (20, 20),
            date_pos: (20, 60),
            speed_pos: (20, 100),
            rec_pos: (1820, 20),
            can_pos: (20, 140),
            fuel_pos: (20, 180),
            font_color: [255, 255, 255],
            bg_color: [0, 0, 0],
            bg_alpha: 128,
            outline: true,
            outline_color: [0, 0, 0],
            show_speed: true,
            speed_unit: SpeedUnit::Mph,
            show_can_status: true,
            show_fuel: true,
            fuel_unit: FuelUnit::Gallons,
            fuel_decimals: 2,
            rec_text: "\u{25CF} REC".to_string(),
            rec_color: [255, 0, 0],
            rec_blink: false,
            rec_blink_rate: 1.0,
        }
    }
}

impl OverlayConfig {
    /// Reject strftime formats chrono cannot render
    pub fn check_formats(&self) -> Result<(), String> {
        use chrono::format::{Item, StrftimeItems};
        for (name, fmt) in [
            ("time_format", &self.time_format),
            ("date_format", &self.date_format),
        ] {
            if StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error)) {
                return Err(format!("invalid {} '{}'", name, fmt));
            }
        }
        Ok(())
    }
}

/// Raw inputs gathered by the render loop for one tick
#[derive(Debug, Clone, Default)]
pub struct OverlaySample {
    /// Wall clock, seconds since the Unix epoch
    pub unix_time: f64,
    pub speed_mph: Option<f64>,
    pub recording: bool,
    pub can_status: Option<CanStatus>,
    pub fuel_liters: Option<f64>,
}

/// What the overlay shows, quantized to display resolution.
///
/// Two equal states render identical overlays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayState {
    /// Wall-clock second
    pub time_sec: i64,
    /// Integer part of the speed in the configured unit
    pub speed: Option<i64>,
    /// REC indicator drawn this tick
    pub rec_visible: bool,
    pub can_text: Option<&'static str>,
    /// Fuel consumed as `round(value * 10^fuel_decimals)` in the configured unit
    pub fuel: Option<i64>,
}

impl OverlayState {
    pub fn from_sample(config: &OverlayConfig, sample: &OverlaySample) -> Self {
        let speed = sample
            .speed_mph
            .filter(|_| config.show_speed)
            .map(|mph| config.speed_unit.convert_mph(mph).trunc() as i64);

        let rec_visible = sample.recording
            && (!config.rec_blink
                || ((sample.unix_time / config.rec_blink_rate.max(0.01)) as i64) % 2 == 0);

        let can_text = sample
            .can_status
            .filter(|_| config.show_can_status)
            .map(|status| status.label());

        let scale = 10f64.powi(config.fuel_decimals as i32);
        let fuel = sample
            .fuel_liters
            .filter(|_| config.show_fuel)
            .map(|liters| (config.fuel_unit.convert_liters(liters) * scale).round() as i64);

        Self {
            time_sec: sample.unix_time.floor() as i64,
            speed,
            rec_visible,
            can_text,
            fuel,
        }
    }
}

/// Draws an overlay for a state onto a transparent canvas
pub trait OverlayRenderer: Send {
    fn render(&self, state: &OverlayState, width: u32, height: u32) -> RgbaImage;
}

/// Tight non-transparent region of a rendered overlay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayMask {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// `width * height` alpha values
    pub alpha: Vec<u8>,
    /// `width * height * 3` colour values
    pub rgb: Vec<u8>,
}

impl OverlayMask {
    /// Crop `image` to its non-transparent pixels; `None` if there are none
    pub fn from_rgba(image: &RgbaImage) -> Option<Self> {
        let (mut x0, mut y0) = (u32::MAX, u32::MAX);
        let (mut x1, mut y1) = (0u32, 0u32);
        for (x, y, px) in image.enumerate_pixels() {
            if px[3] > 0 {
                x0 = x0.min(x);
                y0 = y0.min(y);
                x1 = x1.max(x);
                y1 = y1.max(y);
            }
        }
        if x0 == u32::MAX {
            return None;
        }

        let (width, height) = (x1 - x0 + 1, y1 - y0 + 1);
        let n = width as usize * height as usize;
        let mut alpha = Vec::with_capacity(n);
        let mut rgb = Vec::with_capacity(n * 3);
        for y in y0..=y1 {
            for x in x0..=x1 {
                let px = image.get_pixel(x, y);
                alpha.push(px[3]);
                rgb.extend_from_slice(&px.0[..3]);
            }
        }

        Some(Self {
            x: x0,
            y: y0,
            width,
            height,
            alpha,
            rgb,
        })
    }
}

/// TrueType overlay renderer
pub struct TextOverlayRenderer {
    config: OverlayConfig,
    font: FontVec,
}

impl TextOverlayRenderer {
    /// Load the first usable font from `config.font_paths`
    pub fn load(config: &OverlayConfig) -> Result<Self, DisplayError> {
        for path in &config.font_paths {
            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("Font {} unavailable: {}", path.display(), e);
                    continue;
                }
            };
            match FontVec::try_from_vec(bytes) {
                Ok(font) => {
                    info!("Overlay font: {}", path.display());
                    return Ok(Self::with_font(config.clone(), font));
                }
                Err(e) => warn!("Font {} is not usable: {}", path.display(), e),
            }
        }
        Err(DisplayError::Unsupported(
            "no usable overlay font found".to_string(),
        ))
    }

    pub fn with_font(config: OverlayConfig, font: FontVec) -> Self {
        Self { config, font }
    }

    fn scale(&self) -> PxScale {
        PxScale::from(self.config.font_size.max(1.0))
    }

    fn small_scale(&self) -> PxScale {
        PxScale::from((self.config.font_size - 8.0).max(1.0))
    }

    /// Text with a padded translucent background and optional outline
    fn draw_label(
        &self,
        canvas: &mut RgbaImage,
        text: &str,
        (x, y): (i32, i32),
        color: [u8; 3],
        scale: PxScale,
    ) {
        if text.is_empty() {
            return;
        }
        let (w, h) = text_size(scale, &self.font, text);

        if self.config.bg_alpha > 0 {
            let [r, g, b] = self.config.bg_color;
            let pad = TEXT_PADDING as u32;
            let bg = Rect::at(x - TEXT_PADDING, y - TEXT_PADDING).of_size(w + 2 * pad, h + 2 * pad);
            draw_filled_rect_mut(canvas, bg, Rgba([r, g, b, self.config.bg_alpha]));
        }

        if self.config.outline {
            let [r, g, b] = self.config.outline_color;
            for (dx, dy) in OUTLINE_OFFSETS {
                draw_text_mut(canvas, Rgba([r, g, b, 255]), x + dx, y + dy, scale, &self.font, text);
            }
        }

        let [r, g, b] = color;
        draw_text_mut(canvas, Rgba([r, g, b, 255]), x, y, scale, &self.font, text);
    }
}

fn format_local(time_sec: i64, fmt: &str) -> Option<String> {
    let time = Local.timestamp_opt(time_sec, 0).single()?;
    let mut out = String::new();
    write!(out, "{}", time.format(fmt)).ok()?;
    Some(out)
}

impl OverlayRenderer for TextOverlayRenderer {
    fn render(&self, state: &OverlayState, width: u32, height: u32) -> RgbaImage {
        let mut canvas = RgbaImage::new(width, height);
        let config = &self.config;
        let (scale, small) = (self.scale(), self.small_scale());

        if let Some(text) = format_local(state.time_sec, &config.time_format) {
            self.draw_label(&mut canvas, &text, config.time_pos, config.font_color, scale);
        }
        if let Some(text) = format_local(state.time_sec, &config.date_format) {
            self.draw_label(&mut canvas, &text, config.date_pos, config.font_color, small);
        }

        if let Some(speed) = state.speed {
            let text = format!("{} {}", speed, config.speed_unit.label());
            self.draw_label(&mut canvas, &text, config.speed_pos, config.font_color, scale);
        }

        if let Some(can) = state.can_text {
            self.draw_label(&mut canvas, can, config.can_pos, config.font_color, small);
        }

        if let Some(fuel) = state.fuel {
            let decimals = config.fuel_decimals as usize;
            let value = fuel as f64 / 10f64.powi(config.fuel_decimals as i32);
            let text = format!("FUEL {:.*} {}", decimals, value, config.fuel_unit.label());
            self.draw_label(&mut canvas, &text, config.fuel_pos, config.font_color, scale);
        }

        if state.rec_visible {
            let (text_width, _) = text_size(scale, &self.font, &config.rec_text);
            let (x, y) = config.rec_pos;
            let pos = (x - text_width as i32, y);
            self.draw_label(&mut canvas, &config.rec_text, pos, config.rec_color, scale);
        }

        canvas
    }
}

struct CacheEntry {
    state: OverlayState,
    width: u32,
    height: u32,
    mask: Option<Arc<OverlayMask>>,
}

#[derive(Default)]
struct CacheInner {
    entry: Option<CacheEntry>,
    renders: u64,
}

/// Overlay render cache.
///
/// Empty until the first refresh, then holds the mask for the last state.
/// A state or surface size that differs from the cached one makes the entry
/// stale and the next refresh re-renders.
pub struct OverlayCache {
    renderer: Box<dyn OverlayRenderer>,
    inner: Mutex<CacheInner>,
}

impl OverlayCache {
    pub fn new(renderer: Box<dyn OverlayRenderer>) -> Self {
        Self {
            renderer,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `refresh` with these inputs would re-render
    pub fn is_stale(&self, state: &OverlayState, width: u32, height: u32) -> bool {
        match &self.lock().entry {
            Some(entry) => entry.state != *state || entry.width != width || entry.height != height,
            None => true,
        }
    }

    /// Mask for `state`, re-rendering only if it changed.
    ///
    /// `None` means the overlay is fully transparent and blending can be
    /// skipped.
    pub fn refresh(&self, state: &OverlayState, width: u32, height: u32) -> Option<Arc<OverlayMask>> {
        let mut inner = self.lock();
        if let Some(entry) = &inner.entry {
            if entry.state == *state && entry.width == width && entry.height == height {
                return entry.mask.clone();
            }
        }

        let image = self.renderer.render(state, width, height);
        let mask = OverlayMask::from_rgba(&image).map(Arc::new);
        inner.renders += 1;
        inner.entry = Some(CacheEntry {
            state: state.clone(),
            width,
            height,
            mask: mask.clone(),
        });
        mask
    }

    /// Number of renders so far
    pub fn render_count(&self) -> u64 {
        self.lock().renders
    }

    /// Drop the cached mask
    pub fn invalidate(&self) {
        self.lock().entry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Draws one opaque pixel per visible field, counting renders
    struct MockRenderer {
        calls: Arc<AtomicU64>,
    }

    impl OverlayRenderer for MockRenderer {
        fn render(&self, state: &OverlayState, width: u32, height: u32) -> RgbaImage {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut canvas = RgbaImage::new(width, height);
            if let Some(speed) = state.speed {
                canvas.put_pixel(2, 1, Rgba([speed as u8, 0, 0, 255]));
            }
            if state.rec_visible {
                canvas.put_pixel(5, 3, Rgba([255, 0, 0, 200]));
            }
            canvas
        }
    }

    fn mock_cache() -> (OverlayCache, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        let cache = OverlayCache::new(Box::new(MockRenderer {
            calls: calls.clone(),
        }));
        (cache, calls)
    }

    fn sample(unix_time: f64, speed_mph: Option<f64>) -> OverlaySample {
        OverlaySample {
            unix_time,
            speed_mph,
            ..Default::default()
        }
    }

    #[test]
    fn test_speed_quantization() {
        let config = OverlayConfig::default();
        assert_eq!(OverlayState::from_sample(&config, &sample(0.0, Some(61.4))).speed, Some(61));
        assert_eq!(OverlayState::from_sample(&config, &sample(0.0, Some(61.6))).speed, Some(61));
        assert_eq!(OverlayState::from_sample(&config, &sample(0.0, Some(61.99))).speed, Some(61));
        assert_eq!(OverlayState::from_sample(&config, &sample(0.0, Some(62.0))).speed, Some(62));

        let kph = OverlayConfig {
            speed_unit: SpeedUnit::Kph,
            ..Default::default()
        };
        assert_eq!(OverlayState::from_sample(&kph, &sample(0.0, Some(100.0))).speed, Some(160));

        let hidden = OverlayConfig {
            show_speed: false,
            ..Default::default()
        };
        assert_eq!(OverlayState::from_sample(&hidden, &sample(0.0, Some(50.0))).speed, None);
    }

    #[test]
    fn test_fuel_quantized_to_display_decimals() {
        let config = OverlayConfig {
            fuel_unit: FuelUnit::Liters,
            fuel_decimals: 1,
            ..Default::default()
        };
        let fuel = |liters| {
            let s = OverlaySample {
                fuel_liters: Some(liters),
                ..Default::default()
            };
            OverlayState::from_sample(&config, &s).fuel
        };
        assert_eq!(fuel(1.234), Some(12));
        assert_eq!(fuel(1.249), Some(12));
        assert_eq!(fuel(1.26), Some(13));

        let gallons = OverlayConfig::default();
        let s = OverlaySample {
            fuel_liters: Some(LITERS_PER_GALLON),
            ..Default::default()
        };
        assert_eq!(OverlayState::from_sample(&gallons, &s).fuel, Some(100));
    }

    #[test]
    fn test_rec_blink() {
        let config = OverlayConfig {
            rec_blink: true,
            rec_blink_rate: 1.0,
            ..Default::default()
        };
        let rec = |t| {
            let s = OverlaySample {
                unix_time: t,
                recording: true,
                ..Default::default()
            };
            OverlayState::from_sample(&config, &s).rec_visible
        };
        assert!(rec(10.2));
        assert!(!rec(11.2));
        assert!(rec(12.9));

        let solid = OverlayConfig::default();
        let s = OverlaySample {
            unix_time: 11.2,
            recording: true,
            ..Default::default()
        };
        assert!(OverlayState::from_sample(&solid, &s).rec_visible);
        assert!(!OverlayState::from_sample(&solid, &sample(11.2, None)).rec_visible);
    }

    #[test]
    fn test_can_text() {
        let config = OverlayConfig::default();
        let s = OverlaySample {
            can_status: Some(CanStatus::Idle),
            ..Default::default()
        };
        assert_eq!(OverlayState::from_sample(&config, &s).can_text, Some("CAN IDLE"));
    }

    #[test]
    fn test_cache_rerenders_once_on_speed_change() {
        let config = OverlayConfig::default();
        let (cache, calls) = mock_cache();

        let at_61 = OverlayState::from_sample(&config, &sample(1000.1, Some(61.0)));
        cache.refresh(&at_61, 16, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Same second, same inputs: no work.
        for i in 0..10 {
            let again = OverlayState::from_sample(&config, &sample(1000.2 + i as f64 * 0.05, Some(61.2)));
            assert!(!cache.is_stale(&again, 16, 8));
            cache.refresh(&again, 16, 8);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let at_62 = OverlayState::from_sample(&config, &sample(1000.8, Some(62.0)));
        assert!(cache.is_stale(&at_62, 16, 8));
        let mask = cache.refresh(&at_62, 16, 8).unwrap();
        cache.refresh(&at_62, 16, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.render_count(), 2);
        assert_eq!(mask.rgb, vec![62, 0, 0]);
    }

    #[test]
    fn test_cache_invalidation_triggers() {
        let config = OverlayConfig::default();
        let (cache, calls) = mock_cache();
        let base = OverlayState::from_sample(&config, &sample(50.0, None));
        cache.refresh(&base, 16, 8);

        // None -> value
        cache.refresh(&OverlayState::from_sample(&config, &sample(50.0, Some(0.0))), 16, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Next second
        cache.refresh(&OverlayState::from_sample(&config, &sample(51.0, Some(0.0))), 16, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Surface resize
        cache.refresh(&OverlayState::from_sample(&config, &sample(51.0, Some(0.0))), 32, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        cache.invalidate();
        cache.refresh(&OverlayState::from_sample(&config, &sample(51.0, Some(0.0))), 32, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_transparent_overlay_caches_null_mask() {
        let config = OverlayConfig::default();
        let (cache, calls) = mock_cache();
        let state = OverlayState::from_sample(&config, &sample(7.0, None));
        assert!(cache.refresh(&state, 16, 8).is_none());
        assert!(cache.refresh(&state, 16, 8).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mask_bounding_box() {
        let mut image = RgbaImage::new(10, 10);
        image.put_pixel(2, 3, Rgba([1, 2, 3, 255]));
        image.put_pixel(4, 6, Rgba([4, 5, 6, 100]));
        let mask = OverlayMask::from_rgba(&image).unwrap();
        assert_eq!((mask.x, mask.y, mask.width, mask.height), (2, 3, 3, 4));
        assert_eq!(mask.alpha.len(), 12);
        assert_eq!(mask.alpha[0], 255);
        assert_eq!(mask.alpha[11], 100);
        assert_eq!(&mask.rgb[33..36], &[4, 5, 6]);

        assert!(OverlayMask::from_rgba(&RgbaImage::new(4, 4)).is_none());
    }

    #[test]
    fn test_format_checks() {
        assert!(OverlayConfig::default().check_formats().is_ok());
        let bad = OverlayConfig {
            time_format: "%H:%Q".to_string(),
            ..Default::default()
        };
        assert!(bad.check_formats().is_err());
    }

    #[test]
    fn test_text_renderer_when_font_available() {
        let config = OverlayConfig::default();
        // Hosts without DejaVu fonts cannot exercise real glyph rendering.
        let Ok(renderer) = TextOverlayRenderer::load(&config) else {
            return;
        };

        let state = OverlayState {
            time_sec: 1_700_000_000,
            speed: Some(42),
            rec_visible: true,
            can_text: Some("CAN OK"),
            fuel: Some(125),
        };
        let image = renderer.render(&state, 1920, 1080);
        let mask = OverlayMask::from_rgba(&image).unwrap();
        assert!(mask.x <= config.time_pos.0 as u32);
        // REC is right-aligned on its anchor, plus padding.
        assert!(mask.x + mask.width <= (config.rec_pos.0 + TEXT_PADDING + 2) as u32);
    }

    #[test]
    fn test_missing_fonts_are_reported() {
        let config = OverlayConfig {
            font_paths: vec![PathBuf::from("/nonexistent/font.ttf")],
            ..Default::default()
        };
        assert!(matches!(
            TextOverlayRenderer::load(&config),
            Err(DisplayError::Unsupported(_))
        ));
    }
}
