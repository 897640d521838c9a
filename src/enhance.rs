use image::{imageops, GrayImage, Rgb, RgbImage};
use imageproc::contrast::equalize_histogram;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::quality::luma_stats;

/// Enhancement mode selected by the operator or the lighting classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhanceMode {
    Auto,
    Day,
    LowLight,
    Night,
    Security,
}

impl EnhanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnhanceMode::Auto => "auto",
            EnhanceMode::Day => "day",
            EnhanceMode::LowLight => "low_light",
            EnhanceMode::Night => "night",
            EnhanceMode::Security => "security",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(EnhanceMode::Auto),
            "day" => Some(EnhanceMode::Day),
            "low_light" => Some(EnhanceMode::LowLight),
            "night" => Some(EnhanceMode::Night),
            "security" => Some(EnhanceMode::Security),
            _ => None,
        }
    }
}

/// Runtime-adjustable enhancer settings (exposed via the control API)
#[derive(Debug, Clone)]
pub struct EnhancerSettings {
    pub mode: EnhanceMode,
    pub enabled: bool,
    pub budget: Duration,
}

/// Result metadata returned with every enhanced frame
#[derive(Debug, Clone)]
pub struct EnhanceReport {
    /// The mode actually applied (auto is resolved by the classifier)
    pub mode: EnhanceMode,
    pub processing_time: Duration,
    /// Contrast-based improvement estimate in [0, 1]
    pub quality_improvement: f64,
    /// True when the per-frame budget cut the filter chain short
    pub budget_exhausted: bool,
}

impl EnhanceReport {
    fn passthrough(mode: EnhanceMode, started: Instant) -> Self {
        Self {
            mode,
            processing_time: started.elapsed(),
            quality_improvement: 0.0,
            budget_exhausted: false,
        }
    }
}

/// Pluggable image filter chain. The lighting classifier lives inside the
/// enhancer; callers only choose a mode (usually `Auto`).
///
/// Contract: never blocks past the per-frame budget (remaining filters are
/// skipped once it is spent), and any internal failure returns the
/// original frame with a zero-improvement report.
pub trait FrameEnhancer: Send + Sync {
    fn enhance(&self, frame: &RgbImage, mode: EnhanceMode) -> (RgbImage, EnhanceReport);
}

/// Default enhancer: histogram-based luminance correction plus mode-specific
/// brightness/gamma/sharpen/denoise chains.
pub struct AdaptiveEnhancer {
    budget: Duration,
}

/// Frames smaller than this pass through untouched
const MIN_ENHANCEABLE_DIM: u32 = 16;

impl AdaptiveEnhancer {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    /// Classify lighting from mean luminance, variance and histogram
    /// dark-vs-bright dominance.
    pub fn classify(&self, frame: &RgbImage) -> EnhanceMode {
        let gray = imageops::grayscale(frame);
        let (mean, stdev) = luma_stats(&gray);

        let total = (gray.width() * gray.height()).max(1) as f64;
        let mut dark = 0u32;
        let mut bright = 0u32;
        for p in gray.pixels() {
            let v = p.0[0];
            if v < 64 {
                dark += 1;
            } else if v > 192 {
                bright += 1;
            }
        }
        let dark_fraction = dark as f64 / total;
        let bright_fraction = bright as f64 / total;

        if mean < 60.0 || dark_fraction > 0.6 {
            EnhanceMode::Night
        } else if mean < 100.0 {
            EnhanceMode::LowLight
        } else if stdev < 20.0 && bright_fraction < 0.5 {
            // Flat, washed-out scene: favor the detail-recovery chain
            EnhanceMode::Security
        } else {
            EnhanceMode::Day
        }
    }
}

impl FrameEnhancer for AdaptiveEnhancer {
    fn enhance(&self, frame: &RgbImage, mode: EnhanceMode) -> (RgbImage, EnhanceReport) {
        let started = Instant::now();

        if frame.width() < MIN_ENHANCEABLE_DIM || frame.height() < MIN_ENHANCEABLE_DIM {
            return (frame.clone(), EnhanceReport::passthrough(mode, started));
        }

        let resolved = match mode {
            EnhanceMode::Auto => self.classify(frame),
            explicit => explicit,
        };

        let before_contrast = luma_stats(&imageops::grayscale(frame)).1;

        let mut chain = FilterChain::new(frame.clone(), started, self.budget);
        match resolved {
            EnhanceMode::Night => {
                chain
                    .apply(|f| luminance_equalize(f, 1.0))
                    .apply(|f| brighten(f, 25))
                    .apply(|f| gamma(f, 0.8))
                    .apply(|f| denoise(f, 1.2))
                    .apply(|f| unsharp(f, 1.0, 0.6))
                    .apply(|f| contrast_scale(f, 1.5, 0));
            }
            EnhanceMode::LowLight => {
                chain
                    .apply(|f| luminance_equalize(f, 0.6))
                    .apply(|f| brighten(f, 15))
                    .apply(|f| denoise(f, 0.8))
                    .apply(|f| unsharp(f, 1.0, 0.3));
            }
            EnhanceMode::Day => {
                chain
                    .apply(|f| luminance_equalize(f, 0.4))
                    .apply(|f| unsharp(f, 1.5, 0.4))
                    .apply(|f| contrast_scale(f, 1.05, 0));
            }
            EnhanceMode::Security => {
                chain
                    .apply(|f| luminance_equalize(f, 0.8))
                    .apply(|f| unsharp(f, 2.0, 0.8))
                    .apply(|f| unsharp(f, 1.0, 0.4))
                    .apply(|f| denoise(f, 0.8))
                    .apply(|f| contrast_scale(f, 1.1, 5));
            }
            EnhanceMode::Auto => unreachable!("auto resolved above"),
        }

        let (enhanced, budget_exhausted) = chain.finish();

        let after_contrast = luma_stats(&imageops::grayscale(&enhanced)).1;
        let improvement = ((after_contrast - before_contrast) / 128.0).clamp(0.0, 1.0);

        let report = EnhanceReport {
            mode: resolved,
            processing_time: started.elapsed(),
            quality_improvement: improvement,
            budget_exhausted,
        };
        (enhanced, report)
    }
}

/// Budget-aware filter sequencing: each step runs only while time remains.
struct FilterChain {
    frame: RgbImage,
    started: Instant,
    budget: Duration,
    exhausted: bool,
}

impl FilterChain {
    fn new(frame: RgbImage, started: Instant, budget: Duration) -> Self {
        Self {
            frame,
            started,
            budget,
            exhausted: false,
        }
    }

    fn apply<F: FnOnce(&RgbImage) -> RgbImage>(&mut self, filter: F) -> &mut Self {
        if self.exhausted {
            return self;
        }
        if self.started.elapsed() >= self.budget {
            self.exhausted = true;
            return self;
        }
        self.frame = filter(&self.frame);
        self
    }

    fn finish(self) -> (RgbImage, bool) {
        (self.frame, self.exhausted)
    }
}

/// Equalize the luminance histogram and re-apply the per-pixel gain to all
/// channels, blended with the original at the given strength.
fn luminance_equalize(frame: &RgbImage, strength: f32) -> RgbImage {
    let gray: GrayImage = imageops::grayscale(frame);
    let equalized = equalize_histogram(&gray);

    let mut out = frame.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let orig_luma = gray.get_pixel(x, y).0[0] as f32;
        if orig_luma < 1.0 {
            continue;
        }
        let eq_luma = equalized.get_pixel(x, y).0[0] as f32;
        let gain = 1.0 + (eq_luma / orig_luma - 1.0) * strength;
        for c in 0..3 {
            let v = pixel.0[c] as f32 * gain;
            pixel.0[c] = v.clamp(0.0, 255.0) as u8;
        }
    }
    out
}

fn brighten(frame: &RgbImage, delta: i32) -> RgbImage {
    imageops::colorops::brighten(frame, delta)
}

/// Power-law tone mapping via lookup table; g < 1 lifts shadows
fn gamma(frame: &RgbImage, g: f32) -> RgbImage {
    let mut lut = [0u8; 256];
    for (i, slot) in lut.iter_mut().enumerate() {
        *slot = ((i as f32 / 255.0).powf(g) * 255.0).clamp(0.0, 255.0) as u8;
    }

    let mut out = frame.clone();
    for pixel in out.pixels_mut() {
        for c in 0..3 {
            pixel.0[c] = lut[pixel.0[c] as usize];
        }
    }
    out
}

/// Light denoise: blend towards a Gaussian blur, keeping most detail
fn denoise(frame: &RgbImage, sigma: f32) -> RgbImage {
    let blurred = imageops::blur(frame, sigma);
    let mut out = frame.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let b = blurred.get_pixel(x, y);
        for c in 0..3 {
            let v = pixel.0[c] as f32 * 0.6 + b.0[c] as f32 * 0.4;
            pixel.0[c] = v.clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Unsharp mask: original + amount × (original − blurred)
fn unsharp(frame: &RgbImage, sigma: f32, amount: f32) -> RgbImage {
    let blurred = imageops::blur(frame, sigma);
    let mut out = frame.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let b = blurred.get_pixel(x, y);
        for c in 0..3 {
            let orig = pixel.0[c] as f32;
            let v = orig + amount * (orig - b.0[c] as f32);
            pixel.0[c] = v.clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Linear contrast: v·alpha + beta per channel, clamped
fn contrast_scale(frame: &RgbImage, alpha: f32, beta: i32) -> RgbImage {
    let mut out = frame.clone();
    for pixel in out.pixels_mut() {
        for c in 0..3 {
            let v = pixel.0[c] as f32 * alpha + beta as f32;
            pixel.0[c] = v.clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_mean(value: u8) -> RgbImage {
        RgbImage::from_pixel(64, 64, Rgb([value, value, value]))
    }

    fn textured_dark_frame() -> RgbImage {
        RgbImage::from_fn(64, 64, |x, y| {
            let v = ((x * 3 + y * 2) % 40) as u8;
            Rgb([v, v, v])
        })
    }

    fn enhancer() -> AdaptiveEnhancer {
        AdaptiveEnhancer::new(Duration::from_millis(50))
    }

    #[test]
    fn test_mode_parsing_round_trip() {
        for mode in [
            EnhanceMode::Auto,
            EnhanceMode::Day,
            EnhanceMode::LowLight,
            EnhanceMode::Night,
            EnhanceMode::Security,
        ] {
            assert_eq!(EnhanceMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(EnhanceMode::parse("hdr"), None);
    }

    #[test]
    fn test_classifier_picks_night_for_dark_frames() {
        let e = enhancer();
        assert_eq!(e.classify(&textured_dark_frame()), EnhanceMode::Night);
    }

    #[test]
    fn test_classifier_picks_low_light_for_dim_frames() {
        let e = enhancer();
        assert_eq!(e.classify(&frame_with_mean(80)), EnhanceMode::LowLight);
    }

    #[test]
    fn test_classifier_flat_bright_frame_is_security() {
        let e = enhancer();
        // Uniform mid-bright frame has no contrast: detail-recovery chain
        assert_eq!(e.classify(&frame_with_mean(150)), EnhanceMode::Security);
    }

    #[test]
    fn test_night_mode_brightens_dark_frames() {
        let e = enhancer();
        let dark = textured_dark_frame();
        let (enhanced, report) = e.enhance(&dark, EnhanceMode::Night);

        let before = crate::quality::rgb_stats(&dark).0;
        let after = crate::quality::rgb_stats(&enhanced).0;
        assert!(after > before, "night mode must lift brightness");
        assert_eq!(report.mode, EnhanceMode::Night);
        assert!(report.processing_time < Duration::from_secs(1));
    }

    #[test]
    fn test_auto_resolves_to_concrete_mode() {
        let e = enhancer();
        let (_, report) = e.enhance(&textured_dark_frame(), EnhanceMode::Auto);
        assert_ne!(report.mode, EnhanceMode::Auto);
    }

    #[test]
    fn test_tiny_frame_passes_through() {
        let e = enhancer();
        let tiny = RgbImage::from_pixel(4, 4, Rgb([10, 10, 10]));
        let (out, report) = e.enhance(&tiny, EnhanceMode::Night);
        assert_eq!(out.as_raw(), tiny.as_raw());
        assert_eq!(report.quality_improvement, 0.0);
    }

    #[test]
    fn test_zero_budget_skips_filters() {
        let e = AdaptiveEnhancer::new(Duration::ZERO);
        let frame = textured_dark_frame();
        let (out, report) = e.enhance(&frame, EnhanceMode::Night);
        assert!(report.budget_exhausted);
        // Nothing ran, so pixels are untouched
        assert_eq!(out.as_raw(), frame.as_raw());
    }

    #[test]
    fn test_improvement_is_bounded() {
        let e = enhancer();
        for mode in [EnhanceMode::Day, EnhanceMode::Night, EnhanceMode::Security] {
            let (_, report) = e.enhance(&textured_dark_frame(), mode);
            assert!((0.0..=1.0).contains(&report.quality_improvement));
        }
    }

    #[test]
    fn test_gamma_lifts_shadows() {
        let frame = frame_with_mean(64);
        let lifted = gamma(&frame, 0.8);
        assert!(lifted.get_pixel(0, 0).0[0] > 64);
    }

    #[test]
    fn test_contrast_scale_applies_bias() {
        let frame = frame_with_mean(100);
        let adjusted = contrast_scale(&frame, 1.1, 5);
        assert_eq!(adjusted.get_pixel(0, 0).0[0], 115);
    }
}
