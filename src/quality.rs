use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::edges::canny;
use imageproc::filter::Kernel;

/// Score returned when a frame cannot be analyzed
pub const DEFAULT_QUALITY_SCORE: f64 = 50.0;

/// Canny thresholds for the edge-density term
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;

/// Frames smaller than this cannot be meaningfully analyzed
const MIN_ANALYZABLE_DIM: u32 = 16;

/// Compute the quality score of a decoded frame in [0, 100].
///
/// Combines a Laplacian-variance sharpness proxy, mean brightness, contrast
/// (grayscale standard deviation) and Canny edge density. Scoring is
/// diagnostic only; frames are never rejected because of a low score.
pub fn score_frame(pixels: &RgbImage) -> f64 {
    if pixels.width() < MIN_ANALYZABLE_DIM || pixels.height() < MIN_ANALYZABLE_DIM {
        return DEFAULT_QUALITY_SCORE;
    }

    let gray = imageops::grayscale(pixels);

    let (mean, stdev) = luma_stats(&gray);
    let lap_var = laplacian_variance(&gray);
    let edge_density = edge_density(&gray);

    let sharpness_score = (lap_var / 10.0).min(100.0);
    let brightness_score = (mean / 2.55).clamp(0.0, 100.0);
    let contrast_score = (stdev / 2.55).clamp(0.0, 100.0);
    let edge_score = (edge_density * 1000.0).min(100.0);

    sharpness_score * 0.4 + brightness_score * 0.2 + contrast_score * 0.2 + edge_score * 0.2
}

/// Mean and standard deviation of a grayscale image
pub fn luma_stats(gray: &GrayImage) -> (f64, f64) {
    let count = (gray.width() * gray.height()) as f64;
    if count == 0.0 {
        return (0.0, 0.0);
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for p in gray.pixels() {
        let v = p.0[0] as f64;
        sum += v;
        sum_sq += v * v;
    }

    let mean = sum / count;
    let variance = (sum_sq / count - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

/// Mean and variance across all RGB channels, used by the recorder's frame
/// validation (near-black / near-white / near-uniform rejection).
pub fn rgb_stats(pixels: &RgbImage) -> (f64, f64) {
    let raw = pixels.as_raw();
    if raw.is_empty() {
        return (0.0, 0.0);
    }

    let count = raw.len() as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for &v in raw {
        let v = v as f64;
        sum += v;
        sum_sq += v * v;
    }

    let mean = sum / count;
    let variance = (sum_sq / count - mean * mean).max(0.0);
    (mean, variance)
}

/// Variance of the discrete Laplacian, the classic focus/sharpness proxy
fn laplacian_variance(gray: &GrayImage) -> f64 {
    let kernel = Kernel::new(&[0i32, 1, 0, 1, -4, 1, 0, 1, 0], 3, 3);
    let lap = kernel.filter(gray, |channel: &mut i32, acc: i32| *channel = acc);
    let lap: image::ImageBuffer<Luma<i32>, Vec<i32>> = lap;
    let count = (lap.width() * lap.height()) as f64;
    if count == 0.0 {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for p in lap.pixels() {
        let v = p.0[0] as f64;
        sum += v;
        sum_sq += v * v;
    }

    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}

/// Fraction of pixels flagged by the Canny detector
fn edge_density(gray: &GrayImage) -> f64 {
    let edges = canny(gray, CANNY_LOW, CANNY_HIGH);
    let total = (edges.width() * edges.height()) as f64;
    if total == 0.0 {
        return 0.0;
    }

    let flagged = edges.pixels().filter(|p| p.0[0] > 0).count() as f64;
    flagged / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn uniform_frame(value: u8) -> RgbImage {
        RgbImage::from_pixel(64, 64, Rgb([value, value, value]))
    }

    /// Frame with a sharp vertical edge down the middle
    fn edge_frame() -> RgbImage {
        RgbImage::from_fn(64, 64, |x, _| {
            if x < 32 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        })
    }

    #[test]
    fn test_score_is_in_range() {
        for frame in [uniform_frame(0), uniform_frame(128), edge_frame()] {
            let score = score_frame(&frame);
            assert!(
                (0.0..=100.0).contains(&score),
                "score {} out of range",
                score
            );
        }
    }

    #[test]
    fn test_tiny_frame_returns_default() {
        let tiny = RgbImage::from_pixel(4, 4, Rgb([10, 10, 10]));
        assert_eq!(score_frame(&tiny), DEFAULT_QUALITY_SCORE);
    }

    #[test]
    fn test_edge_frame_outscores_flat_frame() {
        // A frame with structure has sharpness, contrast and edges;
        // a flat frame has only brightness.
        let structured = score_frame(&edge_frame());
        let flat = score_frame(&uniform_frame(128));
        assert!(structured > flat);
    }

    #[test]
    fn test_luma_stats() {
        let gray = image::imageops::grayscale(&uniform_frame(100));
        let (mean, stdev) = luma_stats(&gray);
        assert!((mean - 100.0).abs() < 1.0);
        assert!(stdev < 1.0);
    }

    #[test]
    fn test_rgb_stats_uniform_has_no_variance() {
        let (mean, variance) = rgb_stats(&uniform_frame(42));
        assert!((mean - 42.0).abs() < 1e-9);
        assert!(variance < 1e-9);
    }

    #[test]
    fn test_rgb_stats_structured_has_variance() {
        let (_, variance) = rgb_stats(&edge_frame());
        assert!(variance > 1000.0);
    }
}
