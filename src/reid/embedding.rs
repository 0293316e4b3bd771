//! Appearance embedding extraction.
//!
//! The reference extractor combines an HSV color histogram, a coarse
//! gradient-orientation histogram, per-third mean clothing colors and the
//! bbox aspect ratio, L2-normalized so cosine similarity reduces to a dot
//! product. Deterministic for a given patch.

use image::imageops::FilterType;
use image::RgbImage;

/// Patch size every crop is normalized to before feature extraction.
const PATCH_W: u32 = 64;
const PATCH_H: u32 = 128;

const HUE_BINS: usize = 16;
const SAT_BINS: usize = 16;
const VAL_BINS: usize = 16;
const GRAD_BINS: usize = 9;

/// Contract for embedding extractors. Implementations must be
/// deterministic and return unit-norm vectors of a fixed dimension.
pub trait EmbeddingExtractor: Send {
    fn embed(&self, patch: &RgbImage) -> Vec<f32>;
    fn dim(&self) -> usize;
}

/// Cosine similarity of two embeddings. Robust to non-normalized inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}

/// Histogram-based reference extractor.
pub struct HistogramEmbedder;

impl HistogramEmbedder {
    pub fn new() -> Self {
        Self
    }

    fn color_histograms(patch: &RgbImage) -> Vec<f32> {
        let mut hue = [0f32; HUE_BINS];
        let mut sat = [0f32; SAT_BINS];
        let mut val = [0f32; VAL_BINS];
        let pixels = (patch.width() * patch.height()).max(1) as f32;

        for p in patch.pixels() {
            let (h, s, v) = rgb_to_hsv(p[0], p[1], p[2]);
            hue[((h / 360.0 * HUE_BINS as f32) as usize).min(HUE_BINS - 1)] += 1.0;
            sat[((s * SAT_BINS as f32) as usize).min(SAT_BINS - 1)] += 1.0;
            val[((v * VAL_BINS as f32) as usize).min(VAL_BINS - 1)] += 1.0;
        }

        hue.iter()
            .chain(sat.iter())
            .chain(val.iter())
            .map(|c| c / pixels)
            .collect()
    }

    fn gradient_histogram(patch: &RgbImage) -> Vec<f32> {
        let (w, h) = (patch.width() as i32, patch.height() as i32);
        let luma = |x: i32, y: i32| -> f32 {
            let p = patch.get_pixel(x.clamp(0, w - 1) as u32, y.clamp(0, h - 1) as u32);
            0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
        };

        let mut bins = vec![0f32; GRAD_BINS];
        for y in 0..h {
            for x in 0..w {
                let gx = luma(x + 1, y) - luma(x - 1, y);
                let gy = luma(x, y + 1) - luma(x, y - 1);
                let mag = (gx * gx + gy * gy).sqrt();
                if mag == 0.0 {
                    continue;
                }
                let angle = gy.atan2(gx).to_degrees().rem_euclid(360.0);
                let bin = ((angle / 360.0 * GRAD_BINS as f32) as usize).min(GRAD_BINS - 1);
                bins[bin] += mag;
            }
        }
        let total: f32 = bins.iter().sum();
        if total > 0.0 {
            for b in bins.iter_mut() {
                *b /= total;
            }
        }
        bins
    }

    /// Mean RGB of the upper/middle/lower thirds, a crude clothing-region
    /// descriptor.
    fn third_means(patch: &RgbImage) -> Vec<f32> {
        let h = patch.height();
        let third = (h / 3).max(1);
        let mut out = Vec::with_capacity(9);

        for band in 0..3u32 {
            let y0 = band * third;
            let y1 = if band == 2 { h } else { (band + 1) * third };
            let mut sums = [0f64; 3];
            let mut n = 0f64;
            for y in y0..y1 {
                for x in 0..patch.width() {
                    let p = patch.get_pixel(x, y);
                    sums[0] += p[0] as f64;
                    sums[1] += p[1] as f64;
                    sums[2] += p[2] as f64;
                    n += 1.0;
                }
            }
            for s in sums {
                out.push(if n > 0.0 { (s / n / 255.0) as f32 } else { 0.0 });
            }
        }
        out
    }
}

impl Default for HistogramEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingExtractor for HistogramEmbedder {
    fn embed(&self, patch: &RgbImage) -> Vec<f32> {
        if patch.width() == 0 || patch.height() == 0 {
            return vec![0.0; self.dim()];
        }
        let aspect = patch.height() as f32 / patch.width().max(1) as f32;
        let patch = image::imageops::resize(patch, PATCH_W, PATCH_H, FilterType::Triangle);

        let mut features = Self::color_histograms(&patch);
        features.extend(Self::gradient_histogram(&patch));
        features.extend(Self::third_means(&patch));
        // Scaled so body build carries comparable weight to the histograms.
        features.push(aspect * 10.0);

        let norm: f32 = features.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for f in features.iter_mut() {
                *f /= norm;
            }
        }
        features
    }

    fn dim(&self) -> usize {
        HUE_BINS + SAT_BINS + VAL_BINS + GRAD_BINS + 9 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_patch(r: u8, g: u8, b: u8, w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, image::Rgb([r, g, b]))
    }

    #[test]
    fn embedding_is_unit_norm_and_deterministic() {
        let embedder = HistogramEmbedder::new();
        let patch = solid_patch(200, 30, 30, 40, 90);
        let a = embedder.embed(&patch);
        let b = embedder.embed(&patch);
        assert_eq!(a.len(), embedder.dim());
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn similar_patches_score_higher_than_different_ones() {
        let embedder = HistogramEmbedder::new();
        let red_a = embedder.embed(&solid_patch(210, 20, 20, 40, 90));
        let red_b = embedder.embed(&solid_patch(190, 35, 25, 42, 95));
        let blue = embedder.embed(&solid_patch(20, 30, 200, 40, 90));

        let same = cosine_similarity(&red_a, &red_b);
        let diff = cosine_similarity(&red_a, &blue);
        assert!(same > diff, "same={same} diff={diff}");
        assert!(same > 0.9);
    }

    #[test]
    fn empty_patch_yields_zero_vector() {
        let embedder = HistogramEmbedder::new();
        let patch = RgbImage::new(0, 0);
        let v = embedder.embed(&patch);
        assert!(v.iter().all(|&x| x == 0.0));
    }
}
