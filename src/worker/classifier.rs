//! Degradation classifier
//!
//! Image-statistics heuristics scoring seven degradation kinds in [0, 1].
//! Every stage has a conservative fallback of 0.0 (no restoration pressure)
//! used when the stage cannot produce a value; fallbacks log a warning.
//! The output map always carries all seven kinds.

use image::DynamicImage;
use tracing::warn;

use crate::api::models::{DegradationKind, DegradationMap};

/// Analysis is run on a bounded thumbnail; statistics are scale-tolerant
/// and full-resolution scans buy nothing.
const ANALYSIS_SIDE: u32 = 512;

const FALLBACK_SCORE: f32 = 0.0;

struct Luma {
    data: Vec<f32>,
    width: usize,
    height: usize,
}

impl Luma {
    fn from(img: &DynamicImage) -> Self {
        let gray = img.to_luma8();
        Self {
            width: gray.width() as usize,
            height: gray.height() as usize,
            data: gray.into_raw().into_iter().map(f32::from).collect(),
        }
    }

    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    fn mean(&self) -> Option<f32> {
        if self.data.is_empty() {
            return None;
        }
        Some(self.data.iter().sum::<f32>() / self.data.len() as f32)
    }

    fn variance(&self) -> Option<f32> {
        let mean = self.mean()?;
        Some(self.data.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / self.data.len() as f32)
    }
}

/// Score all seven kinds. `source_is_jpeg` gates the compression heuristic.
pub fn classify(img: &DynamicImage, source_is_jpeg: bool) -> DegradationMap {
    let small = if img.width().max(img.height()) > ANALYSIS_SIDE {
        img.thumbnail(ANALYSIS_SIDE, ANALYSIS_SIDE)
    } else {
        img.clone()
    };
    let luma = Luma::from(&small);
    let rgb = small.to_rgb8();

    let mut map = DegradationMap::new();
    let mut put = |kind: DegradationKind, result: Option<f32>| {
        let score = match result {
            Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
            _ => {
                warn!(kind = ?kind, "Classifier stage failed, using fallback");
                FALLBACK_SCORE
            }
        };
        map.insert(kind, score);
    };

    put(DegradationKind::Blur, blur_score(&luma));
    put(DegradationKind::Noise, noise_score(&luma));
    put(DegradationKind::LowLight, low_light_score(&luma));
    put(
        DegradationKind::Compression,
        if source_is_jpeg { compression_score(&luma) } else { Some(0.0) },
    );
    put(DegradationKind::Scratch, scratch_score(&luma));
    put(DegradationKind::Fade, fade_score(&rgb, &luma));
    put(DegradationKind::ColorShift, color_shift_score(&rgb));

    map
}

/// Variance of the Laplacian response, inverted: sharp images have strong
/// second-derivative energy, so high variance means low blur.
fn blur_score(luma: &Luma) -> Option<f32> {
    if luma.width < 3 || luma.height < 3 {
        return None;
    }
    let mut responses = Vec::with_capacity((luma.width - 2) * (luma.height - 2));
    for y in 1..luma.height - 1 {
        for x in 1..luma.width - 1 {
            let lap = luma.at(x, y - 1) + luma.at(x, y + 1) + luma.at(x - 1, y)
                + luma.at(x + 1, y)
                - 4.0 * luma.at(x, y);
            responses.push(lap);
        }
    }
    let mean = responses.iter().sum::<f32>() / responses.len() as f32;
    let variance =
        responses.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / responses.len() as f32;
    Some(1.0 - (variance / 1000.0).min(1.0))
}

/// Standard deviation of a high-pass residual (pixel minus 3x3 mean)
fn noise_score(luma: &Luma) -> Option<f32> {
    if luma.width < 3 || luma.height < 3 {
        return None;
    }
    let mut sum_sq = 0.0f32;
    let mut count = 0usize;
    for y in 1..luma.height - 1 {
        for x in 1..luma.width - 1 {
            let mut neighborhood = 0.0f32;
            for dy in 0..3 {
                for dx in 0..3 {
                    neighborhood += luma.at(x + dx - 1, y + dy - 1);
                }
            }
            let residual = luma.at(x, y) - neighborhood / 9.0;
            sum_sq += residual * residual;
            count += 1;
        }
    }
    let std = (sum_sq / count as f32).sqrt();
    Some((std / 25.0).min(1.0))
}

/// Zero above mean luminance 0.3, linear ramp below
fn low_light_score(luma: &Luma) -> Option<f32> {
    let mean = luma.mean()? / 255.0;
    if mean >= 0.3 { Some(0.0) } else { Some((0.3 - mean) / 0.3) }
}

/// Blockiness proxy: share of variance a light 3x3 blur removes. JPEG
/// block edges are high-frequency energy that a light blur flattens.
fn compression_score(luma: &Luma) -> Option<f32> {
    if luma.width < 3 || luma.height < 3 {
        return None;
    }
    let variance = luma.variance()?;
    if variance <= f32::EPSILON {
        return Some(0.0);
    }

    let mut blurred = Luma {
        data: vec![0.0; luma.data.len()],
        width: luma.width,
        height: luma.height,
    };
    for y in 1..luma.height - 1 {
        for x in 1..luma.width - 1 {
            let mut acc = 0.0f32;
            for dy in 0..3 {
                for dx in 0..3 {
                    acc += luma.at(x + dx - 1, y + dy - 1);
                }
            }
            blurred.data[y * luma.width + x] = acc / 9.0;
        }
    }
    let blurred_variance = blurred.variance()?;
    let drop = ((variance - blurred_variance) / variance).max(0.0);
    Some((drop * 1.5).min(1.0))
}

/// Density of thin linear high-contrast pixels over a grid sample: strong
/// contrast across one axis, continuity along the other.
fn scratch_score(luma: &Luma) -> Option<f32> {
    if luma.width < 5 || luma.height < 5 {
        return None;
    }
    let mut hits = 0usize;
    let mut samples = 0usize;
    let step = 2;
    for y in (2..luma.height - 2).step_by(step) {
        for x in (2..luma.width - 2).step_by(step) {
            let c = luma.at(x, y);
            let horizontal_contrast =
                (c - luma.at(x - 2, y)).abs() > 50.0 && (c - luma.at(x + 2, y)).abs() > 50.0;
            let vertical_continuity =
                (c - luma.at(x, y - 2)).abs() < 25.0 && (c - luma.at(x, y + 2)).abs() < 25.0;
            let vertical_contrast =
                (c - luma.at(x, y - 2)).abs() > 50.0 && (c - luma.at(x, y + 2)).abs() > 50.0;
            let horizontal_continuity =
                (c - luma.at(x - 2, y)).abs() < 25.0 && (c - luma.at(x + 2, y)).abs() < 25.0;
            if (horizontal_contrast && vertical_continuity)
                || (vertical_contrast && horizontal_continuity)
            {
                hits += 1;
            }
            samples += 1;
        }
    }
    if samples == 0 {
        return None;
    }
    Some((hits as f32 / samples as f32 * 40.0).min(1.0))
}

/// Weighted mix of missing colorfulness (Hasler–Süsstrunk) and missing
/// contrast
fn fade_score(rgb: &image::RgbImage, luma: &Luma) -> Option<f32> {
    let pixels = rgb.pixels().len();
    if pixels == 0 {
        return None;
    }

    let mut rg = Vec::with_capacity(pixels);
    let mut yb = Vec::with_capacity(pixels);
    for p in rgb.pixels() {
        let (r, g, b) = (f32::from(p[0]), f32::from(p[1]), f32::from(p[2]));
        rg.push(r - g);
        yb.push((r + g) / 2.0 - b);
    }
    let stats = |values: &[f32]| {
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
        (mean, var.sqrt())
    };
    let (rg_mean, rg_std) = stats(&rg);
    let (yb_mean, yb_std) = stats(&yb);
    let colorfulness = (rg_std.powi(2) + yb_std.powi(2)).sqrt()
        + 0.3 * (rg_mean.powi(2) + yb_mean.powi(2)).sqrt();
    let colorfulness_norm = (colorfulness / 80.0).min(1.0);

    let contrast_norm = (luma.variance()?.sqrt() / 64.0).min(1.0);
    Some(0.6 * (1.0 - colorfulness_norm) + 0.4 * (1.0 - contrast_norm))
}

/// Max per-channel deviation of the mean from the cross-channel mean
fn color_shift_score(rgb: &image::RgbImage) -> Option<f32> {
    let pixels = rgb.pixels().len();
    if pixels == 0 {
        return None;
    }
    let mut sums = [0.0f32; 3];
    for p in rgb.pixels() {
        for c in 0..3 {
            sums[c] += f32::from(p[c]);
        }
    }
    let means = sums.map(|s| s / pixels as f32);
    let gray = (means[0] + means[1] + means[2]) / 3.0;
    let deviation = means.iter().map(|m| (m - gray).abs()).fold(0.0f32, f32::max);
    Some((deviation / 48.0).min(1.0))
}
