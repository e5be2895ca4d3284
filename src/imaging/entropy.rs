//! Built-in entropy analyzer.
//!
//! The only detection capability that needs nothing beyond the `image`
//! crate: the picture is downsampled to grayscale, split into a square grid,
//! and the Shannon entropy of each cell's histogram is measured. Busy,
//! detailed regions score high; sky, walls and studio backdrops score low.
//!
//! Every cell within 10% of the busiest one becomes a candidate with
//! confidence `entropy / 8` (8 bits is the maximum for a 256-bin histogram).
//! Face, object and saliency are reported unavailable.

use super::rust_backend::load_image;
use crate::detect::{Candidate, Capabilities, Capability, DetectError, RegionAnalyzer};
use image::GrayImage;
use std::path::Path;

/// Longest edge of the analysis thumbnail.
const ANALYSIS_EDGE: u32 = 256;

/// Cells scoring at least this fraction of the maximum are candidates.
const KEEP_RATIO: f64 = 0.9;

pub struct EntropyAnalyzer {
    grid: u32,
}

impl EntropyAnalyzer {
    pub fn new(grid: u32) -> Self {
        Self {
            grid: grid.clamp(2, 32),
        }
    }
}

impl Default for EntropyAnalyzer {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Shannon entropy (bits) of the pixels in `[x0, x1) x [y0, y1)`.
fn region_entropy(gray: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> f64 {
    let mut histogram = [0u32; 256];
    let mut n = 0u32;
    for y in y0..y1 {
        for x in x0..x1 {
            histogram[gray.get_pixel(x, y).0[0] as usize] += 1;
            n += 1;
        }
    }
    if n == 0 {
        return 0.0;
    }
    histogram
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n as f64;
            -p * p.log2()
        })
        .sum()
}

/// Score every grid cell and return the busiest ones as candidates.
pub fn entropy_candidates(gray: &GrayImage, grid: u32) -> Vec<Candidate> {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return Vec::new();
    }
    let cols = grid.min(w).max(1);
    let rows = grid.min(h).max(1);

    let mut cells = Vec::with_capacity((cols * rows) as usize);
    for row in 0..rows {
        for col in 0..cols {
            let (x0, x1) = (col * w / cols, (col + 1) * w / cols);
            let (y0, y1) = (row * h / rows, (row + 1) * h / rows);
            let entropy = region_entropy(gray, x0, y0, x1, y1);
            cells.push(Candidate {
                x: x0 as f64 / w as f64,
                y: y0 as f64 / h as f64,
                width: (x1 - x0) as f64 / w as f64,
                height: (y1 - y0) as f64 / h as f64,
                confidence: entropy / 8.0,
            });
        }
    }

    let best = cells.iter().map(|c| c.confidence).fold(0.0, f64::max);
    if best <= 0.0 {
        return Vec::new();
    }
    cells.retain(|c| c.confidence >= best * KEEP_RATIO);
    cells
}

impl RegionAnalyzer for EntropyAnalyzer {
    fn capabilities(&self) -> Result<Capabilities, DetectError> {
        Ok(Capabilities {
            entropy: true,
            ..Capabilities::default()
        })
    }

    fn analyze(
        &self,
        image: &Path,
        capability: Capability,
        _objects: &[String],
    ) -> Result<Vec<Candidate>, DetectError> {
        if capability != Capability::Entropy {
            return Err(DetectError::Unavailable(capability));
        }
        let gray = load_image(image)?
            .thumbnail(ANALYSIS_EDGE, ANALYSIS_EDGE)
            .to_luma8();
        Ok(entropy_candidates(&gray, self.grid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::merge_candidates;
    use image::Luma;

    /// Flat gray everywhere except a noisy bottom-right quadrant.
    fn busy_corner(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if x >= size / 2 && y >= size / 2 {
                Luma([((x * 37 + y * 91 + x * y) % 256) as u8])
            } else {
                Luma([128])
            }
        })
    }

    #[test]
    fn flat_image_has_no_candidates() {
        let gray = GrayImage::from_pixel(64, 64, Luma([200]));
        assert!(entropy_candidates(&gray, 8).is_empty());
    }

    #[test]
    fn candidates_cluster_in_busy_quadrant() {
        let candidates = entropy_candidates(&busy_corner(64), 8);
        assert!(!candidates.is_empty());
        for c in &candidates {
            let (cx, cy) = c.center();
            assert!(cx > 0.5 && cy > 0.5, "{:?}", c);
            assert!(c.confidence > 0.0 && c.confidence <= 1.0);
        }
        let (focus, _) = merge_candidates(&candidates);
        assert!(focus.x > 0.5 && focus.y > 0.5);
    }

    #[test]
    fn grid_larger_than_image_is_capped() {
        let candidates = entropy_candidates(&busy_corner(4), 32);
        assert!(candidates.len() <= 16);
    }

    #[test]
    fn only_entropy_is_offered() {
        let analyzer = EntropyAnalyzer::default();
        let caps = analyzer.capabilities().unwrap();
        assert!(caps.entropy && !caps.face && !caps.object && !caps.saliency);
        assert!(matches!(
            analyzer.analyze(Path::new("/x.png"), Capability::Face, &[]),
            Err(DetectError::Unavailable(Capability::Face))
        ));
    }

    #[test]
    fn analyze_reads_real_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("busy.png");
        busy_corner(128).save(&path).unwrap();

        let analyzer = EntropyAnalyzer::new(4);
        let candidates = analyzer
            .analyze(&path, Capability::Entropy, &[])
            .unwrap();
        assert!(!candidates.is_empty());
    }
}
