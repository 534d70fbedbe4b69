use std::fmt;

use ndarray::{Array1, Array2};

use crate::error::VisionError;
use crate::feature::Feature;

/// Calibration constant for embedding distances.
pub const DEFAULT_NORMALIZATION: f32 = 2.5;
/// Side of the SSIM sliding window.
pub const SSIM_WINDOW: usize = 7;

/// Similarity in [0, 1]; 0 is "nothing in common or not comparable", 1 is identical.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct SimilarityScore(f32);

impl SimilarityScore {
    pub const ZERO: SimilarityScore = SimilarityScore(0.0);

    /// Clamp a raw value into [0, 1]. NaN and infinities become 0.
    pub fn clamped(raw: f32) -> Self {
        if raw.is_finite() {
            Self(raw.clamp(0.0, 1.0))
        } else {
            Self::ZERO
        }
    }

    pub fn value(&self) -> f32 {
        self.0
    }
}

impl fmt::Display for SimilarityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Turns two features into one score. Absent features score zero.
pub trait SimilarityScorer: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, a: Option<&Feature>, b: Option<&Feature>)
        -> Result<SimilarityScore, VisionError>;
}

/// Divisor that maps an L2 distance onto [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DistanceNormalization {
    Constant(f32),
    /// Square root of the embedding length.
    SqrtDimension,
}

impl Default for DistanceNormalization {
    fn default() -> Self {
        DistanceNormalization::Constant(DEFAULT_NORMALIZATION)
    }
}

impl DistanceNormalization {
    fn divisor(&self, len: usize) -> f32 {
        match self {
            DistanceNormalization::Constant(c) => *c,
            DistanceNormalization::SqrtDimension => (len as f32).sqrt(),
        }
    }
}

/// `1 - ||a - b|| / normalization` over embeddings.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanScorer {
    normalization: DistanceNormalization,
}

impl EuclideanScorer {
    pub fn new(normalization: DistanceNormalization) -> Self {
        Self { normalization }
    }

    pub fn similarity(&self, a: &Array1<f32>, b: &Array1<f32>) -> f32 {
        let distance = l2_distance(a, b);
        1.0 - distance / self.normalization.divisor(a.len())
    }
}

pub fn l2_distance(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

impl SimilarityScorer for EuclideanScorer {
    fn name(&self) -> &'static str {
        "euclidean"
    }

    fn score(
        &self,
        a: Option<&Feature>,
        b: Option<&Feature>,
    ) -> Result<SimilarityScore, VisionError> {
        let (Some(a), Some(b)) = (a, b) else {
            return Ok(SimilarityScore::ZERO);
        };
        match (a, b) {
            (Feature::Embedding(ea), Feature::Embedding(eb)) if ea.len() == eb.len() => {
                Ok(SimilarityScore::clamped(self.similarity(ea, eb)))
            }
            _ => Err(shape_error(a, b)),
        }
    }
}

/// Mean structural similarity over all fully contained 7x7 windows,
/// with sample covariance, K1 = 0.01, K2 = 0.03 and an 8-bit data range.
#[derive(Debug, Clone, Copy)]
pub struct StructuralScorer {
    window: usize,
    data_range: f64,
    k1: f64,
    k2: f64,
}

impl Default for StructuralScorer {
    fn default() -> Self {
        Self {
            window: SSIM_WINDOW,
            data_range: 255.0,
            k1: 0.01,
            k2: 0.03,
        }
    }
}

impl StructuralScorer {
    pub fn window(&self) -> usize {
        self.window
    }

    /// Raw SSIM, roughly in [-1, 1]. Both patches must share a shape at
    /// least as large as the window.
    pub fn ssim(&self, x: &Array2<f32>, y: &Array2<f32>) -> f64 {
        let (rows, cols) = x.dim();
        let win = self.window;
        let n = (win * win) as f64;
        let cov_norm = n / (n - 1.0);
        let c1 = (self.k1 * self.data_range).powi(2);
        let c2 = (self.k2 * self.data_range).powi(2);

        let sx = SummedArea::new(x, |v| v);
        let sy = SummedArea::new(y, |v| v);
        let sxx = SummedArea::new(x, |v| v * v);
        let syy = SummedArea::new(y, |v| v * v);
        let sxy = SummedArea::product(x, y);

        let mut total = 0.0;
        let mut count = 0usize;
        for r in 0..=(rows - win) {
            for c in 0..=(cols - win) {
                let ux = sx.window(r, c, win) / n;
                let uy = sy.window(r, c, win) / n;
                let vx = cov_norm * (sxx.window(r, c, win) / n - ux * ux);
                let vy = cov_norm * (syy.window(r, c, win) / n - uy * uy);
                let vxy = cov_norm * (sxy.window(r, c, win) / n - ux * uy);

                let num = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
                let den = (ux * ux + uy * uy + c1) * (vx + vy + c2);
                total += num / den;
                count += 1;
            }
        }
        total / count as f64
    }
}

impl SimilarityScorer for StructuralScorer {
    fn name(&self) -> &'static str {
        "ssim"
    }

    fn score(
        &self,
        a: Option<&Feature>,
        b: Option<&Feature>,
    ) -> Result<SimilarityScore, VisionError> {
        let (Some(a), Some(b)) = (a, b) else {
            return Ok(SimilarityScore::ZERO);
        };
        match (a, b) {
            (Feature::Patch(pa), Feature::Patch(pb))
                if pa.dim() == pb.dim()
                    && pa.nrows() >= self.window
                    && pa.ncols() >= self.window =>
            {
                Ok(SimilarityScore::clamped(self.ssim(pa, pb) as f32))
            }
            _ => Err(shape_error(a, b)),
        }
    }
}

fn shape_error(a: &Feature, b: &Feature) -> VisionError {
    VisionError::InvalidFeatureShape {
        left: a.shape(),
        right: b.shape(),
    }
}

/// Summed-area table with a zero border row and column.
struct SummedArea {
    cols: usize,
    table: Vec<f64>,
}

impl SummedArea {
    fn new(src: &Array2<f32>, f: impl Fn(f64) -> f64) -> Self {
        Self::build(src.nrows(), src.ncols(), |r, c| f(src[[r, c]] as f64))
    }

    fn product(x: &Array2<f32>, y: &Array2<f32>) -> Self {
        Self::build(x.nrows(), x.ncols(), |r, c| {
            x[[r, c]] as f64 * y[[r, c]] as f64
        })
    }

    fn build(rows: usize, cols: usize, value: impl Fn(usize, usize) -> f64) -> Self {
        let stride = cols + 1;
        let mut table = vec![0.0; (rows + 1) * stride];
        for r in 0..rows {
            let mut row_sum = 0.0;
            for c in 0..cols {
                row_sum += value(r, c);
                table[(r + 1) * stride + c + 1] = table[r * stride + c + 1] + row_sum;
            }
        }
        Self { cols: stride, table }
    }

    /// Sum over the `win` x `win` block whose top-left corner is (r, c).
    fn window(&self, r: usize, c: usize, win: usize) -> f64 {
        let at = |row: usize, col: usize| self.table[row * self.cols + col];
        at(r + win, c + win) - at(r, c + win) - at(r + win, c) + at(r, c)
    }
}
