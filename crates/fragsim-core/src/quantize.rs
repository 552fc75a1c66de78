//! Fixed-point encoding of similarity scores
//!
//! Scores in `[0, 1]` are stored as `u16` values `round(score * precision)`.
//! Decoding rounds *up* to the largest power of ten not above `precision`:
//!
//! ```text
//! precision10 = 10^floor(log10(precision))
//! score      ≈ ceil(precision10 * stored / precision) / precision10
//! ```
//!
//! With the default precision of 65535 scores decode to four decimals. The
//! rounding rule is part of the on-disk contract: both store formats persist
//! `precision` in their header and decode through this type.

use std::collections::BTreeMap;

/// Default quantization constant (full u16 range)
pub const DEFAULT_PRECISION: u16 = u16::MAX;

/// Quantization constant plus its derived decimal resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precision {
    precision: u16,
    precision10: u32,
}

impl Precision {
    /// Returns `None` for a zero precision
    pub fn new(precision: u16) -> Option<Self> {
        if precision == 0 {
            return None;
        }
        let mut precision10 = 1u32;
        while precision10 * 10 <= precision as u32 {
            precision10 *= 10;
        }
        Some(Self {
            precision,
            precision10,
        })
    }

    #[inline]
    pub fn value(&self) -> u16 {
        self.precision
    }

    /// Largest power of ten not above the precision
    #[inline]
    pub fn precision10(&self) -> u32 {
        self.precision10
    }

    /// Encode a score; out-of-range scores clamp to `[0, precision]`
    #[inline]
    pub fn quantize(&self, score: f64) -> u16 {
        let scaled = (score * self.precision as f64).round();
        if scaled.is_nan() || scaled <= 0.0 {
            0
        } else if scaled >= self.precision as f64 {
            self.precision
        } else {
            scaled as u16
        }
    }

    /// Decode a stored value
    #[inline]
    pub fn dequantize(&self, raw: u16) -> f64 {
        let p10 = self.precision10 as f64;
        (p10 * raw as f64 / self.precision as f64).ceil() / p10
    }

    /// Smallest raw value whose decoded score reaches `cutoff`
    ///
    /// Lets scans compare integers instead of decoding every cell.
    pub fn raw_cutoff(&self, cutoff: f64) -> u32 {
        if cutoff <= 0.0 {
            return 0;
        }
        // Start near the answer then correct for the ceil rounding.
        let mut raw = ((cutoff * self.precision as f64).floor().max(0.0) as u32).min(self.precision as u32);
        while raw > 0 && self.dequantize((raw - 1) as u16) >= cutoff {
            raw -= 1;
        }
        while raw <= self.precision as u32 && self.dequantize(raw as u16) < cutoff {
            raw += 1;
        }
        raw
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            precision10: 10_000,
        }
    }
}

/// Which axis a score histogram is reported on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreAxis {
    /// Stored integer values
    Raw,
    /// Decoded fractions; raw values decoding to the same fraction share a bin
    #[default]
    Fraction,
}

/// Occurrence counts of nonzero stored scores
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreHistogram {
    precision: Precision,
    counts: BTreeMap<u16, u64>,
}

impl ScoreHistogram {
    pub fn new(precision: Precision) -> Self {
        Self {
            precision,
            counts: BTreeMap::new(),
        }
    }

    /// Count `n` occurrences of `raw`; zero scores are not similarities and are ignored
    pub fn add(&mut self, raw: u16, n: u64) {
        if raw != 0 && n != 0 {
            *self.counts.entry(raw).or_insert(0) += n;
        }
    }

    pub fn merge(&mut self, other: &ScoreHistogram) {
        for (&raw, &n) in &other.counts {
            self.add(raw, n);
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn raw_counts(&self) -> impl Iterator<Item = (u16, u64)> + '_ {
        self.counts.iter().map(|(&raw, &n)| (raw, n))
    }

    /// Ascending `(score, count)` bins on the requested axis
    pub fn bins(&self, axis: ScoreAxis) -> Vec<(f64, u64)> {
        match axis {
            ScoreAxis::Raw => self.counts.iter().map(|(&raw, &n)| (raw as f64, n)).collect(),
            ScoreAxis::Fraction => {
                let mut bins: Vec<(f64, u64)> = Vec::new();
                // dequantize is monotone, so equal fractions are adjacent
                for (&raw, &n) in &self.counts {
                    let score = self.precision.dequantize(raw);
                    match bins.last_mut() {
                        Some((last, count)) if *last == score => *count += n,
                        _ => bins.push((score, n)),
                    }
                }
                bins
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision10() {
        assert_eq!(Precision::new(65535).unwrap().precision10(), 10_000);
        assert_eq!(Precision::new(100).unwrap().precision10(), 100);
        assert_eq!(Precision::new(99).unwrap().precision10(), 10);
        assert_eq!(Precision::new(1).unwrap().precision10(), 1);
        assert!(Precision::new(0).is_none());
        assert_eq!(Precision::default(), Precision::new(DEFAULT_PRECISION).unwrap());
    }

    #[test]
    fn test_quantize_clamps() {
        let p = Precision::default();
        assert_eq!(p.quantize(0.0), 0);
        assert_eq!(p.quantize(1.0), 65535);
        assert_eq!(p.quantize(1.5), 65535);
        assert_eq!(p.quantize(-0.2), 0);
        assert_eq!(p.quantize(f64::NAN), 0);
    }

    #[test]
    fn test_dequantize_rounds_up_to_decimal() {
        let p = Precision::default();
        assert_eq!(p.dequantize(p.quantize(0.6)), 0.6);
        // 0.7 * 65535 lands on .5 and rounds away from zero, then decodes upward
        assert_eq!(p.quantize(0.7), 45875);
        assert_eq!(p.dequantize(45875), 0.7001);
        assert_eq!(p.dequantize(45874), 0.7);
        assert_eq!(p.dequantize(0), 0.0);
        assert_eq!(p.dequantize(65535), 1.0);
    }

    #[test]
    fn test_small_precision_exact() {
        let p = Precision::new(100).unwrap();
        assert_eq!(p.quantize(0.75), 75);
        assert_eq!(p.dequantize(75), 0.75);
    }

    #[test]
    fn test_raw_cutoff_matches_dequantize() {
        for precision in [2u16, 7, 100, 1000, 65535] {
            let p = Precision::new(precision).unwrap();
            for cutoff in [0.0, 0.1, 0.45, 0.55, 0.6, 0.9, 0.99, 1.0] {
                let raw = p.raw_cutoff(cutoff);
                if raw <= precision as u32 {
                    assert!(p.dequantize(raw as u16) >= cutoff);
                }
                if raw > 0 {
                    assert!(p.dequantize((raw - 1) as u16) < cutoff);
                }
            }
        }
    }

    #[test]
    fn test_histogram_bins() {
        let p = Precision::new(1000).unwrap();
        let mut hist = ScoreHistogram::new(p);
        hist.add(0, 5);
        hist.add(500, 2);
        hist.add(900, 1);
        hist.add(500, 1);
        assert_eq!(hist.total(), 4);
        assert_eq!(hist.bins(ScoreAxis::Raw), vec![(500.0, 3), (900.0, 1)]);
        assert_eq!(hist.bins(ScoreAxis::Fraction), vec![(0.5, 3), (0.9, 1)]);
    }

    #[test]
    fn test_histogram_fraction_bins_merge() {
        // 65535 has more raw steps than four-decimal fractions
        let p = Precision::default();
        let mut hist = ScoreHistogram::new(p);
        hist.add(45874, 1);
        hist.add(45873, 2);
        let bins = hist.bins(ScoreAxis::Fraction);
        assert_eq!(bins, vec![(0.7, 3)]);
    }
}
