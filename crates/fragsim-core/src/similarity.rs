//! Modified Tanimoto similarity over bit-set fingerprints
//!
//! The plain Tanimoto coefficient favors fingerprints with many on-bits. The
//! modified form mixes it with the Tanimoto coefficient of the *off*-bits,
//! weighted by corrections derived from the corpus-wide mean on-bit density:
//!
//! ```text
//! a = |b1|   b = |b2|   c = |b1 ∩ b2|   n = universe size
//!
//! st   = c / (a + b - c)
//! st0  = (n - a - b + c) / (n - c)
//! smt  = corr_st * st + corr_sto * st0
//!
//! corr_st  = (2 - p) / 3
//! corr_sto = (1 + p) / 3           p = mean on-bit density
//! ```

use std::collections::btree_map;
use std::collections::BTreeMap;

use thiserror::Error;

use crate::bitset::BitSet;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimilarityError {
    #[error("Division by zero: a={a} b={b} c={c} n={n}")]
    DivisionByZero { a: usize, b: usize, c: usize, n: usize },

    #[error("Incompatible fingerprint space: {left} bits vs {right} bits")]
    IncompatibleFingerprintSpace { left: u32, right: u32 },

    #[error("Cannot compute density of an empty fingerprint collection")]
    EmptyCollection,
}

/// Which triangle of the label × label grid a producer or consumer covers.
///
/// For label pairs the ordering is lexicographic on labels; for dense
/// matrices it is the row/column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillPolicy {
    /// Both (x, y) and (y, x)
    #[default]
    Symmetric,
    /// Only x < y
    UpperTriangleOnly,
    /// Only x > y
    LowerTriangleOnly,
}

impl FillPolicy {
    /// Whether the ordered pair (x, y) belongs to this policy. Self pairs never do.
    #[inline]
    pub fn admits<T: Ord + ?Sized>(&self, x: &T, y: &T) -> bool {
        match self {
            FillPolicy::Symmetric => x != y,
            FillPolicy::UpperTriangleOnly => x < y,
            FillPolicy::LowerTriangleOnly => x > y,
        }
    }

    pub(crate) fn to_bits(self) -> u32 {
        match self {
            FillPolicy::Symmetric => 0,
            FillPolicy::UpperTriangleOnly => 1,
            FillPolicy::LowerTriangleOnly => 2,
        }
    }

    pub(crate) fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(FillPolicy::Symmetric),
            1 => Some(FillPolicy::UpperTriangleOnly),
            2 => Some(FillPolicy::LowerTriangleOnly),
            _ => None,
        }
    }
}

/// Weights of the on-bit and off-bit Tanimoto terms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corrections {
    pub st: f64,
    pub sto: f64,
}

impl Corrections {
    /// Derive weights from a mean on-bit density
    pub fn from_density(mean_on_bit_density: f64) -> Self {
        let (st, sto) = corrections(mean_on_bit_density);
        Self { st, sto }
    }
}

/// `((2 - p) / 3, (1 + p) / 3)`
pub fn corrections(mean_on_bit_density: f64) -> (f64, f64) {
    let p = mean_on_bit_density;
    ((2.0 - p) / 3.0, (1.0 + p) / 3.0)
}

/// Mean number of on-bits divided by the universe size
pub fn mean_on_bit_density<'a, I>(bitsets: I, number_of_bits: u32) -> Result<f64, SimilarityError>
where
    I: IntoIterator<Item = &'a BitSet>,
{
    let (mut total, mut count) = (0usize, 0usize);
    for bs in bitsets {
        total += bs.len();
        count += 1;
    }
    if count == 0 || number_of_bits == 0 {
        return Err(SimilarityError::EmptyCollection);
    }
    let mean_on_bits = total as f64 / count as f64;
    Ok(mean_on_bits / number_of_bits as f64)
}

/// Modified Tanimoto similarity of two fingerprints in a universe of `number_of_bits`
pub fn similarity(
    bitset1: &BitSet,
    bitset2: &BitSet,
    number_of_bits: u32,
    corrections: Corrections,
) -> Result<f64, SimilarityError> {
    let a = bitset1.len();
    let b = bitset2.len();
    let c = bitset1.intersection_count(bitset2);
    let n = number_of_bits as usize;

    if a + b == c || n <= c {
        return Err(SimilarityError::DivisionByZero { a, b, c, n });
    }

    let st = c as f64 / (a + b - c) as f64;
    // Signed: a malformed fingerprint wider than its universe must not wrap.
    let off_both = n as f64 - a as f64 - b as f64 + c as f64;
    let st0 = off_both / (n - c) as f64;

    Ok(corrections.st * st + corrections.sto * st0)
}

/// Labelled fingerprints sharing one universe size
#[derive(Debug, Clone, Default)]
pub struct FingerprintSet {
    number_of_bits: u32,
    fingerprints: BTreeMap<String, BitSet>,
}

impl FingerprintSet {
    pub fn new(number_of_bits: u32) -> Self {
        Self {
            number_of_bits,
            fingerprints: BTreeMap::new(),
        }
    }

    pub fn number_of_bits(&self) -> u32 {
        self.number_of_bits
    }

    pub fn insert(&mut self, label: impl Into<String>, bits: BitSet) -> Option<BitSet> {
        self.fingerprints.insert(label.into(), bits)
    }

    pub fn get(&self, label: &str) -> Option<&BitSet> {
        self.fingerprints.get(label)
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    /// Entries in label order
    pub fn iter(&self) -> btree_map::Iter<'_, String, BitSet> {
        self.fingerprints.iter()
    }

    /// Entries whose label starts with `prefix`, in label order
    pub fn iter_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a String, &'a BitSet)> + 'a {
        self.fingerprints
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(move |(label, _)| label.starts_with(prefix))
    }

    /// Subset with only the labels accepted by `keep`
    pub fn filter<F: Fn(&str) -> bool>(&self, keep: F) -> Self {
        Self {
            number_of_bits: self.number_of_bits,
            fingerprints: self
                .fingerprints
                .iter()
                .filter(|(label, _)| keep(label))
                .map(|(label, bits)| (label.clone(), bits.clone()))
                .collect(),
        }
    }

    /// Mean on-bit density over this set
    pub fn mean_on_bit_density(&self) -> Result<f64, SimilarityError> {
        mean_on_bit_density(self.fingerprints.values(), self.number_of_bits)
    }
}

impl<S: Into<String>> Extend<(S, BitSet)> for FingerprintSet {
    fn extend<I: IntoIterator<Item = (S, BitSet)>>(&mut self, iter: I) {
        for (label, bits) in iter {
            self.fingerprints.insert(label.into(), bits);
        }
    }
}

/// One scored label pair
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPair {
    pub label1: String,
    pub label2: String,
    pub score: f64,
}

impl ScoredPair {
    pub fn new(label1: impl Into<String>, label2: impl Into<String>, score: f64) -> Self {
        Self {
            label1: label1.into(),
            label2: label2.into(),
            score,
        }
    }
}

/// Lazy all-pairs similarity generator, see [`similarities`]
pub struct Similarities<'a> {
    outer: btree_map::Iter<'a, String, BitSet>,
    right: &'a FingerprintSet,
    current: Option<(&'a String, &'a BitSet)>,
    inner: btree_map::Iter<'a, String, BitSet>,
    number_of_bits: u32,
    corrections: Corrections,
    cutoff: f64,
    policy: FillPolicy,
}

impl<'a> Iterator for Similarities<'a> {
    type Item = Result<ScoredPair, SimilarityError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (label1, bs1) = self.current?;
            let Some((label2, bs2)) = self.inner.next() else {
                self.current = self.outer.next();
                self.inner = self.right.iter();
                continue;
            };

            if !self.policy.admits(label1.as_str(), label2.as_str()) {
                continue;
            }

            match similarity(bs1, bs2, self.number_of_bits, self.corrections) {
                Ok(score) if score >= self.cutoff => {
                    return Some(Ok(ScoredPair::new(label1.as_str(), label2.as_str(), score)));
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Score every admitted label pair of `left` × `right` and keep those at or above `cutoff`.
///
/// Cost is `|left| × |right|`; callers shard large corpora and pass
/// [`FillPolicy::UpperTriangleOnly`] for a shard against itself.
pub fn similarities<'a>(
    left: &'a FingerprintSet,
    right: &'a FingerprintSet,
    corrections: Corrections,
    cutoff: f64,
    policy: FillPolicy,
) -> Result<Similarities<'a>, SimilarityError> {
    if left.number_of_bits != right.number_of_bits {
        return Err(SimilarityError::IncompatibleFingerprintSpace {
            left: left.number_of_bits,
            right: right.number_of_bits,
        });
    }

    let mut outer = left.iter();
    let current = outer.next();
    Ok(Similarities {
        outer,
        right,
        current,
        inner: right.iter(),
        number_of_bits: left.number_of_bits,
        corrections,
        cutoff,
        policy,
    })
}
