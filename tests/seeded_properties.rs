use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fragsim::pairs::OpenMode;
use fragsim::quantize::Precision;
use fragsim::{
    similarity, BitSet, Corrections, FreezeOptions, LabelIndex, MatrixStore, PairStore, ScoredPair,
};
use tempfile::tempdir;

const NUMBER_OF_BITS: u32 = 2048;

fn random_bitset(rng: &mut StdRng) -> BitSet {
    let on_bits = rng.gen_range(0..64usize);
    (0..on_bits).map(|_| rng.gen_range(0..NUMBER_OF_BITS)).collect()
}

#[test]
fn similarity_is_symmetric() {
    let mut rng = StdRng::seed_from_u64(7);
    let corrections = Corrections::from_density(0.01);
    for _ in 0..2_000 {
        let left = random_bitset(&mut rng);
        let right = if rng.gen_bool(0.1) { left.clone() } else { random_bitset(&mut rng) };

        match (
            similarity(&left, &right, NUMBER_OF_BITS, corrections),
            similarity(&right, &left, NUMBER_OF_BITS, corrections),
        ) {
            (Ok(forward), Ok(backward)) => {
                assert_eq!(forward, backward);
                assert!((0.0..=1.0 + 1e-12).contains(&forward), "score {} out of range", forward);
            }
            (Err(_), Err(_)) => assert!(left.is_empty() && right.is_empty()),
            (forward, backward) => panic!("asymmetric outcome {:?} vs {:?}", forward, backward),
        }
    }
}

#[test]
fn quantization_error_is_bounded() {
    let mut rng = StdRng::seed_from_u64(11);
    for value in [10u16, 100, 255, 1000, 10_000, 65_535] {
        let precision = Precision::new(value).unwrap();
        let bound = 1.0 / (2.0 * value as f64) + 1.0 / precision.precision10() as f64 + 1e-12;
        for _ in 0..5_000 {
            let score = rng.gen::<f64>();
            let decoded = precision.dequantize(precision.quantize(score));
            assert!(
                (decoded - score).abs() <= bound,
                "precision {}: {} decoded as {}",
                value,
                score,
                decoded
            );
        }
    }
}

#[test]
fn power_of_ten_precision_is_exact_to_one_step() {
    let mut rng = StdRng::seed_from_u64(13);
    for value in [10u16, 100, 1000, 10_000] {
        let precision = Precision::new(value).unwrap();
        for _ in 0..5_000 {
            let score = rng.gen::<f64>();
            let decoded = precision.dequantize(precision.quantize(score));
            assert!((decoded - score).abs() <= 1.0 / value as f64 + 1e-12);
        }
    }
}

/// Unique unordered pairs over `n` labels with scores at precision 1000
fn random_pair_store(path: &std::path::Path, rng: &mut StdRng, n: u32, pairs: usize) -> PairStore {
    let labels = LabelIndex::from_entries((0..n).map(|i| (format!("frag{:03}", i), i * 3 + 1))).unwrap();
    let mut seen = HashSet::new();
    let mut batch = Vec::new();
    while batch.len() < pairs {
        let a = rng.gen_range(0..n);
        let b = rng.gen_range(0..n);
        if a == b || !seen.insert((a.min(b), a.max(b))) {
            continue;
        }
        let score = rng.gen_range(1..=1000) as f64 / 1000.0;
        batch.push(ScoredPair::new(format!("frag{:03}", a), format!("frag{:03}", b), score));
    }

    let mut store = PairStore::create(path, pairs as u64, 1000).unwrap();
    store.update(batch, &labels).unwrap();
    store.add_indexes().unwrap();
    store
}

#[test]
fn freeze_is_frame_size_invariant() {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(17);
    let pairs = random_pair_store(&dir.path().join("pairs.fsp"), &mut rng, 40, 300);

    let reference = MatrixStore::from_pairs(dir.path().join("ref.fsm"), &pairs, &FreezeOptions::default())
        .unwrap()
        .to_dense()
        .unwrap();
    for frame_size in [1usize, 7, 64, 299, 300, 1_000] {
        let options = FreezeOptions {
            frame_size,
            ..FreezeOptions::default()
        };
        let matrix = MatrixStore::from_pairs(dir.path().join(format!("m{}.fsm", frame_size)), &pairs, &options)
            .unwrap();
        assert_eq!(matrix.to_dense().unwrap(), reference, "frame size {}", frame_size);
    }
}

#[test]
fn sparse_and_dense_queries_agree() {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(19);
    let pairs = random_pair_store(&dir.path().join("pairs.fsp"), &mut rng, 25, 120);
    let matrix = MatrixStore::from_pairs(dir.path().join("m.fsm"), &pairs, &FreezeOptions::default()).unwrap();

    for i in 0..25 {
        let label = format!("frag{:03}", i);
        let cutoff = rng.gen_range(0..10) as f64 / 10.0;
        let limit = if rng.gen_bool(0.5) { Some(rng.gen_range(1..5)) } else { None };
        let sparse = pairs.find_label(&label, cutoff, limit);
        let dense = matrix.find(&label, cutoff, limit);
        // every catalog label resolves, with or without pairs
        assert_eq!(sparse.unwrap(), dense.unwrap(), "{} at {}", label, cutoff);
    }
}

#[test]
fn thaw_round_trip_on_random_matrix() {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(23);
    let pairs = random_pair_store(&dir.path().join("pairs.fsp"), &mut rng, 30, 200);
    let matrix = MatrixStore::from_pairs(dir.path().join("m.fsm"), &pairs, &FreezeOptions::default()).unwrap();

    let thawed_path = dir.path().join("thawed.fsp");
    let mut thawed = PairStore::create(&thawed_path, 200, 1000).unwrap();
    assert_eq!(matrix.to_pairs(&mut thawed).unwrap(), 200);
    thawed.close().unwrap();

    let thawed = PairStore::open(&thawed_path, OpenMode::Read).unwrap();
    let again = MatrixStore::from_pairs(dir.path().join("again.fsm"), &thawed, &FreezeOptions::default()).unwrap();
    assert_eq!(again.to_dense().unwrap(), matrix.to_dense().unwrap());
}
