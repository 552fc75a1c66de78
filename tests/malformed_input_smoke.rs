use std::io::Cursor;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fragsim::format::{detect_store_kind, MatrixHeader, PairHeader, FORMAT_VERSION, MATRIX_MAGIC, PAIRS_MAGIC};
use fragsim::tsv::{read_fpneigh_pairs, read_makebits, read_tsv_pairs};
use fragsim::{open_any, BitSet, FillPolicy, LabelIndex, MatrixStore, PairStore, ScoredPair, SimilarityIndex};
use tempfile::tempdir;

#[test]
fn malformed_bytes_do_not_panic_decode_paths() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..2_000 {
        let len = rng.gen_range(0..512usize);
        let mut data = vec![0u8; len];
        rng.fill(data.as_mut_slice());

        let _ = detect_store_kind(&data);
        let _ = PairHeader::from_bytes(&data);
        let _ = MatrixHeader::from_bytes(&data);
        let _ = BitSet::decode(&data);
        let _ = LabelIndex::decode(&data);
        let _ = read_tsv_pairs(Cursor::new(&data)).take(16).count();
        let _ = read_fpneigh_pairs(Cursor::new(&data)).take(16).count();
        let _ = read_makebits(Cursor::new(&data));
    }
}

/// Touch every read path of whatever `open_any` manages to open
fn exercise(path: &std::path::Path) {
    let Ok(store) = open_any(path) else {
        return;
    };
    for (_, label) in store.labels().iter() {
        let _ = store.find(label, 0.0, Some(8));
    }
    let _ = store.pairs().take(1_000).count();
    let _ = store.histogram();
}

#[test]
fn random_bodies_behind_valid_preambles_do_not_panic() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.bin");
    let mut rng = StdRng::seed_from_u64(7);
    for i in 0..500 {
        let len = rng.gen_range(12..2048usize);
        let mut data = vec![0u8; len];
        rng.fill(data.as_mut_slice());
        let magic = if i % 2 == 0 { PAIRS_MAGIC } else { MATRIX_MAGIC };
        data[0..8].copy_from_slice(&magic);
        data[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        std::fs::write(&path, &data).unwrap();
        exercise(&path);
    }
}

#[test]
fn bit_flipped_stores_do_not_panic() {
    let dir = tempdir().unwrap();
    let pairs_path = dir.path().join("pairs.fsp");
    let matrix_path = dir.path().join("matrix.fsm");

    let labels = LabelIndex::from_entries([("a", 1), ("b", 2), ("c", 3), ("d", 4)]).unwrap();
    let mut pairs = PairStore::create(&pairs_path, 4, 100).unwrap();
    pairs
        .update(
            vec![
                ScoredPair::new("a", "b", 0.9),
                ScoredPair::new("a", "c", 0.5),
                ScoredPair::new("b", "c", 0.6),
                ScoredPair::new("c", "d", 0.7),
            ],
            &labels,
        )
        .unwrap();
    pairs.add_indexes().unwrap();
    pairs.close().unwrap();

    let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let rows = vec![vec![0.0, 0.4, 0.8], vec![0.4, 0.0, 0.2], vec![0.8, 0.2, 0.0]];
    MatrixStore::from_array(&matrix_path, &names, &rows, 1000, FillPolicy::Symmetric).unwrap();

    let pristine_pairs = std::fs::read(&pairs_path).unwrap();
    let pristine_matrix = std::fs::read(&matrix_path).unwrap();
    let scratch = dir.path().join("flipped.bin");

    let mut rng = StdRng::seed_from_u64(99);
    for i in 0..1_000 {
        let mut data = if i % 2 == 0 { pristine_pairs.clone() } else { pristine_matrix.clone() };
        for _ in 0..rng.gen_range(1..4) {
            let at = rng.gen_range(0..data.len());
            data[at] ^= 1 << rng.gen_range(0..8);
        }
        std::fs::write(&scratch, &data).unwrap();
        exercise(&scratch);
    }
}
