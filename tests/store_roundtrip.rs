use fragsim::pairs::OpenMode;
use fragsim::query::AnyStore;
use fragsim::{
    merge_pair_stores, open_any, FillPolicy, FreezeOptions, LabelIndex, MatrixStore, PairStore, ScoredPair,
    SimilarityIndex,
};
use tempfile::tempdir;

fn label_map() -> LabelIndex {
    LabelIndex::from_entries([("a", 1), ("b", 2), ("c", 3), ("d", 4)]).unwrap()
}

fn four_label_pairs(path: &std::path::Path, precision: u16) -> PairStore {
    let mut store = PairStore::create(path, 4, precision).unwrap();
    store
        .update(
            vec![
                ScoredPair::new("a", "b", 0.9),
                ScoredPair::new("a", "c", 0.5),
                ScoredPair::new("b", "c", 0.6),
                ScoredPair::new("c", "d", 0.7),
            ],
            &label_map(),
        )
        .unwrap();
    store.add_indexes().unwrap();
    store
}

#[test]
fn freeze_answers_like_the_pair_store() {
    let dir = tempdir().unwrap();
    let pairs = four_label_pairs(&dir.path().join("pairs.fsp"), 100);
    let matrix = MatrixStore::from_pairs(dir.path().join("matrix.fsm"), &pairs, &FreezeOptions::default()).unwrap();

    let expected = vec![("d".to_string(), 0.7), ("b".to_string(), 0.6)];
    assert_eq!(matrix.find("c", 0.55, None).unwrap(), expected);
    assert_eq!(pairs.find_label("c", 0.55, None).unwrap(), expected);
    assert!(matrix.find("c", 0.9, None).unwrap().is_empty());
    assert_eq!(matrix.find("c", 0.55, Some(1)).unwrap(), vec![("d".to_string(), 0.7)]);

    assert!(matrix.find("x", 0.55, None).unwrap_err().is_not_found());
    assert!(pairs.find_label("x", 0.55, None).unwrap_err().is_not_found());
}

#[test]
fn thaw_then_freeze_reproduces_matrix() {
    let dir = tempdir().unwrap();
    let labels: Vec<String> = ["f1", "f2", "f3", "f4", "f5"].iter().map(|s| s.to_string()).collect();
    let rows = vec![
        vec![0.0, 0.91, 0.0, 0.33, 0.0],
        vec![0.91, 0.0, 0.5, 0.0, 0.0],
        vec![0.0, 0.5, 0.0, 0.0, 0.72],
        vec![0.33, 0.0, 0.0, 0.0, 0.0],
        vec![0.0, 0.0, 0.72, 0.0, 0.0],
    ];
    let original =
        MatrixStore::from_array(dir.path().join("orig.fsm"), &labels, &rows, 1000, FillPolicy::Symmetric).unwrap();

    let thawed_path = dir.path().join("thawed.fsp");
    let mut thawed = PairStore::create(&thawed_path, 8, 1000).unwrap();
    assert_eq!(original.to_pairs(&mut thawed).unwrap(), 4);
    thawed.add_indexes().unwrap();
    thawed.close().unwrap();

    let thawed = PairStore::open(&thawed_path, OpenMode::Read).unwrap();
    let refrozen =
        MatrixStore::from_pairs(dir.path().join("again.fsm"), &thawed, &FreezeOptions::default()).unwrap();

    assert_eq!(refrozen.labels(), original.labels());
    assert_eq!(refrozen.to_dense().unwrap(), original.to_dense().unwrap());
    assert_eq!(refrozen.to_dense().unwrap(), rows);
}

#[test]
fn open_any_serves_both_representations() {
    let dir = tempdir().unwrap();
    let pairs_path = dir.path().join("pairs.fsp");
    let matrix_path = dir.path().join("matrix.fsm");
    {
        let pairs = four_label_pairs(&pairs_path, 100);
        MatrixStore::from_pairs(&matrix_path, &pairs, &FreezeOptions::default()).unwrap();
        pairs.close().unwrap();
    }

    let sparse = open_any(&pairs_path).unwrap();
    let dense = open_any(&matrix_path).unwrap();
    assert!(matches!(sparse, AnyStore::Pairs(_)));
    assert!(matches!(dense, AnyStore::Matrix(_)));

    for label in ["a", "b", "c", "d"] {
        assert_eq!(
            sparse.find(label, 0.0, None).unwrap(),
            dense.find(label, 0.0, None).unwrap(),
            "hits for {}",
            label
        );
    }
    assert_eq!(sparse.precision(), dense.precision());
    assert_eq!(sparse.histogram().unwrap().total(), dense.histogram().unwrap().total());
}

#[test]
fn merged_shards_answer_like_one_store() {
    let dir = tempdir().unwrap();
    let shard1 = dir.path().join("shard1.fsp");
    let shard2 = dir.path().join("shard2.fsp");

    let mut first = PairStore::create(&shard1, 2, 100).unwrap();
    first
        .update(
            vec![ScoredPair::new("a", "b", 0.9), ScoredPair::new("a", "c", 0.5)],
            &label_map(),
        )
        .unwrap();
    first.close().unwrap();

    // Second shard numbers its labels differently
    let other_labels = LabelIndex::from_entries([("c", 10), ("d", 11), ("b", 12)]).unwrap();
    let mut second = PairStore::create(&shard2, 2, 100).unwrap();
    second
        .update(
            vec![ScoredPair::new("b", "c", 0.6), ScoredPair::new("c", "d", 0.7)],
            &other_labels,
        )
        .unwrap();
    second.close().unwrap();

    let merged_path = dir.path().join("merged.fsp");
    assert_eq!(merge_pair_stores(&[&shard1, &shard2], &merged_path).unwrap(), 4);

    let merged = PairStore::open(&merged_path, OpenMode::Read).unwrap();
    assert!(merged.is_indexed());
    assert_eq!(merged.len(), 4);
    assert_eq!(
        merged.find_label("c", 0.55, None).unwrap(),
        vec![("d".to_string(), 0.7), ("b".to_string(), 0.6)]
    );
}

#[test]
fn merge_rejects_mixed_precision() {
    let dir = tempdir().unwrap();
    let coarse = dir.path().join("coarse.fsp");
    let fine = dir.path().join("fine.fsp");
    four_label_pairs(&coarse, 100).close().unwrap();
    four_label_pairs(&fine, 1000).close().unwrap();

    let err = merge_pair_stores(&[&coarse, &fine], dir.path().join("out.fsp")).unwrap_err();
    assert!(matches!(
        err,
        fragsim::StoreError::IncompatiblePrecision { left: 100, right: 1000 }
    ));
}
