//! Text interchange: pair TSV, fpneigh listings, makebits fingerprints and label maps
//!
//! ```text
//! pairs TSV     frag_id1<TAB>frag_id2<TAB>score      (header line first)
//! fpneigh       Compounds similar to <query>:
//!               <hit>   <score>
//! makebits      MAKEBITS 1.0 <number_of_bits> <label>
//!               <label> <bit> <bit> ... 0 <on_bit_count>
//! label map     {"<label>": <id>, ...}
//! ```

use std::collections::{BTreeMap, HashSet};
use std::io::{self, BufRead, Lines, Read, Write};

use thiserror::Error;
use tracing::{debug, info, warn};

use fragsim_core::generate::TSV_HEADER;
use fragsim_core::{BitSet, LabelIndex, PairStore, ScoredPair, SimilarityIndex, StoreError};

/// Pairs handed to the store per append
const IMPORT_BATCH: usize = 10_000;

#[derive(Error, Debug)]
pub enum TsvError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid label map: {0}")]
    LabelMap(#[from] serde_json::Error),

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

pub type Result<T, E = TsvError> = std::result::Result<T, E>;

fn parse_error(line: usize, reason: impl Into<String>) -> TsvError {
    TsvError::Parse {
        line,
        reason: reason.into(),
    }
}

fn parse_score(line: usize, field: &str) -> Result<f64> {
    field
        .trim()
        .parse::<f64>()
        .map_err(|_| parse_error(line, format!("score {:?} is not a number", field)))
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub no_header: bool,
    /// Only pairs where both labels end in `frag1`
    pub frag1_only: bool,
    /// Only pairs where both labels start with one of these PDB codes
    pub pdb_codes: Option<HashSet<String>>,
}

impl ExportOptions {
    fn keeps(&self, pair: &ScoredPair) -> bool {
        if self.frag1_only && !(pair.label1.ends_with("frag1") && pair.label2.ends_with("frag1")) {
            return false;
        }
        match &self.pdb_codes {
            Some(codes) => in_pdb_codes(codes, &pair.label1) && in_pdb_codes(codes, &pair.label2),
            None => true,
        }
    }
}

fn in_pdb_codes(codes: &HashSet<String>, label: &str) -> bool {
    label.get(..4).is_some_and(|code| codes.contains(code))
}

/// Write `pairs` as TSV lines, optionally preceded by the column header
pub fn write_pairs<W, I>(out: &mut W, pairs: I, header: bool) -> Result<u64>
where
    W: Write + ?Sized,
    I: IntoIterator<Item = Result<ScoredPair>>,
{
    if header {
        writeln!(out, "{}", TSV_HEADER)?;
    }
    let mut written = 0u64;
    for pair in pairs {
        let pair = pair?;
        writeln!(out, "{}\t{}\t{}", pair.label1, pair.label2, pair.score)?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}

/// Dump every stored pair of either store representation
pub fn export_pairs<W: Write + ?Sized>(
    index: &dyn SimilarityIndex,
    out: &mut W,
    options: &ExportOptions,
) -> Result<u64> {
    let pairs = index.pairs().filter_map(|pair| match pair {
        Ok(pair) if options.keeps(&pair) => Some(Ok(pair)),
        Ok(_) => None,
        Err(e) => Some(Err(TsvError::from(e))),
    });
    let written = write_pairs(out, pairs, !options.no_header)?;
    info!(pairs = written, "exported pairs");
    Ok(written)
}

/// Lowercased PDB codes, one per line
pub fn load_pdb_codes<R: BufRead>(reader: R) -> Result<HashSet<String>> {
    let mut codes = HashSet::new();
    for line in reader.lines() {
        let line = line?;
        let code = line.trim();
        if !code.is_empty() {
            codes.insert(code.to_lowercase());
        }
    }
    Ok(codes)
}

/// Fragment labels, one per line
pub fn load_label_list<R: BufRead>(reader: R) -> Result<HashSet<String>> {
    let mut labels = HashSet::new();
    for line in reader.lines() {
        let line = line?;
        let label = line.trim();
        if !label.is_empty() {
            labels.insert(label.to_string());
        }
    }
    Ok(labels)
}

/// Label → id map from a JSON object
pub fn load_label_map<R: Read>(reader: R) -> Result<LabelIndex> {
    let entries: BTreeMap<String, u32> = serde_json::from_reader(reader)?;
    Ok(LabelIndex::from_entries(entries)?)
}

/// Tab separated triples after a header line
pub struct TsvPairs<R> {
    lines: Lines<R>,
    line: usize,
}

pub fn read_tsv_pairs<R: BufRead>(reader: R) -> TsvPairs<R> {
    TsvPairs {
        lines: reader.lines(),
        line: 0,
    }
}

impl<R: BufRead> Iterator for TsvPairs<R> {
    type Item = Result<ScoredPair>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;
            if self.line == 1 || text.trim().is_empty() {
                continue;
            }

            let mut fields = text.split('\t');
            let (Some(label1), Some(label2), Some(score), None) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                return Some(Err(parse_error(self.line, "expected 3 tab separated columns")));
            };
            return Some(parse_score(self.line, score).map(|score| ScoredPair::new(label1, label2, score)));
        }
    }
}

/// Pairs from fpneigh `Compounds similar to` listings, query self hits dropped
pub struct FpneighPairs<R> {
    lines: Lines<R>,
    line: usize,
    query: Option<String>,
}

pub fn read_fpneigh_pairs<R: BufRead>(reader: R) -> FpneighPairs<R> {
    FpneighPairs {
        lines: reader.lines(),
        line: 0,
        query: None,
    }
}

impl<R: BufRead> Iterator for FpneighPairs<R> {
    type Item = Result<ScoredPair>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;

            let fields: Vec<&str> = text.split_whitespace().collect();
            match fields.as_slice() {
                ["Compounds", "similar", "to", query] => {
                    self.query = Some(query.trim_end_matches(':').to_string());
                }
                [hit, score] => {
                    let Some(query) = &self.query else {
                        return Some(Err(parse_error(self.line, "hit before any query")));
                    };
                    if query == hit {
                        continue;
                    }
                    return Some(parse_score(self.line, score).map(|score| ScoredPair::new(query.clone(), *hit, score)));
                }
                [] => {}
                _ => return Some(Err(parse_error(self.line, "unrecognised fpneigh line"))),
            }
        }
    }
}

/// Append parsed pairs to `store`, skipping self pairs and, with
/// `upper_only`, rows whose first label sorts after the second.
///
/// Once every row is in, the whole `label2id` catalog joins the store's label map.
pub fn import_pairs<I>(pairs: I, store: &mut PairStore, label2id: &LabelIndex, upper_only: bool) -> Result<u64>
where
    I: IntoIterator<Item = Result<ScoredPair>>,
{
    let mut written = 0u64;
    let mut self_pairs = 0u64;
    let mut lower = 0u64;
    let mut batch = Vec::with_capacity(IMPORT_BATCH);
    for pair in pairs {
        let pair = pair?;
        if pair.label1 == pair.label2 {
            self_pairs += 1;
            continue;
        }
        if upper_only && pair.label1 > pair.label2 {
            lower += 1;
            continue;
        }
        batch.push(pair);
        if batch.len() == IMPORT_BATCH {
            written += store.append_pairs(batch.drain(..), label2id)?;
        }
    }
    written += store.append_pairs(batch, label2id)?;
    store.adopt_labels(label2id)?;
    store.flush()?;

    if self_pairs > 0 {
        warn!(count = self_pairs, "skipped self pairs while importing");
    }
    if lower > 0 {
        debug!(count = lower, "dropped lower triangle rows");
    }
    info!(pairs = written, "imported pairs");
    Ok(written)
}

/// `query hit score` lines for one query's hits
pub fn write_hits<W: Write + ?Sized>(out: &mut W, query: &str, hits: &[(String, f64)]) -> Result<()> {
    for (hit, score) in hits {
        writeln!(out, "{}\t{}\t{}", query, hit, score)?;
    }
    out.flush()?;
    Ok(())
}

/// `score count` table
pub fn write_histogram<W: Write + ?Sized>(out: &mut W, bins: &[(f64, u64)]) -> Result<()> {
    writeln!(out, "score\tcount")?;
    for (score, count) in bins {
        writeln!(out, "{}\t{}", score, count)?;
    }
    out.flush()?;
    Ok(())
}

/// Parse a makebits file into its universe size and fingerprints
pub fn read_makebits<R: BufRead>(reader: R) -> Result<(u32, Vec<(String, BitSet)>)> {
    let mut lines = reader.lines();
    let header = lines.next().ok_or_else(|| parse_error(1, "missing makebits header"))??;
    let number_of_bits = match header.split_whitespace().collect::<Vec<_>>().as_slice() {
        ["MAKEBITS", _version, size, _label] => size
            .parse::<u32>()
            .map_err(|_| parse_error(1, format!("fingerprint size {:?} is not a number", size)))?,
        _ => return Err(parse_error(1, "expected `MAKEBITS <version> <size> <label>`")),
    };

    let mut fingerprints = Vec::new();
    for (i, text) in lines.enumerate() {
        let line = i + 2;
        let text = text?;
        if text.trim().is_empty() {
            continue;
        }
        fingerprints.push(parse_makebits_line(line, &text)?);
    }
    Ok((number_of_bits, fingerprints))
}

fn parse_makebits_line(line: usize, text: &str) -> Result<(String, BitSet)> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    let [label, bits @ .., separator, on_bits] = fields.as_slice() else {
        return Err(parse_error(line, "expected `<label> <bit>... 0 <on_bit_count>`"));
    };
    if *separator != "0" {
        return Err(parse_error(line, "missing 0 separator before the on-bit count"));
    }

    let positions = bits
        .iter()
        .map(|bit| {
            bit.parse::<u32>()
                .map_err(|_| parse_error(line, format!("bit {:?} is not a number", bit)))
        })
        .collect::<Result<Vec<_>>>()?;
    let bitset = BitSet::from_positions(positions);

    let expected: usize = on_bits
        .parse()
        .map_err(|_| parse_error(line, format!("on-bit count {:?} is not a number", on_bits)))?;
    if bitset.len() != expected {
        return Err(parse_error(
            line,
            format!("on-bit checksum incorrect for {}: {} != {}", label, bitset.len(), expected),
        ));
    }
    Ok((label.to_string(), bitset))
}

/// Write fingerprints in makebits layout
pub fn write_makebits<'a, W, I>(out: &mut W, number_of_bits: u32, fingerprints: I) -> Result<u64>
where
    W: Write + ?Sized,
    I: IntoIterator<Item = (&'a str, &'a BitSet)>,
{
    writeln!(out, "MAKEBITS 1.0 {} BigGrid", number_of_bits)?;
    let mut written = 0u64;
    for (label, bits) in fingerprints {
        write!(out, "{}", label)?;
        for bit in bits.iter() {
            write!(out, " {}", bit)?;
        }
        writeln!(out, " 0 {}", bits.len())?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragsim_core::pairs::OpenMode;
    use fragsim_core::{FillPolicy, MatrixStore};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn labels() -> LabelIndex {
        LabelIndex::from_entries([
            ("2mlm_2W7_frag1", 1),
            ("2mlm_2W7_frag2", 2),
            ("3wvm_STE_frag1", 3),
            ("2mlm_2W7_frag4", 4),
        ])
        .unwrap()
    }

    fn collect<I: Iterator<Item = Result<ScoredPair>>>(pairs: I) -> Vec<ScoredPair> {
        pairs.map(|p| p.unwrap()).collect()
    }

    #[test]
    fn test_read_tsv_pairs() {
        let text = "frag_id1\tfrag_id2\tscore\na\tb\t0.9\n\nb\tc\t0.25\n";
        let pairs = collect(read_tsv_pairs(Cursor::new(text)));
        assert_eq!(pairs, vec![ScoredPair::new("a", "b", 0.9), ScoredPair::new("b", "c", 0.25)]);
    }

    #[test]
    fn test_read_tsv_pairs_reports_line() {
        let text = "frag_id1\tfrag_id2\tscore\na\tb\t0.9\na\tb\n";
        let err = read_tsv_pairs(Cursor::new(text)).nth(1).unwrap().unwrap_err();
        assert!(matches!(err, TsvError::Parse { line: 3, .. }));

        let text = "header\na\tb\tnope\n";
        let err = read_tsv_pairs(Cursor::new(text)).next().unwrap().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_read_fpneigh_pairs() {
        let text = "Compounds similar to 2xry_FAD_frag4:\n\
                    2xry_FAD_frag4   1.0000\n\
                    3cvv_FAD_frag3   0.5600\n\
                    Compounds similar to 1wnt_NAP_frag1:\n\
                    1wnt_NAP_frag1   1.0000\n\
                    1wnt_NAP_frag3   0.8730\n";
        let pairs = collect(read_fpneigh_pairs(Cursor::new(text)));
        assert_eq!(
            pairs,
            vec![
                ScoredPair::new("2xry_FAD_frag4", "3cvv_FAD_frag3", 0.56),
                ScoredPair::new("1wnt_NAP_frag1", "1wnt_NAP_frag3", 0.873),
            ]
        );
    }

    #[test]
    fn test_read_fpneigh_hit_without_query() {
        let err = read_fpneigh_pairs(Cursor::new("x 0.5\n")).next().unwrap().unwrap_err();
        assert!(matches!(err, TsvError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_fpneigh_to_tsv() {
        let text = "Compounds similar to a:\na 1.0\nb 0.5\n";
        let mut out = Vec::new();
        let written = write_pairs(&mut out, read_fpneigh_pairs(Cursor::new(text)), true).unwrap();
        assert_eq!(written, 1);
        assert_eq!(String::from_utf8(out).unwrap(), "frag_id1\tfrag_id2\tscore\na\tb\t0.5\n");
    }

    #[test]
    fn test_import_pairs_skips_self_and_lower() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pairs.fsp");
        let text = "frag_id1\tfrag_id2\tscore\n\
                    2mlm_2W7_frag1\t2mlm_2W7_frag2\t0.5877\n\
                    2mlm_2W7_frag2\t2mlm_2W7_frag1\t0.5877\n\
                    2mlm_2W7_frag2\t2mlm_2W7_frag2\t1.0\n\
                    2mlm_2W7_frag2\t3wvm_STE_frag1\t0.4633\n";

        let mut store = PairStore::create(&path, 3, 10_000).unwrap();
        let written = import_pairs(read_tsv_pairs(Cursor::new(text)), &mut store, &labels(), true).unwrap();
        assert_eq!(written, 2);
        store.close().unwrap();

        let store = PairStore::open(&path, OpenMode::Read).unwrap();
        let rows: Vec<_> = store.iter().map(|p| p.unwrap()).collect();
        assert_eq!(
            rows,
            vec![
                ScoredPair::new("2mlm_2W7_frag1", "2mlm_2W7_frag2", 0.5877),
                ScoredPair::new("2mlm_2W7_frag2", "3wvm_STE_frag1", 0.4633),
            ]
        );
        // catalog entries without rows still resolve
        assert_eq!(store.labels(), &labels());
        assert!(store.find_label("2mlm_2W7_frag4", 0.0, None).unwrap().is_empty());
    }

    #[test]
    fn test_import_pairs_rejects_conflicting_map() {
        let dir = tempdir().unwrap();
        let mut store = PairStore::create(dir.path().join("pairs.fsp"), 1, 100).unwrap();
        let text = "h\n2mlm_2W7_frag1\t2mlm_2W7_frag2\t0.5\n";
        import_pairs(read_tsv_pairs(Cursor::new(text)), &mut store, &labels(), false).unwrap();

        let shifted = LabelIndex::from_entries([("2mlm_2W7_frag1", 11), ("2mlm_2W7_frag2", 12)]).unwrap();
        let err = import_pairs(read_tsv_pairs(Cursor::new(text)), &mut store, &shifted, false).unwrap_err();
        assert!(matches!(err, TsvError::Store(StoreError::LabelMismatch(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_import_pairs_unknown_label() {
        let dir = tempdir().unwrap();
        let mut store = PairStore::create(dir.path().join("pairs.fsp"), 1, 100).unwrap();
        let text = "h\nnot_a_fragment\t2mlm_2W7_frag1\t0.5\n";
        let err = import_pairs(read_tsv_pairs(Cursor::new(text)), &mut store, &labels(), false).unwrap_err();
        assert!(matches!(err, TsvError::Store(ref e) if e.is_not_found()));
    }

    fn sample_matrix(dir: &std::path::Path) -> MatrixStore {
        let labels: Vec<String> = ["2mlm_2W7_frag1", "2mlm_2W7_frag2", "2mm3_CHO_frag1", "3wt8_RET_frag1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows = vec![
            vec![0.0, 0.59, 0.0, 0.0],
            vec![0.59, 0.0, 0.0, 0.46],
            vec![0.0, 0.0, 0.0, 0.47],
            vec![0.0, 0.46, 0.47, 0.0],
        ];
        MatrixStore::from_array(dir.join("m.fsm"), &labels, &rows, 100, FillPolicy::Symmetric).unwrap()
    }

    #[test]
    fn test_export_pairs_options() {
        let dir = tempdir().unwrap();
        let matrix = sample_matrix(dir.path());

        let mut out = Vec::new();
        assert_eq!(export_pairs(&matrix, &mut out, &ExportOptions::default()).unwrap(), 3);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("frag_id1\tfrag_id2\tscore\n2mlm_2W7_frag1\t2mlm_2W7_frag2\t0.59\n"));

        let mut out = Vec::new();
        let options = ExportOptions {
            no_header: true,
            frag1_only: true,
            ..ExportOptions::default()
        };
        export_pairs(&matrix, &mut out, &options).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "2mm3_CHO_frag1\t3wt8_RET_frag1\t0.47\n");

        let mut out = Vec::new();
        let options = ExportOptions {
            pdb_codes: Some(load_pdb_codes(Cursor::new("2MLM\n\n")).unwrap()),
            ..ExportOptions::default()
        };
        assert_eq!(export_pairs(&matrix, &mut out, &options).unwrap(), 1);
    }

    #[test]
    fn test_load_label_map() {
        let map = load_label_map(Cursor::new(r#"{"a": 0, "b": 1, "c": 5}"#)).unwrap();
        assert_eq!(map.by_label("c").unwrap(), 5);
        assert!(!map.is_dense());

        assert!(matches!(load_label_map(Cursor::new("[1, 2]")), Err(TsvError::LabelMap(_))));
        assert!(matches!(
            load_label_map(Cursor::new(r#"{"a": 0, "b": 0}"#)),
            Err(TsvError::Store(StoreError::DuplicateId { .. }))
        ));
    }

    #[test]
    fn test_write_hits_and_histogram() {
        let mut out = Vec::new();
        write_hits(&mut out, "c", &[("d".to_string(), 0.7), ("b".to_string(), 0.6)]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "c\td\t0.7\nc\tb\t0.6\n");

        let mut out = Vec::new();
        write_histogram(&mut out, &[(0.5, 2), (0.7, 1)]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "score\tcount\n0.5\t2\n0.7\t1\n");
    }

    #[test]
    fn test_makebits_roundtrip() {
        let text = "MAKEBITS 1.0 574331 BigGrid\n3j7u_NDP_frag24 1 2 3 0 3\n3j7u_NDP_frag23 4 8 0 2\n";
        let (number_of_bits, fingerprints) = read_makebits(Cursor::new(text)).unwrap();
        assert_eq!(number_of_bits, 574_331);
        assert_eq!(fingerprints[1], ("3j7u_NDP_frag23".to_string(), BitSet::from([4, 8])));

        let mut out = Vec::new();
        write_makebits(&mut out, number_of_bits, fingerprints.iter().map(|(l, b)| (l.as_str(), b))).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), text);
    }

    #[test]
    fn test_makebits_checksum() {
        let text = "MAKEBITS 1.0 100 BigGrid\nfrag 1 2 0 3\n";
        let err = read_makebits(Cursor::new(text)).unwrap_err();
        assert!(matches!(err, TsvError::Parse { line: 2, .. }));
        assert!(err.to_string().contains("checksum"));

        assert!(read_makebits(Cursor::new("NOTBITS\n")).is_err());
        assert!(read_makebits(Cursor::new("")).is_err());
    }
}
