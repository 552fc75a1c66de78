#![no_main]

use fragsim_core::format::{detect_store_kind, MatrixHeader, PairHeader};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = detect_store_kind(data);
    if let Ok(header) = PairHeader::from_bytes(data) {
        let _ = header.validate(data.len() as u64);
    }
    if let Ok(header) = MatrixHeader::from_bytes(data) {
        let _ = header.validate(data.len() as u64);
    }
});
