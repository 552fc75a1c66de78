#![no_main]

use fragsim_core::LabelIndex;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(labels) = LabelIndex::decode(data) {
        let _ = LabelIndex::decode(&labels.encode());
    }
});
