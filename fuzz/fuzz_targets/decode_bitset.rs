#![no_main]

use fragsim_core::BitSet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(bits) = BitSet::decode(data) {
        // Varints may be padded, so compare decoded values rather than bytes
        assert_eq!(BitSet::decode(&bits.encode()).ok(), Some(bits));
    }
});
