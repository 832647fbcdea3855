#![no_main]
use libfuzzer_sys::fuzz_target;

use mqtt_core::unpack;

fuzz_target!(|data: &[u8]| {
    let _ = unpack(data, 256 * 1024 * 1024);
});
