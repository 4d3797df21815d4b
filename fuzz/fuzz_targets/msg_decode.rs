#![no_main]

use feedwatch_codec::{decode_msg_cbor, encode_msg_cbor};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = decode_msg_cbor(data) {
        let encoded = encode_msg_cbor(&msg).expect("decoded message re-encodes");
        let again = decode_msg_cbor(&encoded).expect("re-encoded message decodes");
        assert_eq!(msg, again);
    }
});
