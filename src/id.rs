use rand::{rngs::OsRng, RngCore};

use crate::util::b64u;

/// 128 bits: link ids sit in public URLs and must not be enumerable.
pub const LINK_ID_BYTES: usize = 16;
/// 256 bits: token values are bearer credentials.
pub const TOKEN_BYTES: usize = 32;

fn random_b64u(len: usize) -> String {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    b64u(&buf)
}

pub fn new_link_id() -> String {
    random_b64u(LINK_ID_BYTES)
}

pub fn new_token_value() -> String {
    random_b64u(TOKEN_BYTES)
}
