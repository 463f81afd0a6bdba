//! Generate object contents for tests
use rand::distributions::Alphanumeric;
use rand::prelude::*;

/// Parse a human-friendly size like "10 KB" or "2 MiB" into a number of bytes
pub fn size_in_bytes(size: &str) -> usize {
    byte_unit::Byte::from_str(size)
        .unwrap_or_else(|e| panic!("invalid test data size '{size}': {e}"))
        .get_bytes() as usize
}

/// Random alphanumeric text of `size` (see [`size_in_bytes`]), broken into lines.
pub fn random_text(size: &str) -> Vec<u8> {
    const LINE_LEN: usize = 80;

    let len = size_in_bytes(size);
    let mut rng = rand::thread_rng();

    (0..len)
        .map(|i| {
            if i % LINE_LEN == LINE_LEN - 1 {
                b'\n'
            } else {
                rng.sample(Alphanumeric)
            }
        })
        .collect()
}

/// Random binary data of `size` (see [`size_in_bytes`])
pub fn random_bytes(size: &str) -> Vec<u8> {
    let mut data = vec![0u8; size_in_bytes(size)];
    rand::thread_rng().fill_bytes(&mut data);

    data
}
