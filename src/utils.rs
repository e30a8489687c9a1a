//! Utility functions for identifier minting

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

// internal mint for the fixed prefixes the crate itself uses.
// the prefixes are compile-time literals so parsing cannot fail.
pub(crate) fn mint(hrp: &str) -> String {
    new_uuid_to_bech32(hrp).expect("static hrp prefix failed bech32 encoding")
}
