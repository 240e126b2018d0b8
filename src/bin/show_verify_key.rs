//! Prints the Ed25519 verifying key for the configured signing seed.
//!
//! Receipt consumers need this key (and the key id) to verify receipts
//! out of band.
//!
//! ```bash
//! PG_SIGNING_SEED=... cargo run --bin show_verify_key
//! ```

use privacyguard::application::{ReceiptLedger, PUBLIC_KEY_ID};

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn main() {
    let ledger = ReceiptLedger::from_env();
    let key = ledger.verifying_key();

    println!("public_key_id={PUBLIC_KEY_ID}");
    println!("verify_key_hex={}", to_hex(key.as_bytes()));
}
