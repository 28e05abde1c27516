//! Identifier and nonce generation.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Redemption code alphabet: uppercase and digits without 0/O/1/I.
pub const COUPON_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const COUPON_CODE_LEN: usize = 8;

/// Prefixes for externally visible trade numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradePrefix {
    Payment,
    SimulatedPayment,
    Refund,
    SimulatedRefund,
}

impl TradePrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "P",
            Self::SimulatedPayment => "SIM",
            Self::Refund => "R",
            Self::SimulatedRefund => "SIMR",
        }
    }
}

/// `ORD<unix-seconds><6 random digits>`.
pub fn generate_order_no() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("ORD{}{:06}", Utc::now().timestamp(), suffix)
}

/// `<prefix><unix-nanos><6 random hex>`.
pub fn generate_trade_no(prefix: TradePrefix) -> String {
    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros() * 1_000);
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{}{}{:06x}", prefix.as_str(), nanos, suffix)
}

pub fn generate_coupon_code() -> String {
    let mut rng = rand::thread_rng();
    (0..COUPON_CODE_LEN)
        .map(|_| COUPON_CODE_ALPHABET[rng.gen_range(0..COUPON_CODE_ALPHABET.len())] as char)
        .collect()
}

/// 32-character alphanumeric nonce for gateway requests.
pub fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}
