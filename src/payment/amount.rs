//! Exact conversion between decimal SOL strings and lamports.

use crate::error::{Error, Result};

/// Decimal places of the ledger's native unit.
pub const LAMPORT_DECIMALS: u32 = 9;

/// Lamports per SOL.
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Parse a decimal SOL amount such as `"0.01"` into lamports.
///
/// # Errors
///
/// Returns [`Error::Config`] for signs, exponents, more than nine decimals,
/// or values that overflow `u64`.
pub fn parse_sol(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let invalid = || Error::Config(format!("invalid SOL amount: {input:?}"));

    let (whole, frac) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if frac.len() > LAMPORT_DECIMALS as usize {
        return Err(Error::Config(format!(
            "SOL amount {input:?} has more than {LAMPORT_DECIMALS} decimals"
        )));
    }

    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let frac_lamports: u64 = if frac.is_empty() {
        0
    } else {
        let scale = 10u64.pow(LAMPORT_DECIMALS - frac.len() as u32);
        frac.parse::<u64>().map_err(|_| invalid())? * scale
    };

    whole
        .checked_mul(LAMPORTS_PER_SOL)
        .and_then(|w| w.checked_add(frac_lamports))
        .ok_or_else(invalid)
}

/// Render lamports as a SOL string without trailing zeros.
#[must_use]
pub fn format_sol(lamports: u64) -> String {
    let whole = lamports / LAMPORTS_PER_SOL;
    let frac = lamports % LAMPORTS_PER_SOL;
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{frac:09}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}
