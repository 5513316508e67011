//! Number, time and link formatting for finding descriptions.

use alloy::primitives::{Address, U256};
use bigdecimal::BigDecimal;
use chrono::DateTime;
use rust_decimal::{Decimal, RoundingStrategy};
use steth_monitor_provider::u256_to_decimal;

/// 10^18, wei per ether.
pub const ETHER: Decimal = Decimal::from_parts(2_808_348_672, 232_830_643, 0, false, 0);

/// Convert a wei amount to ether.
pub fn to_ether(wei: Decimal) -> Decimal {
    wei / ETHER
}

/// Convert an ether amount to wei.
pub fn from_ether(ether: Decimal) -> Decimal {
    ether.saturating_mul(ETHER)
}

/// Render a wei amount in ether with a fixed number of decimals.
pub fn fmt_ether(wei: Decimal, decimals: u32) -> String {
    fmt_fixed(to_ether(wei), decimals)
}

/// Render a raw wei word in ether. Words beyond the decimal range are
/// rendered in wei.
pub fn fmt_wei(wei: U256, decimals: u32) -> String {
    match u256_to_decimal(wei) {
        Ok(wei) => fmt_ether(wei, decimals),
        Err(_) => format!("{} wei", wei),
    }
}

/// Render a value with a fixed number of decimals, rounding half away from zero.
pub fn fmt_fixed(value: Decimal, decimals: u32) -> String {
    let rounded = value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.*}", decimals as usize, rounded)
}

/// Render a value in shortest scientific notation, e.g. `1.1549004556051977e27`.
pub fn fmt_sci(value: &BigDecimal) -> String {
    // Display output is exact, so parsing it gives the correctly rounded f64.
    match value.to_string().parse::<f64>() {
        Ok(v) => format!("{:e}", v),
        Err(_) => value.to_string(),
    }
}

/// Render a duration as `"120 hrs 12 sec"`, skipping zero parts.
pub fn fmt_duration(secs: u64) -> String {
    let hours = secs / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{} hrs", hours));
    }
    if minutes > 0 {
        parts.push(format!("{} min", minutes));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{} sec", seconds));
    }
    parts.join(" ")
}

/// Render a unix timestamp as an RFC 1123 GMT date.
pub fn fmt_gmt(timestamp: u64) -> String {
    i64::try_from(timestamp)
        .ok()
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Markdown link to an address on Etherscan, checksummed.
pub fn etherscan_address(address: Address) -> String {
    format!("[{}](https://etherscan.io/address/{})", address, address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use std::str::FromStr;

    #[test]
    fn test_ether_constant() {
        assert_eq!(ETHER, Decimal::from(1_000_000_000_000_000_000u64));
    }

    #[test]
    fn test_fmt_ether() {
        let wei = Decimal::from_str("140275704380000000000000").unwrap();
        assert_eq!(fmt_ether(wei, 2), "140275.70");
        assert_eq!(fmt_ether(ETHER, 4), "1.0000");
        assert_eq!(fmt_ether(Decimal::from_str("20001000000000000000000").unwrap(), 2), "20001.00");
    }

    #[test]
    fn test_fmt_wei() {
        assert_eq!(fmt_wei(U256::from(1_500_000_000_000_000_000u128), 2), "1.50");
        assert_eq!(fmt_wei(U256::MAX, 2), format!("{} wei", U256::MAX));
    }

    #[test]
    fn test_fmt_sci() {
        let prev = BigDecimal::from_str("1154900455605197760424102193.81324898101464198621").unwrap();
        let diff = BigDecimal::from_str("154900455605197760424102193.81324898101464198621").unwrap();
        assert_eq!(fmt_sci(&prev), "1.1549004556051977e27");
        assert_eq!(fmt_sci(&(&prev + &diff)), "1.3098009112103954e27");
        assert_eq!(fmt_sci(&diff), "1.5490045560519778e26");
        assert_eq!(fmt_sci(&-diff.clone()), "-1.5490045560519778e26");
        assert_eq!(fmt_sci(&(&prev - &diff)), "1e27");
    }

    #[test]
    fn test_fmt_duration() {
        assert_eq!(fmt_duration(120 * 3_600 + 12), "120 hrs 12 sec");
        assert_eq!(fmt_duration(61), "1 min 1 sec");
        assert_eq!(fmt_duration(0), "0 sec");
    }

    #[test]
    fn test_fmt_gmt() {
        assert_eq!(fmt_gmt(1_714_521_600), "Wed, 01 May 2024 00:00:00 GMT");
    }

    #[test]
    fn test_etherscan_address_is_checksummed() {
        let addr = address!("bd829522d4791b9660f59f5998fae451daca4e1c");
        assert_eq!(
            etherscan_address(addr),
            "[0xbD829522d4791b9660f59f5998faE451dACA4E1C](https://etherscan.io/address/0xbD829522d4791b9660f59f5998faE451dACA4E1C)"
        );
    }
}
