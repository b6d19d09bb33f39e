use std::time::Duration;

use crate::BitcoinUnit;

pub fn now() -> Duration {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
}

/// Renders a satoshi amount as an exact decimal string in the given display
/// unit. No binary floating point is involved.
pub fn format_amount(sats: i64, unit: BitcoinUnit) -> String {
    let (divisor, decimals) = match unit {
        BitcoinUnit::BTC => (100_000_000i64, 8),
        BitcoinUnit::MBTC => (100_000i64, 5),
        BitcoinUnit::UBTC => (100i64, 2),
    };
    let sign = if sats < 0 { "-" } else { "" };
    let magnitude = sats.unsigned_abs();
    let whole = magnitude / divisor as u64;
    let fraction = magnitude % divisor as u64;
    format!(
        "{}{}.{:0width$}",
        sign,
        whole,
        fraction,
        width = decimals
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_each_display_unit() {
        assert_eq!(format_amount(150_000, BitcoinUnit::BTC), "0.00150000");
        assert_eq!(format_amount(150_000, BitcoinUnit::MBTC), "1.50000");
        assert_eq!(format_amount(150_000, BitcoinUnit::UBTC), "1500.00");
    }

    #[test]
    fn formats_negative_and_zero() {
        assert_eq!(format_amount(0, BitcoinUnit::BTC), "0.00000000");
        assert_eq!(format_amount(-1_200, BitcoinUnit::BTC), "-0.00001200");
        assert_eq!(format_amount(-1_200, BitcoinUnit::UBTC), "-12.00");
    }

    #[test]
    fn formats_whole_coins() {
        assert_eq!(
            format_amount(2_100_000_000_000_000, BitcoinUnit::BTC),
            "21000000.00000000"
        );
    }
}
