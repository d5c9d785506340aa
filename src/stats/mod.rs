pub mod combinations;
pub mod pedigree;
pub mod people;
pub mod position;
pub mod runners;

use rust_decimal::Decimal;

/// `round(wins * 100 / total, 2)`, or `None` when there were no runs.
/// Every statistics table stores win rates under this one definition.
pub fn win_rate(wins: i64, total: i64) -> Option<Decimal> {
    if total <= 0 {
        return None;
    }
    Some((Decimal::from(wins) * Decimal::from(100) / Decimal::from(total)).round_dp(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_win_rate_rounds_to_two_decimals() {
        // 1/3 → 33.333... → 33.33
        assert_eq!(win_rate(1, 3), Some(Decimal::from_str("33.33").unwrap()));
        // 2/3 → 66.666... → 66.67 (banker's rounding does not apply at this digit)
        assert_eq!(win_rate(2, 3), Some(Decimal::from_str("66.67").unwrap()));
    }

    #[test]
    fn test_win_rate_exact_values() {
        assert_eq!(win_rate(1, 2), Some(Decimal::from_str("50").unwrap()));
        assert_eq!(win_rate(0, 7), Some(Decimal::ZERO));
        assert_eq!(win_rate(5, 5), Some(Decimal::from(100)));
    }

    #[test]
    fn test_win_rate_zero_total_is_null() {
        assert_eq!(win_rate(0, 0), None);
        assert_eq!(win_rate(3, 0), None);
    }
}
