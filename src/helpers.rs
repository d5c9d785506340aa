//! Field-level parsers for racing API string conventions.
//!
//! The API exposes several values in display form rather than as numbers:
//! weights as stones-pounds ("8-13"), distances as miles-furlongs ("1m2f"),
//! prize money as currency strings ("£5,900"). Each parser here returns a
//! typed value or `None`; callers decide whether a missing value is a
//! `ParseError` or an acceptable gap.

use rust_decimal::Decimal;
use std::str::FromStr;

/// Metres per furlong.
const METRES_PER_FURLONG: f64 = 201.168;

/// Parse a stones-pounds weight string ("8-13") into total pounds.
///
/// Returns `None` for malformed input; a bare number is taken as pounds.
pub fn parse_weight_lbs(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.split_once('-') {
        Some((stones, lbs)) => {
            let stones: i32 = stones.trim().parse().ok()?;
            let lbs: i32 = lbs.trim().parse().ok()?;
            if stones < 0 || !(0..14).contains(&lbs) {
                return None;
            }
            Some(stones * 14 + lbs)
        }
        None => raw.parse().ok(),
    }
}

/// Parse a race distance string into metres.
///
/// Accepts `Nf` ("6f", "7½f"), `NmNf` ("1m2f"), bare miles ("2m"), and
/// explicit metre values ("1207m " is ambiguous with miles, so metres are
/// only recognised as a bare integer ≥ 900). The verbatim string is kept
/// on the race row; this parse feeds the `distance_m` column.
pub fn parse_distance_metres(raw: &str) -> Option<i32> {
    let raw = raw.trim().to_lowercase();
    if raw.is_empty() {
        return None;
    }

    // Bare integer: an explicit metres value. Anything below 900 m (~4.5f)
    // is shorter than any real race and is rejected as noise.
    if let Ok(metres) = raw.parse::<i32>() {
        return (metres >= 900).then_some(metres);
    }

    let furlongs = parse_furlongs(&raw)?;
    Some((furlongs * METRES_PER_FURLONG).round() as i32)
}

/// Parse "1m2f" / "6f" / "2m" / "7½f" into furlongs.
fn parse_furlongs(raw: &str) -> Option<f64> {
    let mut miles = 0.0;
    let mut rest = raw;

    if let Some((m, tail)) = rest.split_once('m') {
        miles = m.trim().parse::<f64>().ok()?;
        rest = tail.trim();
    }

    let furlongs = if rest.is_empty() {
        0.0
    } else {
        let f = rest.strip_suffix('f')?.trim();
        match f.strip_suffix('½') {
            Some(whole) if whole.is_empty() => 0.5,
            Some(whole) => whole.parse::<f64>().ok()? + 0.5,
            None => {
                if f.is_empty() {
                    return None;
                }
                f.parse::<f64>().ok()?
            }
        }
    };

    let total = miles * 8.0 + furlongs;
    // Real races run from 5 furlongs to about 4.5 miles; anything outside
    // that is a malformed or misinterpreted value ("1207m" is not miles).
    if !(4.0..=40.0).contains(&total) {
        return None;
    }
    Some(total)
}

/// Parse a prize-money string ("£5,900", "€4,690") into an amount and the
/// ISO currency code implied by the symbol. Plain numbers default to GBP.
pub fn parse_currency_amount(raw: &str) -> Option<(Decimal, &'static str)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (currency, rest) = if let Some(rest) = raw.strip_prefix('£') {
        ("GBP", rest)
    } else if let Some(rest) = raw.strip_prefix('€') {
        ("EUR", rest)
    } else if let Some(rest) = raw.strip_prefix('$') {
        ("USD", rest)
    } else {
        ("GBP", raw)
    };

    let cleaned: String = rest.chars().filter(|c| *c != ',' && *c != ' ').collect();
    let amount = Decimal::from_str(&cleaned).ok()?;
    Some((amount, currency))
}

/// Lenient decimal parse for API fields that arrive as "9.00", "-", or "".
pub fn parse_decimal_lenient(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "-" || raw == "–" {
        return None;
    }
    Decimal::from_str(raw).ok()
}

/// Parse a fractional starting price ("9/4", "evens") into a decimal price
/// (stake-inclusive, so 9/4 → 3.25, evens → 2.0).
pub fn parse_fractional_price(raw: &str) -> Option<Decimal> {
    let raw = raw.trim().to_lowercase();
    if raw.is_empty() {
        return None;
    }
    if raw == "evens" || raw == "evs" {
        return Some(Decimal::TWO);
    }
    let raw = raw.strip_suffix('f').unwrap_or(&raw); // "9/4F" marks the favourite
    let (num, den) = raw.split_once('/')?;
    let num = Decimal::from_str(num.trim()).ok()?;
    let den = Decimal::from_str(den.trim()).ok()?;
    if den <= Decimal::ZERO {
        return None;
    }
    Some(num / den + Decimal::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_weight_stones_pounds() {
        assert_eq!(parse_weight_lbs("8-13"), Some(8 * 14 + 13));
        assert_eq!(parse_weight_lbs("10-0"), Some(140));
        assert_eq!(parse_weight_lbs(" 9-7 "), Some(133));
    }

    #[test]
    fn test_parse_weight_bare_pounds() {
        assert_eq!(parse_weight_lbs("126"), Some(126));
    }

    #[test]
    fn test_parse_weight_rejects_malformed() {
        assert_eq!(parse_weight_lbs(""), None);
        assert_eq!(parse_weight_lbs("8-14"), None, "pounds part must be < 14");
        assert_eq!(parse_weight_lbs("st-lb"), None);
    }

    #[test]
    fn test_parse_distance_furlongs_only() {
        // 6f = 6 × 201.168 = 1207.008 → 1207
        assert_eq!(parse_distance_metres("6f"), Some(1207));
    }

    #[test]
    fn test_parse_distance_miles_and_furlongs() {
        // 1m2f = 10f = 2011.68 → 2012
        assert_eq!(parse_distance_metres("1m2f"), Some(2012));
    }

    #[test]
    fn test_parse_distance_bare_miles() {
        // 2m = 16f = 3218.688 → 3219
        assert_eq!(parse_distance_metres("2m"), Some(3219));
    }

    #[test]
    fn test_parse_distance_half_furlong() {
        // 7½f = 7.5 × 201.168 = 1508.76 → 1509
        assert_eq!(parse_distance_metres("7½f"), Some(1509));
    }

    #[test]
    fn test_parse_distance_explicit_metres() {
        assert_eq!(parse_distance_metres("1207"), Some(1207));
        assert_eq!(parse_distance_metres("100"), None, "below plausible range");
    }

    #[test]
    fn test_parse_distance_rejects_garbage() {
        assert_eq!(parse_distance_metres(""), None);
        assert_eq!(parse_distance_metres("about a mile"), None);
        // A trailing-m metres string must not be read as miles
        assert_eq!(parse_distance_metres("1207m"), None);
    }

    #[test]
    fn test_parse_currency_gbp() {
        let (amount, currency) = parse_currency_amount("£5,900").unwrap();
        assert_eq!(amount, Decimal::from(5900));
        assert_eq!(currency, "GBP");
    }

    #[test]
    fn test_parse_currency_eur() {
        let (amount, currency) = parse_currency_amount("€4,690").unwrap();
        assert_eq!(amount, Decimal::from(4690));
        assert_eq!(currency, "EUR");
    }

    #[test]
    fn test_parse_currency_plain_number_defaults_gbp() {
        let (amount, currency) = parse_currency_amount("12345.50").unwrap();
        assert_eq!(amount, Decimal::from_str("12345.50").unwrap());
        assert_eq!(currency, "GBP");
    }

    #[test]
    fn test_parse_currency_empty() {
        assert_eq!(parse_currency_amount(""), None);
        assert_eq!(parse_currency_amount("  "), None);
    }

    #[test]
    fn test_parse_decimal_lenient() {
        assert_eq!(
            parse_decimal_lenient("9.00"),
            Some(Decimal::from_str("9.00").unwrap())
        );
        assert_eq!(parse_decimal_lenient("-"), None);
        assert_eq!(parse_decimal_lenient(""), None);
    }

    #[test]
    fn test_parse_fractional_price() {
        assert_eq!(
            parse_fractional_price("9/4"),
            Some(Decimal::from_str("3.25").unwrap())
        );
        assert_eq!(parse_fractional_price("evens"), Some(Decimal::TWO));
        // Favourite marker is tolerated
        assert_eq!(
            parse_fractional_price("5/2F"),
            Some(Decimal::from_str("3.5").unwrap())
        );
        assert_eq!(parse_fractional_price("no price"), None);
    }
}
