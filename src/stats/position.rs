//! Finishing-position canonicalisation.
//!
//! The API renders positions inconsistently: integers, numeric strings,
//! ordinal strings ("1st"), the word "WON", and a family of non-finisher
//! codes (fell, pulled up, unseated rider, …). Every downstream counter
//! folds over the canonical form produced here: an integer 1..N for
//! finishers, `NonFinisher` or `Disqualified` otherwise. Non-finishers
//! count as runs but never as placings.

/// Canonical outcome of a runner's race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Finished(i32),
    NonFinisher,
    Disqualified,
}

impl Position {
    /// The finishing position for finishers, `None` otherwise. This is the
    /// value stored in the nullable `position` columns.
    pub fn as_finish(self) -> Option<i32> {
        match self {
            Position::Finished(n) => Some(n),
            _ => None,
        }
    }

    pub fn is_win(self) -> bool {
        matches!(self, Position::Finished(1))
    }

    pub fn is_place(self) -> bool {
        matches!(self, Position::Finished(n) if n <= 3)
    }
}

/// Non-finisher codes seen in result documents: fell, pulled up, unseated
/// rider, brought down, ran out, slipped up, refused, left at start.
const NON_FINISHER_CODES: &[&str] = &["F", "PU", "U", "UR", "BD", "RO", "SU", "REF", "R", "LFT"];

/// Disqualification codes. Void races also land here.
const DISQUALIFIED_CODES: &[&str] = &["DSQ", "DQ", "DIS", "VOI", "VOID"];

/// Canonicalise a raw position value. Returns `None` when the field is
/// empty or unrecognisable (no result recorded for this runner).
pub fn parse_position(raw: &str) -> Option<Position> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let upper = trimmed.to_uppercase();

    if DISQUALIFIED_CODES.contains(&upper.as_str()) {
        return Some(Position::Disqualified);
    }
    if NON_FINISHER_CODES.contains(&upper.as_str()) {
        return Some(Position::NonFinisher);
    }
    if upper == "WON" || upper == "WIN" {
        return Some(Position::Finished(1));
    }

    // "1st", "2nd", "3rd", "4th", ... and plain integers
    let digits: String = upper.chars().take_while(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() {
        let tail = &upper[digits.len()..];
        if tail.is_empty() || matches!(tail, "ST" | "ND" | "RD" | "TH") {
            let n: i32 = digits.parse().ok()?;
            if n >= 1 {
                return Some(Position::Finished(n));
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_integers() {
        assert_eq!(parse_position("1"), Some(Position::Finished(1)));
        assert_eq!(parse_position("12"), Some(Position::Finished(12)));
        assert_eq!(parse_position(" 3 "), Some(Position::Finished(3)));
    }

    #[test]
    fn test_ordinals_and_won() {
        assert_eq!(parse_position("1st"), Some(Position::Finished(1)));
        assert_eq!(parse_position("2nd"), Some(Position::Finished(2)));
        assert_eq!(parse_position("4th"), Some(Position::Finished(4)));
        assert_eq!(parse_position("WON"), Some(Position::Finished(1)));
        assert_eq!(parse_position("won"), Some(Position::Finished(1)));
    }

    #[test]
    fn test_non_finishers() {
        for code in ["F", "PU", "U", "UR", "BD", "ro", "su"] {
            assert_eq!(
                parse_position(code),
                Some(Position::NonFinisher),
                "code {code} should be a non-finisher"
            );
        }
    }

    #[test]
    fn test_disqualified() {
        assert_eq!(parse_position("DSQ"), Some(Position::Disqualified));
        assert_eq!(parse_position("dq"), Some(Position::Disqualified));
        assert_eq!(parse_position("VOID"), Some(Position::Disqualified));
    }

    #[test]
    fn test_empty_and_garbage() {
        assert_eq!(parse_position(""), None);
        assert_eq!(parse_position("  "), None);
        assert_eq!(parse_position("n/a"), None);
        assert_eq!(parse_position("0"), None, "positions are 1-based");
    }

    #[test]
    fn test_counting_semantics() {
        assert!(parse_position("1").unwrap().is_win());
        assert!(parse_position("3").unwrap().is_place());
        assert!(!parse_position("4").unwrap().is_place());
        // Non-finishers are runs but never placings
        assert_eq!(parse_position("PU").unwrap().as_finish(), None);
        assert!(!parse_position("PU").unwrap().is_place());
        assert_eq!(parse_position("DSQ").unwrap().as_finish(), None);
    }
}
