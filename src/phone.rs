//! Phone number validation for the pair endpoint.
//!
//! Accepts anything the user might paste (spaces, dashes, a leading `+`)
//! and reduces it to the bare international digit string WhatsApp expects.

use anyhow::{Result, bail};

/// Guidance returned whenever a number fails validation.
pub const INVALID_NUMBER_HINT: &str = "Invalid phone number. Enter your full international \
     number (e.g. 15551234567 for US, 447911123456 for UK, 84987654321 for Vietnam) \
     without + or spaces.";

/// Reduce `raw` to its E.164 digit string.
///
/// The shape check is deliberately loose: 7-15 digits with a non-zero
/// country code. Real reachability is decided by the pairing server.
pub fn normalize(raw: &str) -> Result<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.is_empty() {
        bail!("{INVALID_NUMBER_HINT}");
    }
    if !(7..=15).contains(&digits.len()) {
        bail!("{INVALID_NUMBER_HINT}");
    }
    // E.164 country codes never start with 0.
    if digits.starts_with('0') {
        bail!("{INVALID_NUMBER_HINT}");
    }

    Ok(digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_us_number() {
        assert_eq!(normalize("15551234567").unwrap(), "15551234567");
    }

    #[test]
    fn strips_plus_spaces_and_dashes() {
        assert_eq!(normalize("+44 7911-123456").unwrap(), "447911123456");
    }

    #[test]
    fn strips_jid_style_suffix_digits_only() {
        // Users sometimes paste the full JID; everything non-digit goes.
        assert_eq!(normalize("15551234567@s.whatsapp.net").unwrap(), "15551234567");
    }

    #[test]
    fn rejects_empty() {
        assert!(normalize("").is_err());
        assert!(normalize("+- ()").is_err());
    }

    #[test]
    fn rejects_too_short_and_too_long() {
        assert!(normalize("12345").is_err());
        assert!(normalize("1234567890123456").is_err());
    }

    #[test]
    fn rejects_leading_zero() {
        assert!(normalize("0123456789").is_err());
    }

    #[test]
    fn error_carries_guidance() {
        let err = normalize("abc").unwrap_err();
        assert!(err.to_string().contains("full international"));
    }
}
