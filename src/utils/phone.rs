/// Country code prefixed to numbers that look local.
pub const DEFAULT_COUNTRY_CODE: &str = "61";

/// Normalise a phone number to the digits-only international form the gateway
/// expects. `+61 412 345 678` and `0412 345 678` both become `61412345678`.
pub fn format_international(number: &str, country_code: &str) -> String {
    let number = number.trim();
    if let Some(rest) = number.strip_prefix('+') {
        return rest.chars().filter(|c| c.is_ascii_digit()).collect();
    }

    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return digits;
    }
    if digits.len() <= 10 {
        return format!("{}{}", country_code, digits.trim_start_matches('0'));
    }
    digits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plus_prefix_is_stripped() {
        assert_eq!(format_international("+61 412 345 678", "61"), "61412345678");
        assert_eq!(format_international("+14155550100", "61"), "14155550100");
    }

    #[test]
    fn test_local_number_gets_country_code() {
        assert_eq!(format_international("0412 345 678", DEFAULT_COUNTRY_CODE), "61412345678");
        assert_eq!(format_international("412345678", DEFAULT_COUNTRY_CODE), "61412345678");
    }

    #[test]
    fn test_international_without_plus_is_kept() {
        assert_eq!(format_international("61412345678", "61"), "61412345678");
    }

    #[test]
    fn test_empty_stays_empty() {
        assert_eq!(format_international("  ", "61"), "");
    }
}
