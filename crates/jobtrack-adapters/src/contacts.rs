//! Email and phone extraction from free-text listing bodies.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// Country calling code of the target locale.
pub const COUNTRY_CODE: &str = "93";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid email regex")
});

// Mobile plan: optional +93 / 93 / 0093, optional trunk 0, then 7 and eight digits.
static MOBILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?93|0093)?\s*0?7\d{8}\b").expect("valid mobile regex")
});

static PHONE_CHUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+|00)?\d[\d\s().-]{6,}\d").expect("valid phone chunk regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactInfo {
    pub emails: Vec<String>,
    pub phones: Vec<String>,
}

pub fn extract_contacts(text: &str) -> ContactInfo {
    ContactInfo {
        emails: extract_emails(text),
        phones: extract_phones(text),
    }
}

/// Lower-cased, deduplicated, sorted.
pub fn extract_emails(text: &str) -> Vec<String> {
    EMAIL_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Strip separators and fold `0093`/`93` prefixes into `+93`.
pub fn normalize_phone(raw: &str) -> String {
    let raw = raw.trim();
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let international = format!("00{COUNTRY_CODE}");
    if digits.starts_with(&international) {
        digits.drain(..2);
    }
    if digits.starts_with(COUNTRY_CODE) || raw.starts_with('+') {
        format!("+{digits}")
    } else {
        digits
    }
}

/// Union of the strict mobile pass and the loose digit-run pass, canonicalized and sorted.
pub fn extract_phones(text: &str) -> Vec<String> {
    let mut phones = BTreeSet::new();

    for m in MOBILE_RE.find_iter(text) {
        phones.insert(normalize_phone(m.as_str()));
    }

    for m in PHONE_CHUNK_RE.find_iter(text) {
        let raw = m.as_str();
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if !(7..=15).contains(&digits.len()) {
            continue;
        }
        let plausible = raw.starts_with('+')
            || digits.starts_with('0')
            || digits.starts_with('7')
            || digits.starts_with(COUNTRY_CODE);
        if plausible {
            phones.insert(normalize_phone(raw));
        }
    }

    phones.into_iter().filter(|p| !p.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_lowercased_and_deduplicated() {
        let text = "Send CV to Jobs@Example.com or jobs@example.com; cc hr.team+af@ngo-mail.org.af";
        assert_eq!(
            extract_emails(text),
            vec!["hr.team+af@ngo-mail.org.af".to_string(), "jobs@example.com".to_string()]
        );
        assert!(extract_emails("no contact here @ all").is_empty());
    }

    #[test]
    fn international_prefixes_collapse_to_same_value() {
        assert_eq!(normalize_phone("0093701234567"), "+93701234567");
        assert_eq!(normalize_phone("+93701234567"), "+93701234567");
        assert_eq!(normalize_phone("93 70 123 4567"), "+93701234567");
        assert_eq!(normalize_phone("070-123-4567"), "0701234567");
        assert_eq!(normalize_phone("+1 (555) 010-9999"), "+15550109999");
    }

    #[test]
    fn mixed_formats_are_recovered() {
        let text = "Call +93 70 123 4567, or 0093799887766. Office: 070-123-4567.";
        assert_eq!(
            extract_phones(text),
            vec![
                "+93701234567".to_string(),
                "+93799887766".to_string(),
                "0701234567".to_string(),
            ]
        );
    }

    #[test]
    fn number_noise_is_rejected() {
        // Short prices, references not starting with a phone-like prefix, and overlong runs.
        let text = "Salary 45000 AFN, ref 512-334-889, id 1234567890123456789";
        assert!(extract_phones(text).is_empty());
    }

    #[test]
    fn combined_contacts() {
        let info = extract_contacts("email me at Jobs@Example.com or call 0701234567");
        assert_eq!(info.emails, vec!["jobs@example.com".to_string()]);
        assert_eq!(info.phones, vec!["0701234567".to_string()]);
    }
}
