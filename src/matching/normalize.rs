// src/matching/normalize.rs - Payee name normalization shared by the classifier and matchers
use once_cell::sync::Lazy;
use regex::Regex;

const NOISE_PREFIXES: [&str; 4] = ["zzz - ", "void - ", "do not use - ", "re-add "];

const LEADING_ARTICLES: [&str; 3] = ["the ", "a ", "an "];

/// Legal-form suffixes that carry no identity. Checked repeatedly so "acme co inc" loses both.
const CORPORATE_SUFFIXES: [&str; 22] = [
    " incorporated",
    " inc",
    " corporation",
    " corp",
    " limited liability company",
    " llc",
    " limited",
    " ltd",
    " limited partnership",
    " lp",
    " llp",
    " company",
    " co",
    " plc",
    " pllc",
    " pc",
    " pa",
    " gmbh",
    " pty",
    " dba",
    " et al",
    " holdings",
];

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N} ]+").unwrap());
static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static TRAILING_PAREN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\([^)]*\)\s*$").unwrap());

/// Lower-cases, strips punctuation, noise prefixes, leading articles and legal-form suffixes.
pub fn normalize_payee_name(raw: &str) -> String {
    let mut normalized = raw.trim().to_lowercase();

    for prefix in &NOISE_PREFIXES {
        if let Some(stripped) = normalized.strip_prefix(prefix) {
            normalized = stripped.trim().to_string();
        }
    }

    normalized = TRAILING_PAREN.replace(&normalized, "").to_string();

    let char_substitutions = [("&", " and "), ("+", " plus "), ("'", "")];
    for (pattern, replacement) in &char_substitutions {
        normalized = normalized.replace(pattern, replacement);
    }

    normalized = NON_ALNUM.replace_all(&normalized, " ").to_string();
    normalized = MULTI_SPACE.replace_all(normalized.trim(), " ").to_string();

    for article in &LEADING_ARTICLES {
        if let Some(stripped) = normalized.strip_prefix(article) {
            normalized = stripped.to_string();
        }
    }

    loop {
        let before = normalized.len();
        for suffix in &CORPORATE_SUFFIXES {
            if normalized.ends_with(suffix) && normalized.len() > suffix.len() {
                normalized = normalized[..normalized.len() - suffix.len()]
                    .trim_end()
                    .to_string();
            }
        }
        if normalized.len() == before {
            break;
        }
    }

    normalized
}

/// Tokens of a normalized name, ignoring one-character fragments.
pub fn name_tokens(normalized: &str) -> Vec<&str> {
    normalized
        .split_whitespace()
        .filter(|t| t.chars().count() >= 2)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffixes_and_punctuation() {
        assert_eq!(normalize_payee_name("  ACME Supply, Inc. "), "acme supply");
        assert_eq!(normalize_payee_name("Acme Co. Inc."), "acme");
        assert_eq!(normalize_payee_name("Smith & Sons LLC"), "smith and sons");
        assert_eq!(normalize_payee_name("O'Reilly Auto Parts"), "oreilly auto parts");
    }

    #[test]
    fn test_prefixes_and_articles() {
        assert_eq!(normalize_payee_name("ZZZ - The Home Depot"), "home depot");
        assert_eq!(normalize_payee_name("VOID - Grainger (Main Acct)"), "grainger");
    }

    #[test]
    fn test_suffix_only_name_is_kept() {
        // Nothing left to strip down to.
        assert_eq!(normalize_payee_name("Company"), "company");
        assert_eq!(normalize_payee_name(""), "");
    }

    #[test]
    fn test_non_latin_names_survive() {
        assert_eq!(normalize_payee_name("Société Générale S.A."), "société générale s a");
        assert_eq!(normalize_payee_name("ООО «Ромашка»"), "ооо ромашка");
        assert_eq!(normalize_payee_name("東京電力"), "東京電力");
        assert_eq!(name_tokens("東京電力 x"), vec!["東京電力"]);
    }

    #[test]
    fn test_name_tokens() {
        assert_eq!(name_tokens("a b acme supply"), vec!["acme", "supply"]);
    }
}
