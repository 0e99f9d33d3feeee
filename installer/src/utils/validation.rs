// Input validation utilities

use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

fn non_alphanumeric_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9]+").expect("static slug regex is valid"))
}

/// ASCII spelling of accented Latin letters. Other non-ASCII characters are kept as is.
fn fold_latin(c: char) -> Option<&'static str> {
    Some(match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ą' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ą' => "A",
        'æ' => "ae",
        'Æ' => "AE",
        'ç' | 'ć' | 'č' => "c",
        'Ç' | 'Ć' | 'Č' => "C",
        'ď' | 'đ' | 'ð' => "d",
        'Ď' | 'Đ' | 'Ð' => "D",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => "e",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ę' | 'Ě' => "E",
        'ì' | 'í' | 'î' | 'ï' | 'ī' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' => "I",
        'ł' => "l",
        'Ł' => "L",
        'ñ' | 'ń' | 'ň' => "n",
        'Ñ' | 'Ń' | 'Ň' => "N",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => "O",
        'œ' => "oe",
        'Œ' => "OE",
        'ř' => "r",
        'Ř' => "R",
        'ś' | 'š' | 'ş' => "s",
        'Ś' | 'Š' | 'Ş' => "S",
        'ß' => "ss",
        'ť' | 'ţ' => "t",
        'Ť' | 'Ţ' => "T",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' => "U",
        'ý' | 'ÿ' => "y",
        'Ý' | 'Ÿ' => "Y",
        'ź' | 'ż' | 'ž' => "z",
        'Ź' | 'Ż' | 'Ž' => "Z",
        'þ' => "th",
        'Þ' => "TH",
        _ => return None,
    })
}

/// Stable application id derived from its display name.
///
/// Lowercase, runs of anything non-alphanumeric collapse to a single `-`, no leading or
/// trailing separators. `"My Cool App!"` becomes `"my-cool-app"`. Accented Latin letters are
/// spelled in ASCII first (`"Café"` becomes `"cafe"`); other scripts are dropped.
pub fn generate_id(name: &str) -> String {
    let mut folded = String::with_capacity(name.len());
    for c in name.trim().chars() {
        match fold_latin(c) {
            Some(ascii) => folded.push_str(ascii),
            None => folded.push(c),
        }
    }
    non_alphanumeric_runs()
        .replace_all(&folded, "-")
        .trim_matches('-')
        .to_ascii_lowercase()
}

/// Capitalize the first letter of every whitespace/underscore/dash separated word.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut at_word_start = true;
    for c in input.chars() {
        if at_word_start && c.is_alphabetic() {
            out.extend(c.to_uppercase());
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = c.is_whitespace() || c == '_' || c == '-';
        }
    }
    out
}

/// Validate a TCP port field value.
pub fn validate_port(value: &str) -> Result<u16> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(anyhow::anyhow!("Port cannot be empty"));
    }
    let port: u16 = trimmed
        .parse()
        .map_err(|_| anyhow::anyhow!("Port must be a number between 1 and 65535"))?;
    if port == 0 {
        return Err(anyhow::anyhow!("Port must be a number between 1 and 65535"));
    }
    Ok(port)
}

/// Validate database name (MySQL / PostgreSQL common subset)
pub fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow::anyhow!("Database name cannot be empty"));
    }

    if name.len() > 63 {
        return Err(anyhow::anyhow!("Database name cannot exceed 63 characters"));
    }

    let invalid_chars = ['/', '\\', '.', '\0', '`', '"', '\''];
    if name.chars().any(|c| invalid_chars.contains(&c)) {
        return Err(anyhow::anyhow!("Database name contains invalid characters"));
    }

    Ok(())
}
