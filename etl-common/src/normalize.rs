//! Shared normalization helpers used by every per-source normalizer.
//!
//! Each source spells gender, channel, dates, amounts and countries its own
//! way; these functions fold them into the warehouse's canonical forms.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::error::ParseError;

/// Canonical gender values for `dw.dim_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gender {
    Male,
    Female,
    Unspecified,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "Male",
            Gender::Female => "Female",
            Gender::Unspecified => "Unspecified",
        }
    }
}

/// Total over all inputs: any string (or absence of one) maps to exactly one
/// of the three canonical values. Unknown codes become `Unspecified`.
pub fn normalize_gender(raw: Option<&str>) -> Gender {
    let Some(raw) = raw else {
        return Gender::Unspecified;
    };
    match raw.trim().to_uppercase().as_str() {
        "M" | "MALE" | "MASCULINO" | "H" | "HOMBRE" => Gender::Male,
        "F" | "FEMALE" | "FEMENINO" | "MUJER" => Gender::Female,
        _ => Gender::Unspecified,
    }
}

/// Map known channel synonyms onto the closed set WEB / STORE / APP /
/// PARTNER. An unrecognized value passes through trimmed but otherwise
/// unchanged so downstream reporting surfaces new channels instead of
/// silently merging them. A missing channel defaults to WEB.
pub fn normalize_channel(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return "WEB".to_owned();
    };
    let trimmed = raw.trim();
    match trimmed.to_uppercase().as_str() {
        "" | "WEB" | "ONLINE" | "ECOMMERCE" => "WEB".to_owned(),
        "STORE" | "TIENDA" | "RETAIL" | "FISICA" => "STORE".to_owned(),
        "APP" | "MOBILE" | "MOVIL" => "APP".to_owned(),
        "PARTNER" | "SOCIO" | "ASOCIADO" => "PARTNER".to_owned(),
        _ => trimmed.to_owned(),
    }
}

const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y"];

/// Parse a date from any of the textual forms the sources emit:
/// `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS`, ISO-8601 with an offset, and the
/// slash/dash day-first variants. First matching format wins. Unparseable
/// input is an error, never a default date.
pub fn parse_date(raw: &str) -> Result<NaiveDate, ParseError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ParseError::Date(raw.to_owned()));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.date_naive());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.date());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }
    Err(ParseError::Date(raw.to_owned()))
}

/// Parse a monetary amount that may use either a comma or a period as the
/// decimal separator.
///
/// The heuristic is deliberately fuzzy (no source tags its locale): when both
/// characters occur, the rightmost one is taken as the decimal separator and
/// the other as a thousands separator; a lone comma followed by one or two
/// digits is a decimal comma; any other comma is a thousands separator.
pub fn parse_amount(raw: &str) -> Result<f64, ParseError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ParseError::Amount(raw.to_owned()));
    }

    let comma = s.rfind(',');
    let period = s.rfind('.');
    let cleaned = match (comma, period) {
        (Some(c), Some(p)) if c > p => s.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => s.replace(',', ""),
        (Some(c), None) => {
            let decimals = s.len() - c - 1;
            if (1..=2).contains(&decimals) && s[..c].matches(',').count() == 0 {
                s.replacen(',', ".", 1)
            } else {
                s.replace(',', "")
            }
        }
        _ => s.to_owned(),
    };

    if let Ok(value) = cleaned.parse::<f64>() {
        return Ok(value);
    }

    // Last resort: drop stray non-numeric characters (currency symbols,
    // spaces) and retry.
    let stripped: String = cleaned
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    stripped
        .parse::<f64>()
        .map_err(|_| ParseError::Amount(raw.to_owned()))
}

/// Country names the sources actually emit, keyed by their folded form.
const COUNTRIES: [(&str, &str); 18] = [
    ("costa rica", "CR"),
    ("nicaragua", "NI"),
    ("panama", "PA"),
    ("guatemala", "GT"),
    ("honduras", "HN"),
    ("el salvador", "SV"),
    ("mexico", "MX"),
    ("estados unidos", "US"),
    ("united states", "US"),
    ("colombia", "CO"),
    ("espana", "ES"),
    ("spain", "ES"),
    ("argentina", "AR"),
    ("chile", "CL"),
    ("peru", "PE"),
    ("ecuador", "EC"),
    ("brasil", "BR"),
    ("canada", "CA"),
];

/// Resolve a free-text country name to its ISO-3166 two-letter code.
/// Unresolved names return None and pass through unchanged upstream.
pub fn country_code(name: &str) -> Option<&'static str> {
    let key = name_key(name);
    COUNTRIES
        .iter()
        .find(|(country, _)| *country == key)
        .map(|(_, code)| *code)
}

/// Fold a SKU into the canonical dashed form: `SKU0042` becomes `SKU-0042`.
/// Anything else is passed through trimmed.
pub fn normalize_sku(raw: &str) -> String {
    let sku = raw.trim();
    let upper = sku.to_uppercase();
    if upper.starts_with("SKU") && !sku.contains('-') && sku.len() > 3 {
        format!("SKU-{}", &sku[3..])
    } else {
        sku.to_owned()
    }
}

/// Extract the numeric suffix of a SKU in either `SKU-0042` or `SKU0042`
/// form. Used to seed the resolver's generation counter above the highest
/// number already persisted.
pub fn sku_number(sku: &str) -> Option<u32> {
    let rest = sku.trim().strip_prefix("SKU")?;
    let digits = rest.strip_prefix('-').unwrap_or(rest);
    digits.parse().ok()
}

/// Case- and accent-insensitive key for product name/category grouping.
pub fn name_key(s: &str) -> String {
    s.trim().to_lowercase().chars().map(fold_diacritic).collect()
}

fn fold_diacritic(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'â' => 'a',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' => 'o',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        _ => c,
    }
}
