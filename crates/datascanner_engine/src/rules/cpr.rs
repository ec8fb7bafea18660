//! Danish CPR numbers: a date of birth, a serial number, and (mostly) a
//! modulus-11 checksum.

use super::regex::char_offset;
use super::SimpleRule;
use crate::conversions::{OutputType, OutputValue};
use crate::error::{EngineError, Result};
use ::regex::Regex;
use chrono::{Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};

pub const TYPE_LABEL: &str = "cpr";

/// Characters of context kept on each side of a match.
const CONTEXT_CHARS: usize = 50;
const REDACTED: &str = "XXXXXX-XXXX";
const WEIGHTS: [u32; 10] = [4, 3, 2, 7, 6, 5, 4, 3, 2, 1];

static CPR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([0-9]{2}\s?[0-9]{2}\s?[0-9]{2})(?:[\s\-/\.]|\s\-\s)?([0-9]{4})\b").expect("static regex")
});

/// Birth dates for which numbers were issued without a valid checksum.
const EXCEPTION_DATES: &[(i32, u32, u32)] = &[
    (1960, 1, 1),
    (1964, 1, 1),
    (1965, 1, 1),
    (1966, 1, 1),
    (1969, 1, 1),
    (1970, 1, 1),
    (1980, 1, 1),
    (1982, 1, 1),
    (1984, 1, 1),
    (1985, 1, 1),
    (1986, 1, 1),
    (1987, 1, 1),
    (1987, 12, 1),
    (1988, 1, 1),
    (1989, 1, 1),
    (1990, 1, 1),
    (1991, 1, 1),
    (1992, 1, 1),
];

/// Full year of birth from the two-digit year and the 7th digit of the
/// number.
pub fn resolve_year(yy: u32, seventh: u32) -> i32 {
    let century = match seventh {
        0..=3 => 1900,
        4 if yy <= 36 => 2000,
        4 => 1900,
        9 if yy <= 37 => 2000,
        9 => 1900,
        _ if yy <= 57 => 2000,
        _ => 1800,
    };
    century + yy as i32
}

/// The birth date a 10-digit CPR number encodes, if it is a real date.
/// With `ignore_irrelevant`, years before 1900 or more than two years from
/// now are rejected too.
pub fn birth_date(digits: &[u32; 10], ignore_irrelevant: bool) -> Option<NaiveDate> {
    let day = digits[0] * 10 + digits[1];
    let month = digits[2] * 10 + digits[3];
    let year = resolve_year(digits[4] * 10 + digits[5], digits[6]);
    if ignore_irrelevant && (year < 1900 || year > Utc::now().year() + 2) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Whether the number passes the checksum, or is exempt from it because of
/// its birth date.
pub fn modulus11_check(digits: &[u32; 10]) -> bool {
    let Some(born) = birth_date(digits, false) else {
        return false;
    };
    let exempt = EXCEPTION_DATES
        .iter()
        .any(|&(y, m, d)| NaiveDate::from_ymd_opt(y, m, d) == Some(born));
    exempt || digits.iter().zip(WEIGHTS).map(|(digit, weight)| digit * weight).sum::<u32>() % 11 == 0
}

fn parse_digits(birth: &str, serial: &str) -> Option<[u32; 10]> {
    let mut digits = [0u32; 10];
    let mut count = 0;
    for ch in birth.chars().chain(serial.chars()).filter(|ch| !ch.is_whitespace()) {
        *digits.get_mut(count)? = ch.to_digit(10)?;
        count += 1;
    }
    (count == 10).then_some(digits)
}

/// The substring between two character offsets.
fn char_slice(text: &str, from: usize, to: usize) -> &str {
    let byte_at = |n: usize| text.char_indices().nth(n).map_or(text.len(), |(i, _)| i);
    &text[byte_at(from)..byte_at(to)]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CprRule {
    modulus_11: bool,
    ignore_irrelevant: bool,
}

impl Default for CprRule {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl CprRule {
    pub fn new(modulus_11: bool, ignore_irrelevant: bool) -> Self {
        Self {
            modulus_11,
            ignore_irrelevant,
        }
    }

    pub(crate) fn from_json(obj: &Map<String, Value>) -> Result<Self> {
        let flag = |key: &str| match obj.get(key) {
            None => Ok(true),
            Some(value) => value
                .as_bool()
                .ok_or_else(|| EngineError::malformed(TYPE_LABEL, format!("'{}' must be a boolean", key))),
        };
        Ok(Self::new(flag("modulus_11")?, flag("ignore_irrelevant")?))
    }
}

impl SimpleRule for CprRule {
    fn type_label(&self) -> &'static str {
        TYPE_LABEL
    }

    fn operates_on(&self) -> OutputType {
        OutputType::Text
    }

    fn find_matches(&self, content: &OutputValue) -> Vec<Value> {
        let OutputValue::Text(text) = content else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for caps in CPR_PATTERN.captures_iter(text) {
            let (Some(whole), Some(birth), Some(serial)) = (caps.get(0), caps.get(1), caps.get(2)) else {
                continue;
            };
            let Some(digits) = parse_digits(birth.as_str(), serial.as_str()) else {
                continue;
            };
            if birth_date(&digits, self.ignore_irrelevant).is_none() {
                continue;
            }
            if self.modulus_11 && !modulus11_check(&digits) {
                continue;
            }

            let start = char_offset(text, whole.start());
            let end = char_offset(text, whole.end());
            let low = start.saturating_sub(CONTEXT_CHARS);
            let context = CPR_PATTERN.replace_all(char_slice(text, low, end + CONTEXT_CHARS), REDACTED);
            let shown: String = digits[..4].iter().map(u32::to_string).collect();
            found.push(json!({
                "offset": start,
                "match": format!("{}XXXXXX", shown),
                "context": context,
                "context_offset": start - low,
            }));
        }
        found
    }

    fn properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("modulus_11".to_string(), Value::Bool(self.modulus_11));
        props.insert("ignore_irrelevant".to_string(), Value::Bool(self.ignore_irrelevant));
        props
    }
}
