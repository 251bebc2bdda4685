//! Identifier and contact validators.
//!
//! Every validator is strict: it returns `Err(ValidationError)` on bad input.
//! Callers that want lenient handling chain [`Lenient::lenient`], which turns
//! the failure into `None` (the "could not validate" sentinel) and logs it.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use phonenumber::country;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use phonenumber::country::Id as PhoneRegion;

static STANDARD_RUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\d.]+)-([\dk])").expect("static regex"));
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9.!#$%&’*+/=?^_`{|}~-]+@[a-zA-Z0-9-]+(?:\.[a-zA-Z0-9-]+)*$")
        .expect("static regex")
});
static PRO_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^PRO?\s*[-.]?\s*(?P<code>\d+)").expect("static regex"));

const MIN_RUT_BODY_LEN: usize = 6;
const MAX_RUT_BODY_LEN: usize = 12;

/// Connective words left lowercase when title-casing names.
const TITLE_IGNORE: &[&str] = &[
    "y", "e", "o", "u", "a", "al", "del", "de", "el", "la", "los", "las", "en", "para",
];
/// Surname particles, longest first. They glue to the next token and to the previous one.
const NAME_PARTICLES: &[&str] = &["de la", "de los", "de las", "del", "de"];
/// Prefixes that only glue forward.
const NAME_PREFIXES: &[(&str, &str)] = &[("san", "San")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationKind {
    Rut,
    Email,
    PhoneNumber,
    ProCode,
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rut => "RUT",
            Self::Email => "email address",
            Self::PhoneNumber => "phone number",
            Self::ProCode => "PRO code",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    Index(usize),
    Range(usize, usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validating {kind}: {value:?} is not valid{}", detail(.reason, .position))]
pub struct ValidationError {
    pub value: String,
    pub kind: ValidationKind,
    pub reason: Option<String>,
    pub position: Option<Position>,
}

fn detail(reason: &Option<String>, position: &Option<Position>) -> String {
    let mut out = String::new();
    if let Some(reason) = reason {
        out.push_str(", ");
        out.push_str(reason);
    }
    match position {
        Some(Position::Index(i)) => out.push_str(&format!(", at index {i}")),
        Some(Position::Range(a, b)) => out.push_str(&format!(", between indices {a} and {b}")),
        None => {}
    }
    out
}

impl ValidationError {
    pub fn new(value: impl Into<String>, kind: ValidationKind) -> Self {
        Self {
            value: value.into(),
            kind,
            reason: None,
            position: None,
        }
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }
}

/// Lenient handling of a validation result.
pub trait Lenient<T> {
    fn lenient(self) -> Option<T>;
}

impl<T> Lenient<T> for Result<T, ValidationError> {
    fn lenient(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(%err, "value could not be validated; continuing without it");
                None
            }
        }
    }
}

/// A Chilean national tax identifier whose check character has been verified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rut {
    body: u64,
    check: char,
}

impl Rut {
    pub fn body(&self) -> u64 {
        self.body
    }

    pub fn check_char(&self) -> char {
        self.check
    }

    /// `123456785`, the form identity providers expect in login fields.
    pub fn compact(&self) -> String {
        format!("{}{}", self.body, self.check)
    }
}

impl fmt::Display for Rut {
    /// `12.345.678-5`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.body.to_string();
        let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
        for (i, ch) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                grouped.push('.');
            }
            grouped.push(ch);
        }
        write!(f, "{grouped}-{}", self.check)
    }
}

impl FromStr for Rut {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_rut(s)
    }
}

impl TryFrom<String> for Rut {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_rut(&value)
    }
}

impl From<Rut> for String {
    fn from(value: Rut) -> Self {
        value.to_string()
    }
}

/// Check character for a RUT body: weights 2..=7 cycle over the digits from the
/// least significant one, and `11 - sum % 11` maps 11 to `0` and 10 to `k`.
pub fn rut_last_digit(body: &str) -> char {
    let sum: u32 = body
        .chars()
        .rev()
        .filter_map(|c| c.to_digit(10))
        .zip((2..=7).cycle())
        .map(|(digit, weight)| digit * weight)
        .sum();
    match 11 - (sum % 11) {
        11 => '0',
        10 => 'k',
        n => char::from_digit(n, 10).unwrap_or('0'),
    }
}

/// Validates and normalizes a RUT.
///
/// Accepts `12.345.678-5`, `12345678-5`, `123456785` and a bare body without
/// check character (`12345678`), in which case the check character is computed.
/// Without a hyphen the trailing digit is taken as check character only when it
/// matches the computed one.
pub fn validate_rut(raw: &str) -> Result<Rut, ValidationError> {
    let err = |reason: &str| ValidationError::new(raw, ValidationKind::Rut).because(reason);
    let value = raw.trim().to_lowercase();
    if value.is_empty() {
        return Err(err("it is empty"));
    }

    let (body, check) = if let Some(caps) = STANDARD_RUT_RE.captures(&value) {
        let body: String = caps[1].chars().filter(char::is_ascii_digit).collect();
        let check = caps[2].chars().next().unwrap_or_default();
        if rut_last_digit(&body) != check {
            let at = caps.get(2).map(|m| m.start()).unwrap_or_default();
            return Err(err("the check digit does not match").at(Position::Index(at)));
        }
        (body, check)
    } else {
        let cleaned: String = value
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == 'k')
            .collect();
        if cleaned.matches('k').count() > 1 || (cleaned.contains('k') && !cleaned.ends_with('k')) {
            return Err(err("unexpected character"));
        }
        match cleaned.strip_suffix('k') {
            Some(body) => {
                if rut_last_digit(body) != 'k' {
                    return Err(err("the check digit does not match"));
                }
                (body.to_string(), 'k')
            }
            None => {
                let Some(last) = cleaned.chars().last() else {
                    return Err(err("it has no digits"));
                };
                let head = &cleaned[..cleaned.len() - 1];
                if !head.is_empty() && rut_last_digit(head) == last {
                    (head.to_string(), last)
                } else {
                    let check = rut_last_digit(&cleaned);
                    (cleaned, check)
                }
            }
        }
    };

    // Leading zeros carry no weight in the check digit and are not kept.
    let significant = body.trim_start_matches('0');
    if significant.is_empty() {
        return Err(err("the body is zero"));
    }
    if significant.len() < MIN_RUT_BODY_LEN {
        return Err(err("too short"));
    }
    if significant.len() > MAX_RUT_BODY_LEN {
        return Err(err("too long"));
    }
    let body = significant.parse::<u64>().map_err(|e| err(&e.to_string()))?;
    Ok(Rut { body, check })
}

/// Validates an email address, lowercasing only the domain.
pub fn validate_email_address(raw: &str) -> Result<String, ValidationError> {
    let err = |reason: &str| ValidationError::new(raw, ValidationKind::Email).because(reason);
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(err("it is empty"));
    }
    if !EMAIL_RE.is_match(trimmed) {
        return Err(err("it has an invalid character or does not follow the format"));
    }
    match trimmed.split_once('@') {
        Some((user, domain)) => Ok(format!("{user}@{}", domain.to_lowercase())),
        None => Err(err("missing @")),
    }
}

/// Validates a phone number against the rules of `region` and returns it in E.164.
pub fn validate_phone_number(raw: &str, region: PhoneRegion) -> Result<String, ValidationError> {
    let err = |reason: String| ValidationError::new(raw, ValidationKind::PhoneNumber).because(reason);
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(err("it is empty".to_string()));
    }
    let parsed = phonenumber::parse(Some(region), trimmed)
        .map_err(|e| err(format!("libphonenumber rejected it: {e}")))?;
    if !phonenumber::is_valid(&parsed) {
        return Err(err("not a valid number for the region".to_string()));
    }
    Ok(parsed.format().mode(phonenumber::Mode::E164).to_string())
}

pub fn validate_cl_phone_number(raw: &str) -> Result<String, ValidationError> {
    validate_phone_number(raw, country::Id::CL)
}

/// Parses product codes written as `PRO 123`, `PR-123`, `pro.123`.
pub fn validate_pro_code(raw: &str) -> Result<i64, ValidationError> {
    let err = || {
        ValidationError::new(raw, ValidationKind::ProCode).because("it does not have the expected format")
    };
    let caps = PRO_CODE_RE.captures(raw.trim()).ok_or_else(err)?;
    caps["code"].parse().map_err(|_| err())
}

fn title_token(token: &str) -> String {
    let lower = token.to_lowercase();
    if TITLE_IGNORE.contains(&lower.as_str()) {
        return lower;
    }
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Title-cases every word except connectives.
pub fn title_word_ignoring(value: &str) -> String {
    value
        .split_whitespace()
        .map(title_token)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Finds a name prefix starting at `i`: (canonical text, tokens consumed, glues backwards).
fn prefix_at(tokens: &[String], i: usize) -> Option<(String, usize, bool)> {
    if i + 1 < tokens.len() {
        let pair = format!("{} {}", tokens[i], tokens[i + 1]).to_lowercase();
        if NAME_PARTICLES.contains(&pair.as_str()) {
            return Some((pair, 2, true));
        }
    }
    let single = tokens[i].to_lowercase();
    if NAME_PARTICLES.contains(&single.as_str()) {
        return Some((single, 1, true));
    }
    NAME_PREFIXES
        .iter()
        .find(|(raw, _)| *raw == single)
        .map(|(_, canonical)| (canonical.to_string(), 1, false))
}

fn join_prefixed_names(tokens: &[String]) -> Vec<String> {
    let mut parts: Vec<String> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if let Some((prefix, width, glues_back)) = prefix_at(tokens, i) {
            if let Some(next) = tokens.get(i + width) {
                let compound = format!("{prefix} {next}");
                match parts.last_mut() {
                    Some(prev) if glues_back => {
                        prev.push(' ');
                        prev.push_str(&compound);
                    }
                    _ => parts.push(compound),
                }
                i += width + 1;
                continue;
            }
        }
        parts.push(tokens[i].clone());
        i += 1;
    }
    parts
}

/// Splits a full name into (first names, last names).
pub fn normalize_full_name(raw: &str) -> (String, Option<String>) {
    let tokens: Vec<String> = raw.split_whitespace().map(title_token).collect();
    let parts = join_prefixed_names(&tokens);
    match parts.len() {
        0 => (String::new(), None),
        1 => (parts[0].clone(), None),
        2 => (parts[0].clone(), Some(parts[1].clone())),
        3 => (parts[0].clone(), Some(parts[1..].join(" "))),
        n => (parts[..n - 2].join(" "), Some(parts[n - 2..].join(" "))),
    }
}
