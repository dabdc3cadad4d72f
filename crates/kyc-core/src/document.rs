//! Identity documents and the rules used to validate their extracted fields.
//!
//! Validation never fails with an error: every missing or malformed field
//! simply fails the corresponding sub-check and is reported in
//! [`ValidationResult::errors`].

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ─── Document types ──────────────────────────────────────────────────────────

/// The kind of identity document being captured.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DocumentType {
  Passport,
  NationalIdCard,
  DriversLicense,
  ResidencePermit,
}

impl DocumentType {
  /// Whether a back-side image must be captured for this document.
  pub fn requires_back(self) -> bool { !matches!(self, Self::Passport) }

  /// The check-digit scheme printed on this document type.
  pub fn checksum_scheme(self) -> ChecksumScheme {
    match self {
      Self::Passport | Self::NationalIdCard | Self::ResidencePermit => {
        ChecksumScheme::Icao9303
      }
      Self::DriversLicense => ChecksumScheme::None,
    }
  }

  /// Document-number format used when a jurisdiction does not override it.
  pub fn default_number_format(self) -> NumberFormat {
    match self {
      Self::Passport => NumberFormat::Shape {
        min_len: 7,
        max_len: 10,
        charset: Charset::Alphanumeric,
      },
      Self::NationalIdCard | Self::ResidencePermit => NumberFormat::Shape {
        min_len: 6,
        max_len: 13,
        charset: Charset::Alphanumeric,
      },
      Self::DriversLicense => NumberFormat::Shape {
        min_len: 5,
        max_len: 16,
        charset: Charset::Alphanumeric,
      },
    }
  }
}

/// Which face of a document an image shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DocumentSide {
  Front,
  Back,
}

// ─── Number format ───────────────────────────────────────────────────────────

/// Characters allowed in a document number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Charset {
  Digits,
  /// Uppercase ASCII letters and digits.
  Alphanumeric,
}

impl Charset {
  fn allows(self, c: char) -> bool {
    match self {
      Self::Digits => c.is_ascii_digit(),
      Self::Alphanumeric => c.is_ascii_uppercase() || c.is_ascii_digit(),
    }
  }
}

/// What a valid document number looks like, after normalisation.
///
/// In configuration a format is either `{ pattern = "..." }` or
/// `{ min_len, max_len, charset }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberFormat {
  /// Positional rules, e.g. two letters followed by seven digits.
  Pattern { pattern: NumberPattern },
  Shape {
    min_len: usize,
    max_len: usize,
    charset: Charset,
  },
}

impl NumberFormat {
  pub fn matches(&self, number: &str) -> bool {
    match self {
      Self::Pattern { pattern } => pattern.is_match(number),
      Self::Shape { min_len, max_len, charset } => {
        let len = number.chars().count();
        len >= *min_len && len <= *max_len && number.chars().all(|c| charset.allows(c))
      }
    }
  }
}

/// A regular expression that must match the whole document number.
///
/// Serialised as the expression it was built from; an expression that does
/// not compile is rejected when the configuration is read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NumberPattern {
  source: String,
  /// `source` anchored at both ends.
  whole:  Regex,
}

impl NumberPattern {
  pub fn new(source: impl Into<String>) -> Result<Self, regex::Error> {
    let source = source.into();
    let whole = Regex::new(&format!("^(?:{source})$"))?;
    Ok(Self { source, whole })
  }

  pub fn as_str(&self) -> &str { &self.source }

  pub fn is_match(&self, number: &str) -> bool { self.whole.is_match(number) }
}

impl PartialEq for NumberPattern {
  fn eq(&self, other: &Self) -> bool { self.source == other.source }
}

impl Eq for NumberPattern {}

impl TryFrom<String> for NumberPattern {
  type Error = regex::Error;

  fn try_from(source: String) -> Result<Self, Self::Error> { Self::new(source) }
}

impl From<NumberPattern> for String {
  fn from(pattern: NumberPattern) -> Self { pattern.source }
}

// ─── Checksums ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumScheme {
  /// ICAO 9303 machine-readable-zone check digit (weights 7, 3, 1) carried as
  /// the final character of the number.
  Icao9303,
  None,
}

impl ChecksumScheme {
  pub fn verify(self, number: &str) -> bool {
    match self {
      Self::None => true,
      Self::Icao9303 => {
        let Some(last) = number.chars().last() else {
          return false;
        };
        let Some(expected) = last.to_digit(10) else {
          return false;
        };
        let body = &number[..number.len() - last.len_utf8()];
        if body.is_empty() {
          return false;
        }
        icao_check_digit(body) == Some(expected)
      }
    }
  }
}

/// Compute the ICAO 9303 check digit for `field`.
///
/// Returns `None` if the field contains characters outside the MRZ alphabet.
pub fn icao_check_digit(field: &str) -> Option<u32> {
  const WEIGHTS: [u32; 3] = [7, 3, 1];
  let mut sum = 0u32;
  for (i, c) in field.chars().enumerate() {
    let value = match c {
      '0'..='9' => c.to_digit(10)?,
      'A'..='Z' => c as u32 - 'A' as u32 + 10,
      '<' => 0,
      _ => return None,
    };
    sum += value * WEIGHTS[i % 3];
  }
  Some(sum % 10)
}

// ─── Jurisdiction rules ──────────────────────────────────────────────────────

/// Per-jurisdiction toggles and thresholds for document validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JurisdictionRules {
  pub min_age:        u32,
  pub check_format:   bool,
  pub check_checksum: bool,
  pub check_expiry:   bool,
  pub check_age:      bool,
  /// Overrides for [`DocumentType::default_number_format`].
  pub number_formats: HashMap<DocumentType, NumberFormat>,
}

impl Default for JurisdictionRules {
  fn default() -> Self {
    Self {
      min_age:        18,
      check_format:   true,
      check_checksum: true,
      check_expiry:   true,
      check_age:      true,
      number_formats: HashMap::new(),
    }
  }
}

impl JurisdictionRules {
  pub fn number_format(&self, document_type: DocumentType) -> NumberFormat {
    self
      .number_formats
      .get(&document_type)
      .cloned()
      .unwrap_or_else(|| document_type.default_number_format())
  }
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// A single reason a document failed validation. The string form is the
/// stable code stored alongside the session.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValidationError {
  MissingDocumentNumber,
  InvalidNumberFormat,
  ChecksumMismatch,
  MissingExpiry,
  DocumentExpired,
  MissingDateOfBirth,
  UnderMinimumAge,
  /// OCR produced usable fields but below the configured confidence.
  LowOcrConfidence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
  pub is_valid:       bool,
  pub format_valid:   bool,
  pub checksum_valid: bool,
  pub not_expired:    bool,
  pub age_valid:      bool,
  pub errors:         Vec<ValidationError>,
}

// ─── Validator ───────────────────────────────────────────────────────────────

/// Strip separators and upper-case a raw document number.
pub fn normalize_number(raw: &str) -> String {
  raw
    .chars()
    .filter(|c| !c.is_whitespace() && *c != '-')
    .flat_map(char::to_uppercase)
    .collect()
}

/// Full years between `date_of_birth` and `today`, or `None` for a birth date
/// in the future.
pub fn age_on(date_of_birth: NaiveDate, today: NaiveDate) -> Option<u32> {
  if date_of_birth > today {
    return None;
  }
  let mut years = today.year() - date_of_birth.year();
  if (today.month(), today.day()) < (date_of_birth.month(), date_of_birth.day()) {
    years -= 1;
  }
  u32::try_from(years).ok()
}

/// Validate extracted document fields against `rules`.
pub fn validate(
  document_type: DocumentType,
  number: Option<&str>,
  expiry: Option<NaiveDate>,
  date_of_birth: Option<NaiveDate>,
  rules: &JurisdictionRules,
  today: NaiveDate,
) -> ValidationResult {
  let number = number.map(normalize_number).filter(|n| !n.is_empty());
  let mut errors = Vec::new();

  let format_valid = number
    .as_deref()
    .is_some_and(|n| rules.number_format(document_type).matches(n));
  let checksum_valid = number
    .as_deref()
    .is_some_and(|n| document_type.checksum_scheme().verify(n));
  let not_expired = expiry.is_some_and(|e| e > today);
  let age_valid = date_of_birth
    .and_then(|dob| age_on(dob, today))
    .is_some_and(|age| age >= rules.min_age);

  if number.is_none() && (rules.check_format || rules.check_checksum) {
    errors.push(ValidationError::MissingDocumentNumber);
  } else {
    if rules.check_format && !format_valid {
      errors.push(ValidationError::InvalidNumberFormat);
    }
    if rules.check_checksum && !checksum_valid {
      errors.push(ValidationError::ChecksumMismatch);
    }
  }

  if rules.check_expiry && !not_expired {
    errors.push(match expiry {
      None => ValidationError::MissingExpiry,
      Some(_) => ValidationError::DocumentExpired,
    });
  }

  if rules.check_age && !age_valid {
    errors.push(match date_of_birth {
      None => ValidationError::MissingDateOfBirth,
      Some(_) => ValidationError::UnderMinimumAge,
    });
  }

  ValidationResult {
    is_valid: errors.is_empty(),
    format_valid,
    checksum_valid,
    not_expired,
    age_valid,
    errors,
  }
}
