//! Plate text validation and vehicle classification.
//!
//! Recognized text must match one of two mutually exclusive grammars:
//!
//! - standard state-coded plates, `SSDDLLLNNNN` (`SS` state code, two
//!   district digits, one-to-three series letters, four digits), with the
//!   state code checked against the official list;
//! - Bharat-series national plates, `YYBHNNNNLL` (registration year,
//!   literal `BH`, four digits, two letters excluding I and O).
//!
//! Vehicle type is derived from which grammar/sub-pattern matched; it is
//! a pure function of the validated text, not a model call. A detection
//! is never persisted for text that matches neither grammar.

use regex::Regex;
use std::sync::OnceLock;

const STATE_CODES: &[&str] = &[
    "AP", "AR", "AS", "BR", "CG", "GA", "GJ", "HR", "HP", "JH", "KA", "KL", "MP", "MH", "MN",
    "ML", "MZ", "NL", "OD", "PB", "RJ", "SK", "TN", "TS", "TR", "UP", "UK", "WB", "AN", "CH",
    "DN", "DL", "JK", "LA", "LD", "PY",
];

fn standard_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Z]{2})(\d{2})([A-Z]{1,3})(\d{4})$").expect("valid regex"))
}

fn bharat_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{2})BH(\d{4})([A-HJ-NP-Z]{2})$").expect("valid regex"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlateGrammar {
    /// State-coded plate, e.g. `MH01AB1234`.
    Standard,
    /// National Bharat series, e.g. `22BH1234AB`.
    BharatSeries,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VehicleType {
    Passenger,
    TwoWheeler,
    Commercial,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Passenger => "PASSENGER",
            VehicleType::TwoWheeler => "TWO_WHEELER",
            VehicleType::Commercial => "COMMERCIAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PASSENGER" => Some(VehicleType::Passenger),
            "TWO_WHEELER" => Some(VehicleType::TwoWheeler),
            "COMMERCIAL" => Some(VehicleType::Commercial),
            _ => None,
        }
    }
}

/// A validated, normalized plate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidPlate {
    pub text: String,
    pub grammar: PlateGrammar,
    pub vehicle_type: VehicleType,
}

/// Validator for the supported registration grammars.
pub struct PlateValidator;

impl PlateValidator {
    /// Normalize and validate recognized text. `None` means the text
    /// matches neither grammar and must be dropped.
    pub fn validate(text: &str) -> Option<ValidPlate> {
        let normalized: String = text
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect::<String>()
            .to_uppercase();

        if let Some(caps) = standard_pattern().captures(&normalized) {
            let state = caps.get(1).map(|m| m.as_str())?;
            if !STATE_CODES.contains(&state) {
                return None;
            }
            let series = caps.get(3).map(|m| m.as_str())?;
            return Some(ValidPlate {
                vehicle_type: classify_standard(series),
                text: normalized,
                grammar: PlateGrammar::Standard,
            });
        }

        if bharat_pattern().is_match(&normalized) {
            // Bharat series registration is limited to private vehicles.
            return Some(ValidPlate {
                text: normalized,
                grammar: PlateGrammar::BharatSeries,
                vehicle_type: VehicleType::Passenger,
            });
        }

        None
    }
}

/// Classification table for standard plates, keyed on the series letters.
fn classify_standard(series: &str) -> VehicleType {
    if series.starts_with('T') {
        VehicleType::Commercial
    } else if series.len() == 1 {
        VehicleType::TwoWheeler
    } else {
        VehicleType::Passenger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_plate_validates() {
        let plate = PlateValidator::validate("MH01AB1234").expect("valid plate");
        assert_eq!(plate.grammar, PlateGrammar::Standard);
        assert_eq!(plate.vehicle_type, VehicleType::Passenger);
    }

    #[test]
    fn whitespace_and_case_are_normalized() {
        let plate = PlateValidator::validate(" mh 01 ab 1234 ").expect("valid plate");
        assert_eq!(plate.text, "MH01AB1234");
    }

    #[test]
    fn unknown_state_code_is_rejected() {
        assert!(PlateValidator::validate("XX01AB1234").is_none());
    }

    #[test]
    fn garbled_ocr_output_is_rejected() {
        assert!(PlateValidator::validate("MHO1AB1Z34").is_none());
        assert!(PlateValidator::validate("NOT_FOUND").is_none());
        assert!(PlateValidator::validate("").is_none());
    }

    #[test]
    fn bharat_series_validates_and_classifies_passenger() {
        let plate = PlateValidator::validate("22BH1234AB").expect("valid plate");
        assert_eq!(plate.grammar, PlateGrammar::BharatSeries);
        assert_eq!(plate.vehicle_type, VehicleType::Passenger);
    }

    #[test]
    fn bharat_series_rejects_i_and_o_letters() {
        assert!(PlateValidator::validate("22BH1234IO").is_none());
        assert!(PlateValidator::validate("22BH1234AO").is_none());
    }

    #[test]
    fn transport_series_classifies_commercial() {
        let plate = PlateValidator::validate("KA05TA9999").expect("valid plate");
        assert_eq!(plate.vehicle_type, VehicleType::Commercial);
    }

    #[test]
    fn single_letter_series_classifies_two_wheeler() {
        let plate = PlateValidator::validate("DL05C1234").expect("valid plate");
        assert_eq!(plate.vehicle_type, VehicleType::TwoWheeler);
    }
}
