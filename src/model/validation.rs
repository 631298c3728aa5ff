//! Field validation for coasters and wagons
//!
//! The replication core never validates; writers run these checks
//! before a record is saved or published.

use serde::Serialize;

use super::coaster::parse_clock;
use super::{Coaster, Wagon};

/// Collected validation messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors {
    pub errors: Vec<String>,
}

impl ValidationErrors {
    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Coerce a required whole number field
    pub fn count(&mut self, field: &str, value: Option<f64>) -> u32 {
        match value {
            None => {
                self.push(format!("{} is required.", field));
                0
            }
            Some(v) if !v.is_finite() || v.fract() != 0.0 || v < 0.0 || v > f64::from(u32::MAX) => {
                self.push(format!("{} must be a whole number.", field));
                0
            }
            Some(v) => v as u32,
        }
    }

    /// Coerce a required numeric field
    pub fn number(&mut self, field: &str, value: Option<f64>) -> f64 {
        match value {
            None => {
                self.push(format!("{} is required.", field));
                0.0
            }
            Some(v) if !v.is_finite() => {
                self.push(format!("{} must be a number.", field));
                0.0
            }
            Some(v) => v,
        }
    }

    /// Coerce a required text field
    pub fn text(&mut self, field: &str, value: Option<String>) -> String {
        match value {
            Some(v) => v,
            None => {
                self.push(format!("{} is required.", field));
                String::new()
            }
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.errors.join(" "))
    }
}

/// Validate a wagon
pub fn validate_wagon(wagon: &Wagon) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    check_wagon(wagon, &mut errors);
    errors.into_result()
}

fn check_wagon(wagon: &Wagon, errors: &mut ValidationErrors) {
    if wagon.id.is_empty() {
        errors.push("wagon id cannot be empty.");
    }
    if !(wagon.speed > 0.0) {
        errors.push("speed must be greater than 0.");
    }
    if wagon.seats_count == 0 {
        errors.push("seats_count must be greater than 0.");
    }
}

/// Validate a coaster including all of its wagons
pub fn validate_coaster(coaster: &Coaster) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();

    if coaster.id.is_empty() {
        errors.push("id cannot be empty.");
    }
    if coaster.staff_total == 0 {
        errors.push("staff_total must be greater than 0.");
    }
    if coaster.clients_total == 0 {
        errors.push("clients_total must be greater than 0.");
    }
    if !(coaster.route_length > 0.0) {
        errors.push("route_length must be greater than 0.");
    }

    let opening = parse_clock(&coaster.opening_time);
    let closing = parse_clock(&coaster.closing_time);
    if opening.is_none() {
        errors.push("opening_time must be a 24h time between 00:00 and 23:59 (HH:MM).");
    }
    if closing.is_none() {
        errors.push("closing_time must be a 24h time between 00:00 and 23:59 (HH:MM).");
    }
    if let (Some(open), Some(close)) = (opening, closing) {
        if open >= close {
            errors.push("opening_time must be earlier than closing_time.");
        }
    }

    for wagon in &coaster.wagons {
        check_wagon(wagon, &mut errors);
    }

    errors.into_result()
}
