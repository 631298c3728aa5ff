//! Coaster and Wagon records

use serde::{Deserialize, Serialize};

use super::{Record, StatusReport};

/// Staff needed to run a coaster with no wagons
const BASE_STAFF: u32 = 1;
/// Additional staff per wagon
const STAFF_PER_WAGON: u32 = 2;
/// Boarding and unloading break added to every ride, in minutes
const RIDE_BREAK_MINUTES: u64 = 5;

/// A wagon running on a coaster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wagon {
    pub id: String,
    /// Speed in meters per second
    pub speed: f64,
    pub seats_count: u32,
}

/// A coaster with its wagons. This is the record replicated across the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coaster {
    pub id: String,
    pub staff_total: u32,
    pub clients_total: u32,
    /// Route length in meters
    pub route_length: f64,
    /// Opening time, `HH:MM`
    pub opening_time: String,
    /// Closing time, `HH:MM`
    pub closing_time: String,
    #[serde(default)]
    pub wagons: Vec<Wagon>,
}

/// Staffing condition of a coaster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaffingDelta {
    Balanced,
    Missing(u32),
    Excess(u32),
}

/// Capacity condition of a coaster against daily demand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityDelta {
    Sufficient,
    /// Seats missing to serve every client
    Short(u64),
    /// Capacity is at least double the demand
    Excess,
}

/// Advisory status of a coaster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoasterStatus {
    pub staffing: StaffingDelta,
    pub capacity: CapacityDelta,
}

impl CoasterStatus {
    /// Human readable problems; empty when everything is in order
    pub fn messages(&self) -> Vec<String> {
        let mut messages = Vec::new();

        match self.staffing {
            StaffingDelta::Balanced => {}
            StaffingDelta::Missing(n) => {
                messages.push(format!("Missing {} {}.", n, staff_noun(n)));
            }
            StaffingDelta::Excess(n) => {
                messages.push(format!("{} {} too many.", n, staff_noun(n)));
            }
        }

        match self.capacity {
            CapacityDelta::Sufficient => {}
            CapacityDelta::Short(n) => {
                messages.push(format!("Wagons are {} seats short of daily demand.", n));
            }
            CapacityDelta::Excess => {
                messages.push(
                    "Excess wagon capacity and excess staff for the daily demand.".to_string(),
                );
            }
        }

        messages
    }

    /// True when neither condition needs attention
    pub fn is_ok(&self) -> bool {
        self.staffing == StaffingDelta::Balanced && self.capacity == CapacityDelta::Sufficient
    }
}

fn staff_noun(n: u32) -> &'static str {
    if n == 1 {
        "staff member"
    } else {
        "staff members"
    }
}

/// Parse `HH:MM` into minutes since midnight
pub(crate) fn parse_clock(value: &str) -> Option<u32> {
    let (hour, minute) = value.split_once(':')?;
    if hour.is_empty() || minute.is_empty() {
        return None;
    }
    if !hour.bytes().chain(minute.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }

    Some(hour * 60 + minute)
}

impl Coaster {
    /// Staff required to operate the coaster
    pub fn staff_required(&self) -> u32 {
        BASE_STAFF + self.wagons.len() as u32 * STAFF_PER_WAGON
    }

    /// Operating window in minutes; 0 if the hours are unparseable or inverted
    pub fn working_minutes(&self) -> u64 {
        match (parse_clock(&self.opening_time), parse_clock(&self.closing_time)) {
            (Some(open), Some(close)) if close > open => u64::from(close - open),
            _ => 0,
        }
    }

    /// Duration of one ride of a wagon including the break, in minutes
    pub fn ride_minutes(&self, wagon: &Wagon) -> u64 {
        let travel = if wagon.speed > 0.0 {
            (self.route_length / wagon.speed / 60.0).floor()
        } else {
            0.0
        };
        travel.max(0.0) as u64 + RIDE_BREAK_MINUTES
    }

    /// Clients all wagons can carry during the operating window
    pub fn wagons_capacity(&self) -> u64 {
        let working = self.working_minutes();
        self.wagons
            .iter()
            .map(|wagon| working / self.ride_minutes(wagon) * u64::from(wagon.seats_count))
            .sum()
    }

    /// Compute the advisory status
    pub fn status(&self) -> CoasterStatus {
        let required = self.staff_required();
        let staffing = match required.cmp(&self.staff_total) {
            std::cmp::Ordering::Equal => StaffingDelta::Balanced,
            std::cmp::Ordering::Greater => StaffingDelta::Missing(required - self.staff_total),
            std::cmp::Ordering::Less => StaffingDelta::Excess(self.staff_total - required),
        };

        let capacity_total = self.wagons_capacity();
        let clients = u64::from(self.clients_total);
        let capacity = if clients > capacity_total {
            CapacityDelta::Short(clients - capacity_total)
        } else if capacity_total >= clients * 2 {
            CapacityDelta::Excess
        } else {
            CapacityDelta::Sufficient
        };

        CoasterStatus { staffing, capacity }
    }

    /// Find a wagon index by id
    pub fn wagon_position(&self, wagon_id: &str) -> Option<usize> {
        self.wagons.iter().position(|w| w.id == wagon_id)
    }
}

impl Record for Coaster {
    fn id(&self) -> &str {
        &self.id
    }
}

impl StatusReport for Coaster {
    fn status_block(&self) -> String {
        let status = self.status();
        let status_line = if status.is_ok() {
            "OK".to_string()
        } else {
            status
                .messages()
                .iter()
                .map(|m| format!("\n\t\t{}", m))
                .collect::<String>()
        };

        let lines = [
            format!("Operating hours: {} - {}", self.opening_time, self.closing_time),
            format!("Wagons: {}", self.wagons.len()),
            format!("Available staff: {}/{}", self.staff_total, self.staff_required()),
            format!("Daily clients: {}", self.clients_total),
            format!("Status: {}", status_line),
        ];

        let body = lines
            .iter()
            .enumerate()
            .map(|(i, line)| format!("\t {}. {}", i + 1, line))
            .collect::<Vec<_>>()
            .join("\n");

        format!("[Coaster {}]\n\n{}", self.id, body)
    }
}
