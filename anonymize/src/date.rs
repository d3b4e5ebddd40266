use chrono::{Duration, NaiveDate, NaiveDateTime};

/// Applies a consistent day offset to DA and DT values.
///
/// TM values are never shifted. Values that do not parse are returned
/// unchanged.
#[derive(Debug, Clone, Copy)]
pub struct DateShifter {
    days: i64,
}

impl DateShifter {
    pub fn new(days: i64) -> Self {
        DateShifter { days }
    }

    /// Shift a DA value (`YYYYMMDD`).
    pub fn shift_date(&self, value: &str) -> String {
        if value.len() == 8 {
            if let Ok(date) = NaiveDate::parse_from_str(value, "%Y%m%d") {
                if let Some(shifted) = date.checked_add_signed(Duration::days(self.days)) {
                    return shifted.format("%Y%m%d").to_string();
                }
            }
        }
        value.to_string()
    }

    /// Shift the date component of a DT value (`YYYYMMDDHHMMSS...`),
    /// preserving any trailing fraction and timezone characters.
    pub fn shift_datetime(&self, value: &str) -> String {
        if value.len() >= 14 {
            if let Ok(dt) = NaiveDateTime::parse_from_str(&value[..14], "%Y%m%d%H%M%S") {
                if let Some(shifted) = dt.checked_add_signed(Duration::days(self.days)) {
                    return format!("{}{}", shifted.format("%Y%m%d%H%M%S"), &value[14..]);
                }
            }
        }
        value.to_string()
    }
}
