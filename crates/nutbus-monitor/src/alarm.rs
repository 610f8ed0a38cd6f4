//! ups.alarm bitfield
//!
//! The alarm variable is a concatenation of alarm phrases (most end with
//! `!`). Each known phrase maps to one bit; anything non-empty that
//! matches nothing sets the generic bit so an active alarm is never
//! reported as zero.

pub const ALARM_REPLACE_BATTERY: u32 = 1 << 0;
pub const ALARM_SHUTDOWN_IMMINENT: u32 = 1 << 1;
pub const ALARM_FAN_FAILURE: u32 = 1 << 2;
pub const ALARM_NO_BATTERY: u32 = 1 << 3;
pub const ALARM_BATTERY_VOLTAGE_LOW: u32 = 1 << 4;
pub const ALARM_BATTERY_VOLTAGE_HIGH: u32 = 1 << 5;
pub const ALARM_CHARGER_FAILURE: u32 = 1 << 6;
pub const ALARM_TEMPERATURE_HIGH: u32 = 1 << 7;
pub const ALARM_INTERNAL_FAULT: u32 = 1 << 8;
pub const ALARM_AWAITING_POWER: u32 = 1 << 9;
pub const ALARM_AUTOMATIC_BYPASS: u32 = 1 << 10;
pub const ALARM_MANUAL_BYPASS: u32 = 1 << 11;
pub const ALARM_COMMUNICATION_FAULT: u32 = 1 << 12;
pub const ALARM_FUSE_FAULT: u32 = 1 << 13;
/// Set for a non-empty alarm string no known phrase matched.
pub const ALARM_OTHER: u32 = 1 << 31;

const ALARM_TABLE: [(&str, u32); 14] = [
    ("Replace battery", ALARM_REPLACE_BATTERY),
    ("Shutdown imminent", ALARM_SHUTDOWN_IMMINENT),
    ("Fan failure", ALARM_FAN_FAILURE),
    ("No battery installed", ALARM_NO_BATTERY),
    ("Battery voltage too low", ALARM_BATTERY_VOLTAGE_LOW),
    ("Battery voltage too high", ALARM_BATTERY_VOLTAGE_HIGH),
    ("Battery charger fail", ALARM_CHARGER_FAILURE),
    ("Temperature too high", ALARM_TEMPERATURE_HIGH),
    ("Internal UPS fault", ALARM_INTERNAL_FAULT),
    ("Awaiting power", ALARM_AWAITING_POWER),
    ("Automatic bypass mode", ALARM_AUTOMATIC_BYPASS),
    ("Manual bypass mode", ALARM_MANUAL_BYPASS),
    ("Communication fault", ALARM_COMMUNICATION_FAULT),
    ("Fuse fault", ALARM_FUSE_FAULT),
];

/// Convert a `ups.alarm` string to the alarm bitfield.
pub fn upsalarm_to_int(alarm: &str) -> u32 {
    let trimmed = alarm.trim();
    if trimmed.is_empty() {
        return 0;
    }

    let lower = trimmed.to_ascii_lowercase();
    let mut result = 0;
    for (phrase, bit) in ALARM_TABLE {
        if lower.contains(&phrase.to_ascii_lowercase()) {
            result |= bit;
        }
    }
    if result == 0 {
        result = ALARM_OTHER;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_alarm_is_zero() {
        assert_eq!(upsalarm_to_int(""), 0);
        assert_eq!(upsalarm_to_int("   "), 0);
    }

    #[test]
    fn phrases_combine() {
        assert_eq!(
            upsalarm_to_int("Replace battery! Shutdown imminent!"),
            ALARM_REPLACE_BATTERY | ALARM_SHUTDOWN_IMMINENT
        );
        assert_eq!(upsalarm_to_int("Fan failure!"), ALARM_FAN_FAILURE);
    }

    #[test]
    fn unknown_alarms_still_register() {
        assert_eq!(upsalarm_to_int("Dilithium crystals depleted!"), ALARM_OTHER);
    }
}
