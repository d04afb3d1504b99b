use crate::error::{Error, Result};
use crate::growatt::state::OperatingState;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;

/// Number of input registers making up one telemetry snapshot.
pub const INPUT_REGISTER_COUNT: u16 = 41;
pub const INPUT_REGISTER_START: u16 = 0;

pub type InputBlock = [u16; INPUT_REGISTER_COUNT as usize];

/// Timestamps on the wire are UTC, `yyyy-mm-dd hh:mm:ss`.
pub mod timestamp_format {
    use chrono::{DateTime, Utc};
    use serde::Serializer;

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.format(FORMAT).to_string())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Combine registers 5 and 6 for PV1 watt instead of reading register 5
    /// twice. Existing firmware integrations expect the latter, so this stays
    /// off until confirmed against real hardware.
    pub consecutive_pv1_watt: bool,
}

/// One telemetry snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Stats {
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    pub state: OperatingState,
    #[serde(rename = "PV_input_power")]
    pub pv_input_power: u32,
    #[serde(rename = "PV1_input_volt")]
    pub pv1_input_volt: u16,
    #[serde(rename = "PV1_input_current")]
    pub pv1_input_current: u16,
    #[serde(rename = "PV1_input_watt")]
    pub pv1_input_watt: u32,
    #[serde(rename = "PV2_input_volt")]
    pub pv2_input_volt: u16,
    #[serde(rename = "PV2_input_current")]
    pub pv2_input_current: u16,
    #[serde(rename = "PV2_input_watt")]
    pub pv2_input_watt: u32,
    #[serde(rename = "AC_watt")]
    pub ac_watt: u32,
    #[serde(rename = "AC_frequency")]
    pub ac_frequency: u16,
    #[serde(rename = "AC1_volt")]
    pub ac1_volt: u16,
    #[serde(rename = "AC1_current")]
    pub ac1_current: u16,
    #[serde(rename = "AC1_watt")]
    pub ac1_watt: u32,
    #[serde(rename = "AC2_volt")]
    pub ac2_volt: u16,
    #[serde(rename = "AC2_current")]
    pub ac2_current: u16,
    #[serde(rename = "AC2_watt")]
    pub ac2_watt: u32,
    #[serde(rename = "AC3_volt")]
    pub ac3_volt: u16,
    #[serde(rename = "AC3_current")]
    pub ac3_current: u16,
    #[serde(rename = "AC3_watt")]
    pub ac3_watt: u32,
    pub total_today_watt: u64,
    pub total_all_time_watt: u64,
    #[serde(rename = "total_worktime_secs")]
    pub total_work_time_secs: u32,
    #[serde(rename = "inverter_temp")]
    pub temperature: u16,
    pub fault_code: u16,
}

fn double(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// Decodes a raw input block. Pure apart from the caller supplied timestamp,
/// which is truncated to whole seconds.
pub fn decode(block: &InputBlock, captured_at: DateTime<Utc>, options: DecodeOptions) -> Stats {
    let d = block;

    let pv1_watt_low = if options.consecutive_pv1_watt {
        d[6]
    } else {
        d[5]
    };

    Stats {
        timestamp: captured_at.trunc_subsecs(0),
        state: OperatingState::from(d[0]),
        pv_input_power: double(d[1], d[2]) / 10,
        pv1_input_volt: d[3] / 10,
        pv1_input_current: d[4] / 10,
        pv1_input_watt: double(d[5], pv1_watt_low) / 10,
        pv2_input_volt: d[7] / 10,
        pv2_input_current: d[8] / 10,
        pv2_input_watt: double(d[9], d[10]) / 10,
        ac_watt: double(d[11], d[12]) / 10,
        ac_frequency: d[13] / 100,
        ac1_volt: d[14] / 10,
        ac1_current: d[15] / 10,
        ac1_watt: double(d[16], d[17]) / 10,
        ac2_volt: d[18] / 10,
        ac2_current: d[19] / 10,
        ac2_watt: double(d[20], d[21]) / 10,
        ac3_volt: d[22] / 10,
        ac3_current: d[23] / 10,
        ac3_watt: double(d[24], d[25]) / 10,
        total_today_watt: double(d[26], d[27]) as u64 * 100,
        total_all_time_watt: double(d[28], d[29]) as u64 * 100,
        total_work_time_secs: double(d[30], d[31]) / 2,
        temperature: d[32] / 10,
        fault_code: d[40],
    }
}

/// Like `decode`, for a block of unchecked length straight off the wire.
pub fn decode_slice(
    words: &[u16],
    captured_at: DateTime<Utc>,
    options: DecodeOptions,
) -> Result<Stats> {
    let block: &InputBlock = words.try_into().map_err(|_| {
        Error::Protocol(format!(
            "expected {} input registers, got {}",
            INPUT_REGISTER_COUNT,
            words.len()
        ))
    })?;

    Ok(decode(block, captured_at, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 9, 30, 5).unwrap()
    }

    fn block() -> InputBlock {
        let mut b = [0u16; INPUT_REGISTER_COUNT as usize];
        b[0] = 1;
        b[1] = 0;
        b[2] = 1500;
        b[3] = 3105;
        b[4] = 47;
        b[5] = 1;
        b[6] = 2;
        b[13] = 5001;
        b[14] = 2301;
        b[26] = 0;
        b[27] = 123;
        b[28] = 1;
        b[29] = 0;
        b[30] = 0;
        b[31] = 7201;
        b[32] = 415;
        b[40] = 107;
        b
    }

    #[test]
    fn pv_input_power_scenario() {
        let stats = decode(&block(), at(), DecodeOptions::default());
        assert_eq!(stats.state, OperatingState::Normal);
        assert_eq!(stats.pv_input_power, 150);
    }

    #[test]
    fn single_word_scaling_truncates() {
        let stats = decode(&block(), at(), DecodeOptions::default());
        assert_eq!(stats.pv1_input_volt, 310);
        assert_eq!(stats.pv1_input_current, 4);
        assert_eq!(stats.ac1_volt, 230);
        assert_eq!(stats.ac_frequency, 50);
        assert_eq!(stats.temperature, 41);
        assert_eq!(stats.fault_code, 107);
    }

    #[test]
    fn double_word_fields() {
        let stats = decode(&block(), at(), DecodeOptions::default());
        assert_eq!(stats.total_today_watt, 12_300);
        assert_eq!(stats.total_all_time_watt, 65_536 * 100);
        assert_eq!(stats.total_work_time_secs, 3600);
    }

    #[test]
    fn energy_totals_do_not_overflow() {
        let mut b = block();
        b[28] = u16::MAX;
        b[29] = u16::MAX;
        let stats = decode(&b, at(), DecodeOptions::default());
        assert_eq!(stats.total_all_time_watt, u32::MAX as u64 * 100);
    }

    #[test]
    fn pv1_watt_register_quirk() {
        let stats = decode(&block(), at(), DecodeOptions::default());
        assert_eq!(stats.pv1_input_watt, ((1u32 << 16) | 1) / 10);

        let options = DecodeOptions {
            consecutive_pv1_watt: true,
        };
        let stats = decode(&block(), at(), options);
        assert_eq!(stats.pv1_input_watt, ((1u32 << 16) | 2) / 10);
    }

    #[test]
    fn deterministic_except_timestamp() {
        let a = decode(&block(), at(), DecodeOptions::default());
        let mut b = decode(&block(), at() + chrono::Duration::seconds(9), DecodeOptions::default());
        assert_ne!(a, b);
        b.timestamp = a.timestamp;
        assert_eq!(a, b);
    }

    #[test]
    fn timestamp_is_second_precision() {
        let precise = at() + chrono::Duration::milliseconds(750);
        let stats = decode(&block(), precise, DecodeOptions::default());
        assert_eq!(stats.timestamp, at());
    }

    #[test]
    fn unknown_state_code() {
        let mut b = block();
        b[0] = 2;
        let stats = decode(&b, at(), DecodeOptions::default());
        assert_eq!(stats.state, OperatingState::Unknown(2));
    }

    #[test]
    fn decode_slice_rejects_short_block() {
        let words = vec![0u16; 40];
        let err = decode_slice(&words, at(), DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(!err.is_timeout());
    }

    #[test]
    fn json_keys() {
        let stats = decode(&block(), at(), DecodeOptions::default());
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["timestamp"], "2024-03-15 09:30:05");
        assert_eq!(json["state"], "normal");
        assert_eq!(json["PV_input_power"], 150);
        assert_eq!(json["AC1_volt"], 230);
        assert_eq!(json["total_today_watt"], 12_300);
        assert_eq!(json["total_worktime_secs"], 3600);
        assert_eq!(json["inverter_temp"], 41);
        assert_eq!(json["fault_code"], 107);
        assert_eq!(json.as_object().unwrap().len(), 25);
    }
}
