//! # Row Conversion
//!
//! Decodes driver rows into [`Value`]s. A fixed set of server types the
//! caller cannot consume natively are normalised here:
//!
//! | Server type | Converted to |
//! |---|---|
//! | `TEXT[]`, `VARCHAR[]`, `BPCHAR[]`, `NAME[]` | comma-joined `Text` |
//! | `INET`, `CIDR` | `Text`, bare address when the prefix covers every bit |
//! | `UUID` | hyphenated `Text` |
//! | `TIME`, `TIMETZ`, `INTERVAL` | server-style `Text` |
//! | `NUMERIC` | `Float` |
//!
//! Everything else passes through with its natural representation.

use crate::error::{ClientError, ClientResult};
use crate::query::types::{ColumnMeta, ResultRow, Value};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use ipnetwork::IpNetwork;
use bigdecimal::ToPrimitive;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::{Oid, PgInterval, PgTimeTz};
use sqlx::postgres::{PgColumn, PgRow, PgValueFormat, PgValueRef};
use sqlx::types::BigDecimal;
use sqlx::{Column, Decode, Postgres, Row, Type, TypeInfo, ValueRef};

// Sign word of the binary NUMERIC format for the non-finite values.
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_POS_INF: u16 = 0xD000;
const NUMERIC_NEG_INF: u16 = 0xF000;

/// Column metadata from a prepared statement's description.
pub fn column_meta(columns: &[PgColumn]) -> Vec<ColumnMeta> {
    columns
        .iter()
        .map(|column| ColumnMeta::new(column.name(), column.type_info().name()))
        .collect()
}

/// Convert every column of a driver row.
pub fn decode_row(row: &PgRow) -> ClientResult<ResultRow> {
    (0..row.len()).map(|idx| decode_column(row, idx)).collect()
}

fn decode_column(row: &PgRow, idx: usize) -> ClientResult<Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let value = match type_name.as_str() {
        "BOOL" => Value::Bool(get(row, idx)?),
        "INT2" => Value::Int(get::<i16>(row, idx)?.into()),
        "INT4" => Value::Int(get::<i32>(row, idx)?.into()),
        "INT8" => Value::Int(get(row, idx)?),
        "OID" => Value::Int(get::<Oid>(row, idx)?.0.into()),
        "FLOAT4" => Value::Float(get::<f32>(row, idx)?.into()),
        "FLOAT8" => Value::Float(get(row, idx)?),
        "NUMERIC" => Value::Float(decode_numeric(row, idx, &raw)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Value::Text(get(row, idx)?),
        "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => {
            Value::Text(join_text_array(get::<Vec<Option<String>>>(row, idx)?))
        }
        "INET" | "CIDR" => Value::Text(network_to_text(&get(row, idx)?)),
        "UUID" => Value::Text(uuid_to_text(*get::<uuid::Uuid>(row, idx)?.as_bytes())),
        "TIME" => Value::Text(time_to_text(get(row, idx)?)),
        "TIMETZ" => Value::Text(timetz_to_text(&get::<PgTimeTz<NaiveTime, FixedOffset>>(
            row, idx,
        )?)),
        "INTERVAL" => Value::Text(interval_to_text(&get(row, idx)?)),
        "TIMESTAMPTZ" => Value::Timestamp(get::<DateTime<Utc>>(row, idx)?),
        "TIMESTAMP" => Value::LocalTimestamp(get::<NaiveDateTime>(row, idx)?),
        "DATE" => Value::Date(get::<NaiveDate>(row, idx)?),
        "JSON" | "JSONB" => Value::Json(get(row, idx)?),
        "BYTEA" => Value::Bytes(get(row, idx)?),
        "INT2[]" => json_array(get::<Vec<Option<i16>>>(row, idx)?),
        "INT4[]" => json_array(get::<Vec<Option<i32>>>(row, idx)?),
        "INT8[]" => json_array(get::<Vec<Option<i64>>>(row, idx)?),
        "FLOAT8[]" => json_array(get::<Vec<Option<f64>>>(row, idx)?),
        "BOOL[]" => json_array(get::<Vec<Option<bool>>>(row, idx)?),
        _ => {
            let bytes = raw
                .as_bytes()
                .map_err(|e| ClientError::DecodeError(format!("column {idx} ({type_name}): {e}")))?;
            match std::str::from_utf8(bytes) {
                Ok(text) => Value::Text(text.to_string()),
                Err(_) => Value::Bytes(bytes.to_vec()),
            }
        }
    };
    Ok(value)
}

fn get<'r, T>(row: &'r PgRow, idx: usize) -> ClientResult<T>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get::<T, _>(idx).map_err(ClientError::from)
}

fn decode_numeric(row: &PgRow, idx: usize, raw: &PgValueRef<'_>) -> ClientResult<f64> {
    let decode_error =
        |e: BoxDynError| ClientError::DecodeError(format!("column {idx} (NUMERIC): {e}"));
    match raw.format() {
        PgValueFormat::Text => numeric_text_to_float(raw.as_str().map_err(decode_error)?),
        PgValueFormat::Binary => match numeric_special(raw.as_bytes().map_err(decode_error)?) {
            Some(special) => Ok(special),
            None => numeric_to_float(&get::<BigDecimal>(row, idx)?),
        },
    }
}

fn json_array<T: serde::Serialize>(items: Vec<Option<T>>) -> Value {
    Value::Json(serde_json::json!(items))
}

/// Join a text array with `,`. `NULL` elements render as empty strings.
pub fn join_text_array(items: Vec<Option<String>>) -> String {
    items
        .into_iter()
        .map(Option::unwrap_or_default)
        .collect::<Vec<_>>()
        .join(",")
}

/// Render a network value, dropping the prefix length when it covers the
/// whole address (`/32` for IPv4, `/128` for IPv6).
pub fn network_to_text(network: &IpNetwork) -> String {
    let host_prefix = match network {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    };
    if network.prefix() == host_prefix {
        network.ip().to_string()
    } else {
        network.to_string()
    }
}

/// Canonical hyphenated form of a 16-byte UUID.
pub fn uuid_to_text(bytes: [u8; 16]) -> String {
    uuid::Uuid::from_bytes(bytes).hyphenated().to_string()
}

pub fn time_to_text(time: NaiveTime) -> String {
    clock_text(
        time.hour().into(),
        time.minute().into(),
        time.second().into(),
        u64::from(time.nanosecond() % 1_000_000_000) / 1_000,
    )
}

pub fn timetz_to_text(time: &PgTimeTz<NaiveTime, FixedOffset>) -> String {
    let offset = time.offset.local_minus_utc();
    let sign = if offset < 0 { '-' } else { '+' };
    let offset = offset.unsigned_abs();
    let (hours, minutes) = (offset / 3600, (offset % 3600) / 60);
    if minutes == 0 {
        format!("{}{sign}{hours:02}", time_to_text(time.time))
    } else {
        format!("{}{sign}{hours:02}:{minutes:02}", time_to_text(time.time))
    }
}

/// Format an interval the way the server's default output style does,
/// e.g. `1 year 2 mons 3 days 04:05:06`.
pub fn interval_to_text(interval: &PgInterval) -> String {
    let mut parts = Vec::new();
    push_unit(&mut parts, interval.months / 12, "year");
    push_unit(&mut parts, interval.months % 12, "mon");
    push_unit(&mut parts, interval.days, "day");

    if interval.microseconds != 0 || parts.is_empty() {
        let sign = if interval.microseconds < 0 { "-" } else { "" };
        let micros = interval.microseconds.unsigned_abs();
        let seconds = micros / 1_000_000;
        parts.push(format!(
            "{sign}{}",
            clock_text(seconds / 3600, (seconds % 3600) / 60, seconds % 60, micros % 1_000_000)
        ));
    }

    parts.join(" ")
}

fn push_unit(parts: &mut Vec<String>, amount: i32, unit: &str) {
    if amount != 0 {
        let plural = if amount == 1 { "" } else { "s" };
        parts.push(format!("{amount} {unit}{plural}"));
    }
}

fn clock_text(hours: u64, minutes: u64, seconds: u64, micros: u64) -> String {
    let clock = format!("{hours:02}:{minutes:02}:{seconds:02}");
    if micros == 0 {
        clock
    } else {
        let fraction = format!("{micros:06}");
        format!("{clock}.{}", fraction.trim_end_matches('0'))
    }
}

/// `NaN` and the infinities from a binary NUMERIC value, which no decimal
/// type represents. `None` for finite values.
pub fn numeric_special(bytes: &[u8]) -> Option<f64> {
    let sign = u16::from_be_bytes([*bytes.get(4)?, *bytes.get(5)?]);
    match sign {
        NUMERIC_NAN => Some(f64::NAN),
        NUMERIC_POS_INF => Some(f64::INFINITY),
        NUMERIC_NEG_INF => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

/// Parse the text form of a NUMERIC, including `NaN` and `Infinity`.
pub fn numeric_text_to_float(text: &str) -> ClientResult<f64> {
    text.trim()
        .parse()
        .map_err(|e| ClientError::DecodeError(format!("numeric '{text}': {e}")))
}

/// Nearest f64 to an arbitrary-precision value. Values beyond the f64 range
/// become infinite.
pub fn numeric_to_float(value: &BigDecimal) -> ClientResult<f64> {
    match value.to_f64() {
        Some(float) => Ok(float),
        None => numeric_text_to_float(&value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_network_prefix_stripping() {
        let host: IpNetwork = "192.168.0.1/32".parse().unwrap();
        assert_eq!(network_to_text(&host), "192.168.0.1");

        let subnet: IpNetwork = "10.0.0.0/8".parse().unwrap();
        assert_eq!(network_to_text(&subnet), "10.0.0.0/8");

        let v6_host: IpNetwork = "::1/128".parse().unwrap();
        assert_eq!(network_to_text(&v6_host), "::1");
    }

    #[test]
    fn test_interval_formatting() {
        let interval = PgInterval {
            months: 14,
            days: 0,
            microseconds: 0,
        };
        assert_eq!(interval_to_text(&interval), "1 year 2 mons");

        let interval = PgInterval {
            months: 0,
            days: 3,
            microseconds: 4 * 3_600_000_000 + 5 * 60_000_000 + 6_500_000,
        };
        assert_eq!(interval_to_text(&interval), "3 days 04:05:06.5");

        let zero = PgInterval {
            months: 0,
            days: 0,
            microseconds: 0,
        };
        assert_eq!(interval_to_text(&zero), "00:00:00");
    }

    #[test]
    fn test_negative_interval() {
        let interval = PgInterval {
            months: -1,
            days: -1,
            microseconds: -90_000_000,
        };
        assert_eq!(interval_to_text(&interval), "-1 mons -1 days -00:01:30");
    }

    #[test]
    fn test_time_formatting() {
        let time = NaiveTime::from_hms_micro_opt(13, 5, 9, 120_000).unwrap();
        assert_eq!(time_to_text(time), "13:05:09.12");

        let offset = FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap();
        let timetz = PgTimeTz {
            time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            offset,
        };
        assert_eq!(timetz_to_text(&timetz), "08:00:00+05:30");
    }

    #[test]
    fn test_numeric_to_float() {
        let value = BigDecimal::from_str("12.75").unwrap();
        assert_eq!(numeric_to_float(&value).unwrap(), 12.75);
    }

    #[test]
    fn test_numeric_beyond_decimal_range() {
        let huge = BigDecimal::from_str("1e40").unwrap();
        let float = numeric_to_float(&huge).unwrap();
        assert!((float / 1e40 - 1.0).abs() < 1e-12, "{float}");

        let wide = BigDecimal::from_str("123456789012345678901234567890123456789.5").unwrap();
        let float = numeric_to_float(&wide).unwrap();
        assert!((float / 1.234_567_890_123_456_8e38 - 1.0).abs() < 1e-12, "{float}");
    }

    #[test]
    fn test_numeric_special_values() {
        // ndigits, weight, sign, dscale
        let nan = [0, 0, 0, 0, 0xC0, 0x00, 0, 0];
        assert!(numeric_special(&nan).unwrap().is_nan());
        assert_eq!(numeric_special(&[0, 0, 0, 0, 0xD0, 0x00, 0, 0]), Some(f64::INFINITY));
        assert_eq!(numeric_special(&[0, 0, 0, 0, 0xF0, 0x00, 0, 0]), Some(f64::NEG_INFINITY));

        // 1 as a one-digit positive numeric
        assert_eq!(numeric_special(&[0, 1, 0, 0, 0x00, 0x00, 0, 0, 0, 1]), None);
        assert_eq!(numeric_special(&[0, 1]), None);
    }

    #[test]
    fn test_numeric_text_forms() {
        assert!(numeric_text_to_float("NaN").unwrap().is_nan());
        assert_eq!(numeric_text_to_float("Infinity").unwrap(), f64::INFINITY);
        assert_eq!(numeric_text_to_float("-Infinity").unwrap(), f64::NEG_INFINITY);
        assert_eq!(numeric_text_to_float("1e40").unwrap(), 1e40);
        assert!(numeric_text_to_float("twelve").is_err());
    }

    #[test]
    fn test_text_array_join() {
        let items = vec![Some("a".to_string()), None, Some("c".to_string())];
        assert_eq!(join_text_array(items), "a,,c");
    }
}
