//! Serde adapters for the integer encodings servers expect.

use std::time::Duration;

use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

use crate::bson::Bson;

/// Writes `n` as an int32 when it fits and as an int64 otherwise, saturating at `i64::MAX`.
fn serialize_count<S: Serializer>(n: u128, serializer: S) -> Result<S::Ok, S::Error> {
    match i32::try_from(n) {
        Ok(small) => serializer.serialize_i32(small),
        Err(_) => serializer.serialize_i64(i64::try_from(n).unwrap_or(i64::MAX)),
    }
}

/// An optional duration as a whole number of milliseconds, e.g. `wtimeout`.
pub(crate) mod duration_option_as_millis {
    use super::*;

    pub(crate) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serialize_count(duration.as_millis(), serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// An optional duration as a whole number of seconds, e.g. `maxStalenessSeconds`.
pub(crate) mod duration_option_as_secs {
    use super::*;

    pub(crate) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serialize_count(duration.as_secs().into(), serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
pub(crate) fn serialize_u32_option_as_i32<S: Serializer>(
    value: &Option<u32>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(n) => serialize_count((*n).into(), serializer),
        None => serializer.serialize_none(),
    }
}

/// Reads a non-negative integral number stored as any BSON numeric type.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn get_u64(value: &Bson) -> Option<u64> {
    match *value {
        Bson::Int32(n) => u64::try_from(n).ok(),
        Bson::Int64(n) => u64::try_from(n).ok(),
        Bson::Double(f) if f >= 0.0 && f.fract() == 0.0 && f < u64::MAX as f64 => Some(f as u64),
        _ => None,
    }
}

pub(crate) fn deserialize_u64_from_bson_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<u64, D::Error> {
    let value = Bson::deserialize(deserializer)?;
    get_u64(&value).ok_or_else(|| D::Error::custom(format!("expected a count, got {value}")))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::get_u64;
    use crate::bson::Bson;

    #[test]
    fn counts_from_any_numeric_type() {
        assert_eq!(get_u64(&Bson::Int32(7)), Some(7));
        assert_eq!(get_u64(&Bson::Int64(1 << 40)), Some(1 << 40));
        assert_eq!(get_u64(&Bson::Double(4096.0)), Some(4096));
        assert_eq!(get_u64(&Bson::Double(1.5)), None);
        assert_eq!(get_u64(&Bson::Int32(-1)), None);
        assert_eq!(get_u64(&Bson::String("1".to_string())), None);
    }
}
