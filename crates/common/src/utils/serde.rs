//! Serialization helpers for configuration types
//!
//! Configuration files express every duration as an integer number of
//! milliseconds (`initial_delay_ms = 100`). These helpers map those integers
//! onto [`Duration`] fields.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serde adapter for `Duration` stored as milliseconds (u64)
///
/// # Usage
/// ```rust
/// use std::time::Duration;
///
/// use maplink_common::duration_millis;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct ProbeSettings {
///     #[serde(with = "duration_millis")]
///     timeout: Duration,
///     #[serde(default, with = "duration_millis::option")]
///     deadline: Option<Duration>,
/// }
/// ```
pub mod duration_millis {
    use super::*;

    /// Serde serialization result type
    type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

    /// Serialize a Duration as milliseconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    /// Deserialize milliseconds (u64) into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    /// Same mapping for `Option<Duration>`; a missing or `null` value is
    /// `None`
    pub mod option {
        use super::*;

        /// Serialize an optional Duration as milliseconds
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> SerializeResult<S>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize optional milliseconds into an optional Duration
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
