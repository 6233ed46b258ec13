use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

use crate::error::DecodeError;

/// Declares a ulid-backed id newtype with base64 display and dual
/// human-readable / binary serde representations.
macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(PartialEq, Eq, Hash, Clone, Copy, Ord, PartialOrd)]
        pub struct $name(Ulid);

        impl $name {
            pub fn new() -> Self { Self(Ulid::new()) }

            pub fn from_bytes(bytes: [u8; 16]) -> Self { Self(Ulid::from_bytes(bytes)) }

            pub fn to_bytes(&self) -> [u8; 16] { self.0.to_bytes() }

            pub fn from_base64<T: AsRef<[u8]>>(input: T) -> Result<Self, DecodeError> {
                let decoded = general_purpose::URL_SAFE_NO_PAD.decode(input).map_err(DecodeError::InvalidBase64)?;
                let bytes: [u8; 16] = decoded[..].try_into().map_err(|_| DecodeError::InvalidLength)?;
                Ok(Self(Ulid::from_bytes(bytes)))
            }

            pub fn to_base64(&self) -> String { general_purpose::URL_SAFE_NO_PAD.encode(self.0.to_bytes()) }
        }

        impl Default for $name {
            fn default() -> Self { Self::new() }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.to_base64()) }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_base64())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DecodeError;
            fn from_str(s: &str) -> Result<Self, Self::Err> { Self::from_base64(s) }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String { id.to_base64() }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where S: serde::Serializer {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_base64())
                } else {
                    self.to_bytes().serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where D: serde::Deserializer<'de> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    Self::from_base64(s).map_err(serde::de::Error::custom)
                } else {
                    let bytes = <[u8; 16]>::deserialize(deserializer)?;
                    Ok(Self::from_bytes(bytes))
                }
            }
        }
    };
}

id_type! {
    /// Identifies a single subscription (filter + cursor) on a handler.
    SubscriptionId
}
id_type! {
    /// Identifies a long-lived event stream; one handler may carry many subscriptions.
    HandlerId
}
id_type! {
    /// Identifies a task record in the scheduler keyspace.
    TaskId
}
id_type! {
    /// Identifies a recurring schedule.
    ScheduleId
}
id_type! {
    /// Identifies a worker process in the pool.
    WorkerId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let id = SubscriptionId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"AQIDBAUGBwgJCgsMDQ4PEA\"");
        assert_eq!(id, serde_json::from_str(&json).unwrap());
    }

    #[test]
    fn from_base64_rejects_garbage() {
        assert!(TaskId::from_base64("not base64!!").is_err());
        assert!(TaskId::from_base64("AQID").is_err()); // too short
    }
}
