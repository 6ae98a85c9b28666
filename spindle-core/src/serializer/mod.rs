//! Serialization of function payloads and data batches.
//!
//! The wire codec only knows primitives and frames. Everything richer that
//! crosses the boundary (composed functions, partition batches, row batches)
//! is serialized with a [`Serializer`] and carried as a frame payload.
//!
//! # Features:
//! - **Serializable Trait**: A shorthand trait that encapsulates common
//!   serialization and deserialization behaviors.
//! - **Serializer Enum**: Provides a generic way to serialize and deserialize
//!   binary data in one of several formats. The chosen format travels with
//!   each dispatch command by [name](Serializer::name), so workers decode
//!   with the same format the host encoded with.
//!
//! # Examples
//!
//! ```rust
//! use spindle::serializer::Serializer;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct MyData {
//!    field: String,
//! }
//!
//! let data = MyData { field: "Hello, World!".to_string() };
//! let serialized = Serializer::Cbor.to_bytes(&data).unwrap();
//! let deserialized: MyData = Serializer::Cbor.from_bytes(&serialized).unwrap();
//! ```

use anyhow::{bail, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::config::{self, Config};

/// Represents a shorthand for common serialization and deserialization
/// behaviors.
///
/// Values that cross the process boundary may be produced and consumed on
/// different threads, hence the requirements for `Send`, `Sync`, and
/// `'static`.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Provides a unified interface for serializing and deserializing binary data.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Serializer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postcard" => Ok(Self::Postcard),
            "cbor" => Ok(Self::Cbor),
            other => bail!("unknown serializer: {other:?}"),
        }
    }
}

impl Serializer {
    /// The name of this format as written into dispatch commands.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Postcard => "postcard",
            Self::Cbor => "cbor",
        }
    }

    /// Serializes the given value into binary data using the specified format.
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Postcard => Ok(postcard::to_allocvec(value)?),
            Self::Cbor => {
                let mut result = Vec::new();
                ciborium::into_writer(value, &mut result)?;
                Ok(result)
            }
        }
    }

    /// Deserializes the given binary data into a value of the specified type
    /// using the specified format.
    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        match config.serializer {
            config::Serializer::Postcard => Self::Postcard,
            config::Serializer::Cbor => Self::Cbor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for serializer in [Serializer::Postcard, Serializer::Cbor] {
            assert_eq!(serializer.name().parse::<Serializer>().unwrap(), serializer);
        }
        assert!("json".parse::<Serializer>().is_err());
    }

    #[test]
    fn formats_decode_their_own_output() {
        let batch = vec![(1u32, "a".to_string()), (2, "b".to_string())];
        for serializer in [Serializer::Postcard, Serializer::Cbor] {
            let bytes = serializer.to_bytes(&batch).unwrap();
            let decoded: Vec<(u32, String)> = serializer.from_bytes(&bytes).unwrap();
            assert_eq!(decoded, batch);
        }
    }
}
