//! Contains the option types and the server address type used throughout the crate.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize};

pub use crate::{
    cmap::options::ConnectionPoolOptions,
    concern::{Acknowledgment, ReadConcern, ReadConcernLevel, WriteConcern},
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};
use crate::error::{Error, Result};

/// The default port used to connect to a server when none is specified.
pub const DEFAULT_PORT: u16 = 27017;

/// The address of a MongoDB server.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ServerAddress {
    /// The hostname or IP address where the server can be found.
    pub host: String,

    /// The TCP port that the server is listening on.
    ///
    /// The default is 27017.
    pub port: Option<u16>,
}

impl ServerAddress {
    /// Constructs an address from a host and an optional port.
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses an address string into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');
        let hostname = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "invalid server address: \"{address}\"; hostname cannot be empty"
                )))
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| {
                    Error::invalid_argument(format!(
                        "port must be valid 16-bit unsigned integer, instead got: {part}"
                    ))
                })?;

                if port == 0 {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address: \"{address}\"; port must be non-zero"
                    )));
                }
                if parts.next().is_some() {
                    return Err(Error::invalid_argument(format!(
                        "address \"{address}\" contains more than one unescaped ':'"
                    )));
                }

                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress {
            host: hostname.to_lowercase(),
            port,
        })
    }

    /// The host portion of the address.
    pub fn host(&self) -> &str {
        self.host.as_str()
    }

    /// The port, falling back to [`DEFAULT_PORT`].
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host, self.port())
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| <D::Error as serde::de::Error>::custom(format!("{e}")))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::ServerAddress;

    #[test]
    fn parse_address() {
        let address = ServerAddress::parse("Example.COM:27018").unwrap();
        assert_eq!(address.host(), "example.com");
        assert_eq!(address.port(), 27018);
        assert_eq!(address.to_string(), "example.com:27018");

        let address = ServerAddress::parse("localhost").unwrap();
        assert_eq!(address.port, None);
        assert_eq!(address.to_string(), "localhost:27017");

        assert!(ServerAddress::parse(":27017").is_err());
        assert!(ServerAddress::parse("localhost:0").is_err());
        assert!(ServerAddress::parse("localhost:abc").is_err());
        assert!(ServerAddress::parse("a:1:2").is_err());
    }
}
