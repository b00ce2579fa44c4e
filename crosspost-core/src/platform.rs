use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "devto")]
    DevTo,
    #[serde(rename = "linkedin")]
    LinkedIn,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Medium, Platform::DevTo, Platform::LinkedIn];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Medium => "medium",
            Platform::DevTo => "devto",
            Platform::LinkedIn => "linkedin",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "medium" => Ok(Platform::Medium),
            "devto" | "dev.to" => Ok(Platform::DevTo),
            "linkedin" => Ok(Platform::LinkedIn),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("Dev.to".parse::<Platform>().unwrap(), Platform::DevTo);
        assert_eq!(" LinkedIn ".parse::<Platform>().unwrap(), Platform::LinkedIn);
        assert!("myspace".parse::<Platform>().is_err());
    }

    #[test]
    fn serializes_as_wire_name() {
        assert_eq!(serde_json::to_string(&Platform::DevTo).unwrap(), "\"devto\"");
    }
}
