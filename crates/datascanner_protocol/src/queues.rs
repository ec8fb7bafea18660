//! Queue names. The names are the contract between stages.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Queue {
    /// Scan specs: one root (or derived) Source plus the rule to run.
    Sources,
    /// Handles waiting for the conversion their next rule needs.
    Conversions,
    /// Handles carrying converted content.
    Representations,
    /// Final verdicts per Handle.
    Matches,
    /// Matched Handles waiting for metadata.
    Handles,
    Metadata,
    Problems,
}

impl Queue {
    pub const ALL: [Queue; 7] = [
        Queue::Sources,
        Queue::Conversions,
        Queue::Representations,
        Queue::Matches,
        Queue::Handles,
        Queue::Metadata,
        Queue::Problems,
    ];

    /// The queues whose messages leave the pipeline through the exporter.
    pub const EXPORTED: [Queue; 3] = [Queue::Matches, Queue::Metadata, Queue::Problems];

    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Sources => "os2ds_sources",
            Queue::Conversions => "os2ds_conversions",
            Queue::Representations => "os2ds_representations",
            Queue::Matches => "os2ds_matches",
            Queue::Handles => "os2ds_handles",
            Queue::Metadata => "os2ds_metadata",
            Queue::Problems => "os2ds_problems",
        }
    }

    /// Name of the message shape this queue carries.
    pub fn shape(&self) -> &'static str {
        match self {
            Queue::Sources => "scan spec",
            Queue::Conversions => "conversion",
            Queue::Representations => "representation",
            Queue::Matches => "matches",
            Queue::Handles => "handle",
            Queue::Metadata => "metadata",
            Queue::Problems => "problem",
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Queue {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Queue::ALL
            .iter()
            .copied()
            .find(|queue| queue.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownQueue(s.to_string()))
    }
}

impl TryFrom<String> for Queue {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Queue> for String {
    fn from(queue: Queue) -> Self {
        queue.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for queue in Queue::ALL {
            assert_eq!(queue.as_str().parse::<Queue>().unwrap(), queue);
        }
        assert!(matches!(
            "os2ds_results".parse::<Queue>(),
            Err(ProtocolError::UnknownQueue(_))
        ));
    }

    #[test]
    fn test_serialises_as_name() {
        assert_eq!(serde_json::to_value(Queue::Handles).unwrap(), "os2ds_handles");
        let queue: Queue = serde_json::from_value(serde_json::json!("os2ds_problems")).unwrap();
        assert_eq!(queue, Queue::Problems);
    }
}
