//! Scene code parsing.
//!
//! A scene code names a fault as dot-separated segments:
//! `<family>.<target>.<action>[.stop]`, e.g. `chaosblade.cpu.fullload` or
//! `chaosblade.cpu.fullload.stop` for its recovery counterpart.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Suffix marking the recover counterpart of a scene.
pub const RECOVER_SUFFIX: &str = ".stop";

const MIN_SEGMENTS: usize = 3;

/// A parsed scene code.
///
/// Parsing validates the segment count once, so the accessors never fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SceneCode {
    raw: String,
    segments: Vec<String>,
}

impl SceneCode {
    /// Parse a scene code, rejecting codes with fewer than three segments.
    pub fn parse(code: &str) -> Result<Self, EngineError> {
        let segments: Vec<String> = code.split('.').map(str::to_string).collect();
        if segments.len() < MIN_SEGMENTS {
            return Err(EngineError::MalformedSceneCode {
                code: code.to_string(),
            });
        }
        Ok(Self {
            raw: code.to_string(),
            segments,
        })
    }

    /// The full code as given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// First segment: the fault family used to route to an invoker.
    ///
    /// Always the first segment only, however many segments follow.
    pub fn original(&self) -> &str {
        &self.segments[0]
    }

    /// Second segment.
    pub fn target(&self) -> &str {
        &self.segments[1]
    }

    /// Third segment.
    pub fn action(&self) -> &str {
        &self.segments[2]
    }

    /// Third segment, read as the type to prepare.
    pub fn prepare_type(&self) -> &str {
        self.action()
    }

    pub fn is_recover(&self) -> bool {
        self.raw.ends_with(RECOVER_SUFFIX)
    }

    /// The code with a trailing recover suffix removed.
    pub fn without_recover(&self) -> &str {
        self.raw.strip_suffix(RECOVER_SUFFIX).unwrap_or(&self.raw)
    }
}

impl fmt::Display for SceneCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for SceneCode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SceneCode {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SceneCode> for String {
    fn from(value: SceneCode) -> Self {
        value.raw
    }
}
