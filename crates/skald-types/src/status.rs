//! Wire status codes.
//!
//! Every reply to the supervisor carries one of these codes. The
//! numeric values are part of the wire contract and must not change.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Status code of a reply.
///
/// Codes below 100 describe command outcomes (engine and registry
/// results); codes 100 and above describe dispatch-layer shedding
/// (staleness gates and backpressure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Command succeeded.
    Ok,
    /// Generic failure (unsupported command, unexpected error).
    Err,
    /// Script failed to compile or did not evaluate to a function.
    CompileErr,
    /// No function was ever compiled for the requested pair.
    NotFoundPairErr,
    /// The pair exists but its function was removed.
    NotFunctionErr,
    /// The run payload was not valid JSON.
    BadInputErr,
    /// The script raised an error at runtime.
    ScriptRuntimeErr,
    /// The script was terminated for exceeding its time budget.
    ScriptTerminatedErr,
    /// The requested library is not in the module cache.
    CachedRequireFileErr,
    /// Request was already stale on arrival.
    SocketTimeout,
    /// Request went stale while queued in the worker pool.
    ThreadPoolTimeout,
    /// Worker pool backlog is full; request was shed.
    ThreadPoolExhausted,
}

impl Status {
    /// Numeric wire code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::Err => 1,
            Self::CompileErr => 2,
            Self::NotFoundPairErr => 3,
            Self::NotFunctionErr => 4,
            Self::BadInputErr => 5,
            Self::ScriptRuntimeErr => 6,
            Self::ScriptTerminatedErr => 7,
            Self::CachedRequireFileErr => 8,
            Self::SocketTimeout => 100,
            Self::ThreadPoolTimeout => 101,
            Self::ThreadPoolExhausted => 102,
        }
    }

    /// Inverse of [`Status::code`].
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Ok,
            1 => Self::Err,
            2 => Self::CompileErr,
            3 => Self::NotFoundPairErr,
            4 => Self::NotFunctionErr,
            5 => Self::BadInputErr,
            6 => Self::ScriptRuntimeErr,
            7 => Self::ScriptTerminatedErr,
            8 => Self::CachedRequireFileErr,
            100 => Self::SocketTimeout,
            101 => Self::ThreadPoolTimeout,
            102 => Self::ThreadPoolExhausted,
            _ => return None,
        })
    }

    /// True for the dispatch-layer shedding codes (100..).
    #[must_use]
    pub const fn is_shed(self) -> bool {
        self.code() >= 100
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u32::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown status code {code}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in (0..=8).chain(100..=102) {
            let status = Status::from_code(code).expect("known code");
            assert_eq!(status.code(), code);
        }
        assert_eq!(Status::from_code(9), None);
        assert_eq!(Status::from_code(103), None);
    }

    #[test]
    fn serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Status::Ok).unwrap(), "0");
        assert_eq!(serde_json::to_string(&Status::ThreadPoolExhausted).unwrap(), "102");
        let back: Status = serde_json::from_str("7").unwrap();
        assert_eq!(back, Status::ScriptTerminatedErr);
        assert!(serde_json::from_str::<Status>("55").is_err());
    }

    #[test]
    fn shed_codes() {
        assert!(Status::SocketTimeout.is_shed());
        assert!(Status::ThreadPoolTimeout.is_shed());
        assert!(Status::ThreadPoolExhausted.is_shed());
        assert!(!Status::CompileErr.is_shed());
    }
}
