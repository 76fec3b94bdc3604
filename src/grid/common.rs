//! Common types shared between grid interface implementations

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Supported grid backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GridType {
    /// REST gateway in front of the grid's job management service
    #[default]
    Rest,
    /// Scripted in-process backend used by the test suite
    Fake,
}

/// Result envelope returned by every grid gateway operation.
///
/// `ok == false` is an application-level failure and carries a backend
/// message; a transport failure surfaces as an `Err` from the call itself.
/// Callers must check both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct GridEnvelope<T> {
    pub ok: bool,
    #[serde(default)]
    pub value: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> GridEnvelope<T> {
    pub fn success(value: T) -> Self {
        Self {
            ok: true,
            value: Some(value),
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            message: Some(message.into()),
        }
    }

    /// Backend message, or a placeholder when the backend sent none.
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("<no message>")
    }
}

/// One parametric job definition handed to the grid for expansion.
///
/// The backend creates one sub-job per parameter value and returns the
/// assigned remote ids. An oversized parametric job is split across several
/// definitions by the job template so no single submission call times out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridJobDefinition {
    pub name: String,
    pub executable: String,
    pub args: Vec<String>,
    /// Parameter values, one sub-job each.
    pub parameters: Vec<i64>,
    pub site: String,
    pub priority: i16,
    /// Local files shipped alongside the job (runscript and friends).
    pub input_sandbox: Vec<PathBuf>,
}
