use std::{
    fmt::{Display, Write},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod constraint;
pub mod spec;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error reading {path}: {source}")]
    IO {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("YAML parsing error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("Invalid specification for module `{module}`: {message}")]
    InvalidSpecification { module: ModuleName, message: String },
    #[error("Invalid path pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex_lite::Error,
    },
}

/// Opaque, case-sensitive identifier of a module, e.g. `asyn` or `epics-base`.
#[derive(Clone, Hash, Deserialize, Serialize, Debug, PartialEq, Eq, Ord, PartialOrd)]
#[serde(transparent)]
pub struct ModuleName(String);

impl ModuleName {
    pub fn new(s: impl Into<String>) -> Self {
        ModuleName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The Makefile variable conventionally used for this module: `epics-base` -> `EPICS_BASE`.
    pub fn default_variable(&self) -> String {
        self.0.replace('-', "_").to_uppercase()
    }
}

impl Display for ModuleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ModuleName {
    fn from(s: String) -> Self {
        ModuleName(s)
    }
}

impl From<&str> for ModuleName {
    fn from(s: &str) -> Self {
        ModuleName(s.to_string())
    }
}

/// A requested tag, branch or commit. `Arbitrary` means nothing was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum Revision {
    Pinned {
        revision: String,
    },
    #[default]
    Arbitrary,
}

impl Revision {
    pub fn pinned(revision: impl Into<String>) -> Revision {
        Revision::Pinned {
            revision: revision.into(),
        }
    }

    pub fn is_arbitrary(&self) -> bool {
        self == &Self::Arbitrary
    }

    pub fn as_pinned(&self) -> Option<&str> {
        match self {
            Revision::Pinned { revision } => Some(revision),
            Revision::Arbitrary => None,
        }
    }

    /// Two revisions are compatible when they are equal or one of them is arbitrary.
    pub fn is_compatible_with(&self, other: &Revision) -> bool {
        self.is_arbitrary() || other.is_arbitrary() || self == other
    }
}

impl From<Option<String>> for Revision {
    fn from(value: Option<String>) -> Self {
        value.map(Revision::pinned).unwrap_or_default()
    }
}

impl From<&str> for Revision {
    fn from(value: &str) -> Self {
        Revision::pinned(value)
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Revision::Pinned { revision } => f.write_str(revision),
            Revision::Arbitrary => f.write_char('*'),
        }
    }
}
