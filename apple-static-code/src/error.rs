// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Validation status codes and the crate error type.
//!
//! Every failure surfaced by this crate carries a [ValidationStatus]. Statuses
//! are stable numeric codes matching the `errSecCS*` family used by Apple's
//! Security framework, which lets callers express tolerated error sets and
//! monitor vetoes as plain integers.

use {
    crate::embedded_signature::{CodeSigningSlot, DigestType},
    cryptographic_message_syntax::CmsError,
    serde::{Deserialize, Serialize},
    std::{
        fmt::{Display, Formatter},
        path::PathBuf,
    },
    thiserror::Error,
    x509_certificate::X509CertificateError,
};

/// Categorized outcome of a failed validation step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum ValidationStatus {
    Unsigned,
    SignatureFailed,
    SignatureNotVerifiable,
    BadDictionaryFormat,
    ResourcesNotSealed,
    ResourcesNotFound,
    ResourcesInvalid,
    BadResource,
    ResourceRulesInvalid,
    ReqInvalid,
    ReqUnsupported,
    ReqFailed,
    BadObjectFormat,
    InternalError,
    SignatureInvalid,
    InfoPlistFailed,
    ResourceDirectoryFailed,
    BadNestedCode,
    BadCallbackValue,
    Vetoed,
    WeakResourceRules,
    BadFrameworkVersion,
    UnsealedFrameworkRoot,
    WeakResourceEnvelope,
    Cancelled,
    InvalidSymlink,
    UnsupportedDigestAlgorithm,
    InvalidAssociatedFileData,
    InvalidTeamIdentifier,
    BadTeamIdentifier,
    SignatureUntrusted,
    InvalidFlags,
    CertExpired,
    CertNotYetValid,
    CertUntrusted,
    TrustDenied,
    /// A status code without a named variant.
    Other(i32),
}

impl ValidationStatus {
    /// The numeric status code.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidFlags => -67070,
            Self::Unsigned => -67062,
            Self::SignatureFailed => -67061,
            Self::SignatureNotVerifiable => -67060,
            Self::BadDictionaryFormat => -67058,
            Self::ResourcesNotSealed => -67057,
            Self::ResourcesNotFound => -67056,
            Self::ResourcesInvalid => -67055,
            Self::BadResource => -67054,
            Self::ResourceRulesInvalid => -67053,
            Self::ReqInvalid => -67052,
            Self::ReqUnsupported => -67051,
            Self::ReqFailed => -67050,
            Self::BadObjectFormat => -67049,
            Self::InternalError => -67048,
            Self::SignatureInvalid => -67045,
            Self::InfoPlistFailed => -67030,
            Self::ResourceDirectoryFailed => -67023,
            Self::BadNestedCode => -67021,
            Self::BadCallbackValue => -67020,
            Self::Vetoed => -67018,
            Self::WeakResourceRules => -67013,
            Self::BadFrameworkVersion => -67009,
            Self::UnsealedFrameworkRoot => -67008,
            Self::WeakResourceEnvelope => -67007,
            Self::Cancelled => -67006,
            Self::InvalidSymlink => -67003,
            Self::UnsupportedDigestAlgorithm => -67000,
            Self::InvalidAssociatedFileData => -66999,
            Self::InvalidTeamIdentifier => -66998,
            Self::BadTeamIdentifier => -66997,
            Self::SignatureUntrusted => -66996,
            Self::CertExpired => -2147409654,
            Self::CertNotYetValid => -2147409653,
            Self::CertUntrusted => -2147409622,
            Self::TrustDenied => -2147408896,
            Self::Other(v) => *v,
        }
    }

    /// Resolve a numeric status code.
    ///
    /// Unknown codes map to [Self::Other].
    pub fn from_code(code: i32) -> Self {
        [
            Self::InvalidFlags,
            Self::Unsigned,
            Self::SignatureFailed,
            Self::SignatureNotVerifiable,
            Self::BadDictionaryFormat,
            Self::ResourcesNotSealed,
            Self::ResourcesNotFound,
            Self::ResourcesInvalid,
            Self::BadResource,
            Self::ResourceRulesInvalid,
            Self::ReqInvalid,
            Self::ReqUnsupported,
            Self::ReqFailed,
            Self::BadObjectFormat,
            Self::InternalError,
            Self::SignatureInvalid,
            Self::InfoPlistFailed,
            Self::ResourceDirectoryFailed,
            Self::BadNestedCode,
            Self::BadCallbackValue,
            Self::Vetoed,
            Self::WeakResourceRules,
            Self::BadFrameworkVersion,
            Self::UnsealedFrameworkRoot,
            Self::WeakResourceEnvelope,
            Self::Cancelled,
            Self::InvalidSymlink,
            Self::UnsupportedDigestAlgorithm,
            Self::InvalidAssociatedFileData,
            Self::InvalidTeamIdentifier,
            Self::BadTeamIdentifier,
            Self::SignatureUntrusted,
            Self::CertExpired,
            Self::CertNotYetValid,
            Self::CertUntrusted,
            Self::TrustDenied,
        ]
        .into_iter()
        .find(|status| status.code() == code)
        .unwrap_or(Self::Other(code))
    }

    /// Whether this status describes an expired or not yet valid certificate.
    pub fn is_certificate_validity(&self) -> bool {
        matches!(self, Self::CertExpired | Self::CertNotYetValid)
    }
}

impl Display for ValidationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unsigned => "code object is not signed at all",
            Self::SignatureFailed => "invalid signature (code or signature have been modified)",
            Self::SignatureNotVerifiable => "signature cannot be verified",
            Self::BadDictionaryFormat => "a dictionary has an invalid format",
            Self::ResourcesNotSealed => "resources are not sealed",
            Self::ResourcesNotFound => "code has no resources but signature indicates they must be present",
            Self::ResourcesInvalid => "the sealed resource directory is invalid",
            Self::BadResource => "a sealed resource is missing or invalid",
            Self::ResourceRulesInvalid => "invalid resource specification rule(s)",
            Self::ReqInvalid => "invalid or corrupted code requirement(s)",
            Self::ReqUnsupported => "unsupported type or version of code requirement(s)",
            Self::ReqFailed => "code failed to satisfy specified code requirement(s)",
            Self::BadObjectFormat => "the object file format is unrecognizable, invalid, or unsuitable",
            Self::InternalError => "internal error in code signing subsystem",
            Self::SignatureInvalid => "invalid signature",
            Self::InfoPlistFailed => "Info.plist not bound to signature",
            Self::ResourceDirectoryFailed => "resource envelope is obsolete or not bound",
            Self::BadNestedCode => "nested code is modified or invalid",
            Self::BadCallbackValue => "monitor callback returned invalid value",
            Self::Vetoed => "validation vetoed by monitor",
            Self::WeakResourceRules => "resource rules are too weak",
            Self::BadFrameworkVersion => "embedded framework contains modified or invalid version",
            Self::UnsealedFrameworkRoot => "unsealed contents present in the root directory of an embedded framework",
            Self::WeakResourceEnvelope => "resource envelope is obsolete (version 1 signature)",
            Self::Cancelled => "operation was cancelled",
            Self::InvalidSymlink => "invalid destination for symbolic link in bundle",
            Self::UnsupportedDigestAlgorithm => "unsupported digest algorithm",
            Self::InvalidAssociatedFileData => "resource fork, Finder information, or similar detritus not allowed",
            Self::InvalidTeamIdentifier => "invalid team identifier",
            Self::BadTeamIdentifier => "team identifier mismatch",
            Self::SignatureUntrusted => "signature is untrusted",
            Self::InvalidFlags => "invalid or inappropriate flags",
            Self::CertExpired => "certificate has expired",
            Self::CertNotYetValid => "certificate is not yet valid",
            Self::CertUntrusted => "certificate is not trusted",
            Self::TrustDenied => "trust settings deny certificate",
            Self::Other(code) => {
                return f.write_fmt(format_args!("status {}", code));
            }
        };

        f.write_str(s)
    }
}

/// The kind of resource problem recorded during a resource walk.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum ResourceProblemKind {
    /// A file is present that the seal does not cover.
    Added,
    /// A sealed file is absent.
    Missing,
    /// A sealed file differs from its seal.
    Altered,
    /// A seal entry itself is malformed.
    InvalidSeal,
    /// A file carries forbidden associated data.
    Sideband,
}

impl Display for ResourceProblemKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Added => "added",
            Self::Missing => "missing",
            Self::Altered => "altered",
            Self::InvalidSeal => "invalid seal",
            Self::Sideband => "sideband",
        })
    }
}

/// A single offending resource.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ResourceProblem {
    pub kind: ResourceProblemKind,
    pub status: ValidationStatus,
    /// Path relative to the resource root.
    pub path: String,
}

/// Aggregate report of a collecting resource walk.
///
/// `status` is the first status observed. With concurrent hashing it depends
/// on scheduling. `problems` is complete regardless of ordering.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceProblems {
    pub status: ValidationStatus,
    pub problems: Vec<ResourceProblem>,
}

impl ResourceProblems {
    /// Paths of problems having the given kind, sorted.
    pub fn paths_of(&self, kind: ResourceProblemKind) -> Vec<&str> {
        let mut paths = self
            .problems
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.path.as_str())
            .collect::<Vec<_>>();
        paths.sort_unstable();

        paths
    }
}

impl Display for ResourceProblems {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.status))?;

        for problem in &self.problems {
            f.write_fmt(format_args!("; {}: {}", problem.kind, problem.path))?;
        }

        Ok(())
    }
}

/// Error type for static code validation.
#[derive(Debug, Error)]
pub enum CodeValidationError {
    #[error("{0}")]
    Status(ValidationStatus),

    #[error("{status}: {message}")]
    Detailed {
        status: ValidationStatus,
        message: String,
    },

    #[error("{status}: {path}")]
    Resource {
        status: ValidationStatus,
        path: String,
    },

    #[error("{0}")]
    Resources(ResourceProblems),

    #[error("architecture {arch}: {source}")]
    Architecture {
        arch: String,
        source: Box<CodeValidationError>,
    },

    #[error("nested code at {path}: {source}")]
    Nested {
        path: PathBuf,
        source: Box<CodeValidationError>,
    },

    #[error("bad header magic in {0}")]
    BadMagic(&'static str),

    #[error("malformed code directory: {0}")]
    CodeDirectoryMalformed(&'static str),

    #[error("superblob data is malformed")]
    SuperblobMalformed,

    #[error("multiple code directories use digest {0}")]
    DuplicateDigestType(DigestType),

    #[error("unknown digest algorithm")]
    DigestUnknownAlgorithm,

    #[error("component in slot {0:?} does not match its sealed digest")]
    ComponentMismatch(CodeSigningSlot),

    #[error("component in slot {0:?} is sealed but missing")]
    ComponentMissing(CodeSigningSlot),

    #[error("executable page {0} does not match its sealed digest")]
    PageMismatch(usize),

    #[error("sealed directory listing does not match present components")]
    TopDirectoryMismatch,

    #[error("monitor vetoed validation with status {0}")]
    Vetoed(i32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("invalid regular expression in resource rule {0}: {1}")]
    BadRegex(String, regex::Error),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("X.509 certificate error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ValidationStatus> for CodeValidationError {
    fn from(status: ValidationStatus) -> Self {
        Self::Status(status)
    }
}

impl CodeValidationError {
    /// Construct an error with a status and a free form explanation.
    pub fn detailed(status: ValidationStatus, message: impl ToString) -> Self {
        Self::Detailed {
            status,
            message: message.to_string(),
        }
    }

    /// The categorized status of this error.
    pub fn status(&self) -> ValidationStatus {
        match self {
            Self::Status(status) => *status,
            Self::Detailed { status, .. } => *status,
            Self::Resource { status, .. } => *status,
            Self::Resources(problems) => problems.status,
            Self::Architecture { source, .. } => source.status(),
            Self::Nested { source, .. } => source.status(),
            Self::BadMagic(_) => ValidationStatus::SignatureFailed,
            Self::CodeDirectoryMalformed(_) => ValidationStatus::SignatureFailed,
            Self::SuperblobMalformed => ValidationStatus::BadObjectFormat,
            Self::DuplicateDigestType(_) => ValidationStatus::SignatureInvalid,
            Self::DigestUnknownAlgorithm => ValidationStatus::UnsupportedDigestAlgorithm,
            Self::ComponentMismatch(slot) | Self::ComponentMissing(slot) => match slot {
                CodeSigningSlot::Info => ValidationStatus::InfoPlistFailed,
                CodeSigningSlot::ResourceDir => ValidationStatus::ResourceDirectoryFailed,
                _ => ValidationStatus::SignatureFailed,
            },
            Self::PageMismatch(_) => ValidationStatus::SignatureFailed,
            Self::TopDirectoryMismatch => ValidationStatus::SignatureFailed,
            Self::Vetoed(code) => ValidationStatus::from_code(*code),
            Self::Scroll(_) | Self::Goblin(_) => ValidationStatus::BadObjectFormat,
            Self::Plist(_) => ValidationStatus::BadDictionaryFormat,
            Self::BadRegex(_, _) => ValidationStatus::ResourceRulesInvalid,
            Self::Cms(_) | Self::X509(_) => ValidationStatus::SignatureInvalid,
            Self::Io(_) | Self::Internal(_) => ValidationStatus::InternalError,
        }
    }

    /// Whether this error represents an unexpected condition.
    pub fn is_internal(&self) -> bool {
        self.status() == ValidationStatus::InternalError
    }

    /// Attach an architecture name.
    pub fn with_architecture(self, arch: impl ToString) -> Self {
        Self::Architecture {
            arch: arch.to_string(),
            source: Box::new(self),
        }
    }

    /// Attach the path of the nested code this error came from.
    pub fn with_nested_path(self, path: impl Into<PathBuf>) -> Self {
        Self::Nested {
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// Obtain a copy suitable for caching and replaying.
    ///
    /// Aggregate resource reports are kept intact. Everything else is reduced
    /// to its status and rendered message.
    pub fn to_cached(&self) -> Self {
        match self {
            Self::Status(status) => Self::Status(*status),
            Self::Resources(problems) => Self::Resources(problems.clone()),
            Self::Resource { status, path } => Self::Resource {
                status: *status,
                path: path.clone(),
            },
            Self::Architecture { arch, source } => Self::Architecture {
                arch: arch.clone(),
                source: Box::new(source.to_cached()),
            },
            Self::Nested { path, source } => Self::Nested {
                path: path.clone(),
                source: Box::new(source.to_cached()),
            },
            other => Self::Detailed {
                status: other.status(),
                message: other.to_string(),
            },
        }
    }

    /// Find the aggregate resource report inside this error, if any.
    pub fn resource_problems(&self) -> Option<&ResourceProblems> {
        match self {
            Self::Resources(problems) => Some(problems),
            Self::Architecture { source, .. } | Self::Nested { source, .. } => {
                source.resource_problems()
            }
            _ => None,
        }
    }
}

pub type Result<T, E = CodeValidationError> = std::result::Result<T, E>;
