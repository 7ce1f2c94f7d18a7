// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Validation options and engine configuration.

use {
    crate::error::{CodeValidationError, Result, ValidationStatus},
    serde::{Deserialize, Serialize},
    std::{collections::BTreeSet, str::FromStr},
};

bitflags::bitflags! {
    /// Flags governing a static validation.
    ///
    /// Bit values match the `kSecCS*` validation flags.
    pub struct ValidationFlags: u32 {
        /// Validate every architecture slice of a multi-architecture binary.
        const CHECK_ALL_ARCHITECTURES = 1 << 0;
        /// Do not hash the main executable.
        const DO_NOT_VALIDATE_EXECUTABLE = 1 << 1;
        /// Do not scan sealed resources.
        const DO_NOT_VALIDATE_RESOURCES = 1 << 2;
        /// Only validate the signature and code directory.
        const BASIC_VALIDATE_ONLY = Self::DO_NOT_VALIDATE_EXECUTABLE.bits | Self::DO_NOT_VALIDATE_RESOURCES.bits;
        /// Fully validate nested code instead of basic validation only.
        const CHECK_NESTED_CODE = 1 << 3;
        /// Apply strict structural and resource rule checks.
        const STRICT_VALIDATE = 1 << 4;
        /// Report all resource problems rather than the first.
        ///
        /// Accepted and ignored: resource problems are always collected.
        const FULL_REPORT = 1 << 5;
        /// Validate every architecture Gatekeeper cares about.
        const CHECK_GATEKEEPER_ARCHITECTURES = (1 << 6) | Self::CHECK_ALL_ARCHITECTURES.bits;
        /// Symbolic links must resolve inside the code or a system location.
        const RESTRICT_SYMLINKS = 1 << 7;
        /// Restrict nested code to application-like bundles.
        const RESTRICT_TO_APP_LIKE = 1 << 8;
        /// Reject resource forks and Finder information on resources.
        const RESTRICT_SIDEBAND_DATA = 1 << 9;
        /// Evaluate trust under the software signing policy.
        const USE_SOFTWARE_SIGNING_CERT = 1 << 10;
        /// Hash resources on the calling thread only.
        const SINGLE_THREADED = 1 << 12;
        /// Allow the trust collaborator to use the network.
        const ALLOW_NETWORK_ACCESS = 1 << 16;
        /// Set on nested code validated without nested checking.
        const QUICK_CHECK = 1 << 26;
        /// Require the chain to end at a trusted anchor.
        const CHECK_TRUSTED_ANCHORS = 1 << 27;
        /// Report progress to the monitor and allow cancellation.
        const REPORT_PROGRESS = 1 << 28;
        /// Forbid network access during trust evaluation.
        const NO_NETWORK_ACCESS = 1 << 29;
        /// Require revocation checks during trust evaluation.
        const ENFORCE_REVOCATION_CHECKS = 1 << 30;
        /// Treat an expired signing certificate as fatal.
        const CONSIDER_EXPIRATION = 1 << 31;
    }
}

impl FromStr for ValidationFlags {
    type Err = CodeValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check-all-architectures" => Ok(Self::CHECK_ALL_ARCHITECTURES),
            "skip-executable" => Ok(Self::DO_NOT_VALIDATE_EXECUTABLE),
            "skip-resources" => Ok(Self::DO_NOT_VALIDATE_RESOURCES),
            "basic-validate-only" => Ok(Self::BASIC_VALIDATE_ONLY),
            "check-nested-code" => Ok(Self::CHECK_NESTED_CODE),
            "strict" => Ok(Self::STRICT_VALIDATE),
            "full-report" => Ok(Self::FULL_REPORT),
            "check-gatekeeper-architectures" => Ok(Self::CHECK_GATEKEEPER_ARCHITECTURES),
            "restrict-symlinks" => Ok(Self::RESTRICT_SYMLINKS),
            "restrict-to-app-like" => Ok(Self::RESTRICT_TO_APP_LIKE),
            "restrict-sideband-data" => Ok(Self::RESTRICT_SIDEBAND_DATA),
            "use-software-signing-cert" => Ok(Self::USE_SOFTWARE_SIGNING_CERT),
            "single-threaded" => Ok(Self::SINGLE_THREADED),
            "allow-network-access" => Ok(Self::ALLOW_NETWORK_ACCESS),
            "quick-check" => Ok(Self::QUICK_CHECK),
            "check-trusted-anchors" => Ok(Self::CHECK_TRUSTED_ANCHORS),
            "report-progress" => Ok(Self::REPORT_PROGRESS),
            "no-network-access" => Ok(Self::NO_NETWORK_ACCESS),
            "enforce-revocation-checks" => Ok(Self::ENFORCE_REVOCATION_CHECKS),
            "consider-expiration" => Ok(Self::CONSIDER_EXPIRATION),
            _ => Err(CodeValidationError::detailed(
                ValidationStatus::InvalidFlags,
                format!("unknown validation flag: {}", s),
            )),
        }
    }
}

impl ValidationFlags {
    /// Attempt to convert a series of strings into a [ValidationFlags].
    pub fn from_strs(s: &[&str]) -> Result<ValidationFlags> {
        let mut flags = ValidationFlags::empty();

        for s in s {
            flags |= Self::from_str(s)?;
        }

        Ok(flags)
    }

    /// Interpret raw flag bits, rejecting unknown bits.
    pub fn from_raw(bits: u32) -> Result<Self> {
        Self::from_bits(bits).ok_or_else(|| {
            CodeValidationError::detailed(
                ValidationStatus::InvalidFlags,
                format!("unknown validation flag bits {:#x}", bits & !Self::all().bits),
            )
        })
    }

    /// Whether strict validation and `other` are both requested.
    pub fn strict_and(&self, other: ValidationFlags) -> bool {
        self.contains(Self::STRICT_VALIDATE | other)
    }
}

bitflags::bitflags! {
    /// Selects what goes into a signing information report.
    pub struct InformationFlags: u32 {
        const INTERNAL_INFORMATION = 1 << 0;
        const SIGNING_INFORMATION = 1 << 1;
        const REQUIREMENT_INFORMATION = 1 << 2;
        const DYNAMIC_INFORMATION = 1 << 3;
        const CONTENT_INFORMATION = 1 << 4;
        const SKIP_RESOURCE_DIRECTORY = 1 << 5;
    }
}

/// Caller supplied tolerances.
///
/// Parsed from a plist dictionary with an optional `omissions` array of
/// resource rule patterns that may be omitted without making the rules weak,
/// and an optional `errors` array of numeric status codes to tolerate.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ValidationModifiers {
    pub omissions: Vec<String>,
    pub errors: BTreeSet<ValidationStatus>,
}

impl ValidationModifiers {
    pub fn from_plist(value: &plist::Value) -> Result<Self> {
        let dict = value.as_dictionary().ok_or_else(|| {
            CodeValidationError::detailed(
                ValidationStatus::BadDictionaryFormat,
                "validation modifiers must be a dictionary",
            )
        })?;

        let mut res = Self::default();

        for (key, value) in dict.iter() {
            match key.as_str() {
                "omissions" => {
                    let array = value.as_array().ok_or_else(|| {
                        CodeValidationError::detailed(
                            ValidationStatus::BadDictionaryFormat,
                            "omissions must be an array",
                        )
                    })?;

                    for v in array {
                        res.omissions.push(
                            v.as_string()
                                .ok_or_else(|| {
                                    CodeValidationError::detailed(
                                        ValidationStatus::BadDictionaryFormat,
                                        "omissions must be strings",
                                    )
                                })?
                                .to_string(),
                        );
                    }
                }
                "errors" => {
                    let array = value.as_array().ok_or_else(|| {
                        CodeValidationError::detailed(
                            ValidationStatus::BadDictionaryFormat,
                            "errors must be an array",
                        )
                    })?;

                    // Non-integer entries are skipped.
                    for v in array {
                        if let Some(code) = v.as_signed_integer() {
                            res.errors.insert(ValidationStatus::from_code(code as i32));
                        }
                    }
                }
                _ => {
                    return Err(CodeValidationError::detailed(
                        ValidationStatus::BadDictionaryFormat,
                        format!("unknown validation modifier: {}", key),
                    ));
                }
            }
        }

        Ok(res)
    }

    /// Parse from XML or binary plist bytes.
    pub fn from_plist_bytes(data: &[u8]) -> Result<Self> {
        Self::from_plist(&plist::Value::from_reader(std::io::Cursor::new(data))?)
    }

    pub fn tolerates(&self, status: ValidationStatus) -> bool {
        self.errors.contains(&status)
    }
}

/// Storage characteristics of the volume holding resources.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMedium {
    /// Detect from the filesystem.
    Auto,
    Rotational,
    SolidState,
}

impl Default for StorageMedium {
    fn default() -> Self {
        Self::Auto
    }
}

fn default_max_nesting_depth() -> usize {
    32
}

/// Engine level knobs that are not part of a single validation request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Storage medium used to size the resource hashing pool.
    pub medium: StorageMedium,

    /// Explicit number of resource hashing workers. Overrides the medium.
    pub resource_workers: Option<usize>,

    /// Maximum depth of nested code recursion.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            medium: StorageMedium::Auto,
            resource_workers: None,
            max_nesting_depth: default_max_nesting_depth(),
        }
    }
}
