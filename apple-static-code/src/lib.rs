// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static validation of Apple code signatures.
//!
//! This crate checks that code on disk is intact with respect to its code
//! signature, the way Apple's Security framework does for `SecStaticCode`
//! objects. It works on any platform: you can validate macOS and iOS
//! binaries and bundles from Linux or Windows.
//!
//! # Features and Capabilities
//!
//! This crate can:
//!
//! * Locate code and its signature in Mach-O binaries (thin and universal),
//!   bundles and arbitrary files. (See [DiskRep] and [best_guess].)
//! * Use detached signatures, including multi-architecture detached
//!   signature files. (See [StaticCode::attach_detached_signature].)
//! * Select the strongest of multiple code directories and verify every one
//!   of them against the executable pages.
//! * Verify the CMS signature over the code directories and evaluate the
//!   signing certificate chain. (See [SignatureDecoder] and
//!   [TrustEvaluator], pluggable for custom trust policies.)
//! * Validate sealed resources of bundles, in parallel, collecting every
//!   added, missing and altered file into one report. Nested code is
//!   validated recursively against its sealed requirement.
//! * Evaluate a subset of the code requirement language. (See
//!   [ClauseRequirementCompiler].)
//! * Report progress to a monitor and honor cooperative cancellation.
//!   (See [ValidationMonitor].)
//! * Produce a signing information report. (See
//!   [StaticCode::signing_information].)
//!
//! # Getting Started
//!
//! Open code with [StaticCode::open] and call
//! [StaticCode::static_validate]:
//!
//! ```no_run
//! use apple_static_code::{StaticCode, ValidationEnvironment, ValidationFlags};
//!
//! let mut code = StaticCode::open(
//!     std::path::Path::new("/Applications/Calculator.app"),
//!     ValidationEnvironment::default(),
//! )?;
//!
//! code.static_validate(
//!     ValidationFlags::STRICT_VALIDATE | ValidationFlags::CHECK_NESTED_CODE,
//!     None,
//! )?;
//! # Ok::<(), apple_static_code::CodeValidationError>(())
//! ```
//!
//! Every failure maps to a [ValidationStatus] through
//! [CodeValidationError::status].
//!
//! What this crate does not do: it does not sign code, it does not evaluate
//! the full requirement language and it does not consult the system trust
//! store. Trust anchors must be configured explicitly.

mod bundle_rep;
pub use bundle_rep::*;
mod code_directory;
pub use code_directory::{CodeDirectory, CodeDirectoryBlob, CodeSignatureFlags};
pub mod code_resources;
mod detached_rep;
pub use detached_rep::*;
pub mod digest;
pub mod directories;
pub use directories::CodeDirectoryMap;
mod disk_rep;
pub use disk_rep::*;
pub mod embedded_signature;
pub use embedded_signature::{CodeSigningSlot, DigestType};
mod error;
pub use error::*;
mod file_rep;
pub use file_rep::*;
mod flags;
pub use flags::*;
mod legacy;
mod macho_rep;
pub use macho_rep::{MachORep, MachoTarget, Platform};
mod progress;
pub use progress::*;
pub mod requirement;
pub use requirement::{ClauseRequirementCompiler, Requirement, RequirementCompiler};
pub mod resource_walker;
pub mod signature;
pub use signature::{
    CmsSignatureDecoder, SignatureDecoder, SignatureVerification, TrustEvaluator,
    X509TrustEvaluator,
};
mod static_code;
pub use static_code::*;
mod validator;
