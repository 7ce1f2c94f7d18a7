// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Historical resource exemption for old iOS binaries.
//!
//! iOS binaries built against SDKs before 9.0 were distributed with App Store
//! DRM files (`SC_Info/*.sinf`, `*.supf`, `*.supp`) that the store added or
//! rewrote after signing. When the signature's version 1 rules omit such a path,
//! its addition (`.sinf`) or alteration (`.supf`/`.supp`) is not a violation.
//!
//! The exemption requires all of:
//!
//! * the main executable declares `LC_VERSION_MIN_IPHONEOS`,
//! * its SDK version is below 9.0,
//! * the path matches the pattern for its kind of change,
//! * the version 1 rules mark the path omitted.

use {
    crate::{code_resources::ResourceRuleSet, macho_rep::MachoTarget},
    log::warn,
    once_cell::sync::Lazy,
    regex::Regex,
};

const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;

static ADDITIONS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(Frameworks/[^/]+\.framework/|PlugIns/[^/]+\.appex/|())SC_Info/[^/]+\.sinf$")
        .expect("static regex is valid")
});

static ALTERATIONS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(Frameworks/[^/]+\.framework/|PlugIns/[^/]+\.appex/|())SC_Info/[^/]+\.(supf|supp)$",
    )
    .expect("static regex is valid")
});

fn is_legacy_target(target: Option<&MachoTarget>) -> bool {
    match target {
        Some(target) => {
            target.version_min_command == Some(LC_VERSION_MIN_IPHONEOS)
                && target.sdk_version < semver::Version::new(9, 0, 0)
        }
        None => false,
    }
}

/// Whether an added or altered resource falls under the legacy exemption.
///
/// `is_addition` selects between the addition and alteration patterns.
pub fn is_legacy_exempt(
    path: &str,
    is_addition: bool,
    target: Option<&MachoTarget>,
    legacy_rules: Option<&ResourceRuleSet>,
) -> bool {
    if !is_legacy_target(target) {
        return false;
    }

    let pattern = if is_addition { &ADDITIONS } else { &ALTERATIONS };
    if !pattern.is_match(path) {
        return false;
    }

    let omitted = legacy_rules
        .and_then(|rules| rules.find_rule(path))
        .map(|rule| rule.omit)
        .unwrap_or(false);

    if omitted {
        warn!("{}: tolerating legacy store modification", path);
    }

    omitted
}
