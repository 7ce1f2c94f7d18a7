// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! On-disk representations of code.

Code can be a bare Mach-O binary (possibly multi-architecture), a bundle
directory wrapping a main executable, a plain file carrying no embedded
signature, or any of those combined with a detached signature. The
[DiskRep] trait hides these differences: validation only asks for
components by slot, the executable byte range to hash, and where resources
live.

[best_guess] sniffs a path and constructs the most appropriate
representation.
*/

use {
    crate::{
        bundle_rep::BundleRep,
        code_directory::CodeDirectory,
        embedded_signature::{CodeSigningSlot, SuperBlob},
        error::{CodeValidationError, Result, ValidationStatus},
        file_rep::FileRep,
        flags::ValidationFlags,
        macho_rep::{MachORep, MachoTarget},
    },
    goblin::mach::{constants::cputype::CpuType, fat::FAT_MAGIC, parse_magic_and_ctx},
    std::{
        collections::{BTreeMap, BTreeSet},
        fmt::{Debug, Display, Formatter},
        fs::File,
        io::Read,
        path::{Path, PathBuf},
    },
};

/// A CPU architecture of a Mach-O slice.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Architecture {
    pub cpu_type: CpuType,
    pub cpu_subtype: u32,
}

impl Architecture {
    pub fn new(cpu_type: CpuType, cpu_subtype: u32) -> Self {
        Self {
            cpu_type,
            cpu_subtype,
        }
    }

    /// Whether this is a PowerPC architecture.
    pub fn is_powerpc(&self) -> bool {
        self.cpu_type & !goblin::mach::constants::cputype::CPU_ARCH_MASK
            == goblin::mach::constants::cputype::CPU_TYPE_POWERPC
    }

    /// The architecture matching the running process, if any.
    pub fn native() -> Option<CpuType> {
        match std::env::consts::ARCH {
            "x86_64" => Some(goblin::mach::constants::cputype::CPU_TYPE_X86_64),
            "aarch64" => Some(goblin::mach::constants::cputype::CPU_TYPE_ARM64),
            "x86" => Some(goblin::mach::constants::cputype::CPU_TYPE_X86),
            "arm" => Some(goblin::mach::constants::cputype::CPU_TYPE_ARM),
            _ => None,
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match goblin::mach::constants::cputype::get_arch_name_from_types(
            self.cpu_type,
            self.cpu_subtype,
        ) {
            Some(name) => f.write_str(name),
            None => f.write_fmt(format_args!(
                "cputype {} subtype {}",
                self.cpu_type, self.cpu_subtype
            )),
        }
    }
}

/// Where a signature came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureSource {
    Embedded,
    Detached,
}

impl Display for SignatureSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Embedded => "embedded",
            Self::Detached => "explicit detached",
        })
    }
}

/// Access to code and signature data stored on disk.
pub trait DiskRep: Debug + Send + Sync {
    /// Canonical path of the code.
    fn path(&self) -> &Path;

    /// Path of the main executable file.
    fn main_executable_path(&self) -> PathBuf;

    /// Short human readable format description.
    fn format(&self) -> String;

    /// Raw bytes of the component stored in a slot.
    ///
    /// Absence is `Ok(None)`. Errors are reserved for unreadable or malformed
    /// storage.
    fn component(&self, slot: CodeSigningSlot) -> Result<Option<Vec<u8>>>;

    /// The CMS signature bytes, if any.
    fn signature(&self) -> Result<Option<Vec<u8>>> {
        self.component(CodeSigningSlot::Signature)
    }

    fn signature_source(&self) -> SignatureSource {
        SignatureSource::Embedded
    }

    /// Architecture of the selected slice of a Mach-O main executable.
    fn architecture(&self) -> Option<Architecture> {
        None
    }

    /// All architectures present in the main executable.
    fn architectures(&self) -> Vec<Architecture> {
        vec![]
    }

    /// Construct a representation of the same code focused on another slice.
    fn for_architecture(&self, arch: Architecture) -> Result<Box<dyn DiskRep>> {
        Err(CodeValidationError::detailed(
            ValidationStatus::BadObjectFormat,
            format!("{} has no architecture {}", self.path().display(), arch),
        ))
    }

    /// File offset of the signed range of the main executable.
    fn signing_base(&self) -> u64 {
        0
    }

    /// Length of the signable range of the main executable.
    fn signing_limit(&self) -> Result<u64>;

    /// Directory against which resources are validated.
    fn resources_root(&self) -> Option<PathBuf> {
        None
    }

    /// Resource rule patterns that may be omitted without the rules being weak.
    fn allowed_resource_omissions(&self) -> Vec<String> {
        vec![]
    }

    /// Patterns of files under the resource root that belong to the
    /// representation itself and are never resources.
    fn resource_exclusions(&self) -> Vec<String> {
        vec![]
    }

    /// Format specific structural checks run under strict validation.
    ///
    /// Problems whose status is in `tolerated` are ignored.
    fn strict_validate(
        &self,
        _cd: Option<&CodeDirectory>,
        _tolerated: &BTreeSet<ValidationStatus>,
        _flags: ValidationFlags,
    ) -> Result<()> {
        Ok(())
    }

    /// Deployment target of the main executable, if known.
    fn macho_target(&self) -> Option<MachoTarget> {
        None
    }

    /// Representation specific descriptive values.
    fn information(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Drop any cached file content.
    fn flush(&self) {}
}

/// Obtain the raw bytes of a slot from a superblob.
///
/// The CMS slot yields the wrapped payload, or nothing when it is empty.
pub(crate) fn superblob_component(
    superblob: &SuperBlob,
    slot: CodeSigningSlot,
) -> Result<Option<Vec<u8>>> {
    if slot == CodeSigningSlot::Signature {
        Ok(superblob.signature_data()?.map(|data| data.to_vec()))
    } else {
        Ok(superblob.find_slot(slot).map(|entry| entry.data.to_vec()))
    }
}

/// Whether the file at a path starts with Mach-O or universal magic.
pub fn path_is_macho(path: &Path) -> Result<bool> {
    let mut fh = File::open(path)?;

    let mut header = [0u8; 4];
    let count = fh.read(&mut header)?;

    if count < 4 {
        return Ok(false);
    }

    let magic = goblin::mach::peek(&header, 0)?;

    Ok(magic == FAT_MAGIC || parse_magic_and_ctx(&header, 0).is_ok())
}

/// Construct the best fitting representation of the code at a path.
pub fn best_guess(path: &Path) -> Result<Box<dyn DiskRep>> {
    best_guess_slice(path, None)
}

/// Like [best_guess], selecting a specific architecture of a Mach-O.
pub fn best_guess_slice(path: &Path, arch: Option<Architecture>) -> Result<Box<dyn DiskRep>> {
    let metadata = std::fs::metadata(path)?;

    if metadata.is_dir() {
        Ok(Box::new(BundleRep::open(path, arch)?))
    } else if path_is_macho(path)? {
        Ok(Box::new(MachORep::open(path, arch)?))
    } else {
        Ok(Box::new(FileRep::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_names() {
        let arm64 = Architecture::new(goblin::mach::constants::cputype::CPU_TYPE_ARM64, 0);
        assert_eq!(arm64.to_string(), "arm64");
        assert!(!arm64.is_powerpc());

        let ppc = Architecture::new(goblin::mach::constants::cputype::CPU_TYPE_POWERPC, 0);
        assert!(ppc.is_powerpc());
    }

    #[test]
    fn sniff_plain_file() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("script.sh");
        std::fs::write(&path, b"#!/bin/sh\n")?;

        assert!(!path_is_macho(&path)?);

        let rep = best_guess(&path)?;
        assert_eq!(rep.format(), "generic");
        assert_eq!(rep.signing_limit()?, 10);

        Ok(())
    }
}
