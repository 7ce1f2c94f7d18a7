// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mach-O representation.

Code signing data is embedded within the `__LINKEDIT` segment of a Mach-O
binary. An `LC_CODE_SIGNATURE` load command in the Mach-O header points at
this data, which is a superblob of signature components. The signed range of
a slice starts at the slice's first byte and ends where the signature data
starts.

Universal (fat) binaries contain several slices. A [MachORep] is focused on
one of them. Without an explicit choice the slice of the running
architecture is preferred, falling back to the first slice.
*/

use {
    crate::{
        code_directory::CodeDirectory,
        disk_rep::{superblob_component, Architecture, DiskRep},
        embedded_signature::{CodeSigningMagic, CodeSigningSlot, SuperBlob},
        error::{CodeValidationError, Result, ValidationStatus},
        flags::ValidationFlags,
    },
    goblin::mach::{
        constants::{cputype::CPU_SUBTYPE_MASK, SEG_LINKEDIT, SEG_TEXT},
        load_command::{CommandVariant, LC_BUILD_VERSION},
        parse_magic_and_ctx, Mach, MachO,
    },
    log::debug,
    scroll::Pread,
    std::{
        collections::{BTreeMap, BTreeSet},
        path::{Path, PathBuf},
    },
};

/// Content of an `LC_BUILD_VERSION` load command.
#[derive(Clone, Debug, Pread)]
struct BuildVersionCommand {
    cmd: u32,
    cmdsize: u32,
    platform: u32,
    /// X.Y.Z encoded in nibbles as xxxx.yy.zz.
    minos: u32,
    /// X.Y.Z encoded in nibbles as xxxx.yy.zz.
    sdk: u32,
    ntools: u32,
}

/// Represents `PLATFORM_` mach-o constants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    MacOs,
    IOs,
    TvOs,
    WatchOs,
    BridgeOs,
    MacCatalyst,
    IosSimulator,
    TvOsSimulator,
    WatchOsSimulator,
    DriverKit,
    Unknown(u32),
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MacOs => f.write_str("macOS"),
            Self::IOs => f.write_str("iOS"),
            Self::TvOs => f.write_str("tvOS"),
            Self::WatchOs => f.write_str("watchOS"),
            Self::BridgeOs => f.write_str("bridgeOS"),
            Self::MacCatalyst => f.write_str("macCatalyst"),
            Self::IosSimulator => f.write_str("iOSSimulator"),
            Self::TvOsSimulator => f.write_str("tvOSSimulator"),
            Self::WatchOsSimulator => f.write_str("watchOSSimulator"),
            Self::DriverKit => f.write_str("driverKit"),
            Self::Unknown(v) => f.write_fmt(format_args!("Unknown ({})", v)),
        }
    }
}

impl From<u32> for Platform {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::MacOs,
            2 => Self::IOs,
            3 => Self::TvOs,
            4 => Self::WatchOs,
            5 => Self::BridgeOs,
            6 => Self::MacCatalyst,
            7 => Self::IosSimulator,
            8 => Self::TvOsSimulator,
            9 => Self::WatchOsSimulator,
            10 => Self::DriverKit,
            _ => Self::Unknown(v),
        }
    }
}

/// Targeting settings for a Mach-O binary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachoTarget {
    /// The OS/platform being targeted.
    pub platform: Platform,
    /// Minimum required OS version.
    pub minimum_os_version: semver::Version,
    /// SDK version targeting.
    pub sdk_version: semver::Version,
    /// The `LC_VERSION_MIN_*` command this came from, if not `LC_BUILD_VERSION`.
    pub version_min_command: Option<u32>,
}

/// Parses and integer with nibbles xxxx.yy.zz into a [semver::Version].
pub fn parse_version_nibbles(v: u32) -> semver::Version {
    let major = v >> 16;
    let minor = v << 16 >> 24;
    let patch = v & 0xff;

    semver::Version::new(major as _, minor as _, patch as _)
}

/// Attempt to resolve the mach-o targeting settings for a mach-o binary.
fn find_macho_targeting(macho_data: &[u8], macho: &MachO) -> Result<Option<MachoTarget>> {
    let ctx = match parse_magic_and_ctx(macho_data, 0)?.1 {
        Some(ctx) => ctx,
        None => return Ok(None),
    };

    for lc in &macho.load_commands {
        if lc.command.cmd() == LC_BUILD_VERSION {
            let build_version = macho_data.pread_with::<BuildVersionCommand>(lc.offset, ctx.le)?;

            return Ok(Some(MachoTarget {
                platform: build_version.platform.into(),
                minimum_os_version: parse_version_nibbles(build_version.minos),
                sdk_version: parse_version_nibbles(build_version.sdk),
                version_min_command: None,
            }));
        }
    }

    for lc in &macho.load_commands {
        let command = match lc.command {
            CommandVariant::VersionMinMacosx(c) => Some((c, Platform::MacOs)),
            CommandVariant::VersionMinIphoneos(c) => Some((c, Platform::IOs)),
            CommandVariant::VersionMinTvos(c) => Some((c, Platform::TvOs)),
            CommandVariant::VersionMinWatchos(c) => Some((c, Platform::WatchOs)),
            _ => None,
        };

        if let Some((command, platform)) = command {
            return Ok(Some(MachoTarget {
                platform,
                minimum_os_version: parse_version_nibbles(command.version),
                sdk_version: parse_version_nibbles(command.sdk),
                version_min_command: Some(command.cmd),
            }));
        }
    }

    Ok(None)
}

/// A slice of a (possibly universal) Mach-O file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MachOSlice {
    pub architecture: Architecture,
    /// File offset of the slice.
    pub offset: u64,
    /// Length of the slice.
    pub size: u64,
}

/// What we learned from parsing the selected slice.
#[derive(Clone, Debug, Default)]
struct SliceAnalysis {
    signature: Option<Vec<u8>>,
    signature_offset: Option<u64>,
    info_plist: Option<Vec<u8>>,
    target: Option<MachoTarget>,
    linkedit_last: bool,
    data_after_signature: bool,
}

fn analyze_slice(data: &[u8], macho: &MachO) -> Result<SliceAnalysis> {
    let mut res = SliceAnalysis {
        target: find_macho_targeting(data, macho)?,
        linkedit_last: matches!(
            macho.segments.iter().last().map(|segment| segment.name()),
            Some(Ok(SEG_LINKEDIT))
        ),
        ..Default::default()
    };

    let signature_command = macho.load_commands.iter().find_map(|lc| {
        if let CommandVariant::CodeSignature(command) = &lc.command {
            Some(*command)
        } else {
            None
        }
    });

    if let Some(command) = signature_command {
        let start = command.dataoff as usize;
        let end = start + command.datasize as usize;

        let signature = data.get(start..end).ok_or_else(|| {
            CodeValidationError::detailed(
                ValidationStatus::BadObjectFormat,
                "code signature extends beyond end of file",
            )
        })?;

        res.signature = Some(signature.to_vec());
        res.signature_offset = Some(start as u64);
        res.data_after_signature = end != data.len();

        if let Some(linkedit) = macho
            .segments
            .iter()
            .find(|segment| matches!(segment.name(), Ok(SEG_LINKEDIT)))
        {
            res.data_after_signature |= end as u64 != linkedit.fileoff + linkedit.filesize;
        }
    }

    for segment in macho.segments.iter() {
        if !matches!(segment.name(), Ok(SEG_TEXT)) {
            continue;
        }

        for (section, section_data) in segment.sections()? {
            if matches!(section.name(), Ok("__info_plist")) {
                res.info_plist = Some(section_data.to_vec());
            }
        }
    }

    Ok(res)
}

/// Enumerate the slices of a Mach-O file.
pub fn macho_slices(data: &[u8]) -> Result<(bool, Vec<MachOSlice>)> {
    match Mach::parse(data)? {
        Mach::Binary(macho) => Ok((
            false,
            vec![MachOSlice {
                architecture: Architecture::new(macho.header.cputype, macho.header.cpusubtype),
                offset: 0,
                size: data.len() as u64,
            }],
        )),
        Mach::Fat(multiarch) => {
            let slices = multiarch
                .iter_arches()
                .map(|arch| {
                    let arch = arch?;

                    Ok(MachOSlice {
                        architecture: Architecture::new(arch.cputype, arch.cpusubtype),
                        offset: arch.offset as u64,
                        size: arch.size as u64,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok((true, slices))
        }
    }
}

fn same_architecture(a: &Architecture, b: &Architecture) -> bool {
    a.cpu_type == b.cpu_type
        && (a.cpu_subtype & !CPU_SUBTYPE_MASK) == (b.cpu_subtype & !CPU_SUBTYPE_MASK)
}

/// A Mach-O main executable focused on one slice.
#[derive(Clone, Debug)]
pub struct MachORep {
    path: PathBuf,
    universal: bool,
    slices: Vec<MachOSlice>,
    slice: MachOSlice,
    analysis: SliceAnalysis,
}

impl MachORep {
    /// Open a Mach-O file, optionally selecting a slice.
    pub fn open(path: &Path, arch: Option<Architecture>) -> Result<Self> {
        let data = std::fs::read(path)?;

        let (universal, slices) = macho_slices(&data)?;

        let slice = match arch {
            Some(wanted) => slices
                .iter()
                .find(|s| same_architecture(&s.architecture, &wanted))
                .copied()
                .ok_or_else(|| {
                    CodeValidationError::detailed(
                        ValidationStatus::BadObjectFormat,
                        format!("{} has no architecture {}", path.display(), wanted),
                    )
                })?,
            None => Architecture::native()
                .and_then(|native| {
                    slices
                        .iter()
                        .find(|s| s.architecture.cpu_type == native)
                        .copied()
                })
                .or_else(|| slices.first().copied())
                .ok_or_else(|| {
                    CodeValidationError::detailed(
                        ValidationStatus::BadObjectFormat,
                        "universal binary has no slices",
                    )
                })?,
        };

        let start = slice.offset as usize;
        let end = start.saturating_add(slice.size as usize);
        let slice_data = data.get(start..end).ok_or_else(|| {
            CodeValidationError::detailed(
                ValidationStatus::BadObjectFormat,
                "slice extends beyond end of file",
            )
        })?;

        let macho = MachO::parse(slice_data, 0)?;
        let analysis = analyze_slice(slice_data, &macho)?;

        debug!(
            "opened Mach-O {} slice {} (signed: {})",
            path.display(),
            slice.architecture,
            analysis.signature.is_some()
        );

        Ok(Self {
            path: path.to_path_buf(),
            universal,
            slices,
            slice,
            analysis,
        })
    }

    /// Whether the file is a universal binary.
    pub fn is_universal(&self) -> bool {
        self.universal
    }

    pub fn slice(&self) -> &MachOSlice {
        &self.slice
    }

    /// The embedded signature superblob bytes, if signed.
    pub fn signature_data(&self) -> Option<&[u8]> {
        self.analysis.signature.as_deref()
    }
}

impl DiskRep for MachORep {
    fn path(&self) -> &Path {
        &self.path
    }

    fn main_executable_path(&self) -> PathBuf {
        self.path.clone()
    }

    fn format(&self) -> String {
        if self.universal {
            format!("Mach-O universal ({})", self.slice.architecture)
        } else {
            format!("Mach-O thin ({})", self.slice.architecture)
        }
    }

    fn component(&self, slot: CodeSigningSlot) -> Result<Option<Vec<u8>>> {
        if slot == CodeSigningSlot::Info {
            return Ok(self.analysis.info_plist.clone());
        }

        match &self.analysis.signature {
            Some(data) => {
                let superblob = SuperBlob::from_bytes(data, CodeSigningMagic::EmbeddedSignature)?;

                superblob_component(&superblob, slot)
            }
            None => Ok(None),
        }
    }

    fn architecture(&self) -> Option<Architecture> {
        Some(self.slice.architecture)
    }

    fn architectures(&self) -> Vec<Architecture> {
        self.slices.iter().map(|s| s.architecture).collect()
    }

    fn for_architecture(&self, arch: Architecture) -> Result<Box<dyn DiskRep>> {
        Ok(Box::new(Self::open(&self.path, Some(arch))?))
    }

    fn signing_base(&self) -> u64 {
        self.slice.offset
    }

    fn signing_limit(&self) -> Result<u64> {
        Ok(self.analysis.signature_offset.unwrap_or(self.slice.size))
    }

    fn strict_validate(
        &self,
        _cd: Option<&CodeDirectory>,
        tolerated: &BTreeSet<ValidationStatus>,
        _flags: ValidationFlags,
    ) -> Result<()> {
        if tolerated.contains(&ValidationStatus::BadObjectFormat) {
            return Ok(());
        }

        if self.analysis.signature.is_some() && !self.analysis.linkedit_last {
            return Err(CodeValidationError::detailed(
                ValidationStatus::BadObjectFormat,
                "__LINKEDIT is not the last segment",
            ));
        }

        if self.analysis.data_after_signature {
            return Err(CodeValidationError::detailed(
                ValidationStatus::BadObjectFormat,
                "data found after code signature",
            ));
        }

        Ok(())
    }

    fn macho_target(&self) -> Option<MachoTarget> {
        self.analysis.target.clone()
    }

    fn information(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();

        info.insert("architecture".into(), self.slice.architecture.to_string());
        info.insert("slice-offset".into(), self.slice.offset.to_string());

        if let Some(target) = &self.analysis.target {
            info.insert("platform".into(), target.platform.to_string());
            info.insert(
                "minimum-os-version".into(),
                target.minimum_os_version.to_string(),
            );
            info.insert("sdk-version".into(), target.sdk_version.to_string());
        }

        info
    }
}

/// Synthesis of minimal Mach-O files for tests.
#[cfg(test)]
pub(crate) mod testutil {
    use goblin::mach::constants::cputype::{CPU_TYPE_ARM64, CPU_TYPE_X86_64};

    pub const ARM64: u32 = CPU_TYPE_ARM64;
    pub const X86_64: u32 = CPU_TYPE_X86_64;

    const LC_SEGMENT_64: u32 = 0x19;
    const LC_CODE_SIGNATURE: u32 = 0x1d;
    const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;

    fn segment(out: &mut Vec<u8>, name: &str, fileoff: u64, filesize: u64) {
        let mut segname = [0u8; 16];
        segname[..name.len()].copy_from_slice(name.as_bytes());

        out.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
        out.extend_from_slice(&72u32.to_le_bytes());
        out.extend_from_slice(&segname);
        out.extend_from_slice(&fileoff.to_le_bytes()); // vmaddr
        out.extend_from_slice(&filesize.to_le_bytes()); // vmsize
        out.extend_from_slice(&fileoff.to_le_bytes());
        out.extend_from_slice(&filesize.to_le_bytes());
        out.extend_from_slice(&5u32.to_le_bytes()); // maxprot
        out.extend_from_slice(&5u32.to_le_bytes()); // initprot
        out.extend_from_slice(&0u32.to_le_bytes()); // nsects
        out.extend_from_slice(&0u32.to_le_bytes()); // flags
    }

    /// Produce the signed range of a thin 64-bit Mach-O.
    ///
    /// The file is `prefix + signature` where the signature is `sig_len` bytes.
    pub fn thin_macho_prefix(
        cpu_type: u32,
        payload: &[u8],
        sig_len: usize,
        ios_sdk: Option<u32>,
    ) -> Vec<u8> {
        let ncmds = if ios_sdk.is_some() { 4u32 } else { 3 };
        let sizeofcmds = 72 * 2 + 16 + if ios_sdk.is_some() { 16 } else { 0 };
        let text_end = (32 + sizeofcmds + payload.len()) as u64;

        let mut out = Vec::new();
        out.extend_from_slice(&0xfeedfacfu32.to_le_bytes());
        out.extend_from_slice(&cpu_type.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&2u32.to_le_bytes()); // MH_EXECUTE
        out.extend_from_slice(&ncmds.to_le_bytes());
        out.extend_from_slice(&(sizeofcmds as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        segment(&mut out, "__TEXT", 0, text_end);
        segment(&mut out, "__LINKEDIT", text_end, sig_len as u64);

        out.extend_from_slice(&LC_CODE_SIGNATURE.to_le_bytes());
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&(text_end as u32).to_le_bytes());
        out.extend_from_slice(&(sig_len as u32).to_le_bytes());

        if let Some(sdk) = ios_sdk {
            out.extend_from_slice(&LC_VERSION_MIN_IPHONEOS.to_le_bytes());
            out.extend_from_slice(&16u32.to_le_bytes());
            out.extend_from_slice(&0x00070000u32.to_le_bytes());
            out.extend_from_slice(&sdk.to_le_bytes());
        }

        out.extend_from_slice(payload);
        assert_eq!(out.len() as u64, text_end);

        out
    }

    /// Combine thin slices into a universal binary.
    pub fn universal(slices: &[(u32, Vec<u8>)]) -> Vec<u8> {
        const ALIGN: usize = 4096;

        let mut out = Vec::new();
        out.extend_from_slice(&0xcafebabeu32.to_be_bytes());
        out.extend_from_slice(&(slices.len() as u32).to_be_bytes());

        let mut offset = ALIGN;
        let mut offsets = vec![];
        for (cpu_type, data) in slices {
            out.extend_from_slice(&cpu_type.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&(offset as u32).to_be_bytes());
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(&12u32.to_be_bytes());
            offsets.push(offset);
            offset += (data.len() + ALIGN - 1) / ALIGN * ALIGN;
        }

        for ((_, data), offset) in slices.iter().zip(offsets) {
            out.resize(offset, 0);
            out.extend_from_slice(data);
        }

        out
    }
}
