// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure and its validating accessor.
//!
//! A code directory seals the pages of an executable and a handful of
//! auxiliary components. Digests of code pages live at non-negative indices
//! of the digest table. Digests of *special slots* (Info.plist, resources,
//! entitlements, ...) live at negative indices immediately before
//! `hash_offset`, with slot `n` at index `-n`.
//!
//! [CodeDirectoryBlob] is the raw data structure. [CodeDirectory] pairs a
//! structurally validated blob with the exact bytes it was parsed from, which
//! is what digests and signatures bind to.

use {
    crate::{
        embedded_signature::{
            read_and_validate_blob_header, Blob, CodeSigningMagic, CodeSigningSlot, Digest,
            DigestType,
        },
        error::{CodeValidationError, Result},
    },
    scroll::{IOwrite, Pread},
    std::{borrow::Cow, collections::BTreeMap, io::Write},
};

bitflags::bitflags! {
    /// Code signature flags.
    ///
    /// These flags are embedded in the Code Directory and govern use of the embedded
    /// signature.
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host that controls and supervises guest code.
        const HOST = 0x0001;
        /// The code has been sealed without a signing identity.
        const ADHOC = 0x0002;
        /// Set the "hard" status bit for the code when it starts running.
        const FORCE_HARD = 0x0100;
        /// Implicitly set the "kill" status bit for the code when it starts running.
        const FORCE_KILL = 0x0200;
        /// Force certificate expiration checks.
        const FORCE_EXPIRATION = 0x0400;
        /// Restrict dyld loading.
        const RESTRICT = 0x0800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Apply runtime hardening policies.
        const RUNTIME = 0x10000;
        /// The code was automatically signed by the linker.
        const LINKER_SIGNED = 0x20000;
    }
}

bitflags::bitflags! {
    /// Flags that influence behavior of executable segment.
    pub struct ExecutableSegmentFlags: u64 {
        /// Executable segment belongs to main binary.
        const MAIN_BINARY = 0x0001;
        /// Allow unsigned pages (for debugging).
        const ALLOW_UNSIGNED = 0x0010;
        /// Main binary is debugger.
        const DEBUGGER = 0x0020;
        /// JIT enabled.
        const JIT = 0x0040;
        /// Skip library validation (obsolete).
        const SKIP_LIBRARY_VALIDATION = 0x0080;
        /// Can bless code directory hash for execution.
        const CAN_LOAD_CD_HASH = 0x0100;
        /// Can execute blessed code directory hash.
        const CAN_EXEC_CD_HASH = 0x0200;
    }
}

/// Version of Code Directory data structure.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20000,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecutableSegment = 0x20400,
    SupportsRuntime = 0x20500,
    SupportsLinkage = 0x20600,
}

/// Oldest code directory version we accept.
pub const EARLIEST_VERSION: u32 = 0x20001;

/// Versions at or beyond this are from an incompatible future format.
pub const COMPATIBILITY_LIMIT: u32 = 0x2f000;

/// Length of a cdhash. Longer digests are truncated.
pub const CDHASH_LEN: usize = 20;

fn read_string(data: &[u8], offset: u32, what: &'static str) -> Result<String> {
    let tail = data
        .get(offset as usize..)
        .ok_or(CodeValidationError::CodeDirectoryMalformed(what))?;

    let end = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or(CodeValidationError::CodeDirectoryMalformed(what))?;

    String::from_utf8(tail[..end].to_vec())
        .map_err(|_| CodeValidationError::CodeDirectoryMalformed(what))
}

fn get_hashes(
    data: &[u8],
    offset: usize,
    count: usize,
    hash_size: usize,
) -> Result<Vec<Digest<'static>>> {
    let end = count
        .checked_mul(hash_size)
        .and_then(|len| offset.checked_add(len))
        .ok_or(CodeValidationError::CodeDirectoryMalformed("digest table overflows"))?;

    let table = data
        .get(offset..end)
        .ok_or(CodeValidationError::CodeDirectoryMalformed("digest table out of bounds"))?;

    Ok(table
        .chunks(hash_size)
        .map(|data| Digest::from(data.to_vec()))
        .collect())
}

/// Represents a code directory blob entry.
///
/// This struct is versioned and has been extended over time.
///
/// The struct here represents a superset of all fields in all versions.
///
/// The parser will set `Option<T>` fields to `None` for instances
/// where the version is lower than the version that field was introduced in.
#[derive(Clone, Debug)]
pub struct CodeDirectoryBlob<'a> {
    /// Compatibility version.
    pub version: u32,
    /// Setup and mode flags.
    pub flags: CodeSignatureFlags,
    /// Limit to main image signature range.
    ///
    /// This is the file-level offset to stop digesting code data at.
    pub code_limit: u32,
    /// Size of each hash in bytes.
    pub hash_size: u8,
    /// Type of hash.
    pub hash_type: DigestType,
    /// Platform identifier. 0 if not platform binary.
    pub platform: u8,
    /// Page size in bytes. 0 means the signed range is a single page.
    pub page_size: u32,
    /// Unused (must be 0).
    pub spare2: u32,
    // Version 0x20100
    /// Offset of optional scatter vector.
    pub scatter_offset: Option<u32>,
    // Version 0x20300
    /// Unused (must be 0).
    pub spare3: Option<u32>,
    /// Limit to main image signature range, 64 bits.
    pub code_limit_64: Option<u64>,
    // Version 0x20400
    /// Offset of executable segment.
    pub exec_seg_base: Option<u64>,
    /// Limit of executable segment.
    pub exec_seg_limit: Option<u64>,
    /// Executable segment flags.
    pub exec_seg_flags: Option<ExecutableSegmentFlags>,
    // Version 0x20500
    pub runtime: Option<u32>,
    pub pre_encrypt_offset: Option<u32>,
    // Version 0x20600
    pub linkage_hash_type: Option<u8>,
    pub linkage_truncated: Option<u8>,
    pub spare4: Option<u16>,
    pub linkage_offset: Option<u32>,
    pub linkage_size: Option<u32>,

    // End of blob header data / start of derived data.
    pub ident: Cow<'a, str>,
    pub team_name: Option<Cow<'a, str>>,
    pub code_hashes: Vec<Digest<'a>>,
    /// Special slot digests, including null digests for unused slots below
    /// the highest sealed one.
    pub special_hashes: BTreeMap<CodeSigningSlot, Digest<'a>>,
}

impl<'a> Blob<'a> for CodeDirectoryBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::CodeDirectory)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self> {
        read_and_validate_blob_header(data, Self::magic(), "code directory blob")?;

        let offset = &mut 8;

        let version = data.gread_with::<u32>(offset, scroll::BE)?;

        if !(EARLIEST_VERSION..COMPATIBILITY_LIMIT).contains(&version) {
            return Err(CodeValidationError::CodeDirectoryMalformed(
                "unsupported version",
            ));
        }

        let flags = data.gread_with::<u32>(offset, scroll::BE)?;
        let flags = CodeSignatureFlags::from_bits_truncate(flags);
        let hash_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let ident_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_special_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_code_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let code_limit = data.gread_with(offset, scroll::BE)?;
        let hash_size = data.gread_with::<u8>(offset, scroll::BE)?;
        let hash_type = DigestType::from(data.gread_with::<u8>(offset, scroll::BE)?);
        let platform = data.gread_with(offset, scroll::BE)?;
        let page_size = data.gread_with::<u8>(offset, scroll::BE)?;
        let spare2 = data.gread_with(offset, scroll::BE)?;

        if page_size >= 32 {
            return Err(CodeValidationError::CodeDirectoryMalformed("page size too large"));
        }
        let page_size = if page_size == 0 {
            0
        } else {
            1u32 << page_size
        };

        if hash_type.hash_len()? != hash_size as usize {
            return Err(CodeValidationError::CodeDirectoryMalformed(
                "hash size does not match hash type",
            ));
        }

        let scatter_offset = if version >= CodeDirectoryVersion::SupportsScatter as u32 {
            Some(data.gread_with::<u32>(offset, scroll::BE)?).filter(|v| *v != 0)
        } else {
            None
        };
        let team_offset = if version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            Some(data.gread_with::<u32>(offset, scroll::BE)?).filter(|v| *v != 0)
        } else {
            None
        };

        let (spare3, code_limit_64) = if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32
        {
            (
                Some(data.gread_with(offset, scroll::BE)?),
                Some(data.gread_with(offset, scroll::BE)?),
            )
        } else {
            (None, None)
        };

        let (exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if version >= CodeDirectoryVersion::SupportsExecutableSegment as u32 {
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(ExecutableSegmentFlags::from_bits_truncate(
                        data.gread_with::<u64>(offset, scroll::BE)?,
                    )),
                )
            } else {
                (None, None, None)
            };

        let (runtime, pre_encrypt_offset) =
            if version >= CodeDirectoryVersion::SupportsRuntime as u32 {
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                )
            } else {
                (None, None)
            };

        let (linkage_hash_type, linkage_truncated, spare4, linkage_offset, linkage_size) =
            if version >= CodeDirectoryVersion::SupportsLinkage as u32 {
                (
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                    Some(data.gread_with(offset, scroll::BE)?),
                )
            } else {
                (None, None, None, None, None)
            };

        let ident = read_string(data, ident_offset, "identifier")?;
        let team_name = team_offset
            .map(|offset| read_string(data, offset, "team identifier"))
            .transpose()?;

        let specials_len = (hash_size as u64) * (n_special_slots as u64);
        let specials_offset = (hash_offset as u64)
            .checked_sub(specials_len)
            .ok_or(CodeValidationError::CodeDirectoryMalformed(
                "special digests precede blob",
            ))?;

        let code_hashes = get_hashes(
            data,
            hash_offset as usize,
            n_code_slots as usize,
            hash_size as usize,
        )?;

        let special_hashes = get_hashes(
            data,
            specials_offset as usize,
            n_special_slots as usize,
            hash_size as usize,
        )?
        .into_iter()
        .enumerate()
        .map(|(i, h)| (CodeSigningSlot::from(n_special_slots - i as u32), h))
        .collect();

        Ok(Self {
            version,
            flags,
            code_limit,
            hash_size,
            hash_type,
            platform,
            page_size,
            spare2,
            scatter_offset,
            spare3,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            runtime,
            pre_encrypt_offset,
            linkage_hash_type,
            linkage_truncated,
            spare4,
            linkage_offset,
            linkage_size,
            ident: ident.into(),
            team_name: team_name.map(Cow::from),
            code_hashes,
            special_hashes,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>> {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

        // Offsets are unknown until the variable length data is written, so
        // placeholders are patched at the end.
        cursor.iowrite_with(self.version, scroll::BE)?;
        cursor.iowrite_with(self.flags.bits, scroll::BE)?;
        let hash_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;
        let ident_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;

        // Special digests sit at the index of their slot number, so missing
        // slots below the highest one are written as null digests.
        let highest_slot = self
            .special_hashes
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0);

        cursor.iowrite_with(highest_slot, scroll::BE)?;
        cursor.iowrite_with(self.code_hashes.len() as u32, scroll::BE)?;
        cursor.iowrite_with(self.code_limit, scroll::BE)?;
        cursor.iowrite_with(self.hash_size, scroll::BE)?;
        cursor.iowrite_with(u8::from(self.hash_type), scroll::BE)?;
        cursor.iowrite_with(self.platform, scroll::BE)?;
        cursor.iowrite_with(
            if self.page_size == 0 {
                0u8
            } else {
                self.page_size.trailing_zeros() as u8
            },
            scroll::BE,
        )?;
        cursor.iowrite_with(self.spare2, scroll::BE)?;

        let mut team_offset_cursor_position = None;

        if self.version >= CodeDirectoryVersion::SupportsScatter as u32 {
            if self.scatter_offset.is_some() {
                return Err(CodeValidationError::Internal(
                    "scatter vectors cannot be serialized".into(),
                ));
            }
            cursor.iowrite_with(0u32, scroll::BE)?;
        }
        if self.version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            team_offset_cursor_position = Some(cursor.position());
            cursor.iowrite_with(0u32, scroll::BE)?;
        }
        if self.version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
            cursor.iowrite_with(self.spare3.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;
        }
        if self.version >= CodeDirectoryVersion::SupportsExecutableSegment as u32 {
            cursor.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(
                self.exec_seg_flags
                    .unwrap_or_else(ExecutableSegmentFlags::empty)
                    .bits,
                scroll::BE,
            )?;
        }
        if self.version >= CodeDirectoryVersion::SupportsRuntime as u32 {
            cursor.iowrite_with(self.runtime.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.pre_encrypt_offset.unwrap_or(0), scroll::BE)?;
        }
        if self.version >= CodeDirectoryVersion::SupportsLinkage as u32 {
            cursor.iowrite_with(self.linkage_hash_type.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_truncated.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.spare4.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_offset.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_size.unwrap_or(0), scroll::BE)?;
        }

        let identity_offset = cursor.position();
        cursor.write_all(self.ident.as_bytes())?;
        cursor.write_all(b"\0")?;

        let team_offset = cursor.position();
        if team_offset_cursor_position.is_some() {
            if let Some(team_name) = &self.team_name {
                cursor.write_all(team_name.as_bytes())?;
                cursor.write_all(b"\0")?;
            }
        }

        for slot_index in (1..highest_slot + 1).rev() {
            let slot = CodeSigningSlot::from(slot_index);

            if let Some(hash) = self.special_hashes.get(&slot) {
                cursor.write_all(&hash.data)?;
            } else {
                cursor.write_all(&b"\0".repeat(self.hash_size as usize))?;
            }
        }

        let code_hashes_start_offset = cursor.position();

        for hash in &self.code_hashes {
            cursor.write_all(&hash.data)?;
        }

        // Offsets are relative to the blob start, which includes the 8 byte
        // header absent from this buffer.
        cursor.set_position(hash_offset_cursor_position);
        cursor.iowrite_with(code_hashes_start_offset as u32 + 8, scroll::BE)?;

        cursor.set_position(ident_offset_cursor_position);
        cursor.iowrite_with(identity_offset as u32 + 8, scroll::BE)?;

        if let Some(offset) = team_offset_cursor_position {
            if self.team_name.is_some() {
                cursor.set_position(offset);
                cursor.iowrite_with(team_offset as u32 + 8, scroll::BE)?;
            }
        }

        Ok(cursor.into_inner())
    }
}

impl<'a> CodeDirectoryBlob<'a> {
    pub fn to_owned(&self) -> CodeDirectoryBlob<'static> {
        CodeDirectoryBlob {
            version: self.version,
            flags: self.flags,
            code_limit: self.code_limit,
            hash_size: self.hash_size,
            hash_type: self.hash_type,
            platform: self.platform,
            page_size: self.page_size,
            spare2: self.spare2,
            scatter_offset: self.scatter_offset,
            spare3: self.spare3,
            code_limit_64: self.code_limit_64,
            exec_seg_base: self.exec_seg_base,
            exec_seg_limit: self.exec_seg_limit,
            exec_seg_flags: self.exec_seg_flags,
            runtime: self.runtime,
            pre_encrypt_offset: self.pre_encrypt_offset,
            linkage_hash_type: self.linkage_hash_type,
            linkage_truncated: self.linkage_truncated,
            spare4: self.spare4,
            linkage_offset: self.linkage_offset,
            linkage_size: self.linkage_size,
            ident: Cow::Owned(self.ident.clone().into_owned()),
            team_name: self
                .team_name
                .as_ref()
                .map(|x| Cow::Owned(x.clone().into_owned())),
            code_hashes: self.code_hashes.iter().map(|h| h.to_owned()).collect(),
            special_hashes: self
                .special_hashes
                .iter()
                .map(|(k, v)| (*k, v.to_owned()))
                .collect(),
        }
    }
}

/// A structurally valid code directory and the exact bytes it came from.
#[derive(Clone, Debug)]
pub struct CodeDirectory {
    raw: Vec<u8>,
    blob: CodeDirectoryBlob<'static>,
}

impl CodeDirectory {
    /// Parse and structurally validate code directory bytes.
    ///
    /// Magic, length, version bounds, hash size, string and digest table
    /// offsets are all checked. Any violation is an error.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let blob = CodeDirectoryBlob::from_blob_bytes(&raw)?.to_owned();

        Ok(Self { raw, blob })
    }

    /// The raw blob bytes, header included.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The parsed data structure.
    pub fn blob(&self) -> &CodeDirectoryBlob<'static> {
        &self.blob
    }

    pub fn version(&self) -> u32 {
        self.blob.version
    }

    pub fn flags(&self) -> CodeSignatureFlags {
        self.blob.flags
    }

    pub fn hash_type(&self) -> DigestType {
        self.blob.hash_type
    }

    pub fn identifier(&self) -> &str {
        &self.blob.ident
    }

    pub fn team_identifier(&self) -> Option<&str> {
        self.blob.team_name.as_deref()
    }

    pub fn platform(&self) -> u8 {
        self.blob.platform
    }

    pub fn is_adhoc(&self) -> bool {
        self.blob.flags.contains(CodeSignatureFlags::ADHOC)
    }

    /// Page size in bytes, or `None` when the signed range is one page.
    pub fn page_size(&self) -> Option<u64> {
        match self.blob.page_size {
            0 => None,
            size => Some(size as u64),
        }
    }

    pub fn code_slot_count(&self) -> usize {
        self.blob.code_hashes.len()
    }

    /// Highest special slot number covered by the digest table.
    pub fn max_special_slot(&self) -> u32 {
        self.blob
            .special_hashes
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0)
    }

    /// End of the signed range of the main executable.
    ///
    /// The 64-bit limit takes precedence when present and non-zero.
    pub fn signing_limit(&self) -> u64 {
        match self.blob.code_limit_64 {
            Some(limit) if limit != 0 => limit,
            _ => self.blob.code_limit as u64,
        }
    }

    /// Digest sealed for a special slot.
    pub fn slot_digest(&self, slot: CodeSigningSlot) -> Option<&Digest<'static>> {
        self.blob.special_hashes.get(&slot)
    }

    /// Digest sealed for a code page.
    pub fn code_digest(&self, page: usize) -> Option<&Digest<'static>> {
        self.blob.code_hashes.get(page)
    }

    /// Whether the directory seals the given special slot.
    ///
    /// A slot inside the table whose digest is all zeros is not present.
    pub fn slot_is_present(&self, slot: CodeSigningSlot) -> bool {
        self.slot_digest(slot)
            .map(|digest| !digest.is_null())
            .unwrap_or(false)
    }

    /// Hash `data` with this directory's algorithm and compare to the digest
    /// sealed for `slot`.
    ///
    /// A slot that is not sealed compares as `false`.
    pub fn validate_slot(&self, data: &[u8], slot: CodeSigningSlot) -> Result<bool> {
        match self.slot_digest(slot) {
            Some(expected) if !expected.is_null() => {
                Ok(self.hash_type().digest_data(data)?.as_slice() == expected.data.as_ref())
            }
            _ => Ok(false),
        }
    }

    /// Compare an already computed digest to the one sealed for code page `page`.
    pub fn validate_code_page_digest(&self, page: usize, digest: &[u8]) -> bool {
        self.code_digest(page)
            .map(|expected| expected.data.as_ref() == digest)
            .unwrap_or(false)
    }

    /// The unique identity of this directory.
    ///
    /// The digest of the raw blob using the directory's own algorithm,
    /// truncated to [CDHASH_LEN] bytes.
    pub fn cdhash(&self) -> Result<Vec<u8>> {
        let mut digest = self.hash_type().digest_data(&self.raw)?;
        digest.truncate(CDHASH_LEN);

        Ok(digest)
    }
}

/// Build a code directory for test fixtures.
#[cfg(test)]
pub(crate) fn fixture_code_directory(
    hash_type: DigestType,
    ident: &str,
    team: Option<&str>,
    page_size: u32,
    code: &[u8],
    specials: &[(CodeSigningSlot, &[u8])],
    flags: CodeSignatureFlags,
) -> Vec<u8> {
    let code_hashes = if page_size == 0 {
        vec![Digest::from(hash_type.digest_data(code).unwrap())]
    } else {
        code.chunks(page_size as usize)
            .map(|chunk| Digest::from(hash_type.digest_data(chunk).unwrap()))
            .collect()
    };

    let blob = CodeDirectoryBlob {
        version: CodeDirectoryVersion::SupportsExecutableSegment as u32,
        flags,
        code_limit: code.len() as u32,
        hash_size: hash_type.hash_len().unwrap() as u8,
        hash_type,
        platform: 0,
        page_size,
        spare2: 0,
        scatter_offset: None,
        spare3: Some(0),
        code_limit_64: Some(0),
        exec_seg_base: Some(0),
        exec_seg_limit: Some(0),
        exec_seg_flags: Some(ExecutableSegmentFlags::MAIN_BINARY),
        runtime: None,
        pre_encrypt_offset: None,
        linkage_hash_type: None,
        linkage_truncated: None,
        spare4: None,
        linkage_offset: None,
        linkage_size: None,
        ident: ident.into(),
        team_name: team.map(Cow::from),
        code_hashes,
        special_hashes: specials
            .iter()
            .map(|(slot, data)| (*slot, Digest::from(hash_type.digest_data(data).unwrap())))
            .collect(),
    };

    blob.to_blob_bytes().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fixture() {
        let raw = fixture_code_directory(
            DigestType::Sha256,
            "com.example.app",
            Some("TEAM123456"),
            4096,
            &[0x41; 10000],
            &[(CodeSigningSlot::Info, b"info"), (CodeSigningSlot::ResourceDir, b"res")],
            CodeSignatureFlags::ADHOC,
        );

        let cd = CodeDirectory::parse(raw).unwrap();

        assert_eq!(cd.identifier(), "com.example.app");
        assert_eq!(cd.team_identifier(), Some("TEAM123456"));
        assert_eq!(cd.code_slot_count(), 3);
        assert_eq!(cd.max_special_slot(), 3);
        assert_eq!(cd.page_size(), Some(4096));
        assert_eq!(cd.signing_limit(), 10000);
        assert!(cd.is_adhoc());

        assert!(cd.slot_is_present(CodeSigningSlot::Info));
        // Slot 2 is inside the table but null.
        assert!(!cd.slot_is_present(CodeSigningSlot::RequirementSet));
        assert!(!cd.slot_is_present(CodeSigningSlot::Entitlements));

        assert!(cd.validate_slot(b"info", CodeSigningSlot::Info).unwrap());
        assert!(!cd.validate_slot(b"inf0", CodeSigningSlot::Info).unwrap());
        assert!(!cd.validate_slot(b"", CodeSigningSlot::RequirementSet).unwrap());

        let cdhash = cd.cdhash().unwrap();
        assert_eq!(cdhash.len(), CDHASH_LEN);
        assert_eq!(cdhash, cd.cdhash().unwrap());
    }

    #[test]
    fn single_page_when_exponent_zero() {
        let raw = fixture_code_directory(
            DigestType::Sha1,
            "single",
            None,
            0,
            &[1; 9000],
            &[],
            CodeSignatureFlags::empty(),
        );

        let cd = CodeDirectory::parse(raw).unwrap();
        assert_eq!(cd.page_size(), None);
        assert_eq!(cd.code_slot_count(), 1);
        assert_eq!(cd.team_identifier(), None);
    }

    #[test]
    fn truncated_digest_table_rejected() {
        let mut raw = fixture_code_directory(
            DigestType::Sha256,
            "truncated",
            None,
            4096,
            &[0; 8192],
            &[],
            CodeSignatureFlags::empty(),
        );
        raw.truncate(raw.len() - 16);
        let len = raw.len() as u32;
        raw[4..8].copy_from_slice(&len.to_be_bytes());

        assert!(matches!(
            CodeDirectory::parse(raw),
            Err(CodeValidationError::CodeDirectoryMalformed(_))
        ));
    }

    #[test]
    fn bad_version_rejected() {
        let mut raw = fixture_code_directory(
            DigestType::Sha256,
            "future",
            None,
            4096,
            &[0; 10],
            &[],
            CodeSignatureFlags::empty(),
        );
        raw[8..12].copy_from_slice(&0x30000u32.to_be_bytes());

        assert!(CodeDirectory::parse(raw).is_err());
    }
}
