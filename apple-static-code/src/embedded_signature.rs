// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common signature data structures (superblobs, slots, magic values, digests).
//!
//! A signature is stored as a *superblob*: a header with a magic, total length
//! and blob count, followed by an index of `(slot, offset)` pairs and then
//! the blobs themselves. Each blob starts with its own big endian magic and
//! length. Embedded signatures use [CodeSigningMagic::EmbeddedSignature];
//! detached signatures for multi-architecture binaries use
//! [CodeSigningMagic::DetachedSignature], whose index is keyed by CPU type
//! and whose blobs are themselves embedded signature superblobs.
//!
//! Slot and magic constants come from xnu's `cs_blobs.h`.

use {
    crate::error::{CodeValidationError, Result},
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        cmp::Ordering,
        fmt::{Display, Formatter},
        io::Write,
    },
};

/// Defines header magic for various payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeSigningMagic {
    /// Code requirement blob.
    Requirement,
    /// Code requirements blob.
    RequirementSet,
    /// CodeDirectory blob.
    CodeDirectory,
    /// Embedded signature superblob.
    EmbeddedSignature,
    /// Entitlements blob.
    Entitlements,
    /// DER encoded entitlements blob.
    EntitlementsDer,
    /// Multi-arch collection of embedded signatures.
    DetachedSignature,
    /// Generic blob wrapper.
    ///
    /// The CMS signature is stored in this type.
    BlobWrapper,
    /// Unknown magic.
    Unknown(u32),
}

impl From<u32> for CodeSigningMagic {
    fn from(v: u32) -> Self {
        match v {
            0xfade0c00 => Self::Requirement,
            0xfade0c01 => Self::RequirementSet,
            0xfade0c02 => Self::CodeDirectory,
            0xfade0cc0 => Self::EmbeddedSignature,
            0xfade7171 => Self::Entitlements,
            0xfade7172 => Self::EntitlementsDer,
            0xfade0cc1 => Self::DetachedSignature,
            0xfade0b01 => Self::BlobWrapper,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningMagic> for u32 {
    fn from(magic: CodeSigningMagic) -> u32 {
        match magic {
            CodeSigningMagic::Requirement => 0xfade0c00,
            CodeSigningMagic::RequirementSet => 0xfade0c01,
            CodeSigningMagic::CodeDirectory => 0xfade0c02,
            CodeSigningMagic::EmbeddedSignature => 0xfade0cc0,
            CodeSigningMagic::Entitlements => 0xfade7171,
            CodeSigningMagic::EntitlementsDer => 0xfade7172,
            CodeSigningMagic::DetachedSignature => 0xfade0cc1,
            CodeSigningMagic::BlobWrapper => 0xfade0b01,
            CodeSigningMagic::Unknown(v) => v,
        }
    }
}

/// A well-known slot within code signing data.
///
/// Slots 1 through [CodeSigningSlot::MAX_SPECIAL] are *special slots*: their
/// digests live at negative indices of a code directory's digest table.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeSigningSlot {
    CodeDirectory,
    Info,
    RequirementSet,
    ResourceDir,
    /// Ordered list of the slots present in the signature.
    TopDirectory,
    Entitlements,
    RepSpecific,
    EntitlementsDer,
    /// Alternate code directory with index 0 through 4.
    AlternateCodeDirectory(u32),
    Signature,
    Identification,
    Ticket,
    Unknown(u32),
}

impl CodeSigningSlot {
    /// Highest special slot number.
    pub const MAX_SPECIAL: u32 = 7;

    /// Number of alternate code directory slots.
    pub const ALTERNATE_COUNT: u32 = 5;

    /// Special slots in ascending order.
    pub fn special_slots() -> impl Iterator<Item = Self> {
        (1..=Self::MAX_SPECIAL).map(Self::from)
    }

    /// Alternate code directory slots in ascending order.
    pub fn alternate_code_directories() -> impl Iterator<Item = Self> {
        (0..Self::ALTERNATE_COUNT).map(Self::AlternateCodeDirectory)
    }

    /// Whether a digest of this slot can appear in a code directory.
    pub fn is_special(&self) -> bool {
        let v = u32::from(*self);

        (1..=Self::MAX_SPECIAL).contains(&v)
    }

    /// Whether this slot has external data (as opposed to provided via a blob).
    pub fn has_external_content(&self) -> bool {
        matches!(self, Self::Info | Self::ResourceDir)
    }
}

impl std::fmt::Debug for CodeSigningSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CodeDirectory => "CodeDirectory",
            Self::Info => "Info",
            Self::RequirementSet => "RequirementSet",
            Self::ResourceDir => "Resources",
            Self::TopDirectory => "Top Directory",
            Self::Entitlements => "Entitlements",
            Self::RepSpecific => "Rep Specific",
            Self::EntitlementsDer => "DER Entitlements",
            Self::AlternateCodeDirectory(i) => {
                return f.write_fmt(format_args!(
                    "CodeDirectory Alternate #{} ({})",
                    i,
                    u32::from(*self)
                ));
            }
            Self::Signature => "CMS Signature",
            Self::Identification => "Identification",
            Self::Ticket => "Ticket",
            Self::Unknown(value) => {
                return f.write_fmt(format_args!("Unknown ({})", value));
            }
        };

        f.write_fmt(format_args!("{} ({})", name, u32::from(*self)))
    }
}

impl From<u32> for CodeSigningSlot {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CodeDirectory,
            1 => Self::Info,
            2 => Self::RequirementSet,
            3 => Self::ResourceDir,
            4 => Self::TopDirectory,
            5 => Self::Entitlements,
            6 => Self::RepSpecific,
            7 => Self::EntitlementsDer,
            0x1000..=0x1004 => Self::AlternateCodeDirectory(v - 0x1000),
            0x10000 => Self::Signature,
            0x10001 => Self::Identification,
            0x10002 => Self::Ticket,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningSlot> for u32 {
    fn from(v: CodeSigningSlot) -> Self {
        match v {
            CodeSigningSlot::CodeDirectory => 0,
            CodeSigningSlot::Info => 1,
            CodeSigningSlot::RequirementSet => 2,
            CodeSigningSlot::ResourceDir => 3,
            CodeSigningSlot::TopDirectory => 4,
            CodeSigningSlot::Entitlements => 5,
            CodeSigningSlot::RepSpecific => 6,
            CodeSigningSlot::EntitlementsDer => 7,
            CodeSigningSlot::AlternateCodeDirectory(i) => 0x1000 + i,
            CodeSigningSlot::Signature => 0x10000,
            CodeSigningSlot::Identification => 0x10001,
            CodeSigningSlot::Ticket => 0x10002,
            CodeSigningSlot::Unknown(v) => v,
        }
    }
}

impl PartialOrd for CodeSigningSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeSigningSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

#[repr(C)]
#[derive(Clone, Pread)]
struct BlobIndex {
    /// Corresponds to a [CodeSigningSlot] variant, or a CPU type in detached
    /// multi-architecture signatures.
    typ: u32,
    offset: u32,
}

impl std::fmt::Debug for BlobIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlobIndex")
            .field("type", &CodeSigningSlot::from(self.typ))
            .field("offset", &self.offset)
            .finish()
    }
}

/// Represents a digest type encountered in code signature data structures.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum DigestType {
    None,
    Sha1,
    Sha256,
    Sha256Truncated,
    Sha384,
    Sha512,
    Unknown(u8),
}

impl From<u8> for DigestType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Sha1,
            2 => Self::Sha256,
            3 => Self::Sha256Truncated,
            4 => Self::Sha384,
            5 => Self::Sha512,
            _ => Self::Unknown(v),
        }
    }
}

impl From<DigestType> for u8 {
    fn from(v: DigestType) -> u8 {
        match v {
            DigestType::None => 0,
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Sha256Truncated => 3,
            DigestType::Sha384 => 4,
            DigestType::Sha512 => 5,
            DigestType::Unknown(v) => v,
        }
    }
}

impl Display for DigestType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestType::None => f.write_str("none"),
            DigestType::Sha1 => f.write_str("sha1"),
            DigestType::Sha256 => f.write_str("sha256"),
            DigestType::Sha256Truncated => f.write_str("sha256-truncated"),
            DigestType::Sha384 => f.write_str("sha384"),
            DigestType::Sha512 => f.write_str("sha512"),
            DigestType::Unknown(v) => f.write_fmt(format_args!("unknown: {}", v)),
        }
    }
}

impl DigestType {
    /// Obtain the size of hashes for this hash type.
    pub fn hash_len(&self) -> Result<usize> {
        match self {
            Self::Sha1 | Self::Sha256Truncated => Ok(20),
            Self::Sha256 => Ok(32),
            Self::Sha384 => Ok(48),
            Self::Sha512 => Ok(64),
            Self::None | Self::Unknown(_) => Err(CodeValidationError::DigestUnknownAlgorithm),
        }
    }

    /// Obtain a hasher for this digest type.
    pub fn as_hasher(&self) -> Result<ring::digest::Context> {
        match self {
            Self::None => Err(CodeValidationError::DigestUnknownAlgorithm),
            Self::Sha1 => Ok(ring::digest::Context::new(
                &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            )),
            Self::Sha256 | Self::Sha256Truncated => {
                Ok(ring::digest::Context::new(&ring::digest::SHA256))
            }
            Self::Sha384 => Ok(ring::digest::Context::new(&ring::digest::SHA384)),
            Self::Sha512 => Ok(ring::digest::Context::new(&ring::digest::SHA512)),
            Self::Unknown(_) => Err(CodeValidationError::DigestUnknownAlgorithm),
        }
    }

    /// Digest data given the configured hasher.
    pub fn digest_data(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut hasher = self.as_hasher()?;

        hasher.update(data);

        Ok(self.finish(hasher))
    }

    /// Finalize a hasher obtained from [Self::as_hasher], applying truncation.
    pub fn finish(&self, hasher: ring::digest::Context) -> Vec<u8> {
        let mut hash = hasher.finish().as_ref().to_vec();

        if matches!(self, Self::Sha256Truncated) {
            hash.truncate(20);
        }

        hash
    }

    /// Rank of this algorithm when choosing a preferred code directory.
    ///
    /// Higher is stronger. `None` means the algorithm is never preferred.
    pub fn preference_rank(&self) -> Option<u8> {
        match self {
            Self::Sha384 => Some(4),
            Self::Sha256 => Some(3),
            Self::Sha256Truncated => Some(2),
            Self::Sha1 => Some(1),
            _ => None,
        }
    }
}

/// A digest value.
#[derive(Clone, Eq, PartialEq)]
pub struct Digest<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Digest<'a> {
    /// Whether this is the null hash (all 0s).
    pub fn is_null(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn to_owned(&self) -> Digest<'static> {
        Digest {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }
}

impl<'a> std::fmt::Debug for Digest<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.data))
    }
}

impl<'a> From<Vec<u8>> for Digest<'a> {
    fn from(v: Vec<u8>) -> Self {
        Self { data: v.into() }
    }
}

/// Read the header from a Blob.
///
/// Blobs begin with a u32 magic and u32 length, inclusive.
pub(crate) fn read_blob_header(data: &[u8]) -> Result<(u32, usize, &[u8])> {
    let magic = data.pread_with(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)?;

    Ok((magic, length as usize, &data[8..]))
}

/// Validate the blob header and return the payload.
///
/// The advertised length must equal the slice length.
pub(crate) fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected_magic: u32,
    what: &'static str,
) -> Result<&'a [u8]> {
    let (magic, length, payload) = read_blob_header(data)?;

    if magic != expected_magic {
        Err(CodeValidationError::BadMagic(what))
    } else if length != data.len() {
        Err(CodeValidationError::SuperblobMalformed)
    } else {
        Ok(payload)
    }
}

/// Create the binary content for a SuperBlob.
///
/// `blobs` yields `(index type, blob bytes)`. The index type is a slot number
/// for embedded signatures and a CPU type for detached ones.
pub fn create_superblob<'a>(
    magic: CodeSigningMagic,
    blobs: impl Iterator<Item = &'a (u32, Vec<u8>)>,
) -> Result<Vec<u8>> {
    let blobs = blobs.collect::<Vec<_>>();

    let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

    // magic + total length + blob count, then 8 bytes per index entry.
    let mut total_length: u32 = 4 + 4 + 4 + 8 * blobs.len() as u32;

    let mut indices = Vec::with_capacity(blobs.len());

    for (typ, blob) in &blobs {
        indices.push(BlobIndex {
            typ: *typ,
            offset: total_length,
        });

        total_length += blob.len() as u32;
    }

    cursor.iowrite_with(u32::from(magic), scroll::BE)?;
    cursor.iowrite_with(total_length, scroll::BE)?;
    cursor.iowrite_with(indices.len() as u32, scroll::BE)?;
    for index in indices {
        cursor.iowrite_with(index.typ, scroll::BE)?;
        cursor.iowrite_with(index.offset, scroll::BE)?;
    }
    for (_, data) in blobs {
        cursor.write_all(data)?;
    }

    Ok(cursor.into_inner())
}

/// Represents a single blob as defined by a SuperBlob index entry.
#[derive(Clone)]
pub struct BlobEntry<'a> {
    /// Our blob index within the `SuperBlob`.
    pub index: usize,

    /// Raw index type. A slot number or a CPU type.
    pub typ: u32,

    /// Our start offset within the `SuperBlob`.
    pub offset: usize,

    /// The magic value appearing at the beginning of the blob.
    pub magic: CodeSigningMagic,

    /// The length of the blob, including its header.
    pub length: usize,

    /// The raw data in this blob, including magic and length.
    pub data: &'a [u8],
}

impl<'a> std::fmt::Debug for BlobEntry<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlobEntry")
            .field("index", &self.index)
            .field("slot", &self.slot())
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("magic", &self.magic)
            .finish()
    }
}

impl<'a> BlobEntry<'a> {
    /// The index type interpreted as a slot.
    pub fn slot(&self) -> CodeSigningSlot {
        CodeSigningSlot::from(self.typ)
    }

    /// Obtain the payload of this blob.
    ///
    /// This is the data in the blob without the blob header.
    pub fn payload(&self) -> Result<&'a [u8]> {
        Ok(read_blob_header(self.data)?.2)
    }
}

/// Provides common features for a parsed blob type.
pub trait Blob<'a>
where
    Self: Sized,
{
    /// The header magic that identifies this format.
    fn magic() -> u32;

    /// Attempt to construct an instance by parsing a bytes slice.
    ///
    /// The slice begins with the 8 byte blob header denoting the magic
    /// and length.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self>;

    /// Serialize the payload of this blob to bytes.
    ///
    /// Does not include the magic or length header fields common to blobs.
    fn serialize_payload(&self) -> Result<Vec<u8>>;

    /// Serialize this blob to bytes.
    fn to_blob_bytes(&self) -> Result<Vec<u8>> {
        let mut res = Vec::new();
        res.iowrite_with(Self::magic(), scroll::BE)?;

        let payload = self.serialize_payload()?;
        // Length includes our own header.
        res.iowrite_with(payload.len() as u32 + 8, scroll::BE)?;

        res.extend(payload);

        Ok(res)
    }
}

/// Represents an Entitlements blob holding an XML plist.
#[derive(Debug)]
pub struct EntitlementsBlob<'a> {
    plist: Cow<'a, str>,
}

impl<'a> Blob<'a> for EntitlementsBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Entitlements)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self> {
        let data = read_and_validate_blob_header(data, Self::magic(), "entitlements blob")?;
        let s = std::str::from_utf8(data).map_err(|_| {
            CodeValidationError::detailed(
                crate::error::ValidationStatus::BadDictionaryFormat,
                "entitlements are not valid UTF-8",
            )
        })?;

        Ok(Self { plist: s.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>> {
        Ok(self.plist.as_bytes().to_vec())
    }
}

impl<'a> EntitlementsBlob<'a> {
    /// Obtain the plist representation as a string.
    pub fn as_str(&self) -> &str {
        &self.plist
    }

    /// Parse the plist into a dictionary.
    pub fn parse(&self) -> Result<plist::Dictionary> {
        let value = plist::Value::from_reader_xml(self.plist.as_bytes())?;

        value.into_dictionary().ok_or_else(|| {
            CodeValidationError::detailed(
                crate::error::ValidationStatus::BadDictionaryFormat,
                "entitlements plist is not a dictionary",
            )
        })
    }
}

/// Represents a generic blob wrapper. CMS signatures live in these.
pub struct BlobWrapperBlob<'a> {
    data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for BlobWrapperBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::BlobWrapper)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self> {
        Ok(Self {
            data: read_and_validate_blob_header(data, Self::magic(), "blob wrapper blob")?.into(),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for BlobWrapperBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", hex::encode(&self.data)))
    }
}

impl<'a> BlobWrapperBlob<'a> {
    /// The wrapped payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// A lightly parsed `SuperBlob`.
///
/// Used for both embedded signatures and detached multi-architecture
/// signatures.
pub struct SuperBlob<'a> {
    /// Magic value from header.
    pub magic: CodeSigningMagic,
    /// Length of this super blob.
    pub length: u32,
    /// Number of blobs in this super blob.
    pub count: u32,

    /// Raw data backing this super blob.
    pub data: &'a [u8],

    /// All the blobs within this super blob.
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> std::fmt::Debug for SuperBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SuperBlob")
            .field("magic", &self.magic)
            .field("length", &self.length)
            .field("count", &self.count)
            .field("blobs", &self.blobs)
            .finish()
    }
}

impl<'a> SuperBlob<'a> {
    /// Parse a superblob, requiring the given magic.
    ///
    /// Every blob must lie within the buffer and must not advertise a length
    /// overrunning the next blob.
    pub fn from_bytes(data: &'a [u8], expected: CodeSigningMagic) -> Result<Self> {
        let offset = &mut 0;

        let magic = data.gread_with::<u32>(offset, scroll::BE)?.into();

        if magic != expected {
            return Err(CodeValidationError::BadMagic("signature super blob"));
        }

        let length = data.gread_with::<u32>(offset, scroll::BE)?;
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        if length as usize > data.len() {
            return Err(CodeValidationError::SuperblobMalformed);
        }
        let data = &data[..length as usize];

        // The index is bounded by the buffer so a hostile count cannot
        // trigger a huge allocation.
        if (count as usize).saturating_mul(8) > data.len() {
            return Err(CodeValidationError::SuperblobMalformed);
        }

        let mut blob_indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            blob_indices.push(data.gread_with::<BlobIndex>(offset, scroll::BE)?);
        }

        let mut blobs = Vec::with_capacity(blob_indices.len());

        for (i, index) in blob_indices.iter().enumerate() {
            let start = index.offset as usize;
            let end_offset = blob_indices
                .iter()
                .map(|other| other.offset as usize)
                .filter(|other| *other > start)
                .min()
                .unwrap_or(data.len());

            if start < *offset || start > end_offset {
                return Err(CodeValidationError::SuperblobMalformed);
            }

            let full_slice = &data[start..end_offset];
            let (magic, blob_length, _) = read_blob_header(full_slice)?;

            let blob_data = match blob_length.cmp(&full_slice.len()) {
                Ordering::Greater => {
                    return Err(CodeValidationError::SuperblobMalformed);
                }
                Ordering::Equal => full_slice,
                Ordering::Less => &full_slice[0..blob_length],
            };

            blobs.push(BlobEntry {
                index: i,
                typ: index.typ,
                offset: start,
                magic: magic.into(),
                length: blob_length,
                data: blob_data,
            });
        }

        Ok(Self {
            magic,
            length,
            count,
            data,
            blobs,
        })
    }

    /// Find the first occurrence of the specified slot.
    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&BlobEntry<'a>> {
        let typ = u32::from(slot);

        self.blobs.iter().find(|e| e.typ == typ)
    }

    /// Find the blob registered under a raw index type.
    pub fn find_type(&self, typ: u32) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|e| e.typ == typ)
    }

    /// Raw CMS signature data.
    ///
    /// Empty CMS payloads are treated as absent.
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>> {
        if let Some(entry) = self.find_slot(CodeSigningSlot::Signature) {
            let blob = BlobWrapperBlob::from_blob_bytes(entry.data)?;

            if blob.data().is_empty() {
                Ok(None)
            } else {
                entry.payload().map(Some)
            }
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(magic: CodeSigningMagic, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&u32::from(magic).to_be_bytes());
        data.extend_from_slice(&(payload.len() as u32 + 8).to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn superblob_round_trip() {
        let blobs = vec![
            (
                u32::from(CodeSigningSlot::Entitlements),
                blob(CodeSigningMagic::Entitlements, b"<plist/>"),
            ),
            (
                u32::from(CodeSigningSlot::Signature),
                blob(CodeSigningMagic::BlobWrapper, b""),
            ),
        ];

        let data = create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter()).unwrap();
        let sb = SuperBlob::from_bytes(&data, CodeSigningMagic::EmbeddedSignature).unwrap();

        assert_eq!(sb.blobs.len(), 2);
        assert_eq!(
            sb.find_slot(CodeSigningSlot::Entitlements).unwrap().data,
            blobs[0].1.as_slice()
        );
        // Empty CMS data is treated as no signature.
        assert!(sb.signature_data().unwrap().is_none());
    }

    #[test]
    fn superblob_rejects_overrun() {
        let blobs = vec![(
            u32::from(CodeSigningSlot::Entitlements),
            blob(CodeSigningMagic::Entitlements, b"abcd"),
        )];

        let mut data = create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter()).unwrap();
        // Inflate the inner blob length past the buffer.
        let inner = 12 + 8 + 4;
        data[inner..inner + 4].copy_from_slice(&1000u32.to_be_bytes());

        assert!(matches!(
            SuperBlob::from_bytes(&data, CodeSigningMagic::EmbeddedSignature),
            Err(CodeValidationError::SuperblobMalformed)
        ));
        assert!(matches!(
            SuperBlob::from_bytes(&data, CodeSigningMagic::DetachedSignature),
            Err(CodeValidationError::BadMagic(_))
        ));
    }

    #[test]
    fn slot_numbering() {
        assert_eq!(
            CodeSigningSlot::from(0x1002),
            CodeSigningSlot::AlternateCodeDirectory(2)
        );
        assert_eq!(u32::from(CodeSigningSlot::AlternateCodeDirectory(4)), 0x1004);
        assert_eq!(CodeSigningSlot::from(0x1005), CodeSigningSlot::Unknown(0x1005));
        assert_eq!(CodeSigningSlot::special_slots().count(), 7);
        assert!(CodeSigningSlot::TopDirectory.is_special());
        assert!(!CodeSigningSlot::Signature.is_special());
    }

    #[test]
    fn truncated_sha256() {
        let full = DigestType::Sha256.digest_data(b"hello").unwrap();
        let truncated = DigestType::Sha256Truncated.digest_data(b"hello").unwrap();

        assert_eq!(truncated.len(), 20);
        assert_eq!(&full[0..20], truncated.as_slice());
        assert_eq!(DigestType::Sha256Truncated.hash_len().unwrap(), 20);
    }
}
