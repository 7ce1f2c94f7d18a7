// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Detached signatures.

A detached signature is signature data stored outside of the code it signs.
It is either an embedded signature superblob (single architecture) or a
detached signature superblob whose entries are embedded signature
superblobs keyed by CPU type.

[DetachedRep] layers such a signature over another representation. Signature
slots come from the detached data. Slots with external content, such as
`Info.plist` and the resource directory, still come from the wrapped
representation.
*/

use {
    crate::{
        code_directory::CodeDirectory,
        disk_rep::{superblob_component, Architecture, DiskRep, SignatureSource},
        embedded_signature::{read_blob_header, CodeSigningMagic, CodeSigningSlot, SuperBlob},
        error::{CodeValidationError, Result, ValidationStatus},
        flags::ValidationFlags,
        macho_rep::MachoTarget,
    },
    std::{
        collections::{BTreeMap, BTreeSet},
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Select the embedded signature applying to an architecture.
///
/// Returns the bytes of an embedded signature superblob.
pub fn select_detached_signature(data: &[u8], arch: Option<Architecture>) -> Result<Vec<u8>> {
    let (magic, _, _) = read_blob_header(data)?;

    match CodeSigningMagic::from(magic) {
        CodeSigningMagic::EmbeddedSignature => {
            // Parse to validate structure.
            SuperBlob::from_bytes(data, CodeSigningMagic::EmbeddedSignature)?;

            Ok(data.to_vec())
        }
        CodeSigningMagic::DetachedSignature => {
            let global = SuperBlob::from_bytes(data, CodeSigningMagic::DetachedSignature)?;

            let typ = arch.map(|arch| arch.cpu_type).unwrap_or(0);

            let entry = global.find_type(typ).ok_or_else(|| {
                CodeValidationError::detailed(
                    ValidationStatus::SignatureNotVerifiable,
                    format!("detached signature has no entry for cpu type {}", typ),
                )
            })?;

            SuperBlob::from_bytes(entry.data, CodeSigningMagic::EmbeddedSignature)?;

            Ok(entry.data.to_vec())
        }
        _ => Err(CodeValidationError::detailed(
            ValidationStatus::BadObjectFormat,
            "detached signature has unrecognized magic",
        )),
    }
}

/// A representation whose signature comes from detached data.
#[derive(Debug)]
pub struct DetachedRep {
    base: Arc<dyn DiskRep>,

    /// The detached data as supplied.
    source: Arc<Vec<u8>>,

    /// Embedded signature superblob for the base's architecture.
    signature: Vec<u8>,
}

impl DetachedRep {
    pub fn new(base: Arc<dyn DiskRep>, data: Arc<Vec<u8>>) -> Result<Self> {
        let signature = select_detached_signature(&data, base.architecture())?;

        Ok(Self {
            base,
            source: data,
            signature,
        })
    }

    /// The wrapped representation.
    pub fn base(&self) -> &Arc<dyn DiskRep> {
        &self.base
    }

    /// The detached data as supplied.
    pub fn source_data(&self) -> &Arc<Vec<u8>> {
        &self.source
    }
}

impl DiskRep for DetachedRep {
    fn path(&self) -> &Path {
        self.base.path()
    }

    fn main_executable_path(&self) -> PathBuf {
        self.base.main_executable_path()
    }

    fn format(&self) -> String {
        self.base.format()
    }

    fn component(&self, slot: CodeSigningSlot) -> Result<Option<Vec<u8>>> {
        let superblob = SuperBlob::from_bytes(&self.signature, CodeSigningMagic::EmbeddedSignature)?;

        match superblob_component(&superblob, slot)? {
            Some(data) => Ok(Some(data)),
            None if slot.has_external_content() => self.base.component(slot),
            None => Ok(None),
        }
    }

    fn signature_source(&self) -> SignatureSource {
        SignatureSource::Detached
    }

    fn architecture(&self) -> Option<Architecture> {
        self.base.architecture()
    }

    fn architectures(&self) -> Vec<Architecture> {
        self.base.architectures()
    }

    fn for_architecture(&self, arch: Architecture) -> Result<Box<dyn DiskRep>> {
        let base: Arc<dyn DiskRep> = Arc::from(self.base.for_architecture(arch)?);

        Ok(Box::new(Self::new(base, self.source.clone())?))
    }

    fn signing_base(&self) -> u64 {
        self.base.signing_base()
    }

    fn signing_limit(&self) -> Result<u64> {
        self.base.signing_limit()
    }

    fn resources_root(&self) -> Option<PathBuf> {
        self.base.resources_root()
    }

    fn allowed_resource_omissions(&self) -> Vec<String> {
        self.base.allowed_resource_omissions()
    }

    fn resource_exclusions(&self) -> Vec<String> {
        self.base.resource_exclusions()
    }

    fn strict_validate(
        &self,
        cd: Option<&CodeDirectory>,
        tolerated: &BTreeSet<ValidationStatus>,
        flags: ValidationFlags,
    ) -> Result<()> {
        self.base.strict_validate(cd, tolerated, flags)
    }

    fn macho_target(&self) -> Option<MachoTarget> {
        self.base.macho_target()
    }

    fn information(&self) -> BTreeMap<String, String> {
        self.base.information()
    }

    fn flush(&self) {
        self.base.flush()
    }
}
