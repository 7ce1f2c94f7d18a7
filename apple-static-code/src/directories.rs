// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Selection among multiple code directories.

A signature may carry one code directory per digest algorithm. The primary
directory lives in slot 0 and alternates follow in slots `0x1000` onwards.
Alternates are contiguous: the first missing alternate slot ends the scan.

All directories are kept, keyed by digest type. The one with the strongest
trusted digest is canonical and is used for component and page checks. The
slot 0 directory is retained separately since the CMS signature is computed
over it.
*/

use {
    crate::{
        code_directory::CodeDirectory,
        digest::best_hash_of,
        embedded_signature::{CodeSigningSlot, DigestType},
        error::{CodeValidationError, Result, ValidationStatus},
    },
    log::debug,
    scroll::Pread,
    std::collections::BTreeMap,
};

/// Code directories of one signature keyed by digest type.
#[derive(Clone, Debug)]
pub struct CodeDirectoryMap {
    directories: BTreeMap<DigestType, CodeDirectory>,
    base: DigestType,
    canonical: DigestType,
}

fn parse_candidate(slot: CodeSigningSlot, data: Vec<u8>) -> Result<CodeDirectory> {
    CodeDirectory::parse(data).map_err(|e| {
        CodeValidationError::detailed(
            ValidationStatus::SignatureFailed,
            format!("code directory in slot {:?} is invalid: {}", slot, e),
        )
    })
}

impl CodeDirectoryMap {
    /// Load code directories through a component fetcher.
    ///
    /// Returns `Ok(None)` when slot 0 is empty, meaning the code is unsigned.
    pub fn load(
        mut fetch: impl FnMut(CodeSigningSlot) -> Result<Option<Vec<u8>>>,
    ) -> Result<Option<Self>> {
        let base_data = match fetch(CodeSigningSlot::CodeDirectory)? {
            Some(data) => data,
            None => return Ok(None),
        };

        let base = parse_candidate(CodeSigningSlot::CodeDirectory, base_data)?;
        let base_type = base.hash_type();

        let mut directories = BTreeMap::new();
        directories.insert(base_type, base);

        for slot in CodeSigningSlot::alternate_code_directories() {
            let data = match fetch(slot)? {
                Some(data) => data,
                None => break,
            };

            let cd = parse_candidate(slot, data)?;
            let hash_type = cd.hash_type();

            if directories.insert(hash_type, cd).is_some() {
                return Err(CodeValidationError::DuplicateDigestType(hash_type));
            }
        }

        let canonical = best_hash_of(directories.keys().copied())
            .ok_or(CodeValidationError::DigestUnknownAlgorithm)?;

        debug!(
            "loaded {} code directories; selected {} as canonical",
            directories.len(),
            canonical
        );

        Ok(Some(Self {
            directories,
            base: base_type,
            canonical,
        }))
    }

    /// The directory with the strongest trusted digest.
    pub fn canonical(&self) -> &CodeDirectory {
        &self.directories[&self.canonical]
    }

    /// The directory stored in slot 0.
    pub fn base(&self) -> &CodeDirectory {
        &self.directories[&self.base]
    }

    pub fn get(&self, digest_type: DigestType) -> Option<&CodeDirectory> {
        self.directories.get(&digest_type)
    }

    pub fn len(&self) -> usize {
        self.directories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directories.is_empty()
    }

    /// Iterate directories in digest type order.
    pub fn iter(&self) -> impl Iterator<Item = (&DigestType, &CodeDirectory)> {
        self.directories.iter()
    }

    /// Digest types of all directories.
    pub fn digest_types(&self) -> Vec<DigestType> {
        self.directories.keys().copied().collect()
    }

    /// The cdhash of every directory, ordered by digest type.
    pub fn cdhashes(&self) -> Result<Vec<Vec<u8>>> {
        self.directories.values().map(|cd| cd.cdhash()).collect()
    }
}

/// Compare the sealed listing of signature slots with what is present.
///
/// `top` is the content of the top directory slot. When absent there is
/// nothing to compare. `present` reports whether a special slot holds a
/// validated component.
pub fn validate_top_directory(
    top: Option<&[u8]>,
    directory_count: usize,
    mut present: impl FnMut(CodeSigningSlot) -> Result<bool>,
) -> Result<()> {
    let top = match top {
        Some(top) => top,
        None => return Ok(()),
    };

    let mut signed = Vec::with_capacity(top.len() / 4);
    let mut offset = 0;
    while offset + 4 <= top.len() {
        signed.push(top.gread_with::<u32>(&mut offset, scroll::BE)?);
    }

    let mut found = vec![u32::from(CodeSigningSlot::CodeDirectory)];

    for slot in CodeSigningSlot::special_slots() {
        if present(slot)? {
            found.push(u32::from(slot));
        }
    }

    for index in 0..directory_count.saturating_sub(1) {
        found.push(u32::from(CodeSigningSlot::AlternateCodeDirectory(index as u32)));
    }

    found.push(u32::from(CodeSigningSlot::Signature));

    if signed == found {
        Ok(())
    } else {
        debug!("top directory lists {:x?}; found {:x?}", signed, found);
        Err(CodeValidationError::TopDirectoryMismatch)
    }
}
