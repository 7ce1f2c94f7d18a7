// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Representation of an arbitrary file.
//!
//! Plain files have nowhere to embed a signature. They can only be validated
//! through a detached signature, with the whole file as a single signed range.

use {
    crate::{
        disk_rep::DiskRep,
        embedded_signature::CodeSigningSlot,
        error::Result,
    },
    std::path::{Path, PathBuf},
};

#[derive(Clone, Debug)]
pub struct FileRep {
    path: PathBuf,
}

impl FileRep {
    pub fn open(path: &Path) -> Result<Self> {
        // Fail early on unreadable paths.
        std::fs::metadata(path)?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl DiskRep for FileRep {
    fn path(&self) -> &Path {
        &self.path
    }

    fn main_executable_path(&self) -> PathBuf {
        self.path.clone()
    }

    fn format(&self) -> String {
        "generic".into()
    }

    fn component(&self, _slot: CodeSigningSlot) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn signing_limit(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}
