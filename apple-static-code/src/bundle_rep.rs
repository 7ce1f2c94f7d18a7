// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bundles backed by a directory.

use {
    crate::{
        code_directory::CodeDirectory,
        disk_rep::{path_is_macho, Architecture, DiskRep},
        embedded_signature::CodeSigningSlot,
        error::{CodeValidationError, Result, ValidationStatus},
        file_rep::FileRep,
        flags::ValidationFlags,
        macho_rep::{MachORep, MachoTarget},
    },
    log::debug,
    std::{
        collections::{BTreeMap, BTreeSet},
        path::{Path, PathBuf},
    },
};

/// Resource rule patterns a bundle may omit without the rules being weak.
const ALLOWED_OMISSIONS: &[&str] = &[
    r"^(.*/)?\.DS_Store$",
    r"^Info\.plist$",
    r"^PkgInfo$",
    r"^Resources/.*\.lproj/locversion.plist$",
];

/// The type of a bundle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BundlePackageType {
    /// A `.app` bundle.
    App,
    /// A `.framework` bundle.
    Framework,
    /// Any other bundle.
    Bundle,
}

/// How content is laid out inside the bundle directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BundleLayout {
    /// Content lives directly in the bundle directory.
    Shallow,
    /// Content lives in a `Contents/` sub-directory.
    Deep,
    /// Content lives in `Versions/<name>/`, selected by `Versions/Current`.
    Versioned,
}

/// An Apple bundle on the filesystem.
#[derive(Debug)]
pub struct BundleRep {
    /// Root directory of the bundle.
    root: PathBuf,

    /// Directory holding the bundle content and `_CodeSignature/`.
    content: PathBuf,

    layout: BundleLayout,
    package_type: BundlePackageType,
    info_plist_path: PathBuf,
    info_plist: plist::Dictionary,

    /// Representation of the main executable, if the bundle has one.
    executable: Option<Box<dyn DiskRep>>,
}

fn signature_file_name(slot: CodeSigningSlot) -> Option<String> {
    Some(match slot {
        CodeSigningSlot::CodeDirectory => "CodeDirectory".into(),
        CodeSigningSlot::RequirementSet => "CodeRequirements".into(),
        CodeSigningSlot::TopDirectory => "CodeTopDirectory".into(),
        CodeSigningSlot::Entitlements => "CodeEntitlements".into(),
        CodeSigningSlot::RepSpecific => "CodeRepSpecific".into(),
        CodeSigningSlot::EntitlementsDer => "CodeEntitlementDER".into(),
        CodeSigningSlot::AlternateCodeDirectory(index) => format!("CodeDirectory-{}", index + 1),
        CodeSigningSlot::Signature => "CodeSignature".into(),
        _ => return None,
    })
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl BundleRep {
    /// Open the bundle at a directory, optionally selecting a Mach-O slice.
    pub fn open(root: &Path, arch: Option<Architecture>) -> Result<Self> {
        if !root.is_dir() {
            return Err(CodeValidationError::detailed(
                ValidationStatus::BadObjectFormat,
                format!("{} is not a directory", root.display()),
            ));
        }

        let root_name = root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let (layout, content) = if root.join("Contents").is_dir() {
            (BundleLayout::Deep, root.join("Contents"))
        } else if root.join("Versions").join("Current").is_dir() {
            (
                BundleLayout::Versioned,
                std::fs::canonicalize(root.join("Versions").join("Current"))?,
            )
        } else {
            (BundleLayout::Shallow, root.to_path_buf())
        };

        // Frameworks keep Info.plist under Resources/.
        let framework_plist = content.join("Resources").join("Info.plist");
        let app_plist = content.join("Info.plist");

        let (package_type, info_plist_path) = if framework_plist.is_file() {
            (BundlePackageType::Framework, framework_plist)
        } else if app_plist.is_file() {
            if root_name.ends_with(".app") {
                (BundlePackageType::App, app_plist)
            } else if root_name.ends_with(".framework") {
                (BundlePackageType::Framework, app_plist)
            } else {
                (BundlePackageType::Bundle, app_plist)
            }
        } else {
            return Err(CodeValidationError::detailed(
                ValidationStatus::BadObjectFormat,
                format!("{}: Info.plist not found; not a valid bundle", root.display()),
            ));
        };

        let info_plist = plist::Value::from_file(&info_plist_path)?
            .into_dictionary()
            .ok_or_else(|| {
                CodeValidationError::detailed(
                    ValidationStatus::BadDictionaryFormat,
                    format!("{} is not a dictionary", info_plist_path.display()),
                )
            })?;

        let executable = match info_plist
            .get("CFBundleExecutable")
            .and_then(|v| v.as_string())
        {
            Some(name) => {
                let path = if layout == BundleLayout::Deep {
                    content.join("MacOS").join(name)
                } else {
                    content.join(name)
                };

                let rep: Box<dyn DiskRep> = if path_is_macho(&path)? {
                    Box::new(MachORep::open(&path, arch)?)
                } else {
                    Box::new(FileRep::open(&path)?)
                };

                Some(rep)
            }
            None => None,
        };

        debug!(
            "opened {:?} bundle {} ({:?} layout)",
            package_type,
            root.display(),
            layout
        );

        Ok(Self {
            root: root.to_path_buf(),
            content,
            layout,
            package_type,
            info_plist_path,
            info_plist,
            executable,
        })
    }

    pub fn package_type(&self) -> BundlePackageType {
        self.package_type
    }

    /// The parsed `Info.plist`.
    pub fn info_plist(&self) -> &plist::Dictionary {
        &self.info_plist
    }

    /// Directory holding bundle content.
    pub fn content_dir(&self) -> &Path {
        &self.content
    }

    fn signature_dir(&self) -> PathBuf {
        self.content.join("_CodeSignature")
    }

    fn executable_is_macho(&self) -> bool {
        self.executable
            .as_ref()
            .map(|rep| rep.architecture().is_some())
            .unwrap_or(false)
    }

    /// Files at the root of a versioned framework that nothing seals.
    fn unsealed_framework_root_entries(&self) -> Result<Vec<String>> {
        let mut res = vec![];

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();

            if name == "Versions" {
                continue;
            }

            if entry.file_type()?.is_symlink() {
                let target = std::fs::read_link(entry.path())?;

                if target.starts_with("Versions/Current") {
                    continue;
                }
            }

            res.push(name);
        }

        res.sort();

        Ok(res)
    }
}

impl DiskRep for BundleRep {
    fn path(&self) -> &Path {
        &self.root
    }

    fn main_executable_path(&self) -> PathBuf {
        match &self.executable {
            Some(rep) => rep.main_executable_path(),
            None => self.info_plist_path.clone(),
        }
    }

    fn format(&self) -> String {
        match &self.executable {
            Some(rep) => format!("bundle with {}", rep.format()),
            None => "bundle".into(),
        }
    }

    fn component(&self, slot: CodeSigningSlot) -> Result<Option<Vec<u8>>> {
        match slot {
            CodeSigningSlot::Info => read_optional(&self.info_plist_path),
            CodeSigningSlot::ResourceDir => {
                read_optional(&self.signature_dir().join("CodeResources"))
            }
            _ => match &self.executable {
                Some(rep) if self.executable_is_macho() => rep.component(slot),
                _ => match signature_file_name(slot) {
                    Some(name) => read_optional(&self.signature_dir().join(name)),
                    None => Ok(None),
                },
            },
        }
    }

    fn architecture(&self) -> Option<Architecture> {
        self.executable.as_ref().and_then(|rep| rep.architecture())
    }

    fn architectures(&self) -> Vec<Architecture> {
        self.executable
            .as_ref()
            .map(|rep| rep.architectures())
            .unwrap_or_default()
    }

    fn for_architecture(&self, arch: Architecture) -> Result<Box<dyn DiskRep>> {
        Ok(Box::new(Self::open(&self.root, Some(arch))?))
    }

    fn signing_base(&self) -> u64 {
        self.executable
            .as_ref()
            .map(|rep| rep.signing_base())
            .unwrap_or(0)
    }

    fn signing_limit(&self) -> Result<u64> {
        match &self.executable {
            Some(rep) => rep.signing_limit(),
            None => Ok(0),
        }
    }

    fn resources_root(&self) -> Option<PathBuf> {
        Some(self.content.clone())
    }

    fn allowed_resource_omissions(&self) -> Vec<String> {
        ALLOWED_OMISSIONS.iter().map(|s| s.to_string()).collect()
    }

    fn resource_exclusions(&self) -> Vec<String> {
        let mut res = vec![
            "^_CodeSignature$".to_string(),
            "^CodeResources$".to_string(),
            "^_MASReceipt$".to_string(),
        ];

        if let Some(rep) = &self.executable {
            if let Ok(relative) = rep.main_executable_path().strip_prefix(&self.content) {
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");

                res.push(format!("^{}$", regex::escape(&relative)));
            }
        }

        res
    }

    fn strict_validate(
        &self,
        cd: Option<&CodeDirectory>,
        tolerated: &BTreeSet<ValidationStatus>,
        flags: ValidationFlags,
    ) -> Result<()> {
        if self.layout == BundleLayout::Versioned
            && !tolerated.contains(&ValidationStatus::UnsealedFrameworkRoot)
        {
            let unsealed = self.unsealed_framework_root_entries()?;

            if !unsealed.is_empty() {
                return Err(CodeValidationError::detailed(
                    ValidationStatus::UnsealedFrameworkRoot,
                    format!("{}: {}", self.root.display(), unsealed.join(", ")),
                ));
            }
        }

        match &self.executable {
            Some(rep) => rep.strict_validate(cd, tolerated, flags),
            None => Ok(()),
        }
    }

    fn macho_target(&self) -> Option<MachoTarget> {
        self.executable.as_ref().and_then(|rep| rep.macho_target())
    }

    fn information(&self) -> BTreeMap<String, String> {
        let mut info = self
            .executable
            .as_ref()
            .map(|rep| rep.information())
            .unwrap_or_default();

        info.insert("package-type".into(), format!("{:?}", self.package_type));
        info.insert(
            "info-plist-path".into(),
            self.info_plist_path.display().to_string(),
        );

        info
    }

    fn flush(&self) {
        if let Some(rep) = &self.executable {
            rep.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    const INFO_PLIST: &str = indoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
        <plist version="1.0">
        <dict>
            <key>CFBundleExecutable</key>
            <string>Tool</string>
            <key>CFBundleIdentifier</key>
            <string>com.example.tool</string>
        </dict>
        </plist>
    "#};

    #[test]
    fn deep_app_bundle() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = td.path().join("Tool.app");
        let contents = root.join("Contents");
        std::fs::create_dir_all(contents.join("MacOS"))?;
        std::fs::create_dir_all(contents.join("_CodeSignature"))?;
        std::fs::write(contents.join("Info.plist"), INFO_PLIST)?;
        std::fs::write(contents.join("MacOS").join("Tool"), b"#!/bin/sh\necho hi\n")?;
        std::fs::write(contents.join("_CodeSignature").join("CodeDirectory"), b"cd")?;
        std::fs::write(contents.join("_CodeSignature").join("CodeDirectory-1"), b"alt")?;

        let rep = BundleRep::open(&root, None)?;
        assert_eq!(rep.package_type(), BundlePackageType::App);
        assert_eq!(rep.resources_root(), Some(contents.clone()));
        assert_eq!(rep.main_executable_path(), contents.join("MacOS").join("Tool"));
        assert_eq!(rep.format(), "bundle with generic");
        assert_eq!(rep.signing_limit()?, 18);
        assert!(rep
            .resource_exclusions()
            .contains(&"^MacOS/Tool$".to_string()));
        assert_eq!(
            rep.component(CodeSigningSlot::Info)?,
            Some(INFO_PLIST.as_bytes().to_vec())
        );
        assert_eq!(
            rep.component(CodeSigningSlot::CodeDirectory)?,
            Some(b"cd".to_vec())
        );
        assert_eq!(
            rep.component(CodeSigningSlot::AlternateCodeDirectory(0))?,
            Some(b"alt".to_vec())
        );
        assert!(rep.component(CodeSigningSlot::ResourceDir)?.is_none());
        assert!(rep.component(CodeSigningSlot::Signature)?.is_none());

        Ok(())
    }

    #[test]
    fn missing_info_plist() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = td.path().join("Empty.app");
        std::fs::create_dir_all(&root)?;

        let err = BundleRep::open(&root, None).unwrap_err();
        assert_eq!(err.status(), ValidationStatus::BadObjectFormat);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn versioned_framework_root() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = td.path().join("Kit.framework");
        let version = root.join("Versions").join("A");
        std::fs::create_dir_all(version.join("Resources"))?;
        std::fs::write(version.join("Resources").join("Info.plist"), INFO_PLIST)?;
        std::fs::write(version.join("Tool"), b"lib")?;
        std::os::unix::fs::symlink("A", root.join("Versions").join("Current"))?;
        std::os::unix::fs::symlink("Versions/Current/Tool", root.join("Tool"))?;
        std::os::unix::fs::symlink("Versions/Current/Resources", root.join("Resources"))?;

        let rep = BundleRep::open(&root, None)?;
        assert_eq!(rep.package_type(), BundlePackageType::Framework);
        assert_eq!(rep.content_dir(), std::fs::canonicalize(&version)?);

        let tolerated = BTreeSet::new();
        rep.strict_validate(None, &tolerated, ValidationFlags::STRICT_VALIDATE)?;

        std::fs::write(root.join("stray.txt"), b"x")?;
        let err = rep
            .strict_validate(None, &tolerated, ValidationFlags::STRICT_VALIDATE)
            .unwrap_err();
        assert_eq!(err.status(), ValidationStatus::UnsealedFrameworkRoot);

        let mut tolerated = BTreeSet::new();
        tolerated.insert(ValidationStatus::UnsealedFrameworkRoot);
        rep.strict_validate(None, &tolerated, ValidationFlags::STRICT_VALIDATE)?;

        Ok(())
    }
}
