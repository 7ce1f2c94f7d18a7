// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Static code objects.

A [StaticCode] is a piece of code on disk together with everything learned
about it so far: its code directories, validated components and the outcome
of each validation phase. Phase outcomes, failures included, are cached until
[StaticCode::reset_validity] is called or a different signature is attached.

The full validation sequence is [StaticCode::static_validate]. This module
holds the individual phases.
*/

use {
    crate::{
        code_directory::{CodeDirectory, CodeSignatureFlags},
        code_resources::SealedResources,
        detached_rep::DetachedRep,
        digest::digest_pages,
        directories::{validate_top_directory, CodeDirectoryMap},
        disk_rep::{best_guess, best_guess_slice, Architecture, DiskRep, SignatureSource},
        embedded_signature::{Blob, CodeSigningSlot, EntitlementsBlob},
        error::{CodeValidationError, Result, ValidationStatus},
        flags::{EngineConfig, InformationFlags, ValidationFlags, ValidationModifiers},
        progress::{ValidationMonitor, ValidationProgress},
        requirement::{
            ClauseRequirementCompiler, Requirement, RequirementCompiler, RequirementContext,
        },
        resource_walker::{worker_count, ReportPolicy, ResourceScope, ResourceWalker},
        signature::{
            verify_signature, CmsSignatureDecoder, SignatureDecoder, SignatureVerification,
            TrustEvaluator, X509TrustEvaluator,
        },
        validator::DriverHooks,
    },
    log::{debug, info, warn},
    serde::Serialize,
    std::{
        collections::{BTreeMap, BTreeSet},
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Collaborators and settings shared by a validation and its children.
#[derive(Clone)]
pub struct ValidationEnvironment {
    pub decoder: Arc<dyn SignatureDecoder>,
    pub trust: Arc<dyn TrustEvaluator>,
    pub requirements: Arc<dyn RequirementCompiler>,
    pub monitor: Option<Arc<dyn ValidationMonitor>>,
    pub config: EngineConfig,
    pub modifiers: ValidationModifiers,
}

impl Default for ValidationEnvironment {
    fn default() -> Self {
        Self {
            decoder: Arc::new(CmsSignatureDecoder),
            trust: Arc::new(X509TrustEvaluator::new()),
            requirements: Arc::new(ClauseRequirementCompiler),
            monitor: None,
            config: EngineConfig::default(),
            modifiers: ValidationModifiers::default(),
        }
    }
}

/// Cached outcome of one validation phase.
#[derive(Debug)]
pub enum PhaseOutcome<T> {
    NotAttempted,
    Passed(T),
    Failed(CodeValidationError),
}

impl<T> Default for PhaseOutcome<T> {
    fn default() -> Self {
        Self::NotAttempted
    }
}

impl<T> PhaseOutcome<T> {
    fn record(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Passed(value),
            Err(e) => Self::Failed(e),
        }
    }

    pub fn is_attempted(&self) -> bool {
        !matches!(self, Self::NotAttempted)
    }

    pub fn passed(&self) -> Option<&T> {
        match self {
            Self::Passed(value) => Some(value),
            _ => None,
        }
    }

    /// Replay the cached outcome.
    fn replay(&self) -> Result<&T> {
        match self {
            Self::Passed(value) => Ok(value),
            Self::Failed(e) => Err(e.to_cached()),
            Self::NotAttempted => Err(CodeValidationError::Internal(
                "validation phase not attempted".into(),
            )),
        }
    }
}

/// Result of verifying the code directories and their signature.
#[derive(Clone, Debug, Default)]
pub struct DirectoryVerdict {
    /// `None` for ad-hoc signatures.
    pub verification: Option<SignatureVerification>,
    /// The canonical directory demands expiration be enforced.
    pub force_expiration: bool,
}

impl DirectoryVerdict {
    pub fn expired(&self) -> bool {
        self.verification
            .as_ref()
            .map(|v| v.expired)
            .unwrap_or(false)
    }
}

/// Outcomes of all validation phases of one [StaticCode].
#[derive(Debug, Default)]
pub struct ValidationState {
    pub directory: PhaseOutcome<DirectoryVerdict>,
    /// The directory phase ran with revocation enforcement.
    pub revocation_checked: bool,
    pub executable: PhaseOutcome<()>,
    pub resources: PhaseOutcome<()>,
    /// The resource phase ran with nested code checking.
    pub resources_deep: bool,
}

/// Signing information report.
///
/// Fields beyond the format and path are only present for signed code.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SigningInformation {
    pub main_executable: PathBuf,
    pub format: String,
    /// `unsigned`, `embedded` or `explicit detached`.
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Hex cdhash of the canonical code directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cdhashes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub digest_algorithms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_plist: Option<plist::Value>,

    /// PEM encoded signing chain, leaf first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<String>,
    /// RFC 3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_time: Option<String>,
    /// RFC 3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cms: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements_dict: Option<plist::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_directory: Option<plist::Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub disk_rep_information: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sealed_resources: Vec<String>,
}

/// Code on disk and the validation state accumulated for it.
pub struct StaticCode {
    base_rep: Arc<dyn DiskRep>,
    rep: Arc<dyn DiskRep>,
    detached: Option<Arc<Vec<u8>>>,

    /// Outer `None` means not loaded yet; inner `None` means unsigned.
    directories: Option<Option<CodeDirectoryMap>>,
    components: BTreeMap<CodeSigningSlot, Option<Vec<u8>>>,
    resources: Option<Option<SealedResources>>,

    pub(crate) state: ValidationState,
    pub(crate) flags: ValidationFlags,
    pub(crate) progress: ValidationProgress,
    pub(crate) env: ValidationEnvironment,

    /// Resource envelopes of enclosing code, innermost first.
    pub(crate) outer_scopes: Vec<ResourceScope>,
    pub(crate) depth: usize,
}

impl StaticCode {
    pub fn new(rep: Box<dyn DiskRep>, env: ValidationEnvironment) -> Self {
        let rep: Arc<dyn DiskRep> = Arc::from(rep);

        Self {
            base_rep: rep.clone(),
            rep,
            detached: None,
            directories: None,
            components: BTreeMap::new(),
            resources: None,
            state: ValidationState::default(),
            flags: ValidationFlags::empty(),
            progress: ValidationProgress::new(),
            env,
            outer_scopes: vec![],
            depth: 0,
        }
    }

    /// Open the code at a path, guessing its format.
    pub fn open(path: &Path, env: ValidationEnvironment) -> Result<Self> {
        Ok(Self::new(best_guess(path)?, env))
    }

    /// Open a specific architecture of the code at a path.
    pub fn open_architecture(
        path: &Path,
        arch: Architecture,
        env: ValidationEnvironment,
    ) -> Result<Self> {
        Ok(Self::new(best_guess_slice(path, Some(arch))?, env))
    }

    pub fn path(&self) -> &Path {
        self.rep.path()
    }

    /// The representation in use, detached signature included.
    pub fn disk_rep(&self) -> &Arc<dyn DiskRep> {
        &self.rep
    }

    pub fn environment(&self) -> &ValidationEnvironment {
        &self.env
    }

    /// Progress state. Clones may be sent to other threads to cancel.
    pub fn progress(&self) -> &ValidationProgress {
        &self.progress
    }

    /// Request cancellation of a running validation.
    pub fn cancel(&self) -> Result<()> {
        self.progress.cancel()
    }

    pub fn validation_state(&self) -> &ValidationState {
        &self.state
    }

    pub fn validation_flags(&self) -> ValidationFlags {
        self.flags
    }

    pub fn set_validation_flags(&mut self, flags: ValidationFlags) {
        self.flags = flags;
    }

    /// Statuses the caller asked to tolerate.
    pub fn tolerated(&self) -> BTreeSet<ValidationStatus> {
        self.env.modifiers.errors.clone()
    }

    /// Resource omissions that do not make rules weak.
    pub fn allowed_omissions(&self) -> Vec<String> {
        let mut res = self.rep.allowed_resource_omissions();
        res.extend(self.env.modifiers.omissions.iter().cloned());

        res
    }

    /// All code directories, or `None` for unsigned code.
    pub fn code_directories(&mut self) -> Result<Option<&CodeDirectoryMap>> {
        if self.directories.is_none() {
            let rep = self.rep.clone();
            let map = CodeDirectoryMap::load(|slot| rep.component(slot))?;

            if map.is_none() {
                debug!("{} is unsigned", self.path().display());
            }

            self.directories = Some(map);
        }

        Ok(self.directories.as_ref().and_then(|map| map.as_ref()))
    }

    pub fn is_signed(&mut self) -> Result<bool> {
        Ok(self.code_directories()?.is_some())
    }

    fn directory_map(&mut self) -> Result<&CodeDirectoryMap> {
        self.code_directories()?
            .ok_or_else(|| ValidationStatus::Unsigned.into())
    }

    /// The canonical code directory.
    pub fn code_directory(&mut self) -> Result<&CodeDirectory> {
        Ok(self.directory_map()?.canonical())
    }

    pub fn cdhash(&mut self) -> Result<Vec<u8>> {
        self.code_directory()?.cdhash()
    }

    /// cdhashes of every code directory, ordered by digest type.
    pub fn cdhashes(&mut self) -> Result<Vec<Vec<u8>>> {
        self.directory_map()?.cdhashes()
    }

    pub fn team_identifier(&mut self) -> Result<Option<String>> {
        Ok(self
            .code_directory()?
            .team_identifier()
            .map(|s| s.to_string()))
    }

    /// Fetch a special slot component, validated against the canonical
    /// directory.
    ///
    /// Components the directory does not seal are reported absent even if
    /// the disk has them.
    pub fn component(&mut self, slot: CodeSigningSlot) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.components.get(&slot) {
            return Ok(cached.clone());
        }

        let data = self.rep.component(slot)?;

        let value = {
            let cd = self.code_directory()?;

            if cd.slot_is_present(slot) {
                match data {
                    Some(data) if cd.validate_slot(&data, slot)? => Some(data),
                    Some(_) => return Err(CodeValidationError::ComponentMismatch(slot)),
                    None => return Err(CodeValidationError::ComponentMissing(slot)),
                }
            } else {
                if data.is_some() {
                    debug!("ignoring unsealed component in slot {:?}", slot);
                }

                None
            }
        };

        self.components.insert(slot, value.clone());

        Ok(value)
    }

    /// The sealed `Info.plist`.
    pub fn info_plist(&mut self) -> Result<Option<plist::Dictionary>> {
        match self.component(CodeSigningSlot::Info)? {
            Some(data) => {
                let value = plist::Value::from_reader(std::io::Cursor::new(data))?;

                Ok(Some(value.into_dictionary().ok_or_else(|| {
                    CodeValidationError::detailed(
                        ValidationStatus::InfoPlistFailed,
                        "Info.plist is not a dictionary",
                    )
                })?))
            }
            None => Ok(None),
        }
    }

    /// The sealed entitlements.
    pub fn entitlements(&mut self) -> Result<Option<plist::Dictionary>> {
        match self.component(CodeSigningSlot::Entitlements)? {
            Some(data) => Ok(Some(EntitlementsBlob::from_blob_bytes(&data)?.parse()?)),
            None => Ok(None),
        }
    }

    /// The sealed resource directory.
    pub fn resource_dictionary(&mut self) -> Result<Option<SealedResources>> {
        if let Some(cached) = &self.resources {
            return Ok(cached.clone());
        }

        let resources = match self.component(CodeSigningSlot::ResourceDir)? {
            Some(data) => Some(SealedResources::from_xml(&data)?),
            None => None,
        };

        self.resources = Some(resources.clone());

        Ok(resources)
    }

    fn verify_directory(&mut self) -> Result<DirectoryVerdict> {
        let signature = self.rep.signature()?;
        let flags = self.flags;
        let decoder = self.env.decoder.clone();
        let trust = self.env.trust.clone();

        let directories = self.directory_map()?;
        let force_expiration = directories
            .canonical()
            .flags()
            .contains(CodeSignatureFlags::FORCE_EXPIRATION);

        let verification = verify_signature(
            directories,
            signature.as_deref(),
            flags,
            decoder.as_ref(),
            trust.as_ref(),
        )?;

        Ok(DirectoryVerdict {
            verification,
            force_expiration,
        })
    }

    /// Validate the code directories and the signature over them.
    ///
    /// The verdict is cached. A cached verdict is recomputed when revocation
    /// enforcement is requested but was not used before.
    pub fn validate_directory(&mut self) -> Result<()> {
        let enforce_revocation = self
            .flags
            .contains(ValidationFlags::ENFORCE_REVOCATION_CHECKS);

        if !self.state.directory.is_attempted()
            || (enforce_revocation && !self.state.revocation_checked)
        {
            info!("validating code directory of {}", self.path().display());

            let result = self.verify_directory();
            self.state.revocation_checked = enforce_revocation;
            self.state.directory = PhaseOutcome::record(result);
        }

        let verdict = self.state.directory.replay()?;

        if verdict.expired()
            && (self.flags.contains(ValidationFlags::CONSIDER_EXPIRATION)
                || verdict.force_expiration)
        {
            return Err(ValidationStatus::CertExpired.into());
        }

        Ok(())
    }

    /// Validate the directory and every special slot component except the
    /// resource directory.
    pub fn validate_non_resource_components(&mut self) -> Result<()> {
        self.validate_directory()?;

        let max = self.code_directory()?.max_special_slot();

        for slot in (1..=max).rev().map(CodeSigningSlot::from) {
            if slot != CodeSigningSlot::ResourceDir {
                self.component(slot)?;
            }
        }

        Ok(())
    }

    /// Check the sealed slot listing against the components present.
    pub fn validate_top_directory(&mut self) -> Result<()> {
        let top = self.component(CodeSigningSlot::TopDirectory)?;
        let count = self.directory_map()?.len();

        validate_top_directory(top.as_deref(), count, |slot| {
            Ok(self.component(slot)?.is_some())
        })
    }

    fn hash_executable(&mut self) -> Result<()> {
        let rep = self.rep.clone();
        let directories = self.directory_map()?.clone();
        let canonical = directories.canonical();

        let page_size = canonical.page_size();
        let limit = canonical.signing_limit();
        let slots = canonical.code_slot_count();

        for (digest_type, cd) in directories.iter() {
            if cd.page_size() != page_size
                || cd.signing_limit() != limit
                || cd.code_slot_count() != slots
            {
                return Err(CodeValidationError::detailed(
                    ValidationStatus::SignatureFailed,
                    format!("{} code directory disagrees on page layout", digest_type),
                ));
            }
        }

        let types = directories.digest_types();
        let path = rep.main_executable_path();

        debug!(
            "hashing {} bytes of {} at offset {} with {:?}",
            limit,
            path.display(),
            rep.signing_base(),
            types
        );

        let mut fh = std::fs::File::open(&path)?;

        let pages = digest_pages(
            &mut fh,
            rep.signing_base(),
            limit,
            page_size,
            &types,
            |page, digests| {
                for (digest_type, cd) in directories.iter() {
                    let digest = digests.get(digest_type).ok_or_else(|| {
                        CodeValidationError::Internal(format!("no {} page digest", digest_type))
                    })?;

                    if !cd.validate_code_page_digest(page, digest) {
                        debug!("page {} fails {} digest", page, digest_type);
                        return Err(CodeValidationError::PageMismatch(page));
                    }
                }

                Ok(())
            },
        )
        .map_err(|e| match e {
            CodeValidationError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                CodeValidationError::detailed(
                    ValidationStatus::SignatureFailed,
                    "main executable is shorter than its signed range",
                )
            }
            e => e,
        })?;

        if pages != slots {
            return Err(CodeValidationError::detailed(
                ValidationStatus::SignatureFailed,
                format!("signed range has {} pages; {} are sealed", pages, slots),
            ));
        }

        Ok(())
    }

    /// Validate the pages of the main executable against every directory.
    pub fn validate_executable(&mut self) -> Result<()> {
        if !self.state.executable.is_attempted() {
            info!("validating executable of {}", self.path().display());

            let result = self.hash_executable();
            self.state.executable = PhaseOutcome::record(result);
        }

        self.state.executable.replay().map(|_| ())
    }

    fn walk_resources(&mut self, flags: ValidationFlags) -> Result<()> {
        let rep = self.rep.clone();
        let resources = self.resource_dictionary()?;

        let (root, resources) = match (rep.resources_root(), resources) {
            (Some(root), Some(resources)) => (root, resources),
            (None, None) => {
                debug!("{} has no resources", self.path().display());
                return Ok(());
            }
            _ => return Err(ValidationStatus::ResourcesNotFound.into()),
        };

        let directories = self.directory_map()?;
        let digest_types = directories.digest_types();
        let canonical = directories.canonical().hash_type();

        let hooks = DriverHooks::new(self);
        let workers = worker_count(
            &root,
            self.env.config.medium,
            self.env.config.resource_workers,
            flags,
        );

        let walker = ResourceWalker::new(
            &root,
            &resources,
            &rep.resource_exclusions(),
            digest_types,
            canonical,
            flags,
            &hooks,
        )?
        .tolerated(self.tolerated())
        .target(rep.macho_target())
        .outer_scopes(self.outer_scopes.clone())
        .workers(workers);

        walker.check_rules(&self.allowed_omissions())?;
        walker.validate(ReportPolicy::Collect)
    }

    /// Validate sealed resources.
    ///
    /// The outcome is cached. A cached outcome computed without nested code
    /// checking is recomputed when nested code checking is requested.
    pub fn validate_resources(&mut self, flags: ValidationFlags) -> Result<()> {
        let deep = flags.contains(ValidationFlags::CHECK_NESTED_CODE);

        if !self.state.resources.is_attempted() || (deep && !self.state.resources_deep) {
            info!("validating resources of {}", self.path().display());

            let result = self.walk_resources(flags);
            self.state.resources_deep = deep;
            self.state.resources = PhaseOutcome::record(result);
        }

        self.state.resources.replay().map(|_| ())
    }

    /// Evaluate a requirement, failing with `failure` if it is not met.
    pub fn validate_requirement(
        &mut self,
        requirement: &dyn Requirement,
        failure: ValidationStatus,
    ) -> Result<()> {
        self.validate_directory()?;

        let (certificates, vendor_anchored) = self
            .state
            .directory
            .passed()
            .and_then(|verdict| verdict.verification.as_ref())
            .map(|v| (v.chain.clone(), v.vendor_anchored))
            .unwrap_or_default();

        let info_plist = self.info_plist()?;
        let entitlements = self.entitlements()?;
        let cd = self.code_directory()?.clone();

        let context = RequirementContext {
            certificates: &certificates,
            vendor_anchored,
            info_plist: info_plist.as_ref(),
            entitlements: entitlements.as_ref(),
            identifier: cd.identifier(),
            code_directory: &cd,
        };

        if requirement.validates(&context)? {
            Ok(())
        } else {
            debug!("{} does not satisfy {:?}", self.path().display(), requirement);
            Err(failure.into())
        }
    }

    /// The detached signature data in use, if any.
    pub fn detached_signature(&self) -> Option<&Arc<Vec<u8>>> {
        self.detached.as_ref()
    }

    pub(crate) fn attach_detached(&mut self, data: Option<Arc<Vec<u8>>>) -> Result<()> {
        match data {
            Some(data) => {
                self.rep = Arc::new(DetachedRep::new(self.base_rep.clone(), data.clone())?);
                self.detached = Some(data);
            }
            None => {
                self.rep = self.base_rep.clone();
                self.detached = None;
            }
        }

        self.reset_validity();

        Ok(())
    }

    /// Use signature data stored outside the code, or `None` to go back to
    /// the embedded signature.
    ///
    /// All cached state is discarded.
    pub fn attach_detached_signature(&mut self, data: Option<Vec<u8>>) -> Result<()> {
        self.attach_detached(data.map(Arc::new))
    }

    /// Forget everything learned about the code.
    pub fn reset_validity(&mut self) {
        debug!("resetting validity of {}", self.path().display());

        self.directories = None;
        self.components.clear();
        self.resources = None;
        self.state = ValidationState::default();
        self.rep.flush();
    }

    /// Where the signature comes from. `None` for unsigned code.
    pub fn signature_source(&mut self) -> Result<Option<SignatureSource>> {
        Ok(if self.is_signed()? {
            Some(self.rep.signature_source())
        } else {
            None
        })
    }

    /// A child object for another slice of the main executable.
    ///
    /// An explicitly attached detached signature carries over.
    pub(crate) fn for_architecture(&self, arch: Architecture) -> Result<Self> {
        let mut code = Self::new(self.base_rep.for_architecture(arch)?, self.env.clone());
        code.outer_scopes = self.outer_scopes.clone();
        code.depth = self.depth;

        if let Some(data) = &self.detached {
            code.attach_detached(Some(data.clone()))?;
        }

        Ok(code)
    }

    /// Describe the code.
    pub fn signing_information(&mut self, flags: InformationFlags) -> Result<SigningInformation> {
        let mut res = SigningInformation {
            main_executable: self.rep.main_executable_path(),
            format: self.rep.format(),
            source: match self.signature_source()? {
                Some(source) => source.to_string(),
                None => "unsigned".into(),
            },
            ..Default::default()
        };

        if !self.is_signed()? {
            return Ok(res);
        }

        {
            let directories = self.directory_map()?;
            let cd = directories.canonical();

            res.identifier = Some(cd.identifier().to_string());
            res.unique = Some(hex::encode(cd.cdhash()?));
            res.flags = Some(cd.flags().bits());
            res.platform = Some(cd.platform());
            res.team_identifier = cd.team_identifier().map(|s| s.to_string());
            res.cdhashes = directories
                .cdhashes()?
                .into_iter()
                .map(hex::encode)
                .collect();
            res.digest_algorithms = directories
                .digest_types()
                .into_iter()
                .map(|t| t.to_string())
                .collect();
        }

        res.info_plist = self.info_plist()?.map(plist::Value::Dictionary);

        if flags.contains(InformationFlags::SIGNING_INFORMATION) {
            res.cms = self.rep.signature()?.map(hex::encode);

            if let Err(e) = self.validate_directory() {
                debug!("signing details unavailable: {}", e);
            }

            if let Some(verification) = self
                .state
                .directory
                .passed()
                .and_then(|verdict| verdict.verification.as_ref())
            {
                res.certificates = verification
                    .chain
                    .iter()
                    .map(|cert| cert.encode_pem())
                    .collect();
                res.signing_time = verification.signing_time.map(|t| t.to_rfc3339());
                res.timestamp = verification.timestamp.map(|t| t.to_rfc3339());
            }
        }

        if flags.contains(InformationFlags::REQUIREMENT_INFORMATION) {
            res.requirements = self
                .component(CodeSigningSlot::RequirementSet)?
                .map(hex::encode);

            if let Some(data) = self.component(CodeSigningSlot::Entitlements)? {
                let blob = EntitlementsBlob::from_blob_bytes(&data)?;
                res.entitlements = Some(blob.as_str().to_string());
                res.entitlements_dict = Some(plist::Value::Dictionary(blob.parse()?));
            }
        }

        if flags.contains(InformationFlags::INTERNAL_INFORMATION) {
            res.code_directory = Some(hex::encode(self.code_directory()?.raw()));
            res.code_offset = Some(self.rep.signing_base());
            res.disk_rep_information = self.rep.information();

            if !flags.contains(InformationFlags::SKIP_RESOURCE_DIRECTORY) {
                res.resource_directory = self
                    .resource_dictionary()?
                    .map(|r| plist::Value::Dictionary(r.as_dictionary().clone()));
            }
        }

        if flags.contains(InformationFlags::CONTENT_INFORMATION) {
            match self.resource_dictionary() {
                Ok(Some(resources)) => {
                    res.sealed_resources = resources.files().keys().cloned().collect();
                }
                Ok(None) => {}
                Err(e) => warn!("resource directory unavailable: {}", e),
            }
        }

        Ok(res)
    }
}

/// Builders of signed fixture bundles.
#[cfg(test)]
pub(crate) mod testutil {
    use {
        crate::{
            code_directory::{fixture_code_directory, CodeSignatureFlags},
            embedded_signature::{CodeSigningSlot, DigestType},
        },
        indoc::formatdoc,
        plist::{Dictionary, Value},
        std::path::Path,
    };

    pub const PAGE_SIZE: u32 = 4096;

    pub fn info_plist(executable: &str, identifier: &str) -> String {
        formatdoc!(
            r#"
                <?xml version="1.0" encoding="UTF-8"?>
                <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
                <plist version="1.0">
                <dict>
                    <key>CFBundleExecutable</key>
                    <string>{}</string>
                    <key>CFBundleIdentifier</key>
                    <string>{}</string>
                </dict>
                </plist>
            "#,
            executable,
            identifier
        )
    }

    fn file_seal(data: &[u8]) -> Value {
        let mut dict = Dictionary::new();
        dict.insert(
            "hash".into(),
            Value::Data(DigestType::Sha1.digest_data(data).unwrap()),
        );
        dict.insert(
            "hash2".into(),
            Value::Data(DigestType::Sha256.digest_data(data).unwrap()),
        );
        Value::Dictionary(dict)
    }

    fn weighted(key: &str, weight: f64) -> Value {
        let mut dict = Dictionary::new();
        dict.insert(key.into(), Value::Boolean(true));
        dict.insert("weight".into(), Value::Real(weight));
        Value::Dictionary(dict)
    }

    /// Seal for nested code that must satisfy `requirement`.
    pub fn nested_seal(requirement: &str) -> Value {
        let mut dict = Dictionary::new();
        dict.insert("requirement".into(), Value::String(requirement.into()));
        Value::Dictionary(dict)
    }

    /// Description of a bundle to sign.
    pub struct Fixture<'a> {
        pub name: &'a str,
        pub identifier: &'a str,
        pub team: Option<&'a str>,
        /// `Contents/` layout with `MacOS/`, else everything at the root.
        pub deep: bool,
        pub executable: Vec<u8>,
        pub resources: Vec<(&'a str, Vec<u8>)>,
        /// Extra seals, such as nested code, keyed by content relative path.
        pub extra_seals: Vec<(&'a str, Value)>,
        pub flags: CodeSignatureFlags,
    }

    impl<'a> Fixture<'a> {
        pub fn new(name: &'a str, identifier: &'a str) -> Self {
            Self {
                name,
                identifier,
                team: None,
                deep: true,
                executable: (0..3 * PAGE_SIZE + 100).map(|i| (i % 251) as u8).collect(),
                resources: vec![("Resources/en.lproj/Strings.txt", b"hello".to_vec())],
                extra_seals: vec![],
                flags: CodeSignatureFlags::ADHOC,
            }
        }

        /// Write and ad-hoc sign the bundle under `parent`. Returns its root.
        pub fn write(&self, parent: &Path) -> std::path::PathBuf {
            let root = parent.join(self.name);
            let content = if self.deep {
                root.join("Contents")
            } else {
                root.clone()
            };
            let executable_dir = if self.deep {
                content.join("MacOS")
            } else {
                content.clone()
            };

            std::fs::create_dir_all(&executable_dir).unwrap();
            std::fs::create_dir_all(content.join("_CodeSignature")).unwrap();

            let info = info_plist("Tool", self.identifier);
            std::fs::write(content.join("Info.plist"), &info).unwrap();
            std::fs::write(executable_dir.join("Tool"), &self.executable).unwrap();

            let mut files2 = Dictionary::new();
            for (path, data) in &self.resources {
                let full = content.join(path);
                std::fs::create_dir_all(full.parent().unwrap()).unwrap();
                std::fs::write(&full, data).unwrap();
                files2.insert(path.to_string(), file_seal(data));
            }
            for (path, seal) in &self.extra_seals {
                files2.insert(path.to_string(), seal.clone());
            }

            let mut rules2 = Dictionary::new();
            rules2.insert("^.*".into(), Value::Boolean(true));
            rules2.insert("^Info\\.plist$".into(), weighted("omit", 20.0));
            rules2.insert("^(Frameworks|PlugIns)/".into(), weighted("nested", 10.0));

            let mut rules = Dictionary::new();
            rules.insert("^Resources/".into(), Value::Boolean(true));

            let mut code_resources = Dictionary::new();
            code_resources.insert("files".into(), Value::Dictionary(Dictionary::new()));
            code_resources.insert("rules".into(), Value::Dictionary(rules));
            code_resources.insert("files2".into(), Value::Dictionary(files2));
            code_resources.insert("rules2".into(), Value::Dictionary(rules2));

            let mut resources_xml = vec![];
            Value::Dictionary(code_resources)
                .to_writer_xml(&mut resources_xml)
                .unwrap();
            std::fs::write(
                content.join("_CodeSignature").join("CodeResources"),
                &resources_xml,
            )
            .unwrap();

            let cd = fixture_code_directory(
                DigestType::Sha256,
                self.identifier,
                self.team,
                PAGE_SIZE,
                &self.executable,
                &[
                    (CodeSigningSlot::Info, info.as_bytes()),
                    (CodeSigningSlot::ResourceDir, &resources_xml),
                ],
                self.flags,
            );
            std::fs::write(content.join("_CodeSignature").join("CodeDirectory"), cd).unwrap();

            root
        }
    }

    /// Path of the main executable of a deep fixture bundle.
    pub fn executable_path(root: &Path) -> std::path::PathBuf {
        root.join("Contents").join("MacOS").join("Tool")
    }
}
