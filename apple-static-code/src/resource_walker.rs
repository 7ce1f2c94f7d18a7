// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Validation of sealed resources against the filesystem.

The resource root is walked once, in file name order. Each path is
classified by the seal's rules:

* excluded directories are not descended into,
* omitted and excluded files are skipped,
* directories matching a nested rule whose name contains a `.` are treated
  as nested code and not descended into,
* everything else is validated against its seal.

Validation of individual entries runs on a bounded [rayon] pool. Problems
are funneled into a shared [ValidationContext]. After the walk, sealed paths
that were never visited are reported missing unless optional.
*/

use {
    crate::{
        code_resources::{ResourceRuleSet, ResourceSeal, SealedResources},
        digest::MultiDigester,
        embedded_signature::DigestType,
        error::{
            CodeValidationError, ResourceProblem, ResourceProblemKind, ResourceProblems, Result,
            ValidationStatus,
        },
        flags::{StorageMedium, ValidationFlags},
        legacy::is_legacy_exempt,
        macho_rep::MachoTarget,
        requirement::Requirement,
    },
    log::{debug, warn},
    rayon::prelude::*,
    std::{
        collections::{BTreeSet, HashSet},
        path::{Component, Path, PathBuf},
        sync::{Arc, Mutex},
    },
};

/// Absolute symlink targets must resolve under one of these.
const ALLOWED_SYMLINK_DESTINATIONS: &[&str] = &["/System/", "/Library/"];

/// How a [ValidationContext] reacts to a problem.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportPolicy {
    /// The first problem is returned as an error immediately.
    Throw,
    /// Problems are recorded and returned together at the end.
    Collect,
}

#[derive(Debug, Default)]
struct ContextState {
    status: Option<ValidationStatus>,
    problems: Vec<ResourceProblem>,
}

/// Accumulator of resource problems.
///
/// Safe to share between workers. The first recorded status becomes the
/// aggregate status.
#[derive(Debug)]
pub struct ValidationContext {
    policy: ReportPolicy,
    state: Mutex<ContextState>,
}

impl ValidationContext {
    pub fn new(policy: ReportPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn policy(&self) -> ReportPolicy {
        self.policy
    }

    /// Report a problem with a resource.
    ///
    /// Under [ReportPolicy::Throw] this returns the problem as an error.
    pub fn report(
        &self,
        status: ValidationStatus,
        kind: ResourceProblemKind,
        path: &str,
    ) -> Result<()> {
        debug!("resource problem: {} {} ({})", kind, path, status);

        match self.policy {
            ReportPolicy::Throw => Err(CodeValidationError::Resource {
                status,
                path: path.to_string(),
            }),
            ReportPolicy::Collect => {
                let mut state = self
                    .state
                    .lock()
                    .map_err(|_| CodeValidationError::Internal("context lock poisoned".into()))?;

                if state.status.is_none() {
                    state.status = Some(status);
                }

                state.problems.push(ResourceProblem {
                    kind,
                    status,
                    path: path.to_string(),
                });

                Ok(())
            }
        }
    }

    /// The first recorded status, if any problem was reported.
    pub fn status(&self) -> Option<ValidationStatus> {
        self.state.lock().ok().and_then(|state| state.status)
    }

    /// Convert into the aggregate outcome.
    pub fn into_result(self) -> Result<()> {
        let state = self
            .state
            .into_inner()
            .map_err(|_| CodeValidationError::Internal("context lock poisoned".into()))?;

        match state.status {
            None => Ok(()),
            Some(status) => Err(CodeValidationError::Resources(ResourceProblems {
                status,
                problems: state.problems,
            })),
        }
    }
}

/// A sealed resource envelope: a root directory and the rules governing it.
#[derive(Clone, Debug)]
pub struct ResourceScope {
    root: PathBuf,
    rules: ResourceRuleSet,
}

impl ResourceScope {
    pub fn new(root: PathBuf, rules: ResourceRuleSet) -> Self {
        Self { root, rules }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules(&self) -> &ResourceRuleSet {
        &self.rules
    }

    /// Whether a resolved absolute path is inside this envelope.
    ///
    /// `None` if the path is not below the root at all.
    pub fn includes(&self, resolved: &Path) -> Option<bool> {
        let relative = resolved.strip_prefix(&self.root).ok()?;

        Some(self.rules.includes(&relative_path_string(relative)))
    }
}

/// Callbacks from the walk into the validation driver.
pub trait WalkHooks: Send + Sync {
    /// Compile the requirement sealed for nested code.
    fn compile_requirement(&self, text: &str) -> Result<Arc<dyn Requirement>>;

    /// Statically validate nested code against a requirement.
    ///
    /// `scopes` are the enclosing resource envelopes, innermost first.
    fn validate_nested(
        &self,
        path: &Path,
        requirement: Arc<dyn Requirement>,
        flags: ValidationFlags,
        scopes: &[ResourceScope],
    ) -> Result<()>;

    /// Record one unit of progress. Errors abort the walk.
    fn report_progress(&self) -> Result<()>;
}

/// Choose the number of resource hashing workers.
pub fn worker_count(
    root: &Path,
    medium: StorageMedium,
    explicit: Option<usize>,
    flags: ValidationFlags,
) -> usize {
    if flags.contains(ValidationFlags::SINGLE_THREADED) {
        return 1;
    }

    if let Some(count) = explicit {
        return count.max(1);
    }

    let medium = match medium {
        StorageMedium::Auto => detect_medium(root),
        medium => medium,
    };

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let count = match medium {
        StorageMedium::Rotational => 2,
        _ => cpus.max(2),
    };

    debug!("{:?} storage for {}: {} workers", medium, root.display(), count);

    count
}

/// Best effort detection of rotational storage.
///
/// Unknown media are treated as solid state.
#[cfg(target_os = "linux")]
pub fn detect_medium(path: &Path) -> StorageMedium {
    use std::os::unix::fs::MetadataExt;

    let dev = match std::fs::metadata(path) {
        Ok(metadata) => metadata.dev(),
        Err(_) => return StorageMedium::SolidState,
    };

    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & 0xffff_f000);
    let minor = (dev & 0xff) | ((dev >> 12) & 0xffff_ff00);

    // Partitions expose the queue on their parent device.
    let base = PathBuf::from(format!("/sys/dev/block/{}:{}", major, minor));

    for candidate in [base.join("queue/rotational"), base.join("../queue/rotational")] {
        if let Ok(value) = std::fs::read_to_string(&candidate) {
            return if value.trim() == "1" {
                StorageMedium::Rotational
            } else {
                StorageMedium::SolidState
            };
        }
    }

    StorageMedium::SolidState
}

#[cfg(not(target_os = "linux"))]
pub fn detect_medium(_path: &Path) -> StorageMedium {
    StorageMedium::SolidState
}

fn relative_path_string(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether a file carries a resource fork.
fn has_sideband_data(path: &Path) -> bool {
    std::fs::metadata(path.join("..namedfork").join("rsrc"))
        .map(|metadata| metadata.len() > 0)
        .unwrap_or(false)
}

/// A path found on disk that is subject to validation.
#[derive(Clone, Debug, Eq, PartialEq)]
struct WalkItem {
    relative: String,
    is_symlink: bool,
    /// Regular file. Directories, symlinks and special files are not.
    is_file: bool,
}

/// Validates the resources of one piece of code.
pub struct ResourceWalker<'a> {
    root: PathBuf,
    resources: &'a SealedResources,
    scope: ResourceScope,
    legacy_rules: Option<ResourceRuleSet>,
    digest_types: Vec<DigestType>,
    canonical: DigestType,
    flags: ValidationFlags,
    tolerated: BTreeSet<ValidationStatus>,
    target: Option<MachoTarget>,
    outer_scopes: Vec<ResourceScope>,
    workers: usize,
    hooks: &'a dyn WalkHooks,
}

impl<'a> ResourceWalker<'a> {
    /// Construct a walker.
    ///
    /// `exclusions` are patterns of the disk representation's own files,
    /// such as the signature directory. `canonical` must be in `digest_types`.
    pub fn new(
        root: &Path,
        resources: &'a SealedResources,
        exclusions: &[String],
        digest_types: Vec<DigestType>,
        canonical: DigestType,
        flags: ValidationFlags,
        hooks: &'a dyn WalkHooks,
    ) -> Result<Self> {
        let mut rules = resources.rules().clone();
        for pattern in exclusions {
            rules.add_exclusion(pattern)?;
        }

        let root = std::fs::canonicalize(root)?;

        Ok(Self {
            scope: ResourceScope::new(root.clone(), rules),
            root,
            resources,
            legacy_rules: resources.legacy_rules()?,
            digest_types,
            canonical,
            flags,
            tolerated: BTreeSet::new(),
            target: None,
            outer_scopes: vec![],
            workers: 1,
            hooks,
        })
    }

    #[must_use]
    pub fn tolerated(mut self, tolerated: BTreeSet<ValidationStatus>) -> Self {
        self.tolerated = tolerated;
        self
    }

    /// Deployment target of the main executable, used for legacy exemptions.
    #[must_use]
    pub fn target(mut self, target: Option<MachoTarget>) -> Self {
        self.target = target;
        self
    }

    /// Envelopes of enclosing code, innermost first.
    #[must_use]
    pub fn outer_scopes(mut self, scopes: Vec<ResourceScope>) -> Self {
        self.outer_scopes = scopes;
        self
    }

    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// This walk's envelope.
    pub fn scope(&self) -> &ResourceScope {
        &self.scope
    }

    fn tolerates(&self, status: ValidationStatus) -> bool {
        self.tolerated.contains(&status)
    }

    /// Reject weak rules and obsolete envelopes under strict validation.
    pub fn check_rules(&self, allowed_omissions: &[String]) -> Result<()> {
        if !self.flags.contains(ValidationFlags::STRICT_VALIDATE) {
            return Ok(());
        }

        let version = self.resources.version();

        if self
            .resources
            .rules()
            .has_weak_rules(version, allowed_omissions)
        {
            if self.tolerates(ValidationStatus::WeakResourceRules) {
                warn!("{}: tolerating weak resource rules", self.root.display());
            } else {
                return Err(ValidationStatus::WeakResourceRules.into());
            }
        }

        if version == 1 {
            if self.tolerates(ValidationStatus::WeakResourceEnvelope) {
                warn!("{}: tolerating version 1 resource envelope", self.root.display());
            } else {
                return Err(ValidationStatus::WeakResourceEnvelope.into());
            }
        }

        Ok(())
    }

    /// Enumerate the paths subject to validation.
    fn scan(&self) -> Result<Vec<WalkItem>> {
        let rules = self.scope.rules();
        let mut items = vec![];

        let mut it = walkdir::WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = it.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping unreadable resource path: {}", e);
                    continue;
                }
            };

            if entry.depth() == 0 {
                continue;
            }

            let relative = relative_path_string(
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .map_err(|e| CodeValidationError::Internal(e.to_string()))?,
            );

            let file_type = entry.file_type();

            if file_type.is_dir() {
                match rules.find_rule(&relative) {
                    Some(rule) if rule.exclude => {
                        it.skip_current_dir();
                    }
                    Some(rule) if rule.nested => {
                        if entry.file_name().to_string_lossy().contains('.') {
                            items.push(WalkItem {
                                relative,
                                is_symlink: false,
                                is_file: false,
                            });
                            it.skip_current_dir();
                        }
                    }
                    _ => {}
                }
            } else {
                match rules.find_rule(&relative) {
                    Some(rule) if !rule.omit && !rule.exclude => {
                        items.push(WalkItem {
                            relative,
                            is_symlink: file_type.is_symlink(),
                            is_file: file_type.is_file(),
                        });
                    }
                    _ => {
                        debug!("not validating {}", relative);
                    }
                }
            }
        }

        Ok(items)
    }

    /// Validate every resource.
    ///
    /// Problems are collected under `policy`. Cancellation, nested failures
    /// other than requirement failures and I/O errors abort the walk.
    pub fn validate(&self, policy: ReportPolicy) -> Result<()> {
        let ctx = ValidationContext::new(policy);

        let items = self.scan()?;
        debug!(
            "validating {} resources under {} with {} workers",
            items.len(),
            self.root.display(),
            self.workers
        );

        let visited = items
            .iter()
            .map(|item| item.relative.as_str())
            .collect::<HashSet<_>>();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| CodeValidationError::Internal(format!("resource pool: {}", e)))?;

        pool.install(|| {
            items.par_iter().try_for_each(|item| {
                self.validate_resource(item, &ctx)?;
                self.hooks.report_progress()
            })
        })?;

        for (path, value) in self.resources.files() {
            if visited.contains(path.as_str()) {
                continue;
            }

            match ResourceSeal::from_value(value) {
                Ok(seal) if seal.optional() => {}
                Ok(_) => {
                    ctx.report(ValidationStatus::BadResource, ResourceProblemKind::Missing, path)?;
                }
                Err(_) => {
                    ctx.report(
                        ValidationStatus::BadDictionaryFormat,
                        ResourceProblemKind::InvalidSeal,
                        path,
                    )?;
                }
            }
        }

        ctx.into_result()
    }

    fn validate_resource(&self, item: &WalkItem, ctx: &ValidationContext) -> Result<()> {
        let path = &item.relative;
        let full = self.root.join(path);
        let version = self.resources.version();

        if self.checks_sideband() && has_sideband_data(&full) {
            ctx.report(
                ValidationStatus::InvalidAssociatedFileData,
                ResourceProblemKind::Sideband,
                path,
            )?;
        }

        let seal = match self.resources.seal(path) {
            Some(Ok(seal)) => seal,
            Some(Err(e)) => {
                debug!("{}: {}", path, e);
                return ctx.report(
                    ValidationStatus::BadDictionaryFormat,
                    ResourceProblemKind::InvalidSeal,
                    path,
                );
            }
            None => return self.validate_unsealed(item, ctx),
        };

        match &seal {
            ResourceSeal::Nested { requirement, .. } => {
                if item.is_symlink {
                    return ctx.report(
                        ValidationStatus::BadResource,
                        ResourceProblemKind::Altered,
                        path,
                    );
                }

                self.validate_nested(&full, path, requirement, ctx)
            }
            ResourceSeal::Symlink { target, .. } => {
                if !item.is_symlink {
                    return ctx.report(
                        ValidationStatus::BadResource,
                        ResourceProblemKind::Altered,
                        path,
                    );
                }

                self.validate_symlink(&full, path, target, ctx)
            }
            ResourceSeal::File { .. } if seal.digest(self.canonical).is_some() => {
                // Opening a FIFO or device node may block indefinitely.
                if !item.is_file {
                    return ctx.report(
                        ValidationStatus::BadResource,
                        ResourceProblemKind::Altered,
                        path,
                    );
                }

                let mut fh = match std::fs::File::open(&full) {
                    Ok(fh) => fh,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return if seal.optional() {
                            Ok(())
                        } else {
                            ctx.report(
                                ValidationStatus::BadResource,
                                ResourceProblemKind::Missing,
                                path,
                            )
                        };
                    }
                    Err(e) => return Err(e.into()),
                };

                let mut digester = MultiDigester::new(self.digest_types.iter().copied())?;
                digester.update_from_reader(&mut fh)?;

                let good = digester
                    .finish()
                    .iter()
                    .all(|(digest_type, digest)| match seal.digest(*digest_type) {
                        Some(expected) => expected == digest.as_slice(),
                        None => true,
                    });

                if good {
                    Ok(())
                } else if version == 2 && self.legacy_exempt(path, false) {
                    Ok(())
                } else {
                    ctx.report(
                        ValidationStatus::BadResource,
                        ResourceProblemKind::Altered,
                        path,
                    )
                }
            }
            ResourceSeal::File { .. } => ctx.report(
                ValidationStatus::BadResource,
                ResourceProblemKind::Altered,
                path,
            ),
        }
    }

    /// Whether resource forks and other sideband data count as problems.
    fn checks_sideband(&self) -> bool {
        self.resources.version() > 1
            && self
                .flags
                .strict_and(ValidationFlags::RESTRICT_SIDEBAND_DATA)
    }

    fn validate_unsealed(&self, item: &WalkItem, ctx: &ValidationContext) -> Result<()> {
        let version = self.resources.version();

        // Version 1 envelopes do not seal symlinks.
        if version == 1 && item.is_symlink {
            return Ok(());
        }

        if version == 2 && self.legacy_exempt(&item.relative, true) {
            return Ok(());
        }

        ctx.report(
            ValidationStatus::BadResource,
            ResourceProblemKind::Added,
            &item.relative,
        )
    }

    fn legacy_exempt(&self, path: &str, is_addition: bool) -> bool {
        is_legacy_exempt(
            path,
            is_addition,
            self.target.as_ref(),
            self.legacy_rules.as_ref(),
        )
    }

    fn validate_symlink(
        &self,
        full: &Path,
        path: &str,
        sealed: &str,
        ctx: &ValidationContext,
    ) -> Result<()> {
        let target = std::fs::read_link(full)?;

        if target.to_string_lossy() != sealed {
            return ctx.report(
                ValidationStatus::BadResource,
                ResourceProblemKind::Altered,
                path,
            );
        }

        if !self.flags.strict_and(ValidationFlags::RESTRICT_SYMLINKS) {
            return Ok(());
        }

        if self.symlink_destination_allowed(full, &target) {
            return Ok(());
        }

        if self.tolerates(ValidationStatus::InvalidSymlink) {
            warn!("{}: tolerating symlink to {}", path, target.display());
            Ok(())
        } else {
            ctx.report(
                ValidationStatus::InvalidSymlink,
                ResourceProblemKind::Altered,
                path,
            )
        }
    }

    fn symlink_destination_allowed(&self, full: &Path, target: &Path) -> bool {
        let resolved = match std::fs::canonicalize(full) {
            Ok(resolved) => resolved,
            Err(_) => return false,
        };

        if target.is_absolute() {
            let resolved = resolved.to_string_lossy();

            return ALLOWED_SYMLINK_DESTINATIONS
                .iter()
                .any(|prefix| resolved.len() > prefix.len() && resolved.starts_with(prefix));
        }

        for scope in std::iter::once(&self.scope).chain(self.outer_scopes.iter()) {
            if let Some(included) = scope.includes(&resolved) {
                return included;
            }
        }

        false
    }

    fn validate_nested(
        &self,
        full: &Path,
        path: &str,
        requirement: &str,
        ctx: &ValidationContext,
    ) -> Result<()> {
        let requirement = self.hooks.compile_requirement(requirement).map_err(|e| {
            CodeValidationError::detailed(
                ValidationStatus::ResourcesInvalid,
                format!("{}: bad nested requirement: {}", path, e),
            )
        })?;

        let mut flags = self.flags;
        if !flags.contains(ValidationFlags::CHECK_NESTED_CODE) {
            flags |= ValidationFlags::BASIC_VALIDATE_ONLY | ValidationFlags::QUICK_CHECK;
        }
        flags.remove(ValidationFlags::RESTRICT_TO_APP_LIKE);

        let mut scopes = vec![self.scope.clone()];
        scopes.extend(self.outer_scopes.iter().cloned());

        let is_framework = path.len() > ".framework".len() && path.ends_with(".framework");

        let res = self
            .hooks
            .validate_nested(full, requirement.clone(), flags, &scopes)
            .and_then(|_| {
                if is_framework && flags.contains(ValidationFlags::STRICT_VALIDATE) {
                    self.validate_other_versions(full, requirement, flags, &scopes)
                        .map_err(|e| {
                            CodeValidationError::detailed(
                                ValidationStatus::BadFrameworkVersion,
                                e.to_string(),
                            )
                        })
                } else {
                    Ok(())
                }
            });

        match res {
            Ok(()) => Ok(()),
            Err(e) if e.status() == ValidationStatus::ReqFailed => ctx.report(
                ValidationStatus::BadNestedCode,
                ResourceProblemKind::Altered,
                path,
            ),
            Err(e) => Err(e.with_nested_path(full)),
        }
    }

    /// Validate every `Versions/*` directory of a framework except the
    /// current one.
    fn validate_other_versions(
        &self,
        framework: &Path,
        requirement: Arc<dyn Requirement>,
        flags: ValidationFlags,
        scopes: &[ResourceScope],
    ) -> Result<()> {
        let versions = framework.join("Versions");

        let entries = match std::fs::read_dir(&versions) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };

        // Failing to resolve the current version only costs performance.
        let current = std::fs::canonicalize(versions.join("Current")).ok();

        let mut paths = vec![];
        for entry in entries {
            let entry = entry?;

            if entry.file_name() == "Current" || !entry.file_type()?.is_dir() {
                continue;
            }

            let real = std::fs::canonicalize(entry.path())?;
            if current.as_ref() == Some(&real) {
                continue;
            }

            paths.push(real);
        }
        paths.sort();

        for path in paths {
            debug!("validating other framework version {}", path.display());
            self.hooks
                .validate_nested(&path, requirement.clone(), flags, scopes)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::requirement::ClauseRequirement,
        plist::{Dictionary, Value},
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    /// Nested code named `bad*` fails its requirement, `broken*` fails hard.
    #[derive(Default)]
    struct Hooks {
        nested: Mutex<Vec<PathBuf>>,
        progress: AtomicUsize,
        cancel_after: Option<usize>,
    }

    impl WalkHooks for Hooks {
        fn compile_requirement(&self, text: &str) -> Result<Arc<dyn Requirement>> {
            if text == "invalid" {
                Err(ValidationStatus::ReqInvalid.into())
            } else {
                Ok(Arc::new(ClauseRequirement::default()))
            }
        }

        fn validate_nested(
            &self,
            path: &Path,
            _: Arc<dyn Requirement>,
            flags: ValidationFlags,
            scopes: &[ResourceScope],
        ) -> Result<()> {
            assert!(!scopes.is_empty());
            assert!(flags.contains(ValidationFlags::QUICK_CHECK));
            self.nested.lock().unwrap().push(path.to_path_buf());

            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if name.starts_with("bad") {
                Err(ValidationStatus::ReqFailed.into())
            } else if name.starts_with("broken") {
                Err(ValidationStatus::SignatureFailed.into())
            } else {
                Ok(())
            }
        }

        fn report_progress(&self) -> Result<()> {
            let count = self.progress.fetch_add(1, Ordering::SeqCst) + 1;

            match self.cancel_after {
                Some(limit) if count >= limit => Err(ValidationStatus::Cancelled.into()),
                _ => Ok(()),
            }
        }
    }

    fn digest_entry(data: &[u8]) -> Value {
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

    fn rule(weight: f64, key: &str) -> Value {
        let mut dict = Dictionary::new();
        dict.insert(key.into(), Value::Boolean(true));
        dict.insert("weight".into(), Value::Real(weight));
        Value::Dictionary(dict)
    }

    fn v2_resources(files: Vec<(&str, Value)>) -> SealedResources {
        let mut rules = Dictionary::new();
        rules.insert("^.*".into(), Value::Boolean(true));
        rules.insert("^(Frameworks|PlugIns)/".into(), rule(10.0, "nested"));
        rules.insert("^(.*/)?\\.DS_Store$".into(), rule(2000.0, "omit"));

        let mut dict = Dictionary::new();
        dict.insert(
            "files2".into(),
            Value::Dictionary(files.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
        );
        dict.insert("rules2".into(), Value::Dictionary(rules));
        dict.insert("files".into(), Value::Dictionary(Dictionary::new()));
        dict.insert("rules".into(), Value::Dictionary(Dictionary::new()));

        SealedResources::from_dictionary(dict).unwrap()
    }

    fn walker<'a>(
        root: &Path,
        resources: &'a SealedResources,
        flags: ValidationFlags,
        hooks: &'a Hooks,
    ) -> ResourceWalker<'a> {
        ResourceWalker::new(
            root,
            resources,
            &["^_CodeSignature$".to_string()],
            vec![DigestType::Sha1, DigestType::Sha256],
            DigestType::Sha256,
            flags,
            hooks,
        )
        .unwrap()
    }

    #[test]
    fn added_missing_altered_collected_together() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = td.path();
        std::fs::write(root.join("a.txt"), b"changed")?;
        std::fs::write(root.join("b.txt"), b"new")?;
        std::fs::write(root.join("keep.txt"), b"keep")?;
        std::fs::write(root.join(".DS_Store"), b"junk")?;
        std::fs::create_dir(root.join("_CodeSignature"))?;
        std::fs::write(root.join("_CodeSignature").join("CodeResources"), b"x")?;

        let resources = v2_resources(vec![
            ("a.txt", digest_entry(b"original")),
            ("gone.txt", digest_entry(b"gone")),
            ("keep.txt", digest_entry(b"keep")),
        ]);

        let hooks = Hooks::default();
        let err = walker(root, &resources, ValidationFlags::empty(), &hooks)
            .validate(ReportPolicy::Collect)
            .unwrap_err();

        assert_eq!(err.status(), ValidationStatus::BadResource);
        let problems = err.resource_problems().unwrap();
        assert_eq!(problems.paths_of(ResourceProblemKind::Added), vec!["b.txt"]);
        assert_eq!(problems.paths_of(ResourceProblemKind::Missing), vec!["gone.txt"]);
        assert_eq!(problems.paths_of(ResourceProblemKind::Altered), vec!["a.txt"]);
        assert_eq!(problems.problems.len(), 3);
        assert_eq!(hooks.progress.load(Ordering::SeqCst), 3);

        Ok(())
    }

    #[test]
    fn throwing_policy_stops_at_first() -> Result<()> {
        let td = tempfile::tempdir()?;
        std::fs::write(td.path().join("b.txt"), b"new")?;

        let resources = v2_resources(vec![]);
        let hooks = Hooks::default();

        let err = walker(td.path(), &resources, ValidationFlags::SINGLE_THREADED, &hooks)
            .validate(ReportPolicy::Throw)
            .unwrap_err();
        assert!(matches!(err, CodeValidationError::Resource { ref path, .. } if path == "b.txt"));

        Ok(())
    }

    #[test]
    fn optional_resources_may_be_missing() -> Result<()> {
        let td = tempfile::tempdir()?;

        let mut optional = Dictionary::new();
        optional.insert(
            "hash2".into(),
            Value::Data(DigestType::Sha256.digest_data(b"x").unwrap()),
        );
        optional.insert("optional".into(), Value::Boolean(true));

        let resources = v2_resources(vec![("maybe.txt", Value::Dictionary(optional))]);
        let hooks = Hooks::default();

        walker(td.path(), &resources, ValidationFlags::empty(), &hooks)
            .validate(ReportPolicy::Collect)?;

        Ok(())
    }

    #[test]
    fn concurrent_report_is_order_independent() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut files = vec![];
        let mut corrupt = vec![];

        for i in 0..100 {
            let name = format!("file{:03}.dat", i);
            let content = format!("content {}", i);

            if i % 20 == 7 {
                std::fs::write(td.path().join(&name), b"tampered")?;
                corrupt.push(name.clone());
            } else {
                std::fs::write(td.path().join(&name), &content)?;
            }

            files.push((name, digest_entry(content.as_bytes())));
        }

        let resources = v2_resources(
            files
                .iter()
                .map(|(name, value)| (name.as_str(), value.clone()))
                .collect(),
        );

        for _ in 0..3 {
            let hooks = Hooks::default();
            let err = walker(td.path(), &resources, ValidationFlags::empty(), &hooks)
                .workers(3)
                .validate(ReportPolicy::Collect)
                .unwrap_err();

            let problems = err.resource_problems().unwrap();
            assert_eq!(problems.paths_of(ResourceProblemKind::Altered), corrupt);
            assert_eq!(problems.problems.len(), 5);
            assert_eq!(hooks.progress.load(Ordering::SeqCst), 100);
        }

        Ok(())
    }

    #[test]
    fn cancellation_aborts_walk() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut files = vec![];
        for i in 0..10 {
            let name = format!("f{}", i);
            std::fs::write(td.path().join(&name), b"x")?;
            files.push((name, digest_entry(b"x")));
        }

        let resources = v2_resources(
            files
                .iter()
                .map(|(name, value)| (name.as_str(), value.clone()))
                .collect(),
        );

        let hooks = Hooks {
            cancel_after: Some(2),
            ..Default::default()
        };

        let err = walker(td.path(), &resources, ValidationFlags::SINGLE_THREADED, &hooks)
            .validate(ReportPolicy::Collect)
            .unwrap_err();
        assert_eq!(err.status(), ValidationStatus::Cancelled);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlinks() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = td.path();
        std::fs::write(root.join("real.txt"), b"data")?;
        std::os::unix::fs::symlink("real.txt", root.join("good"))?;
        std::os::unix::fs::symlink("real.txt", root.join("retargeted"))?;
        std::os::unix::fs::symlink("/etc/hostname", root.join("outside"))?;
        std::os::unix::fs::symlink("real.txt", root.join("was-file"))?;

        let link = |target: &str| {
            let mut dict = Dictionary::new();
            dict.insert("symlink".into(), Value::String(target.into()));
            Value::Dictionary(dict)
        };

        let resources = v2_resources(vec![
            ("real.txt", digest_entry(b"data")),
            ("good", link("real.txt")),
            ("retargeted", link("other.txt")),
            ("outside", link("/etc/hostname")),
            ("was-file", digest_entry(b"data")),
        ]);

        let hooks = Hooks::default();
        let err = walker(root, &resources, ValidationFlags::empty(), &hooks)
            .validate(ReportPolicy::Collect)
            .unwrap_err();
        let problems = err.resource_problems().unwrap();
        assert_eq!(
            problems.paths_of(ResourceProblemKind::Altered),
            vec!["retargeted", "was-file"]
        );

        let flags = ValidationFlags::STRICT_VALIDATE | ValidationFlags::RESTRICT_SYMLINKS;
        let err = walker(root, &resources, flags, &hooks)
            .validate(ReportPolicy::Collect)
            .unwrap_err();
        let problems = err.resource_problems().unwrap();
        assert!(problems.problems.contains(&ResourceProblem {
            kind: ResourceProblemKind::Altered,
            status: ValidationStatus::InvalidSymlink,
            path: "outside".into(),
        }));
        assert!(!problems
            .problems
            .iter()
            .any(|p| p.path == "good"));

        let mut tolerated = BTreeSet::new();
        tolerated.insert(ValidationStatus::InvalidSymlink);
        let err = walker(root, &resources, flags, &hooks)
            .tolerated(tolerated)
            .validate(ReportPolicy::Collect)
            .unwrap_err();
        assert!(!err
            .resource_problems()
            .unwrap()
            .problems
            .iter()
            .any(|p| p.path == "outside"));

        Ok(())
    }

    #[test]
    fn nested_code() -> Result<()> {
        let td = tempfile::tempdir()?;
        let frameworks = td.path().join("Frameworks");
        for name in ["good.framework", "bad.framework", "Headers"] {
            std::fs::create_dir_all(frameworks.join(name).join("inner"))?;
            std::fs::write(frameworks.join(name).join("inner").join("x"), b"x")?;
        }

        let nested = |requirement: &str| {
            let mut dict = Dictionary::new();
            dict.insert("requirement".into(), Value::String(requirement.into()));
            Value::Dictionary(dict)
        };

        let resources = v2_resources(vec![
            ("Frameworks/good.framework", nested("always")),
            ("Frameworks/bad.framework", nested("always")),
            ("Frameworks/Headers/inner/x", digest_entry(b"x")),
        ]);

        let hooks = Hooks::default();
        let err = walker(td.path(), &resources, ValidationFlags::empty(), &hooks)
            .validate(ReportPolicy::Collect)
            .unwrap_err();

        assert_eq!(err.status(), ValidationStatus::BadNestedCode);
        assert_eq!(
            err.resource_problems()
                .unwrap()
                .paths_of(ResourceProblemKind::Altered),
            vec!["Frameworks/bad.framework"]
        );
        assert_eq!(hooks.nested.lock().unwrap().len(), 2);

        std::fs::create_dir_all(frameworks.join("broken.framework"))?;
        let resources = v2_resources(vec![("Frameworks/broken.framework", nested("always"))]);
        let err = walker(&frameworks.join(".."), &resources, ValidationFlags::empty(), &hooks)
            .validate(ReportPolicy::Collect)
            .unwrap_err();
        assert_eq!(err.status(), ValidationStatus::SignatureFailed);
        assert!(matches!(err, CodeValidationError::Nested { .. }));

        let resources = v2_resources(vec![("Frameworks/broken.framework", nested("invalid"))]);
        let err = walker(&frameworks.join(".."), &resources, ValidationFlags::empty(), &hooks)
            .validate(ReportPolicy::Collect)
            .unwrap_err();
        assert_eq!(err.status(), ValidationStatus::ResourcesInvalid);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn special_files_are_never_opened() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = td.path();

        for name in ["data.bin", "pipe"] {
            let status = std::process::Command::new("mkfifo")
                .arg(root.join(name))
                .status()?;
            assert!(status.success());
        }

        let resources = v2_resources(vec![("data.bin", digest_entry(b"data"))]);

        let hooks = Hooks::default();
        let err = walker(root, &resources, ValidationFlags::empty(), &hooks)
            .validate(ReportPolicy::Collect)
            .unwrap_err();

        let problems = err.resource_problems().unwrap();
        assert_eq!(problems.paths_of(ResourceProblemKind::Altered), vec!["data.bin"]);
        assert_eq!(problems.paths_of(ResourceProblemKind::Added), vec!["pipe"]);
        assert_eq!(problems.problems.len(), 2);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn strict_checks_other_framework_versions() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = std::fs::canonicalize(td.path())?;
        let framework = root.join("Frameworks").join("Kit.framework");
        let versions = framework.join("Versions");
        for version in ["A", "bad"] {
            std::fs::create_dir_all(versions.join(version))?;
            std::fs::write(versions.join(version).join("Kit"), b"kit")?;
        }
        std::os::unix::fs::symlink("A", versions.join("Current"))?;

        let mut seal = Dictionary::new();
        seal.insert("requirement".into(), Value::String("always".into()));
        let resources = v2_resources(vec![("Frameworks/Kit.framework", Value::Dictionary(seal))]);

        // Without strict validation only the framework itself is visited.
        let hooks = Hooks::default();
        walker(&root, &resources, ValidationFlags::empty(), &hooks)
            .validate(ReportPolicy::Collect)?;
        assert_eq!(hooks.nested.lock().unwrap().clone(), vec![framework.clone()]);

        let hooks = Hooks::default();
        let err = walker(&root, &resources, ValidationFlags::STRICT_VALIDATE, &hooks)
            .validate(ReportPolicy::Collect)
            .unwrap_err();

        assert_eq!(err.status(), ValidationStatus::BadFrameworkVersion);
        assert!(matches!(err, CodeValidationError::Nested { ref path, .. } if path == &framework));

        let visited = hooks.nested.lock().unwrap().clone();
        assert_eq!(
            visited,
            vec![framework.clone(), std::fs::canonicalize(versions.join("bad"))?]
        );

        std::fs::rename(versions.join("bad"), versions.join("B"))?;
        let hooks = Hooks::default();
        walker(&root, &resources, ValidationFlags::STRICT_VALIDATE, &hooks)
            .validate(ReportPolicy::Collect)?;
        let visited = hooks.nested.lock().unwrap().clone();
        assert_eq!(visited.len(), 2);
        assert!(!visited
            .iter()
            .any(|path| path.ends_with("A") || path.ends_with("Current")));

        Ok(())
    }

    #[test]
    fn sideband_checks_need_strict_restriction_and_v2_seals() -> Result<()> {
        let td = tempfile::tempdir()?;
        std::fs::write(td.path().join("a.txt"), b"a")?;
        let hooks = Hooks::default();

        let v2 = v2_resources(vec![("a.txt", digest_entry(b"a"))]);

        let mut rules = Dictionary::new();
        rules.insert("^.*".into(), Value::Boolean(true));
        let mut files = Dictionary::new();
        files.insert("a.txt".into(), Value::Data(DigestType::Sha1.digest_data(b"a")?));
        let mut dict = Dictionary::new();
        dict.insert("files".into(), Value::Dictionary(files));
        dict.insert("rules".into(), Value::Dictionary(rules));
        let v1 = SealedResources::from_dictionary(dict)?;

        let restricted = ValidationFlags::STRICT_VALIDATE | ValidationFlags::RESTRICT_SIDEBAND_DATA;

        assert!(walker(td.path(), &v2, restricted, &hooks).checks_sideband());
        assert!(!walker(td.path(), &v1, restricted, &hooks).checks_sideband());
        assert!(!walker(
            td.path(),
            &v2,
            ValidationFlags::RESTRICT_SIDEBAND_DATA,
            &hooks
        )
        .checks_sideband());
        assert!(!walker(td.path(), &v2, ValidationFlags::STRICT_VALIDATE, &hooks).checks_sideband());

        // Files without a resource fork raise nothing.
        walker(td.path(), &v2, restricted, &hooks).validate(ReportPolicy::Collect)?;
        assert!(!has_sideband_data(&td.path().join("a.txt")));

        Ok(())
    }

    #[test]
    fn strict_rule_checks() -> Result<()> {
        let td = tempfile::tempdir()?;
        let hooks = Hooks::default();

        let resources = v2_resources(vec![]);
        let allowed = vec!["^(.*/)?\\.DS_Store$".to_string()];
        walker(td.path(), &resources, ValidationFlags::STRICT_VALIDATE, &hooks)
            .check_rules(&allowed)?;

        let err = walker(td.path(), &resources, ValidationFlags::STRICT_VALIDATE, &hooks)
            .check_rules(&[])
            .unwrap_err();
        assert_eq!(err.status(), ValidationStatus::WeakResourceRules);

        // Non-strict never checks.
        walker(td.path(), &resources, ValidationFlags::empty(), &hooks).check_rules(&[])?;

        let mut rules = Dictionary::new();
        rules.insert("^Resources/".into(), Value::Boolean(true));
        let mut dict = Dictionary::new();
        dict.insert("files".into(), Value::Dictionary(Dictionary::new()));
        dict.insert("rules".into(), Value::Dictionary(rules));
        let v1 = SealedResources::from_dictionary(dict)?;

        let err = walker(td.path(), &v1, ValidationFlags::STRICT_VALIDATE, &hooks)
            .check_rules(&[])
            .unwrap_err();
        assert_eq!(err.status(), ValidationStatus::WeakResourceEnvelope);

        let mut tolerated = BTreeSet::new();
        tolerated.insert(ValidationStatus::WeakResourceEnvelope);
        walker(td.path(), &v1, ValidationFlags::STRICT_VALIDATE, &hooks)
            .tolerated(tolerated)
            .check_rules(&[])?;

        Ok(())
    }

    #[test]
    fn worker_sizing() {
        let dir = Path::new(".");

        assert_eq!(
            worker_count(dir, StorageMedium::SolidState, Some(8), ValidationFlags::SINGLE_THREADED),
            1
        );
        assert_eq!(
            worker_count(dir, StorageMedium::Auto, Some(3), ValidationFlags::empty()),
            3
        );
        assert_eq!(
            worker_count(dir, StorageMedium::Rotational, None, ValidationFlags::empty()),
            2
        );
        assert!(worker_count(dir, StorageMedium::SolidState, None, ValidationFlags::empty()) >= 2);
    }

    #[test]
    fn context_first_status_wins() {
        let ctx = ValidationContext::new(ReportPolicy::Collect);
        ctx.report(
            ValidationStatus::InvalidAssociatedFileData,
            ResourceProblemKind::Sideband,
            "a",
        )
        .unwrap();
        ctx.report(ValidationStatus::BadResource, ResourceProblemKind::Added, "b")
            .unwrap();
        assert_eq!(ctx.status(), Some(ValidationStatus::InvalidAssociatedFileData));

        let err = ctx.into_result().unwrap_err();
        assert_eq!(err.resource_problems().unwrap().problems.len(), 2);

        ValidationContext::new(ReportPolicy::Collect)
            .into_result()
            .unwrap();
    }
}
