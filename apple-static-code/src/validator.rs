// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Full static validation of code.

use {
    crate::{
        disk_rep::Architecture,
        error::{CodeValidationError, Result, ValidationStatus},
        flags::ValidationFlags,
        progress::{check_veto, MonitorEvent, Veto},
        requirement::Requirement,
        resource_walker::{ResourceScope, WalkHooks},
        static_code::{StaticCode, ValidationEnvironment},
    },
    log::{debug, info, warn},
    std::{
        path::{Path, PathBuf},
        sync::Arc,
    },
};

impl StaticCode {
    fn notify(&self, event: MonitorEvent) -> Option<Veto> {
        self.env
            .monitor
            .as_ref()
            .and_then(|monitor| monitor.notify(self.path(), &event))
    }

    fn report_progress(&self) -> Result<()> {
        self.progress
            .report(self.path(), self.env.monitor.as_deref())
    }

    /// Statically validate the code.
    ///
    /// Runs every phase `flags` asks for and optionally evaluates
    /// `requirement`, failing with [ValidationStatus::ReqFailed] if it is
    /// not satisfied. Phase outcomes are cached, so validating again with
    /// the same flags only repeats what cannot be replayed.
    pub fn static_validate(
        &mut self,
        flags: ValidationFlags,
        requirement: Option<&dyn Requirement>,
    ) -> Result<()> {
        if self.depth > self.env.config.max_nesting_depth {
            return Err(CodeValidationError::detailed(
                ValidationStatus::BadNestedCode,
                format!(
                    "{} is nested more than {} levels deep",
                    self.path().display(),
                    self.env.config.max_nesting_depth
                ),
            ));
        }

        info!("validating {} with {:?}", self.path().display(), flags);

        self.flags = flags;

        let reporting = flags.contains(ValidationFlags::REPORT_PROGRESS);
        let workload = if reporting {
            self.resource_dictionary()
                .ok()
                .flatten()
                .map(|resources| resources.workload())
                .unwrap_or(0)
        } else {
            0
        };
        self.progress.prepare(reporting, workload + 2);

        let result = self.run_phases(flags, requirement, workload + 2);

        let veto = self.notify(MonitorEvent::Validated {
            status: result.as_ref().err().map(|e| e.status()),
        });

        match result {
            Ok(()) => check_veto(veto),
            Err(e) => {
                debug!("{} failed validation: {}", self.path().display(), e);
                Err(e)
            }
        }
    }

    fn run_phases(
        &mut self,
        flags: ValidationFlags,
        requirement: Option<&dyn Requirement>,
        total: usize,
    ) -> Result<()> {
        self.validate_core(flags, requirement)?;

        if flags.contains(ValidationFlags::CHECK_ALL_ARCHITECTURES) {
            self.validate_other_architectures(flags, requirement)?;
        }

        self.report_progress()?;
        check_veto(self.notify(MonitorEvent::Prepared { total }))?;

        if !flags.contains(ValidationFlags::DO_NOT_VALIDATE_RESOURCES) {
            self.validate_resources(flags)?;
        }

        if flags.contains(ValidationFlags::STRICT_VALIDATE) {
            let cd = self.code_directory()?.clone();
            let tolerated = self.tolerated();

            self.disk_rep().strict_validate(Some(&cd), &tolerated, flags)?;
        }

        self.report_progress()
    }

    /// Validation of everything but resources, for the active architecture.
    fn validate_core(
        &mut self,
        flags: ValidationFlags,
        requirement: Option<&dyn Requirement>,
    ) -> Result<()> {
        let result = (|| -> Result<()> {
            self.validate_non_resource_components()?;
            self.validate_top_directory()?;

            if !flags.contains(ValidationFlags::DO_NOT_VALIDATE_EXECUTABLE) {
                self.validate_executable()?;
            }

            if let Some(requirement) = requirement {
                self.validate_requirement(requirement, ValidationStatus::ReqFailed)?;
            }

            Ok(())
        })();

        match self.disk_rep().architecture() {
            Some(arch) => result.map_err(|e| e.with_architecture(arch)),
            None => result,
        }
    }

    fn validate_architecture(
        &self,
        arch: Architecture,
        team: &Option<String>,
        flags: ValidationFlags,
        requirement: Option<&dyn Requirement>,
    ) -> Result<()> {
        let mut code = self.for_architecture(arch)?;
        code.flags = flags;

        if &code.team_identifier()? != team {
            return Err(CodeValidationError::detailed(
                ValidationStatus::SignatureInvalid,
                "architectures are signed by different teams",
            ));
        }

        code.validate_core(flags, requirement)
    }

    fn validate_other_architectures(
        &mut self,
        flags: ValidationFlags,
        requirement: Option<&dyn Requirement>,
    ) -> Result<()> {
        let active = self.disk_rep().architecture();
        let architectures = self.disk_rep().architectures();

        if architectures.len() < 2 {
            return Ok(());
        }

        let team = self.team_identifier()?;

        for arch in architectures {
            if Some(arch) == active {
                continue;
            }

            if flags.contains(ValidationFlags::CHECK_GATEKEEPER_ARCHITECTURES) && arch.is_powerpc()
            {
                warn!("{}: skipping {}", self.path().display(), arch);
                continue;
            }

            debug!("validating {} slice of {}", arch, self.path().display());

            self.validate_architecture(arch, &team, flags, requirement)
                .map_err(|e| match e {
                    CodeValidationError::Architecture { .. } => e,
                    e => e.with_architecture(arch),
                })?;
        }

        Ok(())
    }
}

/// Connects a resource walk to the code being validated.
pub(crate) struct DriverHooks {
    env: ValidationEnvironment,
    progress: crate::progress::ValidationProgress,
    path: PathBuf,
    depth: usize,
}

impl DriverHooks {
    pub(crate) fn new(code: &StaticCode) -> Self {
        Self {
            env: code.env.clone(),
            progress: code.progress.clone(),
            path: code.path().to_path_buf(),
            depth: code.depth,
        }
    }
}

impl WalkHooks for DriverHooks {
    fn compile_requirement(&self, text: &str) -> Result<Arc<dyn Requirement>> {
        self.env.requirements.compile(text)
    }

    fn validate_nested(
        &self,
        path: &Path,
        requirement: Arc<dyn Requirement>,
        flags: ValidationFlags,
        scopes: &[ResourceScope],
    ) -> Result<()> {
        debug!("validating nested code {}", path.display());

        let mut code = StaticCode::open(path, self.env.clone())?;
        code.outer_scopes = scopes.to_vec();
        code.depth = self.depth + 1;

        code.static_validate(flags, Some(requirement.as_ref()))
    }

    fn report_progress(&self) -> Result<()> {
        self.progress.report(&self.path, self.env.monitor.as_deref())
    }
}
