//! Appliance facade: read, interpret, edit and import an OVF package.
//!
//! ```text
//! Empty ──read()──▶ Reading ──▶ Read ──interpret()──▶ Interpreted
//!   ▲                  │                                  │
//!   └──── failure ─────┘                      import_machines()
//!                                                         ▼
//!                                       Importing ──▶ Imported
//! ```
//!
//! `close()` moves any settled phase to `Closed`, after which only the import
//! results remain readable.
//!
//! `read` and `import_machines` return a [`Progress`] immediately and run on a
//! background tokio task; they must be called inside a tokio runtime. Calls
//! made in the wrong phase fail with `InvalidState`.

pub mod description;
pub mod interpret;
pub mod session;

pub use description::{
    ApplianceDescriptor, DescriptionType, DescriptorItem, ImportOverrides,
    VirtualSystemDescription,
};
pub use interpret::Interpretation;
pub use session::ImportSession;

use crate::import::{CreatedArtifact, ImportOrchestrator, SharedReporter};
use crate::options::ImportOptions;
use crate::ovf::{self, OvfEnvelope};
use crate::progress::Progress;
use crate::registry::{FileMediumStore, LocalRegistry, MachineId, MachineRegistry, MediumStore};
use ovfimport_shared::errors::{ImportError, ImportResult};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lifecycle phase of an [`Appliance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliancePhase {
    Empty,
    Reading,
    Read,
    Interpreted,
    Importing,
    Imported,
    Closed,
}

impl fmt::Display for AppliancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::Reading => "reading",
            Self::Read => "read",
            Self::Interpreted => "interpreted",
            Self::Importing => "importing",
            Self::Imported => "imported",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct ApplianceState {
    phase: AppliancePhase,
    package: Option<PathBuf>,
    envelope: Option<OvfEnvelope>,
    descriptor: Option<ApplianceDescriptor>,
    warnings: Vec<ImportError>,
    artifacts: Vec<CreatedArtifact>,
    import_error: Option<ImportError>,
    /// An import ran to the end, successfully or not.
    imported: bool,
    session: ImportSession,
}

impl ApplianceState {
    fn expect_phase(&self, allowed: &[AppliancePhase], operation: &str) -> ImportResult<()> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        Err(ImportError::InvalidState(format!(
            "cannot {} while the appliance is {}",
            operation, self.phase
        )))
    }
}

/// One OVF/OVA package on its way into the machine registry.
pub struct Appliance {
    options: ImportOptions,
    registry: Arc<dyn MachineRegistry>,
    store: Arc<dyn MediumStore>,
    state: Arc<Mutex<ApplianceState>>,
}

impl fmt::Debug for Appliance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Appliance")
            .field("phase", &state.phase)
            .field("package", &state.package)
            .finish()
    }
}

impl Appliance {
    pub fn new(
        options: ImportOptions,
        registry: Arc<dyn MachineRegistry>,
        store: Arc<dyn MediumStore>,
    ) -> Self {
        Self {
            options,
            registry,
            store,
            state: Arc::new(Mutex::new(ApplianceState {
                phase: AppliancePhase::Empty,
                package: None,
                envelope: None,
                descriptor: None,
                warnings: Vec::new(),
                artifacts: Vec::new(),
                import_error: None,
                imported: false,
                session: ImportSession::new(),
            })),
        }
    }

    /// Appliance backed by the SQLite registry under the options' home
    /// directory and the block-copy medium store. Also installs file logging.
    pub fn with_local_backends(options: ImportOptions) -> ImportResult<Self> {
        let options = options.sanitize()?;
        crate::init_logging_for(&options.home_dir)?;
        let registry = LocalRegistry::open(&options.db_path())?;
        Ok(Self::new(
            options,
            Arc::new(registry),
            Arc::new(FileMediumStore::new()),
        ))
    }

    pub fn phase(&self) -> AppliancePhase {
        self.state.lock().phase
    }

    /// Start reading the package at `path` (`.ovf` or `.ova`).
    ///
    /// Parse, reference and manifest errors are reported through the returned
    /// progress; the appliance falls back to `Empty` on failure.
    pub fn read(&self, path: impl AsRef<Path>) -> ImportResult<Progress> {
        let path = path.as_ref().to_path_buf();
        {
            let mut state = self.state.lock();
            state.expect_phase(&[AppliancePhase::Empty], "read a package")?;
            state.phase = AppliancePhase::Reading;
            state.package = Some(path.clone());
        }

        let (progress, mut reporter) = Progress::new(
            format!("Reading appliance {}", path.display()),
            ovf::PARSE_WEIGHT + ovf::MANIFEST_WEIGHT,
        );
        reporter.set_operation_count(2);

        let options = self.options.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let result = ovf::read_package(&path, &options, &mut reporter).await;

            // State first, so a woken waiter sees the new phase.
            let result = {
                let mut state = state.lock();
                match result {
                    Ok(contents) => {
                        if let Some(scratch) = contents.scratch {
                            state.session.adopt_dir(scratch);
                        }
                        state.envelope = Some(contents.envelope);
                        state.phase = AppliancePhase::Read;
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(package = %path.display(), error = %e, "Failed to read appliance");
                        state.phase = AppliancePhase::Empty;
                        state.package = None;
                        Err(e)
                    }
                }
            };
            reporter.complete(result);
        });

        Ok(progress)
    }

    /// Map the read package into virtual system descriptions.
    ///
    /// Unsupported hardware is skipped and reported by [`Appliance::warnings`].
    pub fn interpret(&self) -> ImportResult<Vec<VirtualSystemDescription>> {
        let mut state = self.state.lock();
        state.expect_phase(&[AppliancePhase::Read], "interpret")?;

        let envelope = state
            .envelope
            .take()
            .ok_or_else(|| ImportError::Internal("read appliance has no envelope".into()))?;
        let interpretation = match interpret::interpret(&envelope) {
            Ok(interpretation) => interpretation,
            Err(e) => {
                state.envelope = Some(envelope);
                return Err(e);
            }
        };

        let systems = interpretation.descriptor.systems.clone();
        state.descriptor = Some(interpretation.descriptor);
        state.warnings = interpretation.warnings;
        state.phase = AppliancePhase::Interpreted;
        Ok(systems)
    }

    /// Interpreted descriptions, including edits made with
    /// [`Appliance::set_descriptions`].
    pub fn descriptions(&self) -> ImportResult<Vec<VirtualSystemDescription>> {
        let state = self.state.lock();
        state
            .descriptor
            .as_ref()
            .map(|d| d.systems.clone())
            .ok_or_else(|| ImportError::InvalidState("appliance has not been interpreted".into()))
    }

    /// Replace the descriptions wholesale, keeping one per virtual system.
    pub fn set_descriptions(&self, systems: Vec<VirtualSystemDescription>) -> ImportResult<()> {
        let mut state = self.state.lock();
        state.expect_phase(&[AppliancePhase::Interpreted], "edit descriptions")?;
        let descriptor = state
            .descriptor
            .as_mut()
            .ok_or_else(|| ImportError::Internal("interpreted appliance has no descriptor".into()))?;

        if systems.len() != descriptor.systems.len() {
            return Err(ImportError::InvalidArgument(format!(
                "expected {} virtual system descriptions, got {}",
                descriptor.systems.len(),
                systems.len()
            )));
        }
        if let Some(index) = systems
            .iter()
            .position(|s| s.first(DescriptionType::Name).is_none())
        {
            return Err(ImportError::InvalidArgument(format!(
                "virtual system {} has no name item",
                index
            )));
        }

        descriptor.systems = systems;
        Ok(())
    }

    pub fn warnings(&self) -> Vec<ImportError> {
        self.state.lock().warnings.clone()
    }

    /// Create machines for every virtual system.
    ///
    /// Invalid overrides fail here with `InvalidArgument`, before anything is
    /// created. Import failures are reported through the returned progress.
    pub fn import_machines(&self, overrides: &ImportOverrides) -> ImportResult<Progress> {
        let orchestrator = ImportOrchestrator::new(
            self.registry.clone(),
            self.store.clone(),
            self.options.clone(),
        );

        let (prepared, package) = {
            let mut state = self.state.lock();
            state.expect_phase(&[AppliancePhase::Interpreted], "import machines")?;
            let descriptor = state
                .descriptor
                .as_ref()
                .ok_or_else(|| ImportError::Internal("interpreted appliance has no descriptor".into()))?;

            let applied = overrides.apply(descriptor)?;
            let prepared = orchestrator.prepare(&applied)?;
            state.phase = AppliancePhase::Importing;
            (prepared, state.package.clone().unwrap_or_default())
        };

        let (progress, reporter) = Progress::new(
            format!("Importing appliance {}", package.display()),
            prepared.total_weight(),
        );
        let reporter: SharedReporter = Arc::new(Mutex::new(reporter));

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let report = orchestrator.run(prepared, reporter.clone()).await;
            let result = report.result();
            {
                let mut state = state.lock();
                state.artifacts = report.artifacts;
                state.import_error = report.failure.map(|f| f.error);
                state.imported = true;
                state.phase = AppliancePhase::Imported;
            }
            reporter.lock().complete(result);
        });

        Ok(progress)
    }

    /// Machines created by a finished import. After a failure these are the
    /// machines of the systems that completed before it.
    pub fn machines(&self) -> ImportResult<Vec<MachineId>> {
        let state = self.state.lock();
        if state.phase == AppliancePhase::Closed && !state.imported {
            return Err(ImportError::InvalidState(
                "appliance was closed without importing".into(),
            ));
        }
        state.expect_phase(
            &[AppliancePhase::Imported, AppliancePhase::Closed],
            "list imported machines",
        )?;
        Ok(state.artifacts.iter().map(|a| a.machine_id).collect())
    }

    pub fn created_artifacts(&self) -> Vec<CreatedArtifact> {
        self.state.lock().artifacts.clone()
    }

    /// Error that stopped the last import, if any.
    pub fn import_error(&self) -> Option<ImportError> {
        self.state.lock().import_error.clone()
    }

    /// Remove temporary files (an unpacked OVA) and retire the appliance.
    /// Returns the number of resources that could not be removed.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> ImportResult<usize> {
        let mut state = self.state.lock();
        if matches!(
            state.phase,
            AppliancePhase::Reading | AppliancePhase::Importing
        ) {
            return Err(ImportError::InvalidState(format!(
                "cannot close while the appliance is {}",
                state.phase
            )));
        }
        state.phase = AppliancePhase::Closed;
        state.envelope = None;
        Ok(state.session.close())
    }
}
