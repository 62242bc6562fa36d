/*!
 * Bootstrap
 *
 * Runs the fixed stage sequence: raise the memlock limit, open the object,
 * bind the inner template, load, insert, look up, delete, unload. The first
 * failing stage ends the run and decides the exit status.
 */

use super::limits::{LimitManager, Limits};
use crate::config::Config;
use crate::core::errors::{NestedMapError, Stage};
use crate::core::types::{MapId, NestedResult};
use crate::ebpf::{select_backend, BpfPlatform, BpfSyscalls, ExtensionObject};
use crate::maps::NestedMapProtocol;
use crate::monitoring::{generate_run_id, log_run_outcome, span_stage, LedgerSnapshot};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Timing of one completed stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub duration_us: u64,
}

/// Outcome of a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub object_path: String,
    pub outer_map: String,
    pub backend: BpfPlatform,
    pub inner_map_id: MapId,
    pub value: u32,
    pub stages: Vec<StageRecord>,
    pub handles: LedgerSnapshot,
}

/// First failure of a run, tagged with the stage it stopped in
#[derive(Debug, Error, Diagnostic)]
#[error("{stage} stage failed")]
pub struct RunFailure {
    pub stage: Stage,
    #[source]
    #[diagnostic_source]
    pub source: NestedMapError,
}

impl RunFailure {
    /// Errors owned by one stage keep it; shared errors take the running stage
    pub fn new(running: Stage, source: NestedMapError) -> Self {
        Self {
            stage: source.stage().unwrap_or(running),
            source,
        }
    }

    #[inline]
    pub fn exit_code(&self) -> u8 {
        self.stage.exit_code()
    }
}

/// Runs one configured pass of the nested table protocol
pub struct Bootstrap {
    config: Config,
    kernel: Option<Arc<dyn BpfSyscalls>>,
    limits: LimitManager,
}

/// Runs a single stage inside its span and records its timing
struct StageRunner<'a> {
    run_id: &'a str,
    records: Vec<StageRecord>,
}

impl StageRunner<'_> {
    fn run<T>(&mut self, stage: Stage, f: impl FnOnce() -> NestedResult<T>) -> Result<T, RunFailure> {
        let span = span_stage(stage, self.run_id);
        let _entered = span.enter();

        match f() {
            Ok(value) => {
                span.record_result(true);
                self.records.push(StageRecord {
                    stage,
                    duration_us: span.elapsed().as_micros() as u64,
                });
                Ok(value)
            }
            Err(source) => {
                span.record_error(&source.to_string());
                error!(%stage, error = %source, "stage failed");
                Err(RunFailure::new(stage, source))
            }
        }
    }
}

impl Bootstrap {
    /// Backend is chosen from `config.backend` when the run starts
    pub fn new(config: Config) -> Self {
        Self {
            config,
            kernel: None,
            limits: LimitManager::new(),
        }
    }

    /// Run against an already constructed backend
    pub fn with_kernel(config: Config, kernel: Arc<dyn BpfSyscalls>) -> Self {
        Self {
            config,
            kernel: Some(kernel),
            limits: LimitManager::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn run(&self) -> Result<RunReport, RunFailure> {
        let run_id = generate_run_id();
        let result = self.run_stages(&run_id);
        log_run_outcome(&run_id, result.as_ref().err().map(|f| f.stage));
        result
    }

    fn run_stages(&self, run_id: &str) -> Result<RunReport, RunFailure> {
        let config = &self.config;
        let mut runner = StageRunner {
            run_id,
            records: Vec::new(),
        };

        let kernel = runner.run(Stage::Config, || {
            config.validate()?;
            match &self.kernel {
                Some(kernel) => Ok(Arc::clone(kernel)),
                None => select_backend(config.backend),
            }
        })?;

        runner.run(Stage::Limits, || self.raise_limits(kernel.as_ref()))?;

        let object = runner.run(Stage::Open, || {
            ExtensionObject::open(&config.object_path, Arc::clone(&kernel))
        })?;

        let mut protocol = NestedMapProtocol::new(object, config.outer_map.as_str())
            .with_capacities(config.template_max_entries, config.inner_max_entries);

        runner.run(Stage::Bind, || protocol.bind())?;

        runner.run(Stage::Load, || protocol.load())?;
        info!("Loaded");

        let inner_map_id = runner.run(Stage::Insert, || {
            protocol.insert(config.outer_key, &[(config.inner_key, config.inner_value)])
        })?;
        info!(inner_map_id = %inner_map_id, "Inserted");

        let value = runner.run(Stage::Lookup, || protocol.lookup(config.outer_key, config.inner_key))?;
        info!("Inner value is {value}");
        if value != config.inner_value {
            warn!(expected = config.inner_value, actual = value, "inner value differs from what was inserted");
        }

        runner.run(Stage::Delete, || protocol.delete(config.outer_key))?;
        info!("Deleted");

        runner.run(Stage::Unload, || protocol.unload())?;
        info!("Unloaded");

        let handles = protocol.registry().ledger().snapshot();
        if handles.outstanding() != 0 {
            warn!(outstanding = handles.outstanding(), "map handles still outstanding");
        }

        Ok(RunReport {
            run_id: run_id.to_string(),
            object_path: config.object_path.display().to_string(),
            outer_map: config.outer_map.clone(),
            backend: kernel.platform(),
            inner_map_id,
            value,
            stages: runner.records,
            handles,
        })
    }

    /// Locked memory only matters to a real kernel
    fn raise_limits(&self, kernel: &dyn BpfSyscalls) -> NestedResult<()> {
        if !self.config.raise_memlock {
            debug!("memlock raise disabled");
            return Ok(());
        }
        if kernel.platform() != BpfPlatform::Linux {
            debug!(backend = %kernel.platform(), "memlock raise not needed");
            return Ok(());
        }
        self.limits.apply(&Limits::default())?;
        Ok(())
    }
}

impl std::fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrap")
            .field("config", &self.config)
            .field("kernel", &self.kernel.as_ref().map(|k| k.platform()))
            .finish()
    }
}
