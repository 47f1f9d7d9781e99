use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{Engine, Summary};
use crate::error::Result;
use crate::feed::{self, Row};
use crate::importers::{self, ImportOptions, ImporterInfo, RunContext};
use crate::logging::{self, Verbosity};
use crate::output::{self, Format};
use crate::reactor::TaskReactor;
use crate::remote::http::HttpApi;
use crate::remote::RemoteApi;
use crate::store::cache::EntityCache;
use crate::store::lock::DataDirLock;
use crate::store::mapping::MappingStore;

/// One `import` invocation.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub entity: String,
    pub csv_file: PathBuf,
    pub delete: bool,
    pub verbosity: Verbosity,
    pub options: ImportOptions,
}

/// Counters of a finished run plus how the run ended. The summary is
/// meaningful even when `result` is an error.
#[derive(Debug)]
pub struct Outcome {
    pub summary: Summary,
    pub result: Result<()>,
}

pub fn run(config: &Config, request: &ImportRequest, format: Format) -> Result<()> {
    let info = importers::lookup(&request.entity)?;
    logging::init(&config.logfile(), request.verbosity)?;
    let rows = feed::read(&request.csv_file, info.columns)?;
    let (server, username, password) = config.credentials()?;
    let api: Arc<dyn RemoteApi> = Arc::new(HttpApi::new(server, username, password)?);

    let outcome = execute(config, info, api, &rows, request)?;
    output::print_summary(&outcome.summary, format)?;
    outcome.result
}

/// Run `rows` through `info`'s importer against `api`, holding the data
/// directory lock throughout.
pub fn execute(
    config: &Config,
    info: &ImporterInfo,
    api: Arc<dyn RemoteApi>,
    rows: &[Row],
    request: &ImportRequest,
) -> Result<Outcome> {
    let data_dir = config.data_dir();
    let lock = DataDirLock::acquire(&data_dir)?;
    debug!(lock = %lock.path().display(), "data directory locked");

    let mappings = MappingStore::load(&data_dir, info.mappings)?;
    let mut engine = Engine::new(
        Arc::clone(&api),
        mappings,
        EntityCache::new(),
        config.policy(),
    );
    logging::progress(request.verbosity, "Loading remote entities...");
    let pruned = engine.load_cache()?;
    if pruned > 0 {
        info!("dropped {pruned} mapping entries whose target no longer exists");
    }

    let verb = if request.delete { "Deleting" } else { "Importing" };
    logging::progress(
        request.verbosity,
        &format!("{verb} {} rows of {}", rows.len(), info.name),
    );
    let reactor = TaskReactor::for_api(api, config.backoff());
    let ctx = RunContext::new(engine, reactor, request.options.clone());
    let result = importers::process(info, &ctx, rows, request.delete);
    let summary = ctx.engine().summary().clone();

    if let Err(e) = lock.release() {
        warn!("releasing data directory lock failed: {e}");
    }
    Ok(Outcome { summary, result })
}
