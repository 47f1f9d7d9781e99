//! Per-entity CSV importers and the loop that feeds them.

pub mod host_collection;
pub mod organization;
pub mod repository;
pub mod user;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info};

use crate::engine::Engine;
use crate::error::{ImportError, Result};
use crate::feed::Row;
use crate::model::Verb;
use crate::reactor::TaskReactor;
use crate::store::schema::MappingName;

/// Run-wide switches that only some importers look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Map every source organization onto this existing target organization.
    pub into_org_id: Option<i64>,
    /// Map users onto existing target users with the same login.
    pub merge_users: bool,
    /// Where to write generated passwords of newly created users.
    pub new_passwords: Option<PathBuf>,
    pub synchronize: bool,
    pub wait: bool,
}

/// Everything a row handler may touch. The engine sits behind a mutex so
/// reactor continuations can use it from the worker thread; only one side
/// holds it at a time.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub engine: Arc<Mutex<Engine>>,
    pub reactor: TaskReactor,
    pub options: ImportOptions,
}

impl RunContext {
    pub fn new(engine: Engine, reactor: TaskReactor, options: ImportOptions) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            reactor,
            options,
        }
    }

    pub fn engine(&self) -> MutexGuard<'_, Engine> {
        // A panicking continuation leaves the engine usable; its state is
        // only changed through complete operations.
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub trait Importer: Send {
    fn import_row(&mut self, ctx: &RunContext, row: &Row) -> Result<()>;

    fn delete_row(&mut self, ctx: &RunContext, row: &Row) -> Result<()>;

    fn post_import(&mut self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    fn post_delete(&mut self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }
}

/// Static description of one importer.
#[derive(Debug)]
pub struct ImporterInfo {
    pub name: &'static str,
    pub description: &'static str,
    /// Columns that must be present in the input CSV.
    pub columns: &'static [&'static str],
    /// Mappings loaded for the run, dependencies first.
    pub mappings: &'static [MappingName],
    /// Mapping that row-level failures are reported against.
    pub primary: MappingName,
    pub build: fn(&ImportOptions) -> Box<dyn Importer>,
}

pub static REGISTRY: &[ImporterInfo] = &[
    organization::INFO,
    user::INFO,
    host_collection::INFO,
    repository::INFO,
];

pub fn lookup(name: &str) -> Result<&'static ImporterInfo> {
    REGISTRY
        .iter()
        .find(|info| info.name == name)
        .ok_or_else(|| ImportError::UnknownEntity(name.to_string()))
}

/// Process `rows` with a fresh importer, then drain the reactor and save the
/// mapping store. Both happen even when the loop is aborted; the first fatal
/// error is returned.
pub fn process(info: &ImporterInfo, ctx: &RunContext, rows: &[Row], delete: bool) -> Result<()> {
    let mut importer = (info.build)(&ctx.options);
    let outcome = drive(info, importer.as_mut(), ctx, rows, delete);
    if let Err(e) = &outcome {
        error!("exiting: {e}");
    }

    let drained = ctx.reactor.shutdown();
    if let Err(e) = &drained {
        error!("waiting for asynchronous tasks failed: {e}");
    }
    let saved = ctx.engine().save();
    match &saved {
        Ok(paths) => {
            for path in paths {
                info!("saved {}", path.display());
            }
        }
        Err(e) => error!("saving mappings failed: {e}"),
    }

    outcome?;
    drained?;
    saved.map(|_| ())
}

fn drive(
    info: &ImporterInfo,
    importer: &mut dyn Importer,
    ctx: &RunContext,
    rows: &[Row],
    delete: bool,
) -> Result<()> {
    for row in rows {
        let handled = if delete {
            importer.delete_row(ctx, row)
        } else {
            importer.import_row(ctx, row)
        };
        absorb(info, ctx, row, handled)?;
    }
    let finished = if delete {
        importer.post_delete(ctx)
    } else {
        importer.post_import(ctx)
    };
    match finished {
        Err(e) if e.is_row_level() => {
            error!("{} post-processing failed: {e}", info.name);
            Ok(())
        }
        other => other,
    }
}

/// Count and log a row-level failure; hand anything else back.
fn absorb(info: &ImporterInfo, ctx: &RunContext, row: &Row, handled: Result<()>) -> Result<()> {
    match handled {
        Ok(()) => Ok(()),
        Err(e @ ImportError::MissingObject { .. }) => {
            error!("line {}: {e}", row.line);
            ctx.engine().report(Verb::Skipped, info.primary);
            Ok(())
        }
        Err(e) if e.is_row_level() => {
            error!("line {}: {e}", row.line);
            ctx.engine().report(Verb::Failed, info.primary);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
