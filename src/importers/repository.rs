use std::sync::Arc;

use serde_json::{json, Map};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Result;
use crate::feed::Row;
use crate::importers::{ImportOptions, Importer, ImporterInfo, RunContext};
use crate::model::{EntityType, Verb};
use crate::store::cache::entity_id;
use crate::store::codec::{FieldValue, Tuple};
use crate::store::schema::MappingName;

pub const INFO: ImporterInfo = ImporterInfo {
    name: "repository",
    description: "Import custom repositories and their products",
    columns: &["id", "org_id", "repo_label", "source_url", "repo_type"],
    mappings: &[
        MappingName::Organizations,
        MappingName::Repositories,
        MappingName::Products,
    ],
    primary: MappingName::Repositories,
    build,
};

fn build(_options: &ImportOptions) -> Box<dyn Importer> {
    Box::new(RepositoryImporter)
}

pub struct RepositoryImporter;

/// `http://mirror.example.com/x` names its product `EXAMPLE.COM`.
pub fn product_name(source_url: &str) -> Option<String> {
    let url = Url::parse(source_url).ok()?;
    let labels: Vec<&str> = url.host_str()?.split('.').collect();
    if labels.len() < 2 {
        return None;
    }
    Some(labels[labels.len() - 2..].join(".").to_uppercase())
}

impl Importer for RepositoryImporter {
    fn import_row(&mut self, ctx: &RunContext, row: &Row) -> Result<()> {
        let label = row.get("repo_label")?;
        let source_url = row.get("source_url")?;
        let Some(product) = product_name(source_url) else {
            warn!("skipping {label} repository import, invalid source_url '{source_url}'");
            ctx.engine().report(Verb::Skipped, MappingName::Repositories);
            return Ok(());
        };
        let org_source = row.int("org_id")?;

        let repo_id = {
            let mut engine = ctx.engine();
            let org_id = engine.translate(MappingName::Organizations, &Tuple::single(org_source))?;

            let mut product_attrs = Map::new();
            product_attrs.insert("name".into(), json!(product));
            product_attrs.insert("organization_id".into(), org_id.to_json());
            let product_entity = engine.create_entity(
                MappingName::Products,
                product_attrs,
                Tuple::from((org_source, product.as_str())),
            )?;
            let product_id = entity_id(EntityType::Products, &product_entity)?;

            let mut repo_attrs = Map::new();
            repo_attrs.insert("name".into(), json!(label));
            repo_attrs.insert("product_id".into(), product_id.to_json());
            repo_attrs.insert("url".into(), json!(source_url));
            repo_attrs.insert("content_type".into(), json!(row.get("repo_type")?));
            let repo = engine.create_entity(
                MappingName::Repositories,
                repo_attrs,
                Tuple::single(row.int("id")?),
            )?;
            entity_id(EntityType::Repositories, &repo)?
        };

        if !ctx.options.synchronize || is_synced(ctx, &repo_id)? {
            return Ok(());
        }
        let job = ctx
            .engine()
            .api()
            .start_job(EntityType::Repositories, "sync", &repo_id)?;
        debug!("sync of repository {repo_id} started as {job}");
        if !ctx.options.wait {
            return Ok(());
        }

        let engine = Arc::clone(&ctx.engine);
        ctx.reactor.register(vec![job], move || {
            let mut engine = engine.lock().unwrap_or_else(|e| e.into_inner());
            let refreshed = engine.lookup_entity(MappingName::Repositories, &repo_id, true)?;
            let state = refreshed
                .as_ref()
                .and_then(|r| r.str_attr("sync_state"))
                .unwrap_or("unknown");
            info!("repository {repo_id} synchronized ({state})");
            Ok(())
        })
    }

    fn delete_row(&mut self, ctx: &RunContext, row: &Row) -> Result<()> {
        let source_id = row.int("id")?;
        let source = Tuple::single(source_id);
        let mut engine = ctx.engine();

        if engine
            .mappings()
            .get(MappingName::Repositories, &source)
            .is_none()
        {
            info!("repository with id {source_id} wasn't imported, skipping deletion");
            return Ok(());
        }
        let repo_id = engine.translate(MappingName::Repositories, &source)?;
        let product_id = engine
            .lookup_entity(MappingName::Repositories, &repo_id, false)?
            .and_then(|repo| repo.get("product").and_then(|p| p.get("id")).cloned())
            .and_then(|id| id.as_i64())
            .map(FieldValue::Int);

        engine.delete_entity(MappingName::Repositories, &source)?;

        let Some(product_id) = product_id else {
            warn!("product of repository {repo_id} unknown, leaving it in place");
            return Ok(());
        };
        let product = engine.lookup_entity(MappingName::Products, &product_id, true)?;
        let empty = product
            .as_ref()
            .and_then(|p| p.get("repository_count"))
            .and_then(|c| c.as_u64())
            == Some(0);
        if empty {
            engine.delete_by_target_id(MappingName::Products, &product_id)?;
        }
        Ok(())
    }
}

fn is_synced(ctx: &RunContext, repo_id: &FieldValue) -> Result<bool> {
    let repo = ctx
        .engine()
        .lookup_entity(MappingName::Repositories, repo_id, true)?;
    Ok(repo.as_ref().and_then(|r| r.str_attr("sync_state")) == Some("finished"))
}
