use serde_json::{json, Map};
use tracing::{info, warn};

use crate::error::Result;
use crate::feed::Row;
use crate::importers::{ImportOptions, Importer, ImporterInfo, RunContext};
use crate::model::Verb;
use crate::store::codec::{FieldValue, Tuple};
use crate::store::schema::MappingName;

pub const INFO: ImporterInfo = ImporterInfo {
    name: "organization",
    description: "Import organizations",
    columns: &["organization_id", "organization"],
    mappings: &[MappingName::Organizations],
    primary: MappingName::Organizations,
    build,
};

/// Target organization that is never deleted, only unmapped.
const DEFAULT_ORGANIZATION: i64 = 1;

fn build(_options: &ImportOptions) -> Box<dyn Importer> {
    Box::new(OrganizationImporter)
}

pub struct OrganizationImporter;

impl Importer for OrganizationImporter {
    fn import_row(&mut self, ctx: &RunContext, row: &Row) -> Result<()> {
        let source = Tuple::single(row.int("organization_id")?);
        let mut engine = ctx.engine();

        if let Some(into) = ctx.options.into_org_id {
            let target = FieldValue::Int(into);
            if engine
                .lookup_entity(MappingName::Organizations, &target, false)?
                .is_none()
            {
                warn!("organization [{into}] not found, skipping");
                engine.report(Verb::Skipped, MappingName::Organizations);
                return Ok(());
            }
            engine.map_entity(MappingName::Organizations, source, target)?;
            return Ok(());
        }

        let name = row.get("organization")?;
        let mut attrs = Map::new();
        attrs.insert("name".into(), json!(name));
        attrs.insert(
            "description".into(),
            json!(format!("Imported '{name}' organization")),
        );
        engine.create_entity(MappingName::Organizations, attrs, source)?;
        Ok(())
    }

    fn delete_row(&mut self, ctx: &RunContext, row: &Row) -> Result<()> {
        let source_id = row.int("organization_id")?;
        let source = Tuple::single(source_id);
        let mut engine = ctx.engine();

        if engine
            .mappings()
            .get(MappingName::Organizations, &source)
            .is_none()
        {
            info!("organization with id {source_id} wasn't imported, skipping deletion");
            return Ok(());
        }
        let target = engine.translate(MappingName::Organizations, &source)?;
        if engine.is_last(MappingName::Organizations, &target) {
            warn!("won't delete last organization [{target}], unmapping only");
            engine.unmap_entity(MappingName::Organizations, &target)?;
            return Ok(());
        }
        if target == FieldValue::Int(DEFAULT_ORGANIZATION) {
            warn!("won't delete organization with id [{target}], unmapping only");
            engine.unmap_entity(MappingName::Organizations, &target)?;
            return Ok(());
        }
        engine.delete_entity(MappingName::Organizations, &source)
    }
}
