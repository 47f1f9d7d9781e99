use serde_json::{json, Map};

use crate::error::Result;
use crate::feed::Row;
use crate::importers::{ImportOptions, Importer, ImporterInfo, RunContext};
use crate::store::codec::Tuple;
use crate::store::schema::MappingName;

pub const INFO: ImporterInfo = ImporterInfo {
    name: "host-collection",
    description: "Import host collections (system groups)",
    columns: &["group_id", "name", "org_id"],
    mappings: &[MappingName::Organizations, MappingName::HostCollections],
    primary: MappingName::HostCollections,
    build,
};

fn build(_options: &ImportOptions) -> Box<dyn Importer> {
    Box::new(HostCollectionImporter)
}

pub struct HostCollectionImporter;

impl Importer for HostCollectionImporter {
    fn import_row(&mut self, ctx: &RunContext, row: &Row) -> Result<()> {
        let mut engine = ctx.engine();
        let org_id = engine.translate(
            MappingName::Organizations,
            &Tuple::single(row.int("org_id")?),
        )?;
        let mut attrs = Map::new();
        attrs.insert("name".into(), json!(row.get("name")?));
        attrs.insert("organization_id".into(), org_id.to_json());
        engine.create_entity(
            MappingName::HostCollections,
            attrs,
            Tuple::single(row.int("group_id")?),
        )?;
        Ok(())
    }

    fn delete_row(&mut self, ctx: &RunContext, row: &Row) -> Result<()> {
        let source = Tuple::single(row.int("group_id")?);
        ctx.engine()
            .delete_entity(MappingName::HostCollections, &source)
    }
}
