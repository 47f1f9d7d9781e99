use std::path::Path;

use crate::error::Result;
use crate::output::{self, Format};
use crate::store::mapping::MappingStore;
use crate::store::schema::MappingName;

/// Print the live content of one mapping as replayed from `data_dir`.
pub fn run(data_dir: &Path, name: &str, format: Format) -> Result<()> {
    let name: MappingName = name.parse()?;
    let store = MappingStore::load(data_dir, &[name])?;
    output::print_mapping(store.mapping(name)?, format)
}
