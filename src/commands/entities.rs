use crate::error::Result;
use crate::importers::REGISTRY;
use crate::output::{self, Format};

pub fn run(format: Format) -> Result<()> {
    output::print_importers(REGISTRY, format)
}
