use anyhow::{Context, Result};
use tracing::info;

use crate::catalog::{CatalogDocument, SqliteCatalog};

use super::shared::{load_engine_cfg, must_env};

pub(super) async fn run() -> Result<()> {
    let input_path = must_env("IMPORT_INPUT_PATH")?;
    let cfg = load_engine_cfg();

    let doc = CatalogDocument::load(&input_path)?;
    let catalog = SqliteCatalog::open(&cfg.catalog_db_path)
        .with_context(|| format!("failed to open catalog {}", cfg.catalog_db_path))?;
    let (systems, triggers, filters) = catalog.import(&doc)?;

    info!(
        "Import complete into {}: systems={}, triggers={}, filters={}",
        cfg.catalog_db_path, systems, triggers, filters
    );
    Ok(())
}
