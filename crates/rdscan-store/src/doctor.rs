use anyhow::Result;
use std::path::Path;

use crate::StoreConfig;

pub fn check_store(cfg: &StoreConfig) -> Result<()> {
    let p = Path::new(&cfg.dir);
    if p.exists() {
        anyhow::ensure!(p.is_dir(), "store.dir is not a dir: {}", cfg.dir);
        anyhow::ensure!(
            !std::fs::metadata(p)?.permissions().readonly(),
            "store.dir is read-only: {}",
            cfg.dir
        );
    }
    anyhow::ensure!(!cfg.log_file.is_empty(), "store.log_file must not be empty");
    anyhow::ensure!(cfg.queue_capacity >= 8, "store.queue_capacity too small; set >= 8");
    anyhow::ensure!(cfg.write_attempts >= 1 && cfg.write_attempts <= 5, "store.write_attempts should be 1..5");
    Ok(())
}
