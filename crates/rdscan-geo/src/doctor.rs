use anyhow::Result;
use std::path::Path;

use crate::GnssConfig;

pub fn check_gnss(cfg: &GnssConfig) -> Result<()> {
    anyhow::ensure!(!cfg.sentence.is_empty(), "gnss.sentence must not be empty");
    anyhow::ensure!(cfg.read_timeout_ms >= 10 && cfg.read_timeout_ms <= 10_000, "gnss.read_timeout_ms should be 10..10000");
    match cfg.source.as_str() {
        "nmea-serial" => {
            anyhow::ensure!(cfg.baud > 0, "gnss.baud invalid");
            anyhow::ensure!(Path::new(&cfg.device).exists(), "gnss.device missing: {}", cfg.device);
        }
        "nmea-file" => {
            let f = cfg.file.as_deref().unwrap_or_default();
            anyhow::ensure!(Path::new(f).is_file(), "gnss.file missing: {:?}", f);
        }
        other => anyhow::bail!("unknown gnss.source: {}", other),
    }
    Ok(())
}
