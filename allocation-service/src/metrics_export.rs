use std::{fs, path::Path};

use anyhow::{anyhow, Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Installs the global Prometheus recorder. Calling it twice is a no-op.
pub fn init() -> Result<()> {
    if PROM_HANDLE.get().is_some() {
        return Ok(());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow!("failed to install Prometheus metrics recorder: {e}"))?;
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

/// Writes the current exposition to `path` for a textfile collector.
///
/// The file is written next to its final name and renamed into place so a
/// scraper never reads a partial file.
pub fn write_textfile(path: &Path) -> Result<()> {
    let handle = PROM_HANDLE
        .get()
        .ok_or_else(|| anyhow!("Prometheus recorder not initialized"))?;

    let tmp = path.with_extension("prom.tmp");
    fs::write(&tmp, handle.render()).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to move metrics into {}", path.display()))?;
    Ok(())
}
