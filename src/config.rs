//! Compiler/link configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::stackmap::TargetTriple;

/// Options for AOT file generation.
#[derive(Debug, Clone)]
pub struct AotConfig {
    /// Target architecture the code was generated for.
    pub triple: TargetTriple,
    /// Cap on worker threads during the finalize/link step.
    pub max_workers: usize,
    /// Trace module indexing and merging to stderr.
    pub trace_link: bool,
    /// Where to write the generated image, when driven from an options
    /// file rather than an explicit save call.
    pub out: Option<PathBuf>,
}

impl Default for AotConfig {
    fn default() -> Self {
        Self {
            triple: TargetTriple::default(),
            max_workers: 7,
            trace_link: false,
            out: None,
        }
    }
}

/// On-disk options file (TOML), the user-facing shape of [`AotConfig`].
#[derive(Debug, Serialize, Deserialize)]
pub struct AotOptions {
    pub triple: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub trace_link: bool,
    #[serde(default)]
    pub out: Option<PathBuf>,
}

fn default_max_workers() -> usize {
    7
}

impl AotOptions {
    pub fn load(path: &Path) -> Result<AotConfig, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let options: AotOptions =
            toml::from_str(&content).map_err(|e| format!("failed to parse options: {}", e))?;
        options.into_config()
    }

    pub fn into_config(self) -> Result<AotConfig, String> {
        let triple = TargetTriple::parse(&self.triple)
            .ok_or_else(|| format!("unsupported target triple: {}", self.triple))?;
        if self.max_workers == 0 {
            return Err("max_workers must be at least 1".to_string());
        }
        Ok(AotConfig {
            triple,
            max_workers: self.max_workers,
            trace_link: self.trace_link,
            out: self.out,
        })
    }
}
