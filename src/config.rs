//! User preferences at `~/.config/nb.toml` - distinct from the per-repository
//! `<repo>/config` search-tree document (`search::config`). Grounded
//! directly on backpak's own `config.rs`: same `home`+`toml` load pattern,
//! same "missing file means defaults" behavior.

use std::fs;
use std::io;

use anyhow::{Context, Result, anyhow};
use camino::Utf8PathBuf;
use serde_derive::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Configuration {
    /// Floor for `-v` verbosity; explicit `-v` flags only raise it.
    #[serde(default)]
    pub verbosity: u8,
    /// Whether the change report uses ANSI color. Defaults to `console`'s
    /// own terminal detection when absent.
    pub color: Option<bool>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            verbosity: 0,
            color: None,
        }
    }
}

pub fn load() -> Result<Configuration> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "nb.toml"]);

    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;
    toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))
}
