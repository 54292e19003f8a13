#![allow(dead_code)]

use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;

pub fn cli() -> Result<Command> {
    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME"))?;
    cmd.arg("-vvv");
    Ok(cmd)
}

pub fn write_config(repo: &Path, body: &str) {
    std::fs::write(repo.join("config"), body).expect("Couldn't write config");
}
