// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Weft Authors

//! Command-line plumbing shared by the server binaries.

use std::{env, path::PathBuf};

use anyhow::{Context, Result, bail, ensure};

/// Turns a user-supplied config argument into a canonical absolute path.
pub fn resolve_config_path(arg: &str) -> Result<PathBuf> {
    ensure!(!arg.is_empty(), "config path is empty");

    let mut path = PathBuf::from(arg);
    if path.is_relative() {
        let cwd = env::current_dir().context("working directory is not accessible")?;
        path = cwd.join(path);
    }

    path.canonicalize()
        .with_context(|| format!("config path {} does not resolve", path.display()))
}

/// Picks the config file: the first CLI argument when given, otherwise
/// `weft.yaml` in the working directory.
pub fn config_path_from_args<I: IntoIterator<Item = String>>(args: I) -> Result<PathBuf> {
    if let Some(arg) = args.into_iter().next() {
        return resolve_config_path(&arg);
    }

    let fallback = "weft.yaml";
    if !PathBuf::from(fallback).exists() {
        bail!("no config argument given and no {fallback} in the working directory");
    }
    resolve_config_path(fallback)
}
