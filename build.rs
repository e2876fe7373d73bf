// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Embeds the worker's version string as `WORKER_LINK_VERSION`.
//!
//! The package version is always the base. Inside a git checkout the commit
//! is appended as semver build metadata, so a host logging the worker's
//! `--version` can tell builds of the same release apart:
//! - `0.4.2` (no git, e.g. a packaged source tarball)
//! - `0.4.2+gabc1234` (clean checkout)
//! - `0.4.2+gabc1234.dirty` (uncommitted changes)

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let mut version = env!("CARGO_PKG_VERSION").to_string();
    if let Some(commit) = git(&["rev-parse", "--short", "HEAD"]) {
        version.push_str("+g");
        version.push_str(&commit);
        if git(&["status", "--porcelain", "--untracked-files=no"]).is_some() {
            version.push_str(".dirty");
        }
    }
    println!("cargo:rustc-env=WORKER_LINK_VERSION={version}");
}

/// Trimmed stdout of a successful git command, `None` if empty or failed.
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
