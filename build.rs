//! Build script for persona-relay
//!
//! Embeds git, target and toolchain details into the binary so the
//! `version` command and the startup log can report them.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = run("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_branch = run("git", &["rev-parse", "--abbrev-ref", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(output) if output.status.success() => {
            if output.stdout.is_empty() { "false" } else { "true" }
        }
        _ => "unknown",
    };

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let rustc_version = run("rustc", &["--version"]);

    let vars = [
        ("GIT_HASH", git_hash),
        ("GIT_BRANCH", git_branch),
        ("GIT_DIRTY", git_dirty.to_string()),
        ("BUILD_TIMESTAMP", build_timestamp),
        ("TARGET", cargo_var("TARGET")),
        ("PROFILE", cargo_var("PROFILE")),
        ("RUSTC_VERSION", rustc_version),
        ("HOST", cargo_var("HOST")),
    ];

    for (name, value) in vars {
        println!("cargo:rustc-env=PERSONA_RELAY_{}={}", name, value);
    }
}

/// Run a command and return its trimmed stdout, or "unknown"
fn run(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Read a variable cargo sets for build scripts
fn cargo_var(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| "unknown".to_string())
}
