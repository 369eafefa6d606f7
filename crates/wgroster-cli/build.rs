use std::env;
use std::process::Command;

/// `git describe` of the checkout, or the crate version for source tarballs.
fn describe() -> String {
    let described = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    match described {
        Some(rev) => format!("{} ({rev})", env!("CARGO_PKG_VERSION")),
        None => env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// PROFILE only reports debug or release, so custom profiles are recognised
/// by their target directory.
fn building_for_distribution() -> bool {
    let profile = env::var("PROFILE").unwrap_or_default();
    let out_dir = env::var("OUT_DIR").unwrap_or_default();
    profile == "distribute" || out_dir.contains("/distribute/")
}

fn main() {
    println!("cargo:rustc-env=GIT_VERSION={}", describe());

    println!("cargo::rustc-check-cfg=cfg(distribute)");
    if building_for_distribution() {
        println!("cargo:rustc-cfg=distribute");
    }

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
}
