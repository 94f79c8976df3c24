//! Sykli CI pipeline for kulta-canary
//!
//! Run locally: sykli run
//! Or: cargo run --bin sykli --features sykli -- --emit | sykli run -

use sykli::{Condition, Pipeline, Template};

fn main() {
    let mut p = Pipeline::new();

    let src = p.dir(".");
    let cargo_registry = p.cache("cargo-registry");
    let cargo_git = p.cache("cargo-git");
    let target_cache = p.cache("target");

    let rust = Template::new()
        .container("rust:1.85")
        .mount_dir(&src, "/src")
        .mount_cache(&cargo_registry, "/usr/local/cargo/registry")
        .mount_cache(&cargo_git, "/usr/local/cargo/git")
        .mount_cache(&target_cache, "/src/target")
        .workdir("/src");

    // Unit tests run against in-memory fakes, no cluster needed
    let _ = p
        .task("test")
        .from(&rust)
        .run("cargo test --lib")
        .inputs(&["src/**/*.rs", "Cargo.toml", "Cargo.lock"]);

    let _ = p
        .task("lint")
        .from(&rust)
        .run("cargo clippy --lib --bins -- -D warnings -D clippy::unwrap_used -D clippy::expect_used")
        .inputs(&["src/**/*.rs", "Cargo.toml", "Cargo.lock"]);

    let _ = p
        .task("fmt")
        .from(&rust)
        .run("cargo fmt -- --check")
        .inputs(&["**/*.rs"]);

    // Canary CRD manifest
    let _ = p
        .task("crd")
        .from(&rust)
        .run("cargo run --bin gen-crd > target/canary-crd.json")
        .inputs(&["src/crd/**/*.rs", "src/bin/gen-crd.rs", "Cargo.toml"])
        .output("crd", "target/canary-crd.json")
        .after(&["test", "lint", "fmt"]);

    // Schema check against a real API server, push builds only
    let _ = p
        .task("crd-dry-run")
        .container("ghcr.io/sykli/kind-runner:latest")
        .mount(&src, "/src")
        .workdir("/src")
        .run(
            r#"#!/bin/bash
set -e
kind create cluster --name kulta-canary-ci
kubectl apply --dry-run=server -f /tmp/canary-crd.json
kind delete cluster --name kulta-canary-ci || true
"#,
        )
        .input_from("crd", "crd", "/tmp/canary-crd.json")
        .when_cond(Condition::event("push").or(Condition::negate(Condition::branch("*"))))
        .timeout(600);

    p.emit();
}
