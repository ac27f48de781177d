#![allow(dead_code)]

use std::path::Path;

use assert_cmd::{assert::Assert, cargo::cargo_bin_cmd, Command};
use serde_json::Value;

/// `hubsnap` with a private cache root and no ambient hub settings.
pub fn hubsnap(cache: &Path, endpoint: &str) -> Command {
    let mut cmd = cargo_bin_cmd!("hubsnap");
    cmd.env("HUBSNAP_CACHE", cache)
        .env("HF_ENDPOINT", endpoint)
        .env("NO_PROXY", "127.0.0.1,localhost")
        .env("NO_COLOR", "1")
        .env_remove("HUGGINGFACE_HUB_CACHE")
        .env_remove("HF_HOME")
        .env_remove("HUBSNAP_JOBS")
        .env_remove("HUBSNAP_HTTP_TIMEOUT")
        .env_remove("RUST_LOG");
    cmd
}

/// An endpoint nothing listens on.
pub const UNREACHABLE: &str = "http://127.0.0.1:9";

pub fn parse_json(assert: &Assert) -> Value {
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 stdout");
    serde_json::from_str(stdout.trim()).expect("json payload")
}

pub fn stdout(assert: &Assert) -> String {
    String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 stdout")
}
