// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal CLI wrapper so the library can run as a stand-alone gateway.
//!
//!  Build it with `cargo build --release --bin vireo`
//!  The binary honours VIREO_CONFIG_FILE or falls back to /etc/vireo/config.toml.

use std::env;
use std::error::Error;
use vireo::{Gateway, error_fmt, info_fmt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("Starting Vireo");

    let file_from_env = env::var("VIREO_CONFIG_FILE").ok();

    // Environment variables always apply on top of the file.
    let mut loader = Gateway::loader().with_env_vars();
    if let Some(ref path) = file_from_env {
        println!("Using configuration from {path}");
        loader = loader.with_config_file(path);
    } else {
        let fallback_path = "/etc/vireo/config.toml";
        println!(
            "No VIREO_CONFIG_FILE env var found. Attempting to use default configuration path: {fallback_path}"
        );

        if !std::path::Path::new(fallback_path).exists() {
            println!("Default configuration file {fallback_path} does not exist.");
            return Err(Box::from("No configuration file found."));
        }

        loader = loader.with_config_file(fallback_path);
    }

    let gateway = match loader.build().await {
        Ok(g) => g,
        Err(e) => {
            println!("Failed to build gateway: {e}");
            return Err(e.into());
        }
    };

    match gateway.start().await {
        Ok(()) => {
            info_fmt!("Vireo", "Gateway stopped gracefully");
        }
        Err(e) => {
            error_fmt!("Vireo", "Gateway failed: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
