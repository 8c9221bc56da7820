// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use crate::{Error, Result};

#[cfg(test)]
#[path = "./logging_test.rs"]
mod logging_test;

/// Overrides the default directives when the verbosity is zero.
const CLOUDFS_LOG: &str = "CLOUDFS_LOG";

/// Install a global subscriber that writes to stderr.
///
/// Higher verbosity levels enable more detailed output from
/// cloudfs, and `RUST_LOG` may add or replace any directive.
pub fn configure_logging(verbosity: usize) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let directives = directives(
        verbosity,
        std::env::var(CLOUDFS_LOG).ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let env_filter = tracing_subscriber::filter::EnvFilter::new(directives);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(verbosity > 2);
    let sub = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(fmt_layer);
    tracing::subscriber::set_global_default(sub).map_err(Error::Logging)
}

fn directives(verbosity: usize, existing: Option<String>, overrides: Option<String>) -> String {
    let mut config = match (verbosity, existing) {
        (0, Some(existing)) => existing,
        (0, None) => "cloudfs=info,warn".to_string(),
        (1, _) => "cloudfs=debug,info".to_string(),
        (2, _) => "cloudfs=trace,info".to_string(),
        (3, _) => "cloudfs=trace,debug".to_string(),
        _ => "trace".to_string(),
    };
    if let Some(overrides) = overrides {
        config.push(',');
        config.push_str(&overrides);
    }
    config
}
