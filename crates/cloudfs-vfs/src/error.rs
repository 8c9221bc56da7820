// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use miette::Diagnostic;
use thiserror::Error;

/// A specialized result for the platform bindings.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors specific to mounting and serving a cloud tree.
#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    /// The cloud service could not provide what was needed.
    #[error(transparent)]
    #[diagnostic(forward(0))]
    Cloud(#[from] cloudfs::Error),

    /// Sessions dispatch requests onto an existing tokio runtime.
    #[error("A session must be created from within a tokio runtime")]
    #[diagnostic(
        code("cloudfs_vfs::no_runtime"),
        help("Create the session inside the runtime that should serve it")
    )]
    NoRuntime(#[source] tokio::runtime::TryCurrentError),

    /// The filesystem could not be mounted or served.
    #[error("Failed to mount filesystem at {0}")]
    Mount(std::path::PathBuf, #[source] std::io::Error),

    /// A global logger was already installed.
    #[error("Failed to initialize logging")]
    Logging(#[source] tracing::subscriber::SetGlobalDefaultError),
}
