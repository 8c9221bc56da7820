// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Platform bindings for cloudfs
//!
//! Notably, provides the logic to serve a cloud tree over FUSE
//! on linux, along with the process logging setup shared by
//! anything that mounts one.

#![deny(missing_docs)]

mod error;
mod logging;

pub use error::{Error, Result};
pub use logging::configure_logging;

#[cfg(all(unix, feature = "fuse-backend"))]
mod fuse;

#[cfg(all(unix, feature = "fuse-backend"))]
pub use fuse::{Config, Session};
