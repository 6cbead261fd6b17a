//! Build formulas and publish their output as compressed archives.
//!
//! A formula is a bash script in a workspace directory. It declares its
//! prebuilt dependencies and its output directory through comment markers:
//!
//! ```text
//! #!/usr/bin/env bash
//! # Build Deps: libraries/sqlite-3.*, libraries/zlib
//! # Build Path: /app/.heroku/python/
//! ```
//!
//! Building fetches each dependency archive from object storage into the
//! build path, runs the script, and can then pack the build path and upload
//! it under `{prefix}{name}.tar.gz`.
//!
//! # Architecture
//!
//! ```text
//! bob (binary)
//!     │
//!     ├── config      environment + bob.toml → Config
//!     └── formula     build / resolve_deps / archive / deploy
//!             │
//!             ├── markers    "# Build Deps:" / "# Build Path:" lines
//!             ├── resolver   exact or wildcard keys, newest version wins
//!             │      └── version
//!             ├── storage    Bucket trait, BucketRegistry, local backend
//!             ├── archive    tar.gz pack / guarded unpack
//!             └── process    child output forwarding, held-back signals
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod formula;
pub mod markers;
pub mod process;
pub mod resolver;
pub mod storage;
pub mod version;

pub use config::{BucketLocation, Config, Credentials};
pub use error::{Error, Result};
pub use formula::{ArchiveSource, Formula, State};
pub use process::{Outcome, ProcessRunner};
pub use storage::{AccessMode, Bucket, BucketRegistry, ObjectRef, StorageError};
