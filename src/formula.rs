//! The formula lifecycle: build, archive, deploy.
//!
//! ```text
//! exists? ──► clean build path ──► resolve deps ──► run script ──► archive ──► deploy
//!   │                                  │                │                        │
//!   └──────────────────────────────────┴────────────────┴──────► Failed ◄────────┘
//! ```
//!
//! A formula is a bash script under the workspace. It declares its
//! dependencies and its output directory through comment markers (see
//! [`crate::markers`]). Dependencies are fetched one level deep as prebuilt
//! archives; they are never rebuilt.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, info};

use crate::archive;
use crate::config::{BucketLocation, Config};
use crate::error::{Error, IoContext, Result};
use crate::markers;
use crate::process::{InterruptGuard, Outcome, ProcessRunner};
use crate::resolver;
use crate::storage::{AccessMode, Bucket, BucketRegistry, Connector, ObjectRef};

/// Lifecycle position of a [`Formula`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Resolving,
    Building,
    Built,
    Archived,
    Deployed,
    Failed,
}

/// A bucket handle paired with the location it was opened for.
#[derive(Clone)]
pub struct ArchiveSource {
    pub bucket: Rc<dyn Bucket>,
    pub location: BucketLocation,
}

impl ArchiveSource {
    pub fn new(bucket: Rc<dyn Bucket>, location: &BucketLocation) -> Self {
        Self {
            bucket,
            location: location.clone(),
        }
    }

    pub fn archive_key(&self, identifier: &str) -> String {
        self.location.archive_key(identifier)
    }

    fn resolve(&self, key: &str) -> Result<Option<ObjectRef>> {
        Ok(resolver::resolve(self.bucket.as_ref(), key)?)
    }
}

pub struct Formula<'a> {
    name: String,
    archive_name_override: Option<String>,
    config: &'a Config,
    primary: ArchiveSource,
    upstream: Option<ArchiveSource>,
    runner: ProcessRunner,
    archived_path: Option<PathBuf>,
    state: State,
}

impl std::fmt::Debug for Formula<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Formula {}>", self.name)
    }
}

impl<'a> Formula<'a> {
    pub fn new(
        name: impl Into<String>,
        archive_name_override: Option<String>,
        config: &'a Config,
        primary: ArchiveSource,
        upstream: Option<ArchiveSource>,
    ) -> Self {
        Self {
            name: name.into(),
            archive_name_override,
            config,
            primary,
            upstream,
            runner: ProcessRunner::default(),
            archived_path: None,
            state: State::Uninitialized,
        }
    }

    /// Open the configured buckets through `registry` and create the formula.
    pub fn connect<C: Connector>(
        name: impl Into<String>,
        archive_name_override: Option<String>,
        config: &'a Config,
        registry: &mut BucketRegistry<C>,
    ) -> Result<Self> {
        let primary = ArchiveSource::new(registry.bucket(&config.bucket.name)?, &config.bucket);
        let upstream = match &config.upstream {
            Some(location) => Some(ArchiveSource::new(
                registry.bucket(&location.name)?,
                location,
            )),
            None => None,
        };
        Ok(Self::new(
            name,
            archive_name_override,
            config,
            primary,
            upstream,
        ))
    }

    pub fn with_runner(mut self, runner: ProcessRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Local archive produced by [`Formula::archive`], if it ran.
    pub fn archived_path(&self) -> Option<&Path> {
        self.archived_path.as_deref()
    }

    /// Script location relative to the current directory.
    pub fn workspace_path(&self) -> PathBuf {
        self.config.workspace_dir.join(&self.name)
    }

    /// Absolute script location.
    pub fn full_path(&self) -> Result<PathBuf> {
        let path = self.workspace_path();
        std::path::absolute(&path).io_context(|| format!("resolving '{}'", path.display()))
    }

    pub fn exists(&self) -> bool {
        self.workspace_path().exists()
    }

    /// Dependencies from the first `# Build Deps:` line; re-read every call.
    pub fn dependencies(&self) -> Result<Vec<String>> {
        markers::declared_dependencies(&self.full_path()?)
    }

    /// Absolute output directory from `# Build Path:` or the configured
    /// default.
    pub fn build_path(&self) -> Result<PathBuf> {
        let path = markers::declared_build_path(&self.full_path()?)?
            .unwrap_or_else(|| self.config.default_build_path.clone());
        std::path::absolute(&path).io_context(|| format!("resolving '{}'", path.display()))
    }

    /// Name used for the published archive.
    pub fn archive_name(&self) -> &str {
        self.archive_name_override.as_deref().unwrap_or(&self.name)
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.state = State::Failed;
        }
        result
    }

    /// Build with script output forwarded to stdout.
    pub fn build(&mut self) -> Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        self.build_with_output(&mut out)
    }

    /// Clean the build path, fetch dependencies into it, then run the script
    /// with `out` receiving its output.
    pub fn build_with_output<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let result = self.run_build(out);
        self.track(result)
    }

    fn run_build<W: Write>(&mut self, out: &mut W) -> Result<()> {
        if !self.exists() {
            return Err(Error::FormulaNotFound {
                name: self.name.clone(),
                path: self.workspace_path(),
            });
        }

        let build_path = self.build_path()?;
        prepare_build_dir(&build_path)?;

        self.state = State::Resolving;
        self.resolve_deps(&build_path)?;

        self.state = State::Building;
        self.run_script(&build_path, out)?;

        info!("Build complete: {}", build_path.display());
        self.state = State::Built;
        Ok(())
    }

    /// Fetch every declared dependency, in order, into `build_path`.
    ///
    /// Each one is looked up in the primary bucket, then in the upstream
    /// bucket if it is configured and the primary had no match. Extraction
    /// order is declaration order, so later archives overwrite files from
    /// earlier ones.
    pub fn resolve_deps(&self, build_path: &Path) -> Result<()> {
        let deps = self.dependencies()?;
        if deps.is_empty() {
            return Ok(());
        }

        info!("Fetching dependencies... found {}:", deps.len());
        for dep in &deps {
            info!("  - {dep}");

            let mut key = self.primary.archive_key(dep);
            let mut found = self
                .primary
                .resolve(&key)?
                .map(|object| (object, &self.primary));

            if found.is_none() {
                if let Some(upstream) = &self.upstream {
                    info!(
                        "    Not found in {}, trying {}...",
                        self.primary.bucket.name(),
                        upstream.bucket.name()
                    );
                    key = upstream.archive_key(dep);
                    found = upstream.resolve(&key)?.map(|object| (object, upstream));
                }
            }

            let Some((object, source)) = found else {
                return Err(Error::DependencyNotFound { key });
            };
            debug!("{dep} resolved to {}/{}", object.bucket, object.key);

            let staged = tempfile::Builder::new()
                .prefix("bob-dep-")
                .suffix(".tar.gz")
                .tempfile()
                .io_context(|| "creating temporary download file")?;
            source.bucket.download(&object.key, staged.path())?;
            archive::unpack(staged.path(), build_path)?;
        }
        Ok(())
    }

    fn run_script<W: Write>(&self, build_path: &Path, out: &mut W) -> Result<()> {
        let bash = which::which("bash").map_err(|_| Error::MissingTool { tool: "bash" })?;
        let script = self.full_path()?;

        let scratch = tempfile::Builder::new()
            .prefix("bob-")
            .tempdir()
            .io_context(|| "creating scratch directory")?;
        info!(
            "Building formula {} in {}:",
            self.name,
            scratch.path().display()
        );

        let mut args = vec![
            "--".into(),
            script.into_os_string(),
            build_path.as_os_str().to_owned(),
        ];
        if let Some(name) = &self.archive_name_override {
            args.push(name.into());
        }

        let guard = InterruptGuard::install()?;
        let outcome = self
            .runner
            .run_guarded(&guard, &bash, &args, scratch.path(), out);
        let interrupted = guard.pending();
        drop(guard);

        if let Some(signal) = interrupted {
            return Err(Error::Interrupted { signal });
        }
        match outcome? {
            Outcome::Success => Ok(()),
            Outcome::ExitFailure(code) => Err(Error::ProcessFailure { code }),
            Outcome::SignalTerminated(signal) => Err(Error::ProcessSignal { signal }),
        }
    }

    /// Pack the build path into a temporary `.tar.gz` and remember it.
    pub fn archive(&mut self) -> Result<PathBuf> {
        let result = self.run_archive();
        self.track(result)
    }

    fn run_archive(&mut self) -> Result<PathBuf> {
        let build_path = self.build_path()?;
        let path = archive::pack(&build_path)?;
        let (sha256, size) = archive::sha256_file(&path)?;
        info!("Created: {} ({size} bytes, sha256 {sha256})", path.display());

        self.archived_path = Some(path.clone());
        self.state = State::Archived;
        Ok(path)
    }

    /// Publish the archive to the primary bucket.
    ///
    /// Requires a prior [`Formula::archive`] and an authenticated bucket
    /// handle. An existing object is only replaced when `allow_overwrite`.
    pub fn deploy(&mut self, allow_overwrite: bool) -> Result<()> {
        let result = self.run_deploy(allow_overwrite);
        self.track(result)
    }

    fn run_deploy(&mut self, allow_overwrite: bool) -> Result<()> {
        let Some(archive) = self.archived_path.clone() else {
            return Err(Error::ContractViolation("deploy called before archive"));
        };

        let bucket = Rc::clone(&self.primary.bucket);
        if bucket.access_mode() == AccessMode::Anonymous {
            return Err(Error::Credentials {
                bucket: bucket.name().to_string(),
            });
        }

        let key = self.primary.archive_key(self.archive_name());
        if bucket.head(&key)?.is_some() {
            if !allow_overwrite {
                return Err(Error::AlreadyExists { key });
            }
            info!("Overwriting existing archive {key}");
        }

        info!("Uploading to: {}", bucket.public_url(&key));
        bucket.upload_public(&key, &archive)?;
        info!("Upload complete!");

        self.state = State::Deployed;
        Ok(())
    }
}

/// Remove `build_path` if present and recreate it empty.
fn prepare_build_dir(build_path: &Path) -> Result<()> {
    if build_path.exists() {
        std::fs::remove_dir_all(build_path)
            .io_context(|| format!("removing build path '{}'", build_path.display()))?;
    }
    std::fs::create_dir_all(build_path)
        .io_context(|| format!("creating build path '{}'", build_path.display()))
}
