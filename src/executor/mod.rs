//! Running terraform for a working group.
//!
//! A run prepares the working directory, builds the child environment,
//! starts the IPC server, and then streams the child's stdout and stderr
//! through per-run filter chains on two reader threads. Teardown order is
//! fixed: readers are joined only after the child has exited and the pipe
//! write ends are gone, and chains are closed only after both readers are
//! done, so a filter's `close` sees the complete stream.

pub mod interrupt;
mod stream;
pub mod workdir;

use std::collections::BTreeMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, anyhow};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::{ConfigView, Settings};
use crate::filter::{Direction, FilterChain, FilterContext, FilterRegistry, RunLauncher, RunServices};
use crate::ipc::{self, IpcError, IpcRegistry, IpcServer};
use crate::notify::{CommandNotifier, Notifier};
use crate::paths::RunPaths;
use crate::prompt::{Confirmer, TerminalConfirmer};
use crate::secrets::{CredentialProvider, ProcessEnv, SecretProvider, StaticMap, secret_env_name};

pub use stream::OutputSink;
use workdir::Workdir;

pub const ROOT_ENV: &str = "ATMOS_ROOT";
pub const CONFIG_ENV: &str = "ATMOS_CONFIG";
pub const WORKING_GROUP_ENV: &str = "ATMOS_WORKING_GROUP";
pub const TMPDIR_ENV: &str = "TMPDIR";

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("terraform exited with status {exit_code}")]
    ProcessFailed { exit_code: i32 },
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

impl ExecError {
    /// Status the harness itself should exit with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ProcessFailed { exit_code } => *exit_code,
            _ => 1,
        }
    }
}

#[derive(Clone, Default)]
pub struct RunOptions {
    /// Do not generate the backend file (and remove a stale one).
    pub skip_backend: bool,
    /// Do not export secrets as `TF_VAR_*`.
    pub skip_secrets: bool,
    /// Run `terraform get` before the requested command.
    pub get_modules: bool,
    pub output: OutputSink,
}

/// Per-invocation state, fixed once the working directory is ready.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub process_env: BTreeMap<String, String>,
    pub working_group: String,
    pub paths: RunPaths,
    pub recipes: Vec<PathBuf>,
}

struct Finished {
    status: ExitStatus,
    stdout: FilterChain,
    stderr: FilterChain,
}

/// Runs terraform for one working group.
///
/// Cheap to clone; filters that need a follow-up run (force-unlock) get a
/// clone of the executor as their [`RunLauncher`].
#[derive(Clone)]
pub struct TerraformExecutor {
    config: Arc<dyn ConfigView>,
    settings: Arc<Settings>,
    working_group: String,
    credentials: Arc<dyn CredentialProvider>,
    secrets: Arc<dyn SecretProvider>,
    filters: Arc<FilterRegistry>,
    ipc_actions: Arc<IpcRegistry>,
    notifier: Arc<dyn Notifier>,
    confirmer: Arc<dyn Confirmer>,
}

impl TerraformExecutor {
    pub fn new(config: Arc<dyn ConfigView>, working_group: impl Into<String>) -> anyhow::Result<Self> {
        let settings = Settings::from_view(config.as_ref())?;
        let notifier: Arc<dyn Notifier> =
            Arc::new(CommandNotifier::new(settings.ui.notify.clone()));
        Ok(Self {
            config,
            settings: Arc::new(settings),
            working_group: working_group.into(),
            credentials: Arc::new(ProcessEnv),
            secrets: Arc::new(StaticMap::default()),
            filters: Arc::new(FilterRegistry::standard()),
            ipc_actions: Arc::new(IpcRegistry::standard(notifier.clone())),
            notifier,
            confirmer: Arc::new(TerminalConfirmer),
        })
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretProvider>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = Arc::new(filters);
        self
    }

    /// Replace the notifier used by filters and the `notify` IPC action.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.ipc_actions = Arc::new(IpcRegistry::standard(notifier.clone()));
        self.notifier = notifier;
        self
    }

    pub fn with_ipc_actions(mut self, actions: IpcRegistry) -> Self {
        self.ipc_actions = Arc::new(actions);
        self
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn working_group(&self) -> &str {
        &self.working_group
    }

    pub fn paths(&self) -> RunPaths {
        RunPaths::resolve(
            self.config.root_dir(),
            &self.settings.tmp_root,
            &self.working_group,
        )
    }

    /// Run terraform with `args`. Fails with [`ExecError::ProcessFailed`]
    /// when the child exits nonzero.
    pub fn run(&self, args: &[String], options: RunOptions) -> Result<ExitStatus, ExecError> {
        info!(working_group = %self.working_group, ?args, "starting terraform run");

        let paths = self.paths();
        let recipes = Workdir {
            config: self.config.as_ref(),
            settings: &self.settings,
            paths: &paths,
            working_group: &self.working_group,
        }
        .setup(options.skip_backend)?;

        let ctx = RunContext {
            process_env: self.process_env(&paths, options.skip_secrets)?,
            working_group: self.working_group.clone(),
            paths,
            recipes,
        };

        if options.get_modules {
            self.get_modules(&ctx)?;
        }
        self.execute(&ctx, args, &options.output)
    }

    /// `terraform get` with its output held back unless it fails.
    fn get_modules(&self, ctx: &RunContext) -> Result<(), ExecError> {
        let (sink, buffer) = OutputSink::buffer();
        match self.execute(ctx, &["get".to_string()], &sink) {
            Ok(_) => Ok(()),
            Err(e) => {
                let output = buffer
                    .lock()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default();
                error!(error = %e, %output, "terraform get failed");
                Err(e)
            }
        }
    }

    fn process_env(
        &self,
        paths: &RunPaths,
        skip_secrets: bool,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        let mut env = self
            .credentials
            .auth_env()
            .context("failed to load credentials")?;

        if skip_secrets {
            debug!("secrets skipped");
        } else {
            let secrets = self.secrets.secrets().context("failed to load secrets")?;
            debug!(count = secrets.len(), "exporting secrets");
            for (name, value) in secrets {
                env.insert(secret_env_name(&name), value);
            }
        }

        env.insert(
            ROOT_ENV.to_string(),
            self.config.root_dir().display().to_string(),
        );
        if let Some(file) = self.config.config_file() {
            env.insert(CONFIG_ENV.to_string(), file.display().to_string());
        }
        env.insert(WORKING_GROUP_ENV.to_string(), self.working_group.clone());
        env.insert(TMPDIR_ENV.to_string(), paths.tmp_dir.display().to_string());
        Ok(env)
    }

    fn execute(
        &self,
        ctx: &RunContext,
        args: &[String],
        sink: &OutputSink,
    ) -> Result<ExitStatus, ExecError> {
        let filter_ctx = FilterContext {
            process_env: ctx.process_env.clone(),
            working_group: ctx.working_group.clone(),
            services: RunServices {
                notifier: self.notifier.clone(),
                confirmer: self.confirmer.clone(),
                launcher: Arc::new(self.clone()),
            },
        };
        let disabled = &self.settings.filters.disabled;
        let stdout_chain = self.filters.build_chain(Direction::Stdout, &filter_ctx, disabled);
        let stderr_chain = self.filters.build_chain(Direction::Stderr, &filter_ctx, disabled);

        let mut env = ctx.process_env.clone();
        let finished = if self.settings.ipc.disable {
            debug!("ipc disabled");
            env.insert(ipc::CLIENT_ENV.to_string(), ipc::DISABLED_CLIENT.to_string());
            self.spawn_and_wait(ctx, args, &env, sink, stdout_chain, stderr_chain)?
        } else {
            let server = IpcServer::new(&ctx.paths.tmp_dir, self.ipc_actions.clone());
            server.listen(|socket| -> Result<Finished, ExecError> {
                let client = server
                    .generate_client_script(socket)
                    .context("failed to write ipc client script")?;
                env.insert(ipc::SOCK_ENV.to_string(), socket.display().to_string());
                env.insert(ipc::CLIENT_ENV.to_string(), client.display().to_string());
                self.spawn_and_wait(ctx, args, &env, sink, stdout_chain, stderr_chain)
            })??
        };

        let Finished {
            status,
            mut stdout,
            mut stderr,
        } = finished;
        stdout.close();
        stderr.close();

        if status.success() {
            info!(%status, "terraform finished");
            Ok(status)
        } else {
            let exit_code = exit_code(status);
            info!(exit_code, "terraform failed");
            Err(ExecError::ProcessFailed { exit_code })
        }
    }

    fn spawn_and_wait(
        &self,
        ctx: &RunContext,
        args: &[String],
        env: &BTreeMap<String, String>,
        sink: &OutputSink,
        stdout_chain: FilterChain,
        stderr_chain: FilterChain,
    ) -> Result<Finished, ExecError> {
        let (stdout_read, stdout_write) = io::pipe().context("failed to create stdout pipe")?;
        let (stderr_read, stderr_write) = io::pipe().context("failed to create stderr pipe")?;

        let stdout_reader =
            stream::spawn_reader(stdout_read, stdout_chain, sink.writer(Direction::Stdout))
                .context("failed to start stdout reader")?;
        let stderr_reader =
            stream::spawn_reader(stderr_read, stderr_chain, sink.writer(Direction::Stderr))
                .context("failed to start stderr reader")?;

        let program = &self.settings.terraform.command;
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&ctx.paths.working_dir)
            .envs(env)
            .stdin(Stdio::inherit())
            .stdout(stdout_write)
            .stderr(stderr_write);

        let spawned = command.spawn();
        // Our copies of the write ends; the readers see EOF once the child
        // (and anything it spawned) lets go of its own.
        drop(command);

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = stdout_reader.join();
                let _ = stderr_reader.join();
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to spawn `{program}`"))
                    .into());
            }
        };
        debug!(pid = child.id(), program = %program, "terraform spawned");

        let status =
            interrupt::wait_for_child(&mut child).context("failed to wait for terraform")?;
        let stdout = join_reader(stdout_reader, Direction::Stdout)?;
        let stderr = join_reader(stderr_reader, Direction::Stderr)?;
        Ok(Finished {
            status,
            stdout,
            stderr,
        })
    }
}

impl RunLauncher for TerraformExecutor {
    fn launch(&self, args: &[String]) -> anyhow::Result<()> {
        self.run(args, RunOptions::default())?;
        Ok(())
    }
}

fn join_reader(
    handle: JoinHandle<FilterChain>,
    direction: Direction,
) -> Result<FilterChain, ExecError> {
    handle
        .join()
        .map_err(|_| ExecError::Setup(anyhow!("{direction} reader thread panicked")))
}

/// Shell-style status: the exit code, or 128 + signal number.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}
