use anyhow::{Context, Error, bail};
use clap::{Parser, ValueEnum};
use container_backend::iodaemon::{Broker, Link, listen};
use container_backend::logging::init_logging;
use container_backend::process::detach_stdio;
use container_backend::{Mapping, MappingList, ProcessSpec, RunConfig, UserNamespace, run_container};
use std::fmt::Display;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "container-backend")]
#[command(about = "Single-host container backend")]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true, env = "CONTAINER_BACKEND_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum UserNs {
    Enabled,
    Disabled,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run a command inside a new container
    Run {
        #[arg(long, default_value = "container")]
        hostname: String,

        /// Disabling runs the container privileged, in the host user namespace
        #[arg(long, value_enum, default_value_t = UserNs::Enabled)]
        userns: UserNs,

        #[arg(long = "uid-map", value_name = "FROM:TO:SIZE")]
        uid_map: Vec<Mapping>,

        #[arg(long = "gid-map", value_name = "FROM:TO:SIZE")]
        gid_map: Vec<Mapping>,

        rootfs: String,
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Start a process and serve its stdio on SOCKET
    Spawn {
        /// Give the process a pseudo-terminal instead of pipes
        #[arg(long)]
        tty: bool,

        socket: PathBuf,
        path: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to a process started with `spawn`
    Link { socket: PathBuf },
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Run {
            hostname,
            userns,
            uid_map,
            gid_map,
            rootfs,
            command,
            args,
        } => {
            let user_namespace = match userns {
                UserNs::Disabled => None,
                UserNs::Enabled => Some(user_namespace(uid_map, gid_map)),
            };
            let config = RunConfig {
                rootfs: checked_rootfs(&rootfs)?,
                command: checked_command(command)?,
                args,
                hostname,
                user_namespace,
            };

            let code = run_container(&config)?;
            process::exit(code);
        }

        Commands::Spawn {
            tty,
            socket,
            path,
            args,
        } => spawn(&socket, ProcessSpec::new(path, args).with_tty(tty)),

        Commands::Link { socket } => {
            let link = Link::attach(&socket)
                .with_context(|| format!("attaching to {}", socket.display()))?;
            let code = link.run()?;
            process::exit(code);
        }
    }
}

fn user_namespace(uid_map: Vec<Mapping>, gid_map: Vec<Mapping>) -> UserNamespace {
    let mut userns = UserNamespace::for_current_user();
    if !uid_map.is_empty() {
        userns.uid_map = MappingList::new(uid_map);
    }
    if !gid_map.is_empty() {
        userns.gid_map = MappingList::new(gid_map);
    }
    userns
}

fn checked_rootfs(rootfs: &str) -> Result<PathBuf, Error> {
    if rootfs.is_empty() {
        bail!("rootfs path is empty");
    }
    let path = PathBuf::from(rootfs);
    if !path.is_dir() {
        bail!("rootfs {} is not a directory", path.display());
    }
    Ok(path)
}

fn checked_command(command: String) -> Result<String, Error> {
    if command.is_empty() {
        bail!("command is empty");
    }
    if command.contains('\0') || command.chars().any(char::is_control) {
        bail!("command {:?} contains control characters", command);
    }
    Ok(command)
}

/// Broker daemon. Only returns by exiting the process.
fn spawn(socket: &Path, spec: ProcessSpec) -> ! {
    let listener = listen(socket).unwrap_or_else(|err| fatal(err));
    let broker = Broker::new(listener, &spec)
        .unwrap_or_else(|err| fatal(err))
        .on_started(|pid| {
            // The parent may have stopped listening after "ready"; never die over it.
            let mut stdout = io::stdout();
            let _ = writeln!(stdout, "pid: {}", pid).and_then(|_| stdout.flush());
            // Everything from here on goes over the socket.
            if let Err(err) = detach_stdio() {
                tracing::warn!(%err, "failed to detach stdio");
            }
        })
        .on_exit(|_| process::exit(0));

    let mut stdout = io::stdout();
    let _ = writeln!(stdout, "ready").and_then(|_| stdout.flush());

    if let Err(err) = broker.serve() {
        fatal(err);
    }
    process::exit(0)
}

fn fatal(err: impl Display) -> ! {
    tracing::error!(%err, "broker failed");
    eprintln!("fatal: {}", err);
    process::exit(1)
}
