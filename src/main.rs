use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd,
    path::PathBuf,
    process::ExitCode,
};

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zprd::{Config, Node};

const DEFAULT_CONFIG_PATH: &str = "/etc/zprd.conf";

#[tokio::main]
async fn main() -> ExitCode {
    let mut confpath = PathBuf::from(DEFAULT_CONFIG_PATH);
    for arg in std::env::args().skip(1) {
        if arg == "-h" || arg == "--help" {
            println!("USAGE: zprd [--help] [L<logfile>] [C<conffile>]");
            return ExitCode::SUCCESS;
        }
        match arg.chars().next() {
            Some('L') => {
                if let Err(e) = redirect_output(&arg[1..]) {
                    eprintln!("STARTUP ERROR: unable to open logfile '{}': {e}", &arg[1..]);
                    return ExitCode::FAILURE;
                }
            }
            Some('C') => confpath = PathBuf::from(&arg[1..]),
            _ => {}
        }
    }

    // Don't block any terminal through an inherited stdin.
    if let Err(e) = redirect_stdin() {
        eprintln!("STARTUP ERROR: unable to redirect stdin: {e}");
        return ExitCode::FAILURE;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load(&confpath).await {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config from {}: {e}", confpath.display());
            return ExitCode::FAILURE;
        }
    };
    let run_as_user = config.run_as_user.clone();

    let node = match Node::new(config).await {
        Ok(node) => node,
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The TUN device and sockets exist, root is no longer needed.
    if let Some(user) = run_as_user {
        if let Err(e) = drop_privileges(&user) {
            error!("failed to drop privileges to '{user}': {e}");
            return ExitCode::FAILURE;
        }
    }

    let mut sigint = signal(SignalKind::interrupt()).expect("can install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("can install SIGTERM handler");
    let mut sigusr1 = signal(SignalKind::user_defined1()).expect("can install SIGUSR1 handler");
    let mut sighup = signal(SignalKind::hangup()).expect("can install SIGHUP handler");

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sigusr1.recv() => node.dump_routes(),
            // SIGHUP is ignored; consuming it here keeps the default
            // terminate action from firing.
            _ = sighup.recv() => {}
        }
    }

    node.shutdown().await;
    info!("quit");
    ExitCode::SUCCESS
}

/// Send stdout and stderr to a logfile, like the original daemon: the file
/// descriptors themselves are replaced, so the log subscriber and the
/// routing table dumps both land there.
fn redirect_output(path: &str) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    for fd in [1, 2] {
        if unsafe { libc::dup2(file.as_raw_fd(), fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn redirect_stdin() -> io::Result<()> {
    let null = File::open("/dev/null")?;
    if unsafe { libc::dup2(null.as_raw_fd(), 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Drop to the configured user, with `nogroup` as the only group.
fn drop_privileges(username: &str) -> Result<(), Box<dyn std::error::Error>> {
    use nix::unistd::{setgid, setgroups, setuid, Group, User};

    let user = User::from_name(username)?
        .ok_or_else(|| io::Error::other(format!("unknown user '{username}'")))?;
    let group = Group::from_name("nogroup")?
        .ok_or_else(|| io::Error::other("unknown group 'nogroup'"))?;

    info!("running daemon as user '{username}', group 'nogroup'");
    setgroups(&[group.gid])?;
    setgid(group.gid)?;
    setuid(user.uid)?;
    Ok(())
}
