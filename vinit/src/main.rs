mod mount;
mod vsock;

use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use tracing::{error, info, warn};

use vsock::{Frame, VsockListener};

const CONTAINER_ROOT: &str = "/mnt/container";

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        error!("vinit failed: {err:#}");
        // give the console a moment to flush before the kernel panics/halts.
        std::thread::sleep(std::time::Duration::from_millis(200));
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    info!("mounting essential filesystems");
    mount::mount_essential()?;

    info!("chrooting into container root at {CONTAINER_ROOT}");
    mount::chroot_into(CONTAINER_ROOT)?;

    reap_zombies_in_background();

    info!("signaling boot complete on vsock:{}", vsock::BOOT_PORT);
    announce_boot_complete()?;

    info!("listening for commands on vsock:{}", vsock::COMMAND_PORT);
    serve_commands()
}

/// vinit runs as pid 1 inside the VM; nothing else reaps orphaned children,
/// so it must.
fn reap_zombies_in_background() {
    std::thread::spawn(|| loop {
        match nix::sys::wait::waitpid(
            nix::unistd::Pid::from_raw(-1),
            Some(nix::sys::wait::WaitPidFlag::__WALL),
        ) {
            Ok(_) => {}
            Err(nix::errno::Errno::ECHILD) => {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            Err(e) => {
                warn!("waitpid failed: {e}");
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        }
    });
}

fn announce_boot_complete() -> anyhow::Result<()> {
    let listener = VsockListener::bind(vsock::BOOT_PORT)?;
    let mut stream = listener.accept()?;
    stream.send_frame(&Frame::BootComplete)?;
    Ok(())
}

/// Serves one `Exec` request per connection: the host's `CommandContext`
/// opens a fresh connection for each program it runs.
fn serve_commands() -> anyhow::Result<()> {
    let listener = VsockListener::bind(vsock::COMMAND_PORT)?;
    loop {
        let mut stream = match listener.accept() {
            Ok(s) => s,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        let frame = match stream.recv_frame() {
            Ok(f) => f,
            Err(e) => {
                warn!("recv_frame failed: {e}");
                continue;
            }
        };

        let Frame::Exec { path, argv, env, cwd } = frame else {
            warn!("unexpected frame on command channel");
            continue;
        };

        let result = exec_one(&path, &argv, &env, &cwd);
        if let Err(e) = stream.send_frame(&result) {
            warn!("send_frame failed: {e}");
        }
    }
}

fn exec_one(path: &str, argv: &[String], env: &[(String, String)], cwd: &str) -> Frame {
    let mut cmd = Command::new(path);
    cmd.args(argv);
    cmd.current_dir(cwd);
    cmd.env_clear();
    for (k, v) in env {
        cmd.env(k, v);
    }

    match cmd.output() {
        Ok(output) => Frame::ExecResult {
            exit_code: output.status.code().unwrap_or_else(|| 128 + output.status.signal().unwrap_or(0)),
            stdout: output.stdout,
            stderr: output.stderr,
        },
        Err(e) => Frame::ExecResult {
            exit_code: -1,
            stdout: Vec::new(),
            stderr: format!("exec {path} failed: {e}").into_bytes(),
        },
    }
}
