//! External container runtime (podman- or docker-compatible).
//!
//! Only the common verb subset is used: `build`, `run`, `stop`, `rm`,
//! `exec`, `logs`, `ps`. Every invocation carries a per-operation timeout;
//! exceeding it kills the child and yields `RUNTIME_TIMEOUT`.

use std::{
    env,
    ffi::OsStr,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
    sync::mpsc,
    thread,
    time::Duration,
};

use log::debug;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::{Error, Result};

/// Environment variable naming the runtime binary.
pub const RUNTIME_ENV_VAR: &str = "CONTAINER_CMD";

pub const BUILD_TIMEOUT: Duration = Duration::from_secs(120);
pub const START_STOP_TIMEOUT: Duration = Duration::from_secs(30);
pub const RELOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle on the container runtime binary.
#[derive(Debug, Clone)]
pub struct Runtime {
    program: PathBuf,
}

impl Runtime {
    /// Locates the runtime: `CONTAINER_CMD`, else `podman`, else `docker`.
    pub fn detect() -> Result<Self> {
        if let Ok(name) = env::var(RUNTIME_ENV_VAR) {
            if !name.is_empty() {
                let program = which::which(&name)
                    .map_err(|e| Error::RuntimeUnavailable(format!("{}: {}", name, e)))?;
                return Ok(Self { program });
            }
        }
        for candidate in ["podman", "docker"] {
            if let Ok(program) = which::which(candidate) {
                return Ok(Self { program });
            }
        }
        Err(Error::RuntimeUnavailable(
            "no podman or docker binary on PATH".to_string(),
        ))
    }

    /// Uses an explicit binary; tests point this at a stub.
    pub fn with_program<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn invoke<I, S>(&self, operation: &str, args: I, timeout: Duration) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(
            "invoking {:?} {:?}",
            self.program,
            command.get_args().collect::<Vec<_>>()
        );

        let child = command.spawn().map_err(|e| {
            Error::RuntimeUnavailable(format!("{}: {}", self.program.display(), e))
        })?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel();
        let operation_name = operation.to_string();
        thread::spawn(move || {
            tx.send(child.wait_with_output()).ok();
        });

        let output = match rx.recv_timeout(timeout) {
            Ok(result) => result.map_err(|e| Error::io(&self.program, e))?,
            Err(_) => {
                kill(Pid::from_raw(pid as i32), Signal::SIGKILL).ok();
                return Err(Error::RuntimeTimeout {
                    operation: operation_name,
                    timeout,
                });
            }
        };

        if !output.status.success() {
            return Err(Error::RuntimeError {
                operation: operation_name,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    pub fn build(&self, image_tag: &str, context: &Path, no_cache: bool) -> Result<()> {
        let mut args = vec!["build".to_string(), "-t".to_string(), image_tag.to_string()];
        if no_cache {
            args.push("--no-cache".to_string());
        }
        args.push(context.display().to_string());
        self.invoke("build", args, BUILD_TIMEOUT)?;
        Ok(())
    }

    /// `run` with a fully composed argument vector (everything after the
    /// verb itself).
    pub fn run(&self, args: &[String]) -> Result<()> {
        let mut full = vec!["run".to_string()];
        full.extend_from_slice(args);
        self.invoke("run", full, START_STOP_TIMEOUT)?;
        Ok(())
    }

    pub fn stop(&self, container: &str) -> Result<()> {
        self.invoke("stop", ["stop", container], START_STOP_TIMEOUT)?;
        Ok(())
    }

    pub fn rm(&self, container: &str) -> Result<()> {
        self.invoke("rm", ["rm", "-f", container], START_STOP_TIMEOUT)?;
        Ok(())
    }

    /// Executes a command inside a running container.
    pub fn exec(&self, container: &str, command: &[String], timeout: Duration) -> Result<String> {
        let mut args = vec!["exec".to_string(), container.to_string()];
        args.extend_from_slice(command);
        let output = self.invoke("exec", args, timeout)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub fn logs(&self, container: &str) -> Result<String> {
        let output = self.invoke("logs", ["logs", container], START_STOP_TIMEOUT)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Lists all containers known to the runtime.
    pub fn ps(&self) -> Result<Vec<PsEntry>> {
        let output = self.invoke(
            "ps",
            ["ps", "--all", "--format", "{{.Names}}|{{.Ports}}"],
            START_STOP_TIMEOUT,
        )?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().filter_map(PsEntry::parse).collect())
    }

    pub fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.ps()?.iter().any(|e| e.name == name))
    }
}

/// One `ps` line: container name plus its raw port bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsEntry {
    pub name: String,
    pub ports: String,
}

impl PsEntry {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (name, ports) = line.split_once('|')?;
        Some(Self {
            name: name.trim().to_string(),
            ports: ports.trim().to_string(),
        })
    }

    /// Host ports bound by this container, parsed from strings like
    /// `0.0.0.0:8180->80/tcp, :::8180->80/tcp`.
    pub fn host_ports(&self) -> Vec<u16> {
        let mut ports = vec![];
        for binding in self.ports.split(',') {
            let Some((host, _)) = binding.split_once("->") else {
                continue;
            };
            if let Some(port) = host.trim().rsplit(':').next() {
                if let Ok(port) = port.parse::<u16>() {
                    if !ports.contains(&port) {
                        ports.push(port);
                    }
                }
            }
        }
        ports
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use test_log::test;

    use super::{PsEntry, Runtime};
    use crate::Error;

    #[test]
    fn test_ps_entry_parsing() {
        let entry =
            PsEntry::parse("net-servers-apache-testing|0.0.0.0:8180->80/tcp, :::8180->80/tcp")
                .unwrap();
        assert_eq!(entry.name, "net-servers-apache-testing");
        assert_eq!(entry.host_ports(), vec![8180]);

        assert!(PsEntry::parse("").is_none());
        assert!(PsEntry::parse("   ").is_none());
    }

    #[test]
    fn test_exec_success_and_failure() {
        let ok = Runtime::with_program("/bin/true");
        ok.exec("whatever", &["noop".to_string()], Duration::from_secs(5))
            .unwrap();

        let fail = Runtime::with_program("/bin/false");
        assert!(matches!(
            fail.exec("whatever", &["noop".to_string()], Duration::from_secs(5)),
            Err(Error::RuntimeError { .. })
        ));
    }

    #[test]
    fn test_timeout_kills_child() {
        let slow = Runtime::with_program("/bin/sleep");
        let err = slow
            .invoke("sleep", ["5"], Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, Error::RuntimeTimeout { .. }));
    }

    #[test]
    fn test_missing_binary() {
        let gone = Runtime::with_program("/nonexistent/daemon");
        assert!(matches!(
            gone.exec("x", &[], Duration::from_secs(1)),
            Err(Error::RuntimeUnavailable(_))
        ));
    }
}
