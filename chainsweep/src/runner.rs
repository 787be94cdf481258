//! Per-case process choreography: server up, client handshake, server down.
//!
//! Each test case runs strictly sequentially: the server must be listening
//! before the client connects, and the server is terminated and reaped
//! before the next case starts, so the shared port is free and no child or
//! pipe fd outlives its case. The server child is held in a guard with
//! kill-on-drop, which covers the error and cancellation paths the explicit
//! shutdown doesn't reach.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    process::{Child, Command},
    time::{self, Instant},
};
use tracing::{debug, warn};

use crate::{
    bundle::TestCase,
    error::{FatalError, ServerStartError},
    report::{HandshakeResult, Outcome},
    tls,
};

/// How long to wait for the server socket to accept connections.
const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval while waiting for the server socket.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Upper bound on one verifying-client run.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(15);
/// Grace period between the termination signal and SIGKILL at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Everything fixed across the sweep. The port (with the loopback address)
/// is the one piece of shared state between cases; sequential execution is
/// what keeps it conflict-free.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub server_bin: PathBuf,
    pub client_bin: String,
    pub key_path: PathBuf,
    pub trust_root_path: PathBuf,
    pub port: u16,
    pub sni: String,
}

pub struct HandshakeRunner {
    config: RunnerConfig,
}

impl HandshakeRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Run one test case end to end. TLS rejections and server-side failures
    /// are recorded in the returned result; only a verifying client the
    /// harness cannot run aborts the sweep.
    pub async fn run_case(
        &self,
        case: &TestCase,
        bundle_path: &Path,
    ) -> Result<HandshakeResult, FatalError> {
        let mut cmd = self.server_command(bundle_path);
        let mut server =
            match ServerProcess::spawn(&mut cmd, &self.config.server_bin) {
                Ok(server) => server,
                Err(err) => {
                    let outcome =
                        Outcome::ServerError { reason: err.to_string() };
                    return Ok(self.result(case, bundle_path, outcome, String::new()));
                }
            };

        let outcome = match server
            .wait_ready(self.listen_addr(), SERVER_READY_TIMEOUT)
            .await
        {
            Ok(()) => self.run_client().await,
            Err(err) => Ok(Outcome::ServerError { reason: err.to_string() }),
        };

        // Tear the server down even when the client step failed, so the
        // port is free for the next case.
        let log = server.shutdown().await;
        debug!("server exited: {:?}", log.status);

        let outcome = outcome?;
        Ok(self.result(case, bundle_path, outcome, log.stderr))
    }

    fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.config.port))
    }

    fn server_command(&self, bundle_path: &Path) -> Command {
        let mut cmd = Command::new(&self.config.server_bin);
        cmd.arg(bundle_path)
            .arg(&self.config.key_path)
            .arg("--listen")
            .arg(self.listen_addr().to_string());
        cmd
    }

    /// Run the verifying client against the listening server. Exit status 0
    /// means the handshake and chain verification succeeded.
    async fn run_client(&self) -> Result<Outcome, FatalError> {
        let config = &self.config;

        let mut cmd = Command::new(&config.client_bin);
        cmd.args(["s_client", "-connect"])
            .arg(self.listen_addr().to_string())
            .arg("-servername")
            .arg(&config.sni)
            .arg("-CAfile")
            .arg(&config.trust_root_path)
            // Plain s_client exits 0 even when verification fails; this
            // makes the exit status the verification verdict.
            .arg("-verify_return_error")
            .arg("-showcerts")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            FatalError::harness(
                format!("failed to spawn verifying client `{}`", config.client_bin),
                err,
            )
        })?;

        // End the client's session once the handshake settles. A client
        // that already exited (fast rejection) makes this a broken pipe,
        // which is fine.
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"quit\n").await;
        }

        let output = time::timeout(CLIENT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_elapsed| {
                FatalError::harness_msg(format!(
                    "verifying client still running after {}s",
                    CLIENT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|err| {
                FatalError::harness("failed to collect client output", err)
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            Ok(Outcome::Accepted { client_stdout: stdout })
        } else {
            Ok(Outcome::Rejected {
                exit_code: output.status.code(),
                client_stderr: stderr,
            })
        }
    }

    fn result(
        &self,
        case: &TestCase,
        bundle_path: &Path,
        outcome: Outcome,
        server_stderr: String,
    ) -> HandshakeResult {
        HandshakeResult {
            scenario: case.scenario,
            ca_order: case.bundle.ca_names(),
            bundle_file: bundle_path.to_path_buf(),
            chain: tls::describe_chain(case.bundle.to_pem().as_bytes()),
            outcome,
            server_stderr,
        }
    }
}

/// Guard around the TLS server child. Spawned with kill-on-drop so the
/// child is killed on every exit path; `shutdown` is the graceful path
/// (termination signal, bounded wait, SIGKILL escalation, reap).
#[derive(Debug)]
struct ServerProcess {
    child: Child,
}

/// What the server left behind after shutdown.
struct ServerLog {
    status: Option<ExitStatus>,
    stderr: String,
}

impl ServerProcess {
    fn spawn(cmd: &mut Command, bin: &Path) -> Result<Self, ServerStartError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ServerStartError::Spawn {
            bin: bin.to_path_buf(),
            source,
        })?;
        Ok(Self { child })
    }

    /// Poll `addr` until the server accepts a TCP connection, it exits, or
    /// `timeout` expires. The probe connection is dropped immediately; the
    /// server treats it as a failed handshake, which it tolerates.
    async fn wait_ready(
        &mut self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<(), ServerStartError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                let stderr = self.drain_stderr().await;
                return Err(ServerStartError::ExitedEarly { status, stderr });
            }

            match time::timeout(READY_POLL_INTERVAL, TcpStream::connect(addr))
                .await
            {
                Ok(Ok(_probe)) => return Ok(()),
                Ok(Err(_)) | Err(_) => (),
            }

            if Instant::now() >= deadline {
                return Err(ServerStartError::NotListening {
                    addr,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Graceful stop: termination signal, bounded wait, SIGKILL if ignored.
    /// Always reaps the child before returning.
    async fn shutdown(mut self) -> ServerLog {
        self.terminate();

        let status = match time::timeout(SHUTDOWN_GRACE, self.child.wait())
            .await
        {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                warn!("failed to reap server: {err}");
                None
            }
            Err(_elapsed) => {
                warn!("server ignored termination signal; killing");
                if let Err(err) = self.child.start_kill() {
                    warn!("failed to kill server: {err}");
                }
                self.child.wait().await.ok()
            }
        };

        let stderr = self.drain_stderr().await;
        ServerLog { status, stderr }
    }

    // SIGTERM lets the server log its shutdown line; `shutdown` escalates
    // to SIGKILL if it is ignored.
    #[cfg(unix)]
    fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Read whatever the (exited) server wrote to stderr.
    async fn drain_stderr(&mut self) -> String {
        let mut buf = String::new();
        if let Some(mut stderr) = self.child.stderr.take() {
            let _ = stderr.read_to_string(&mut buf).await;
        }
        buf
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::logger;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    fn test_config() -> RunnerConfig {
        RunnerConfig {
            server_bin: PathBuf::from("chainsweep-server"),
            client_bin: "openssl".to_owned(),
            key_path: PathBuf::from("server.key"),
            trust_root_path: PathBuf::from("root-ca.pem"),
            port: 0,
            sni: "localhost".to_owned(),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_a_server_start_error() {
        let bin = Path::new("/definitely/not/a/real/binary");
        let mut cmd = Command::new(bin);
        let err = ServerProcess::spawn(&mut cmd, bin).unwrap_err();
        assert!(matches!(err, ServerStartError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ready_wait_detects_early_exit() {
        logger::init_for_testing();

        let mut server =
            ServerProcess::spawn(&mut sh("echo boom >&2; exit 3"), Path::new("sh"))
                .unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], 1));

        let err = server
            .wait_ready(addr, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ServerStartError::ExitedEarly { status, stderr } => {
                assert_eq!(status.code(), Some(3));
                assert!(stderr.contains("boom"), "{stderr}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ready_wait_times_out_when_never_listening() {
        let mut server =
            ServerProcess::spawn(&mut sh("sleep 5"), Path::new("sh")).unwrap();
        // Port 1 on loopback refuses connections quickly.
        let addr = SocketAddr::from(([127, 0, 0, 1], 1));

        let err = server
            .wait_ready(addr, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerStartError::NotListening { .. }));

        let _ = server.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ready_wait_connects_to_listening_socket() {
        let listener =
            tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut server =
            ServerProcess::spawn(&mut sh("sleep 5"), Path::new("sh")).unwrap();
        server.wait_ready(addr, Duration::from_secs(5)).await.unwrap();

        // The child was still sleeping; shutdown must signal and reap it.
        let log = server.shutdown().await;
        assert!(log.status.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn client_exit_status_classifies_outcome() {
        let mut config = test_config();
        config.client_bin = "true".to_owned();
        let runner = HandshakeRunner::new(config);
        assert!(matches!(
            runner.run_client().await.unwrap(),
            Outcome::Accepted { .. }
        ));

        let mut config = test_config();
        config.client_bin = "false".to_owned();
        let runner = HandshakeRunner::new(config);
        match runner.run_client().await.unwrap() {
            Outcome::Rejected { exit_code, .. } =>
                assert_eq!(exit_code, Some(1)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unspawnable_client_is_fatal() {
        let mut config = test_config();
        config.client_bin = "/definitely/not/openssl".to_owned();
        let runner = HandshakeRunner::new(config);
        assert!(matches!(
            runner.run_client().await,
            Err(FatalError::Harness { .. })
        ));
    }
}
