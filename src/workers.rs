//! Multi-process worker model.
//!
//! The supervising process forks N workers before any tokio runtime exists.
//! Each worker binds the secure/plaintext ports with `SO_REUSEPORT` and
//! serves gRPC; the supervisor keeps the health-check listener and owns
//! teardown: SIGTERM to every worker, a bounded wait, then SIGKILL for
//! stragglers. Workers share nothing at runtime.

use crate::server::{CalloutServer, Role, ServerError};

#[cfg(unix)]
use std::time::{Duration, Instant};
#[cfg(unix)]
use tracing::{error, info, warn};

impl CalloutServer {
    pub(crate) fn run_multi_process(&self) -> Result<(), ServerError> {
        #[cfg(unix)]
        {
            self.run_forked_workers()
        }
        #[cfg(not(unix))]
        {
            tracing::warn!("multi-process serving requires unix, falling back to one process");
            let runtime = self.build_runtime()?;
            runtime.block_on(self.serve_until_shutdown(Role::All, false))
        }
    }

    #[cfg(unix)]
    fn run_forked_workers(&self) -> Result<(), ServerError> {
        let num_processes = self.config().num_processes;
        info!("starting {num_processes} gRPC worker process(es)");

        let mut workers: Vec<libc::pid_t> = Vec::with_capacity(num_processes);
        for index in 0..num_processes {
            // Fork happens before any runtime is built; each side creates its
            // own below.
            match unsafe { libc::fork() } {
                -1 => {
                    warn!(
                        "fork for worker {index} failed: {}",
                        std::io::Error::last_os_error()
                    );
                }
                0 => {
                    let code = match self.run_worker(index) {
                        Ok(()) => 0,
                        Err(err) => {
                            error!("gRPC worker {index} failed: {err}");
                            1
                        }
                    };
                    // The worker never returns into the supervisor's run().
                    std::process::exit(code);
                }
                pid => {
                    info!("gRPC worker {index} started (pid {pid})");
                    workers.push(pid);
                }
            }
        }
        if workers.is_empty() {
            return Err(ServerError::NoListeners);
        }

        let result = self
            .build_runtime()?
            .block_on(self.serve_until_shutdown(Role::HealthOnly, false));

        terminate_workers(&workers, self.config().shutdown_grace);
        result
    }

    #[cfg(unix)]
    fn run_worker(&self, index: usize) -> Result<(), ServerError> {
        let runtime = self.build_runtime()?;
        info!("gRPC worker {index} serving");
        runtime.block_on(self.serve_until_shutdown(Role::GrpcOnly, true))
    }
}

/// SIGTERM every worker, reap them within the grace period, SIGKILL the rest.
/// Teardown failures are logged, never propagated.
#[cfg(unix)]
fn terminate_workers(workers: &[libc::pid_t], grace: Duration) {
    for &pid in workers {
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
    // Workers drain their own streams; give them the same grace we give
    // in-process drains, plus slack for runtime teardown.
    let deadline = Instant::now() + grace + Duration::from_secs(5);
    for &pid in workers {
        let mut status: libc::c_int = 0;
        loop {
            let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if reaped == pid || reaped == -1 {
                info!("worker pid {pid} joined");
                break;
            }
            if Instant::now() >= deadline {
                warn!("worker pid {pid} did not exit gracefully, terminating");
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                    libc::waitpid(pid, &mut status, 0);
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
    info!("all gRPC worker processes joined");
}
