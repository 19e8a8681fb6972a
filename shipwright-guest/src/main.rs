//! shipwright bootstrap client — runs inside the builder micro-VM guest,
//! typically as PID 1.
//!
//! Reads its connection parameters from the MMDS boot channel, dials the
//! host's bootstrap server over mutual TLS, executes the build plan it
//! receives, and reports success or failure. There is no long-lived service:
//! once the plan completes (or fails) the process exits.
#![allow(clippy::print_stderr)]

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("shipwright-guest only runs inside a Linux micro-VM");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod client;
#[cfg(target_os = "linux")]
mod run;
#[cfg(target_os = "linux")]
mod transfer;

#[cfg(target_os = "linux")]
#[tokio::main(flavor = "multi_thread")]
async fn main() {
    // PID 1 duty: auto-reap zombie children left behind by `RUN` steps that
    // spawn background processes.
    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    match client::run_once().await {
        Ok(true) => {
            tracing::info!("build plan completed successfully");
            std::process::exit(0);
        }
        Ok(false) => {
            tracing::error!("build plan aborted after a failed step");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("[shipwright-guest] {e}");
            std::process::exit(1);
        }
    }
}
