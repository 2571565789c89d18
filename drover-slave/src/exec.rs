//! Command execution with streamed output.
//!
//! The sub-protocol: an empty ack box once the process is spawned, then one
//! `{data, stream}` box per readable chunk of stdout/stderr, then a final
//! `{result: exit_code}` box. Stream readiness is multiplexed so a full pipe
//! on one stream cannot deadlock the other, and process exit is polled on a
//! timeout that starts at 10ms and doubles to a 1s ceiling while no data is
//! flowing.

use crate::error::OpFault;
use drover_proto::{ErrTag, Message, Transport, Wire, CHUNK_SIZE};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

const POLL_FLOOR: Duration = Duration::from_millis(10);
const POLL_CEILING: Duration = Duration::from_secs(1);

/// Spawns `args` in `cwd` and streams its output over `wire`.
pub async fn run<T: Transport>(
    wire: &mut Wire<T>,
    cwd: &Path,
    args: &[String],
    want_stdout: bool,
    want_stderr: bool,
) -> Result<(), OpFault> {
    let mut command = Command::new(&args[0]);
    command
        .args(&args[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(if want_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(if want_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return Err(OpFault::os(ErrTag::ExecFailed, &e)),
    };
    tracing::debug!("spawned {:?} (pid {:?})", args[0], child.id());

    // Accepted: the master may now expect data boxes.
    wire.send(&Message::new()).await?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; CHUNK_SIZE];
    let mut err_buf = vec![0u8; CHUNK_SIZE];
    let mut poll = POLL_FLOOR;

    loop {
        if stdout.is_none() && stderr.is_none() {
            break;
        }

        // Disabled branches still build their futures, so the reads live in
        // async blocks that only touch the stream once polled.
        tokio::select! {
            n = async { stdout.as_mut().unwrap().read(&mut out_buf).await }, if stdout.is_some() => {
                match n {
                    Ok(0) => stdout = None,
                    Ok(n) => {
                        poll = POLL_FLOOR;
                        send_chunk(wire, "stdout", &out_buf[..n]).await?;
                    }
                    Err(e) => {
                        tracing::warn!("stdout read failed: {}", e);
                        stdout = None;
                    }
                }
            }
            n = async { stderr.as_mut().unwrap().read(&mut err_buf).await }, if stderr.is_some() => {
                match n {
                    Ok(0) => stderr = None,
                    Ok(n) => {
                        poll = POLL_FLOOR;
                        send_chunk(wire, "stderr", &err_buf[..n]).await?;
                    }
                    Err(e) => {
                        tracing::warn!("stderr read failed: {}", e);
                        stderr = None;
                    }
                }
            }
            _ = tokio::time::sleep(poll) => {
                // No data this round; back off the exit poll.
                poll = std::cmp::min(poll * 2, POLL_CEILING);
                let _ = child.try_wait();
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| OpFault::os(ErrTag::Failed, &e))?;
    let code = exit_code(&status);
    tracing::debug!("process exited with {}", code);

    wire.send(&Message::new().with("result", code.to_string()))
        .await?;
    Ok(())
}

async fn send_chunk<T: Transport>(
    wire: &mut Wire<T>,
    stream: &'static str,
    data: &[u8],
) -> Result<(), OpFault> {
    let msg = Message::new()
        .with("stream", stream)
        .with("data", data.to_vec());
    wire.send(&msg).await?;
    Ok(())
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}
