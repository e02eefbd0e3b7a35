//! Exec input driver: bridge a child process to the tunnel.
//!
//! The child's stdout feeds the session, the session feeds its stdin, and
//! stderr lines go to the log. When the child exits the session is closed.

use std::process::Stdio;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedReceiver;

use super::DriverHandle;
use crate::bus::{Bus, Event};
use crate::Error;

pub fn spawn(bus: Bus, program: String) -> Result<DriverHandle, Error> {
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(&program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Driver(format!("cannot spawn {}: {}", program, e)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Driver("child stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Driver("child stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Driver("child stderr not captured".to_string()))?;

    info!("executing: {}", program);
    let events = bus.subscribe();
    let task = tokio::spawn(run(bus, events, child, stdin, stdout, stderr));
    Ok(DriverHandle::from_tasks(vec![task]))
}

async fn run(
    bus: Bus,
    mut events: UnboundedReceiver<Event>,
    mut child: tokio::process::Child,
    mut stdin: tokio::process::ChildStdin,
    mut stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
) {
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut buf = vec![0u8; 2048];
    let mut session: Option<u16> = None;
    let mut pending: Vec<Bytes> = Vec::new();
    let mut stdout_open = true;
    let mut stderr_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::SessionCreated { session_id }) => {
                    session = Some(session_id);
                    for data in pending.drain(..) {
                        bus.publish(Event::DataOut { session_id, data });
                    }
                }
                Some(Event::DataIn { data, .. }) => {
                    if stdin.write_all(&data).await.is_err() {
                        debug!("exec: child stdin closed");
                        if let Some(session_id) = session {
                            bus.publish(Event::CloseSession { session_id });
                        }
                    }
                }
                Some(Event::SessionClosed { reason, .. }) => {
                    info!("exec: session closed ({})", reason);
                    break;
                }
                Some(Event::Shutdown) | None => break,
                _ => {}
            },

            read = stdout.read(&mut buf), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    match session {
                        Some(session_id) => bus.publish(Event::DataOut { session_id, data }),
                        None => pending.push(data),
                    }
                }
                Err(e) => {
                    debug!("exec: stdout read error: {}", e);
                    stdout_open = false;
                }
            },

            line = stderr_lines.next_line(), if stderr_open => match line {
                Ok(Some(line)) => warn!("exec stderr: {}", line),
                Ok(None) => stderr_open = false,
                Err(e) => {
                    debug!("exec: stderr read error: {}", e);
                    stderr_open = false;
                }
            },

            status = child.wait() => {
                match status {
                    Ok(status) => info!("exec: child exited with {}", status),
                    Err(e) => warn!("exec: wait failed: {}", e),
                }
                if let Some(session_id) = session {
                    bus.publish(Event::CloseSession { session_id });
                }
                break;
            }
        }
    }
}
