//! Console input driver: stdin into the tunnel, tunnel onto stdout.

use bytes::Bytes;
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;

use super::DriverHandle;
use crate::bus::{Bus, Event};

pub fn spawn(bus: Bus) -> DriverHandle {
    let events = bus.subscribe();
    let task = tokio::spawn(run(bus, events));
    DriverHandle::from_tasks(vec![task])
}

async fn run(bus: Bus, mut events: UnboundedReceiver<Event>) {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 2048];

    // Bytes read before the session id is known are held back, as is an
    // early EOF.
    let mut session: Option<u16> = None;
    let mut pending: Vec<Bytes> = Vec::new();
    let mut eof_pending = false;
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::SessionCreated { session_id }) => {
                    session = Some(session_id);
                    for data in pending.drain(..) {
                        bus.publish(Event::DataOut { session_id, data });
                    }
                    if eof_pending {
                        bus.publish(Event::CloseSession { session_id });
                    }
                }
                Some(Event::DataIn { data, .. }) => {
                    if stdout.write_all(&data).await.is_err() {
                        if let Some(session_id) = session {
                            bus.publish(Event::CloseSession { session_id });
                        }
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Some(Event::SessionClosed { reason, .. }) => {
                    info!("console: session closed ({})", reason);
                    break;
                }
                Some(Event::Shutdown) | None => break,
                _ => {}
            },

            read = stdin.read(&mut buf), if stdin_open => match read {
                Ok(0) => {
                    debug!("console: stdin closed");
                    stdin_open = false;
                    match session {
                        Some(session_id) => bus.publish(Event::CloseSession { session_id }),
                        None => eof_pending = true,
                    }
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    match session {
                        Some(session_id) => bus.publish(Event::DataOut { session_id, data }),
                        None => pending.push(data),
                    }
                }
                Err(e) => {
                    debug!("console: stdin read error: {}", e);
                    stdin_open = false;
                    if let Some(session_id) = session {
                        bus.publish(Event::CloseSession { session_id });
                    }
                }
            },
        }
    }
}
