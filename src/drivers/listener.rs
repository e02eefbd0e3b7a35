//! TCP listener input driver.
//!
//! The first connection attaches to the session; the tunnel protocol has
//! no multiplexing, so anything that connects after it is turned away.

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

use super::DriverHandle;
use crate::bus::{Bus, Event};
use crate::Error;

pub async fn spawn(bus: Bus, port: u16) -> Result<DriverHandle, Error> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::Driver(format!("cannot listen on port {}: {}", port, e)))?;
    info!("listening on port {}", port);

    let events = bus.subscribe();
    let task = tokio::spawn(run(bus, events, listener));
    Ok(DriverHandle::from_tasks(vec![task]))
}

async fn run(bus: Bus, mut events: UnboundedReceiver<Event>, listener: TcpListener) {
    let mut session: Option<u16> = None;

    // Phase one: wait for the connection that attaches.
    let stream = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::SessionCreated { session_id }) => session = Some(session_id),
                Some(Event::SessionClosed { .. }) | Some(Event::Shutdown) | None => return,
                _ => {}
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("connection from {} attached to the session", peer);
                    break stream;
                }
                Err(e) => warn!("accept failed: {}", e),
            },
        }
    };

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; 2048];
    let mut pending: Vec<Bytes> = Vec::new();
    let mut eof_pending = false;
    let mut conn_open = true;

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
                    if writer.write_all(&data).await.is_err() {
                        debug!("listener: peer went away");
                        if let Some(session_id) = session {
                            bus.publish(Event::CloseSession { session_id });
                        }
                        break;
                    }
                }
                Some(Event::SessionClosed { reason, .. }) => {
                    info!("listener: session closed ({})", reason);
                    break;
                }
                Some(Event::Shutdown) | None => break,
                _ => {}
            },

            read = reader.read(&mut buf), if conn_open => match read {
                Ok(0) => {
                    debug!("listener: connection closed by peer");
                    conn_open = false;
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
                    debug!("listener: read error: {}", e);
                    conn_open = false;
                    if let Some(session_id) = session {
                        bus.publish(Event::CloseSession { session_id });
                    }
                }
            },

            // One session per process: later connections are refused.
            accepted = listener.accept() => if let Ok((_, peer)) = accepted {
                warn!("refusing connection from {}: a session is already live", peer);
            },
        }
    }
}
