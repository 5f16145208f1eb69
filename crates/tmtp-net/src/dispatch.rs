//! Inbound frame dispatch: maps each relay op onto the store.
//!
//! Store calls block on file I/O, so each runs on the blocking pool. Fatal
//! store errors halt the process from there; anything else comes back as a
//! [`DispatchError::Store`] and the connection carries on.

use std::sync::Arc;

use tmtp_shared::constants::PRESENCE_ACK_ID;
use tmtp_shared::{Frame, ProtocolError, SendTag};
use tmtp_store::{OrHalt, Outcome, Service, StoreError};

use crate::error::DispatchError;

/// What an inbound frame amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The relay accepted our protocol revision.
    Revision { id: String },
    Registered { uid: String },
    /// Online list from the relay; `login` is set when it confirms a login.
    Online { count: usize, login: bool },
    Presence { uid: String, online: bool },
    Delivered { id: String, outcome: Outcome },
    /// A queued send was acknowledged and completed.
    Acked { id: String, outcome: Outcome },
    /// A queued send was refused and dropped.
    Rejected { id: String, error: String },
    /// Acknowledgement of the presence push after login.
    PresenceSynced,
    /// A relay op this client takes no part in (contact requests, group
    /// membership). Acknowledged and otherwise ignored.
    Unhandled { op: String, from: String },
    Quit,
}

impl Event {
    /// Queue id the waiting sender should hear about.
    pub fn ack_id(&self) -> Option<&str> {
        match self {
            Self::Acked { id, .. } | Self::Rejected { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Apply one frame to `service`.
pub async fn handle_frame(service: &Arc<Service>, frame: Frame) -> Result<Event, DispatchError> {
    let op = frame.header.op.clone();
    let header = &frame.header;
    match op.as_str() {
        "tmtp" => Ok(Event::Revision {
            id: header.id.clone(),
        }),
        "registered" => {
            let (uid, node) = (header.uid.clone(), header.node_id.clone());
            let event = Event::Registered { uid: uid.clone() };
            blocking(service, "registered", move |svc| svc.set_registered(&uid, &node)).await?;
            Ok(event)
        }
        "login" | "info" => {
            service.presence().set_online(&header.ohi);
            Ok(Event::Online {
                count: header.ohi.len(),
                login: op == "login" || header.info == "login ok",
            })
        }
        "ohi" => {
            let online = header.status == 1;
            service.presence().update_online(&header.from, online);
            Ok(Event::Presence {
                uid: header.from.clone(),
                online,
            })
        }
        "delivery" => {
            let id = header.id.clone();
            let outcome = blocking(service, "delivery", move |svc| {
                let confirm = frame.sub_head().and_then(|s| s.confirm.clone());
                match confirm {
                    Some(confirm) => {
                        svc.threads()
                            .store_forwarded(&frame.header, &confirm.id, &frame.data)
                    }
                    None => svc.threads().store_received(&frame.header, &frame.data),
                }
            })
            .await?;
            Ok(Event::Delivered { id, outcome })
        }
        "ack" => handle_ack(service, frame.header.id.clone(), frame.header.error.clone(), frame).await,
        "ping" | "invite" | "member" => {
            tracing::info!(service = %service.name(), op = %op, from = %header.from, "ignoring relay op");
            Ok(Event::Unhandled {
                op: op.clone(),
                from: header.from.clone(),
            })
        }
        "quit" => Ok(Event::Quit),
        other => Err(ProtocolError::InvalidHeader(format!("unknown op {other:?}")).into()),
    }
}

async fn handle_ack(
    service: &Arc<Service>,
    id: String,
    error: String,
    frame: Frame,
) -> Result<Event, DispatchError> {
    if id == PRESENCE_ACK_ID {
        if !error.is_empty() {
            tracing::warn!(service = %service.name(), error = %error, "presence push refused");
        }
        return Ok(Event::PresenceSynced);
    }
    if !error.is_empty() {
        let queued = id.clone();
        let reason = error.clone();
        blocking(service, "ack", move |svc| svc.record_failure(&queued, &reason)).await?;
        return Ok(Event::Rejected { id, error });
    }

    let tag = id
        .chars()
        .next()
        .ok_or_else(|| ProtocolError::InvalidHeader("ack without id".into()))?;
    let tag = SendTag::from_char(tag)?;
    let queued = id.clone();
    let outcome = blocking(service, "ack", move |svc| {
        let key = &queued[1..];
        match tag {
            SendTag::Thread => {
                svc.complete_sent(key, &frame.header.msg_id, &frame.header.posted)
            }
            SendTag::Presence => {
                let changed = svc.presence().apply_edit(key)?;
                svc.queue().drop_entry(&queued)?;
                Ok(if changed { Outcome::Done } else { Outcome::Unchanged })
            }
            SendTag::Forward => {
                svc.queue().drop_entry(&queued)?;
                Ok(Outcome::Done)
            }
        }
    })
    .await?;
    Ok(Event::Acked { id, outcome })
}

/// Run a store call on the blocking pool, halting on fatal errors.
async fn blocking<T, F>(service: &Arc<Service>, op: &'static str, f: F) -> Result<T, DispatchError>
where
    T: Send + 'static,
    F: FnOnce(&Service) -> Result<T, StoreError> + Send + 'static,
{
    let svc = service.clone();
    let result = tokio::task::spawn_blocking(move || f(svc.as_ref()).or_halt(op)).await?;
    result.map_err(|e| {
        tracing::warn!(service = %service.name(), op, error = %e, "store refused frame");
        DispatchError::Store(e)
    })
}
