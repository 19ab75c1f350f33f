//! Inbound connection admission.
//!
//! Every peer goes through the same gate before it can route traffic:
//!
//! 1. `query-meta` is sent; the peer has a bounded window to answer.
//! 2. The `meta-info` payload is parsed as a schema.
//! 3. The model name must not collide with an already-admitted model.
//! 4. Frames received in the meantime (other than meta traffic) are held in
//!    a bounded FIFO and drained, in arrival order, once the peer is
//!    promoted to a routable connection.
//!
//! Rejections broadcast an advisory event -- delivered to the offender too,
//! subscribed or not -- then close after a short grace so the offender can
//! read it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tm_link::{Connection, Transport};
use tm_meta::Meta;
use tm_protocol::{DecodeError, Frame};

use crate::core::ProxyCore;

/// Where an inbound peer stands in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    AwaitingMeta,
    Validating,
    Admitted,
    Rejected,
}

/// Run one inbound transport through the admission pipeline.  On success the
/// transport is promoted into an attached [`Connection`]; on failure it is
/// closed and discarded.
pub async fn handle_incoming(core: ProxyCore, transport: Transport) {
    let peer = transport.peer_addr().to_owned();
    let (mut reader, mut writer) = transport.split();
    let mut state = AdmissionState::AwaitingMeta;
    info!(%peer, ?state, "peer connected");

    // Step 1: ask for the schema.
    let query = match Frame::QueryMeta.encode() {
        Ok(text) => text,
        Err(_) => return,
    };
    core.tap_out(&peer, &query);
    if writer.write_message(&query).await.is_err() {
        return;
    }

    // Step 2: wait for meta-info, buffering everything else.
    let mut backlog: Vec<String> = Vec::new();
    let deadline = tokio::time::sleep(core.config().meta_wait);
    tokio::pin!(deadline);

    let meta_doc = loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!(%peer, "schema wait timed out");
                writer.close().await;
                return;
            }
            msg = reader.read_message() => match msg {
                Ok(Some(text)) => {
                    core.tap_in(&peer, &text);
                    match Frame::decode(&text) {
                        Ok(Frame::MetaInfo(doc)) => break doc,
                        Ok(Frame::QueryMeta) => {
                            // The peer wants our schema too; answer inline.
                            if let Ok(reply) = Frame::MetaInfo(core.host().meta_json()).encode() {
                                core.tap_out(&peer, &reply);
                                let _ = writer.write_message(&reply).await;
                            }
                        }
                        Ok(_) | Err(DecodeError::Payload { .. }) | Err(DecodeError::UnknownKind(_)) => {
                            if backlog.len() < core.config().backlog_cap {
                                backlog.push(text);
                            } else {
                                warn!(%peer, "pre-admission buffer full, dropping frame");
                            }
                        }
                        Err(e @ DecodeError::Envelope(_)) => {
                            warn!(%peer, error = %e, "undecodable frame before admission");
                            writer.close().await;
                            return;
                        }
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(%peer, error = %e, "transport failed before admission");
                    return;
                }
            },
        }
    };

    state = AdmissionState::Validating;
    debug!(%peer, ?state, "schema received");

    // Step 3: parse and check the name.
    let meta = match Meta::parse(&meta_doc) {
        Ok(meta) => Arc::new(meta),
        Err(e) => {
            state = AdmissionState::Rejected;
            warn!(%peer, ?state, error = %e, "schema rejected");
            core.notify_meta_error(&peer, &e.to_string(), &mut writer).await;
            tokio::time::sleep(core.config().conflict_grace).await;
            writer.close().await;
            return;
        }
    };

    let name = meta.name().to_owned();
    if !core.registry().reserve(&name) {
        state = AdmissionState::Rejected;
        warn!(%peer, model = %name, ?state, "duplicate model name");
        core.notify_name_conflict(&peer, &name, &mut writer).await;
        tokio::time::sleep(core.config().conflict_grace).await;
        writer.close().await;
        return;
    }

    // Step 4: promote.  The backlog is handed to the connection's reader,
    // which drains it before the first transport read.
    state = AdmissionState::Admitted;
    info!(%peer, model = %name, ?state, buffered = backlog.len(), "model admitted");
    let opts = core.admitted_conn_options(&name, &peer);
    let conn = Connection::attach_parts(
        reader,
        writer,
        peer,
        core.host(),
        opts,
        backlog,
        Some(meta.clone()),
    );
    core.registry().fill(&name, conn, meta);

    // The newcomer may already be a subscription target of earlier peers.
    core.reaggregate_states().await;
    core.reaggregate_events().await;
    core.push_online_count().await;
}
