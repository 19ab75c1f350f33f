//! Traffic routing between admitted models.
//!
//! Three flows, all keyed on the `<model>/<local>` name convention:
//!
//! - **Broadcast fan-out**: a state/event frame arriving from model X goes to
//!   every attached peer whose publish set names it.
//! - **Call bridging**: a `call` addressed to another admitted model is
//!   re-invoked upstream through the proxy's own waiter machinery; the
//!   response is routed back to the origin under the original UUID.
//! - **Subscription aggregation**: whenever any peer's publish set changes,
//!   the union of interest per upstream model is recomputed and pushed as a
//!   `set` subscription on that model's connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, info};

use tm_link::{CallReply, ConnOptions, Connection, EventNotice, StateUpdate, SubKind};
use tm_protocol::{CallPayload, split_full_name};

use crate::core::ProxyCore;

impl ProxyCore {
    /// Connection options for a freshly admitted model: fan-out handlers,
    /// the call router, subscription aggregation, and registry cleanup on
    /// close.
    pub fn admitted_conn_options(&self, model_name: &str, peer: &str) -> ConnOptions {
        let fan_state = self.clone();
        let fan_event = self.clone();
        let agg = self.clone();
        let route = self.clone();
        let cleanup = self.clone();
        let name = model_name.to_owned();

        ConnOptions {
            on_state: Some(Arc::new(move |update: StateUpdate| {
                let core = fan_state.clone();
                async move { core.fanout_state(update).await }.boxed()
            })),
            on_event: Some(Arc::new(move |notice: EventNotice| {
                let core = fan_event.clone();
                async move { core.fanout_event(notice).await }.boxed()
            })),
            on_sub_update: Some(Arc::new(move |change| {
                let core = agg.clone();
                tokio::spawn(async move {
                    match change.kind {
                        SubKind::State => core.reaggregate_states().await,
                        SubKind::Event => core.reaggregate_events().await,
                    }
                });
            })),
            call_router: Some(Arc::new(move |origin: Connection, call: CallPayload| {
                let core = route.clone();
                tokio::spawn(async move { core.route_call(origin, call).await });
            })),
            on_close: Some(Box::new(move |reason: &str| {
                info!(model = %name, reason, "model disconnected");
                tokio::spawn(async move {
                    cleanup.registry().remove(&name);
                    cleanup.reaggregate_states().await;
                    cleanup.reaggregate_events().await;
                    cleanup.push_online_count().await;
                });
            })),
            frame_tap: self.frame_tap_for(peer),
            ..ConnOptions::default()
        }
    }

    // -----------------------------------------------------------------------
    // Broadcast fan-out
    // -----------------------------------------------------------------------

    pub async fn fanout_state(&self, update: StateUpdate) {
        for conn in self.host().connections() {
            if conn.publishes_state(&update.full_name).await {
                if let Err(e) = conn.send_state(&update.full_name, update.data.clone()).await {
                    debug!(peer = %conn.peer_addr(), error = %e, "state fan-out failed");
                }
            }
        }
    }

    pub async fn fanout_event(&self, notice: EventNotice) {
        for conn in self.host().connections() {
            if conn.publishes_event(&notice.full_name).await {
                if let Err(e) = conn.send_event(&notice.full_name, notice.args.clone()).await {
                    debug!(peer = %conn.peer_addr(), error = %e, "event fan-out failed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Call bridging
    // -----------------------------------------------------------------------

    /// Bridge a `call` frame addressed to another model.  The upstream
    /// waiter resolves on response *or* upstream close, so the origin always
    /// hears back.
    pub async fn route_call(&self, origin: Connection, call: CallPayload) {
        let Some((model_name, _method)) = split_full_name(&call.name) else {
            let _ = origin
                .send_response(&call.uuid, "fullName is invalid format", CallReply::new())
                .await;
            return;
        };
        let Some(target) = self.registry().get_conn(model_name) else {
            let _ = origin
                .send_response(
                    &call.uuid,
                    &format!("model {model_name:?} not found"),
                    CallReply::new(),
                )
                .await;
            return;
        };
        let outcome = match target.invoke(&call.name, call.args).await {
            Ok(waiter) => waiter.wait().await,
            Err(e) => Err(e),
        };
        let result = match outcome {
            Ok(resp) => origin.send_response(&call.uuid, "", resp).await,
            Err(e) => {
                origin
                    .send_response(&call.uuid, &e.to_string(), CallReply::new())
                    .await
            }
        };
        if let Err(e) = result {
            debug!(peer = %origin.peer_addr(), error = %e, "bridged response send failed");
        }
    }

    // -----------------------------------------------------------------------
    // Subscription aggregation
    // -----------------------------------------------------------------------

    /// Recompute the union of every peer's state interest per upstream model
    /// and re-subscribe with `set` semantics.  Serialized so a stale sweep
    /// cannot overwrite a newer one; the union is always computed inside the
    /// critical section, so concurrent sweeps converge.
    pub async fn reaggregate_states(&self) {
        let _guard = self.agg_states_lock().await;
        let mut per_model = HashMap::new();
        for conn in self.host().connections() {
            collect_interest(&mut per_model, conn.pub_states().await, self.host().name());
        }
        for (name, conn) in self.registry().admitted() {
            let want = per_model.remove(&name).unwrap_or_default();
            if let Err(e) = conn.sub_state(want).await {
                debug!(model = %name, error = %e, "upstream state subscribe failed");
            }
        }
    }

    pub async fn reaggregate_events(&self) {
        let _guard = self.agg_events_lock().await;
        let mut per_model = HashMap::new();
        for conn in self.host().connections() {
            collect_interest(&mut per_model, conn.pub_events().await, self.host().name());
        }
        for (name, conn) in self.registry().admitted() {
            let want = per_model.remove(&name).unwrap_or_default();
            if let Err(e) = conn.sub_event(want).await {
                debug!(model = %name, error = %e, "upstream event subscribe failed");
            }
        }
    }
}

/// Group fully-qualified names by their model prefix, skipping the proxy's
/// own names (those are served locally, not routed).
fn collect_interest(
    per_model: &mut HashMap<String, HashSet<String>>,
    names: HashSet<String>,
    own_name: &str,
) {
    for name in names {
        if let Some((model, _)) = split_full_name(&name) {
            if model != own_name {
                per_model.entry(model.to_owned()).or_default().insert(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_groups_by_model_prefix_and_skips_own() {
        let mut per_model = HashMap::new();
        let names: HashSet<String> = [
            "car/#1/speed".to_owned(),
            "car/#1/rpm".to_owned(),
            "door/#2/open".to_owned(),
            "proxy/onlineModelCount".to_owned(),
        ]
        .into_iter()
        .collect();
        collect_interest(&mut per_model, names, "proxy");
        assert_eq!(per_model.len(), 2);
        assert_eq!(per_model["car/#1"].len(), 2);
        assert!(per_model["door/#2"].contains("door/#2/open"));
    }
}
