//! Shared proxy state: the proxy's own thing model, the admitted-model
//! registry, and the advisory-event plumbing used by admission failures.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::debug;

use tm_link::{
    CallHandler, CallReply, CallRequest, FrameDirection, FrameTap, Model, ModelOptions,
    TransportWriter,
};
use tm_meta::{Meta, MetaError};
use tm_protocol::{EventPayload, Frame};

use crate::frame_log::FrameLog;
use crate::proxy_meta;
use crate::registry::Registry;

/// Admission and buffering knobs; the defaults are the protocol constants.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// How long an inbound peer has to answer `query-meta`.
    pub meta_wait: Duration,
    /// Pause between an advisory rejection event and the close.
    pub conflict_grace: Duration,
    /// Pre-admission frame buffer capacity.
    pub backlog_cap: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            meta_wait: Duration::from_secs(5),
            conflict_grace: Duration::from_secs(1),
            backlog_cap: 64,
        }
    }
}

#[derive(Clone)]
pub struct ProxyCore {
    inner: Arc<CoreInner>,
}

pub(crate) struct CoreInner {
    host: Model,
    cfg: ProxyConfig,
    registry: Registry,
    log: Option<FrameLog>,
    // Serialize upstream re-subscription sweeps per kind so a stale sweep
    // cannot overwrite a newer one.
    pub(crate) agg_states: tokio::sync::Mutex<()>,
    pub(crate) agg_events: tokio::sync::Mutex<()>,
}

impl ProxyCore {
    pub fn new(cfg: ProxyConfig, log: Option<FrameLog>) -> Result<ProxyCore, MetaError> {
        let registry = Registry::new();
        let meta = Meta::parse(&proxy_meta::document())?;
        let handler = Self::call_handler(registry.clone());
        let host = Model::new(
            meta,
            ModelOptions {
                on_call: Some(handler),
                verify_resp: true,
            },
        );
        Ok(ProxyCore {
            inner: Arc::new(CoreInner {
                host,
                cfg,
                registry,
                log,
                agg_states: tokio::sync::Mutex::new(()),
                agg_events: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Open the frame log per CLI flags and build the core.
    pub fn with_frame_log(
        cfg: ProxyConfig,
        log_path: Option<&Path>,
        echo: bool,
    ) -> Result<ProxyCore, Box<dyn std::error::Error>> {
        let log = FrameLog::open(log_path, echo)?;
        Ok(ProxyCore::new(cfg, log)?)
    }

    fn call_handler(registry: Registry) -> CallHandler {
        Arc::new(move |req: CallRequest| {
            let registry = registry.clone();
            async move {
                let mut resp = CallReply::new();
                if req.name == proxy_meta::METHOD_GET_ONLINE_MODELS {
                    let names = registry.names().into_iter().map(Value::String).collect();
                    resp.insert("modelNames".to_owned(), Value::Array(names));
                }
                resp
            }
            .boxed()
        })
    }

    pub fn host(&self) -> &Model {
        &self.inner.host
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.cfg
    }

    pub(crate) async fn agg_states_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.agg_states.lock().await
    }

    pub(crate) async fn agg_events_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.agg_events.lock().await
    }

    // -----------------------------------------------------------------------
    // Frame log taps
    // -----------------------------------------------------------------------

    /// A per-connection tap for the frame log, or `None` when not recording.
    pub fn frame_tap_for(&self, peer: &str) -> Option<FrameTap> {
        let log = self.inner.log.clone()?;
        let peer = peer.to_owned();
        Some(Arc::new(move |dir, text: &str| {
            log.record(dir, &peer, text);
        }))
    }

    /// Record a frame read during admission, before a connection exists.
    pub fn tap_in(&self, peer: &str, text: &str) {
        if let Some(log) = &self.inner.log {
            log.record(FrameDirection::Inbound, peer, text);
        }
    }

    pub fn tap_out(&self, peer: &str, text: &str) {
        if let Some(log) = &self.inner.log {
            log.record(FrameDirection::Outbound, peer, text);
        }
    }

    // -----------------------------------------------------------------------
    // Advisory events
    // -----------------------------------------------------------------------

    /// Broadcast a schema-validation failure and echo it to the offender,
    /// subscribed or not.
    pub async fn notify_meta_error(
        &self,
        peer: &str,
        detail: &str,
        offender: &mut TransportWriter,
    ) {
        let mut args = CallReply::new();
        args.insert("addr".to_owned(), Value::String(peer.to_owned()));
        args.insert("detail".to_owned(), Value::String(detail.to_owned()));
        self.push_advisory(proxy_meta::EVENT_META_CHECK_ERROR, args, peer, offender)
            .await;
    }

    /// Broadcast a name conflict and echo it to the offender.
    pub async fn notify_name_conflict(
        &self,
        peer: &str,
        model_name: &str,
        offender: &mut TransportWriter,
    ) {
        let mut args = CallReply::new();
        args.insert(
            "modelName".to_owned(),
            Value::String(model_name.to_owned()),
        );
        args.insert("addr".to_owned(), Value::String(peer.to_owned()));
        self.push_advisory(proxy_meta::EVENT_REPEAT_MODEL_NAME, args, peer, offender)
            .await;
    }

    async fn push_advisory(
        &self,
        event: &str,
        args: CallReply,
        peer: &str,
        offender: &mut TransportWriter,
    ) {
        if let Err(e) = self.host().push_event(event, args.clone(), true).await {
            debug!(event, error = %e, "advisory broadcast failed");
        }
        let frame = Frame::Event(EventPayload {
            name: format!("{}/{}", self.host().name(), event),
            args,
        });
        if let Ok(text) = frame.encode() {
            self.tap_out(peer, &text);
            if let Err(e) = offender.write_message(&text).await {
                debug!(peer, error = %e, "advisory to offender failed");
            }
        }
    }

    /// Publish the admitted-model count to subscribers of the proxy's own
    /// state stream.
    pub async fn push_online_count(&self) {
        let count = self.registry().names().len() as u64;
        let _ = self
            .host()
            .push_state(proxy_meta::STATE_ONLINE_COUNT, Value::from(count), true)
            .await;
    }
}
