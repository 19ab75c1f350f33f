//! The shared operation surface of a peer link.
//!
//! [`Connection`] and [`AutoLink`] both speak to one remote model; code that
//! only needs the peer-operations contract (subscribe, invoke, call, fetch
//! the schema, close) can take either through this trait.  The supervisor
//! *delegates* to its wrapped connection; it is not one.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use tm_meta::Meta;

use crate::autolink::AutoLink;
use crate::conn::Connection;
use crate::waiter::{CallReply, Waiter};
use crate::LinkError;

#[allow(async_fn_in_trait)]
pub trait PeerOps {
    async fn sub_state(&self, names: Vec<String>) -> Result<(), LinkError>;
    async fn add_sub_state(&self, names: Vec<String>) -> Result<(), LinkError>;
    async fn cancel_sub_state(&self, names: Vec<String>) -> Result<(), LinkError>;
    async fn cancel_all_sub_state(&self) -> Result<(), LinkError>;

    async fn sub_event(&self, names: Vec<String>) -> Result<(), LinkError>;
    async fn add_sub_event(&self, names: Vec<String>) -> Result<(), LinkError>;
    async fn cancel_sub_event(&self, names: Vec<String>) -> Result<(), LinkError>;
    async fn cancel_all_sub_event(&self) -> Result<(), LinkError>;

    async fn invoke(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<Waiter, LinkError>;
    async fn call(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<CallReply, LinkError>;
    async fn call_for(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
        timeout: Duration,
    ) -> Result<CallReply, LinkError>;

    async fn peer_meta(&self) -> Result<Arc<Meta>, LinkError>;
    async fn close(&self);
}

impl PeerOps for Connection {
    async fn sub_state(&self, names: Vec<String>) -> Result<(), LinkError> {
        Connection::sub_state(self, names).await
    }

    async fn add_sub_state(&self, names: Vec<String>) -> Result<(), LinkError> {
        Connection::add_sub_state(self, names).await
    }

    async fn cancel_sub_state(&self, names: Vec<String>) -> Result<(), LinkError> {
        Connection::cancel_sub_state(self, names).await
    }

    async fn cancel_all_sub_state(&self) -> Result<(), LinkError> {
        Connection::cancel_all_sub_state(self).await
    }

    async fn sub_event(&self, names: Vec<String>) -> Result<(), LinkError> {
        Connection::sub_event(self, names).await
    }

    async fn add_sub_event(&self, names: Vec<String>) -> Result<(), LinkError> {
        Connection::add_sub_event(self, names).await
    }

    async fn cancel_sub_event(&self, names: Vec<String>) -> Result<(), LinkError> {
        Connection::cancel_sub_event(self, names).await
    }

    async fn cancel_all_sub_event(&self) -> Result<(), LinkError> {
        Connection::cancel_all_sub_event(self).await
    }

    async fn invoke(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<Waiter, LinkError> {
        Connection::invoke(self, full_name, args).await
    }

    async fn call(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<CallReply, LinkError> {
        Connection::call(self, full_name, args).await
    }

    async fn call_for(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
        timeout: Duration,
    ) -> Result<CallReply, LinkError> {
        Connection::call_for(self, full_name, args, timeout).await
    }

    async fn peer_meta(&self) -> Result<Arc<Meta>, LinkError> {
        Connection::peer_meta(self).await
    }

    async fn close(&self) {
        Connection::close(self).await;
    }
}

impl PeerOps for AutoLink {
    async fn sub_state(&self, names: Vec<String>) -> Result<(), LinkError> {
        AutoLink::sub_state(self, names).await
    }

    async fn add_sub_state(&self, names: Vec<String>) -> Result<(), LinkError> {
        AutoLink::add_sub_state(self, names).await
    }

    async fn cancel_sub_state(&self, names: Vec<String>) -> Result<(), LinkError> {
        AutoLink::cancel_sub_state(self, names).await
    }

    async fn cancel_all_sub_state(&self) -> Result<(), LinkError> {
        AutoLink::cancel_all_sub_state(self).await
    }

    async fn sub_event(&self, names: Vec<String>) -> Result<(), LinkError> {
        AutoLink::sub_event(self, names).await
    }

    async fn add_sub_event(&self, names: Vec<String>) -> Result<(), LinkError> {
        AutoLink::add_sub_event(self, names).await
    }

    async fn cancel_sub_event(&self, names: Vec<String>) -> Result<(), LinkError> {
        AutoLink::cancel_sub_event(self, names).await
    }

    async fn cancel_all_sub_event(&self) -> Result<(), LinkError> {
        AutoLink::cancel_all_sub_event(self).await
    }

    async fn invoke(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<Waiter, LinkError> {
        AutoLink::invoke(self, full_name, args).await
    }

    async fn call(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<CallReply, LinkError> {
        AutoLink::call(self, full_name, args).await
    }

    async fn call_for(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
        timeout: Duration,
    ) -> Result<CallReply, LinkError> {
        AutoLink::call_for(self, full_name, args, timeout).await
    }

    async fn peer_meta(&self) -> Result<Arc<Meta>, LinkError> {
        AutoLink::peer_meta(self).await
    }

    async fn close(&self) {
        AutoLink::close(self).await;
    }
}
