//! The proxy's own thing-model schema.
//!
//! The proxy is a peer like any other: its schema declares the advisory
//! events pushed during admission failures, the online-model count state,
//! and the introspection method.

use serde_json::{Value, json};

pub const MODEL_NAME: &str = "proxy";

/// Pushed when an inbound peer's schema fails to parse.
pub const EVENT_META_CHECK_ERROR: &str = "metaCheckError";
/// Pushed when an inbound peer advertises an already-admitted name.
pub const EVENT_REPEAT_MODEL_NAME: &str = "repeatModelNameError";

pub const STATE_ONLINE_COUNT: &str = "onlineModelCount";
pub const METHOD_GET_ONLINE_MODELS: &str = "GetOnlineModels";

pub fn document() -> Value {
    json!({
        "name": MODEL_NAME,
        "description": "pub/sub and RPC proxy for thing models",
        "state": [
            {
                "name": STATE_ONLINE_COUNT,
                "description": "number of currently admitted models",
                "type": "uint"
            }
        ],
        "event": [
            {
                "name": EVENT_META_CHECK_ERROR,
                "description": "an inbound peer sent an invalid schema",
                "args": [
                    {"name": "addr", "type": "string"},
                    {"name": "detail", "type": "string"}
                ]
            },
            {
                "name": EVENT_REPEAT_MODEL_NAME,
                "description": "an inbound peer advertised an already-admitted name",
                "args": [
                    {"name": "modelName", "type": "string"},
                    {"name": "addr", "type": "string"}
                ]
            }
        ],
        "method": [
            {
                "name": METHOD_GET_ONLINE_MODELS,
                "description": "list the names of all admitted models",
                "args": [],
                "response": [
                    {"name": "modelNames", "type": "array"}
                ]
            }
        ]
    })
}
