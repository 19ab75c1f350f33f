//! Thing-model schema descriptors.
//!
//! A [`Meta`] is the parsed, immutable description of one model: its name,
//! its publishable states and events, and its callable methods with typed
//! arguments and response fields.  Peers exchange the raw JSON document in
//! `meta-info` frames; the verifiers here gate inbound call arguments,
//! outbound responses, and local pushes.
//!
//! # Document shape
//!
//! ```json
//! {
//!   "name": "car/#1",
//!   "description": "telemetry unit",
//!   "state":  [ {"name": "speed", "type": "uint"} ],
//!   "event":  [ {"name": "overheat", "args": [{"name": "temp", "type": "int"}]} ],
//!   "method": [ {"name": "QS",
//!                "args": [{"name": "angle", "type": "int"},
//!                         {"name": "speed", "type": "string", "option": ["low", "middle", "high"]}],
//!                "response": [{"name": "res", "type": "bool"},
//!                             {"name": "time", "type": "uint"},
//!                             {"name": "code", "type": "int", "option": [0, 1, 2, 3, 4]}]} ]
//! }
//! ```

use serde::Deserialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum MetaError {
    #[error("parse meta: {0}")]
    Document(String),
    #[error("meta name is empty")]
    EmptyName,
    #[error("{kind} {name:?}: repeated")]
    Duplicate { kind: &'static str, name: String },
    #[error("{kind} {name:?}: unknown type {ty:?}")]
    UnknownType {
        kind: &'static str,
        name: String,
        ty: String,
    },
    #[error("unknown {kind} {name:?}")]
    Unknown { kind: &'static str, name: String },
    #[error("{kind} {name:?}: missing")]
    Missing { kind: &'static str, name: String },
    #[error("{kind} {name:?}: type mismatch, want {want}")]
    TypeMismatch {
        kind: &'static str,
        name: String,
        want: &'static str,
    },
    #[error("{kind} {name:?}: value not in options")]
    NotInOptions { kind: &'static str, name: String },
    #[error("{kind} {name:?}: not declared")]
    Undeclared { kind: &'static str, name: String },
}

// ---------------------------------------------------------------------------
// Type system
// ---------------------------------------------------------------------------

/// The JSON value classes a declared field may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Int,
    Uint,
    Float,
    String,
    Object,
    Array,
}

impl DataType {
    fn parse(s: &str) -> Option<DataType> {
        Some(match s {
            "bool" => DataType::Bool,
            "int" => DataType::Int,
            "uint" => DataType::Uint,
            "float" => DataType::Float,
            "string" => DataType::String,
            "object" => DataType::Object,
            "array" => DataType::Array,
            _ => return None,
        })
    }

    /// The document spelling of this type.
    pub fn name(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int => "int",
            DataType::Uint => "uint",
            DataType::Float => "float",
            DataType::String => "string",
            DataType::Object => "object",
            DataType::Array => "array",
        }
    }

    /// Whether `value` is of this type.  `uint` is the non-negative subset of
    /// `int`; `float` admits any JSON number.
    pub fn admits(self, value: &Value) -> bool {
        match self {
            DataType::Bool => value.is_boolean(),
            DataType::Int => value.is_i64(),
            DataType::Uint => value.is_u64(),
            DataType::Float => value.is_number(),
            DataType::String => value.is_string(),
            DataType::Object => value.is_object(),
            DataType::Array => value.is_array(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsed definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StateDef {
    pub name: String,
    pub description: String,
    pub ty: DataType,
}

/// A typed parameter of an event or method, optionally constrained to an
/// enumerated value set.
#[derive(Debug, Clone)]
pub struct ParamDef {
    pub name: String,
    pub ty: DataType,
    /// Allowed values; empty means unconstrained.
    pub option: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct EventDef {
    pub name: String,
    pub description: String,
    pub args: Vec<ParamDef>,
}

#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub description: String,
    pub args: Vec<ParamDef>,
    pub response: Vec<ParamDef>,
}

// ---------------------------------------------------------------------------
// Raw document (serde layer)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawMeta {
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    state: Vec<RawState>,
    #[serde(default)]
    event: Vec<RawEvent>,
    #[serde(default)]
    method: Vec<RawMethod>,
}

#[derive(Deserialize)]
struct RawState {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "type")]
    ty: String,
}

#[derive(Deserialize)]
struct RawParam {
    name: String,
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    option: Vec<Value>,
}

#[derive(Deserialize)]
struct RawEvent {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    args: Vec<RawParam>,
}

#[derive(Deserialize)]
struct RawMethod {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    args: Vec<RawParam>,
    #[serde(default)]
    response: Vec<RawParam>,
}

fn parse_param(kind: &'static str, raw: RawParam) -> Result<ParamDef, MetaError> {
    let ty = DataType::parse(&raw.ty).ok_or_else(|| MetaError::UnknownType {
        kind,
        name: raw.name.clone(),
        ty: raw.ty.clone(),
    })?;
    Ok(ParamDef {
        name: raw.name,
        ty,
        option: raw.option,
    })
}

fn check_unique<'a, I: Iterator<Item = &'a str>>(
    kind: &'static str,
    names: I,
) -> Result<(), MetaError> {
    let mut seen = std::collections::HashSet::new();
    for n in names {
        if !seen.insert(n) {
            return Err(MetaError::Duplicate {
                kind,
                name: n.to_owned(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Meta
// ---------------------------------------------------------------------------

/// A parsed model descriptor.  Immutable after [`Meta::parse`]; the original
/// JSON document is retained verbatim for `meta-info` replies.
#[derive(Debug, Clone)]
pub struct Meta {
    raw: Value,
    name: String,
    description: String,
    states: Vec<StateDef>,
    events: Vec<EventDef>,
    methods: Vec<MethodDef>,
}

impl Meta {
    pub fn parse(doc: &Value) -> Result<Meta, MetaError> {
        let raw: RawMeta = serde_json::from_value(doc.clone())
            .map_err(|e| MetaError::Document(e.to_string()))?;
        let name = raw.name.unwrap_or_default();
        if name.trim().is_empty() {
            return Err(MetaError::EmptyName);
        }

        check_unique("state", raw.state.iter().map(|s| s.name.as_str()))?;
        check_unique("event", raw.event.iter().map(|e| e.name.as_str()))?;
        check_unique("method", raw.method.iter().map(|m| m.name.as_str()))?;

        let states = raw
            .state
            .into_iter()
            .map(|s| {
                let ty = DataType::parse(&s.ty).ok_or_else(|| MetaError::UnknownType {
                    kind: "state",
                    name: s.name.clone(),
                    ty: s.ty.clone(),
                })?;
                Ok(StateDef {
                    name: s.name,
                    description: s.description,
                    ty,
                })
            })
            .collect::<Result<Vec<_>, MetaError>>()?;

        let events = raw
            .event
            .into_iter()
            .map(|e| {
                let args = e
                    .args
                    .into_iter()
                    .map(|p| parse_param("argument", p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(EventDef {
                    name: e.name,
                    description: e.description,
                    args,
                })
            })
            .collect::<Result<Vec<_>, MetaError>>()?;

        let methods = raw
            .method
            .into_iter()
            .map(|m| {
                let args = m
                    .args
                    .into_iter()
                    .map(|p| parse_param("argument", p))
                    .collect::<Result<Vec<_>, _>>()?;
                let response = m
                    .response
                    .into_iter()
                    .map(|p| parse_param("response field", p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(MethodDef {
                    name: m.name,
                    description: m.description,
                    args,
                    response,
                })
            })
            .collect::<Result<Vec<_>, MetaError>>()?;

        Ok(Meta {
            raw: doc.clone(),
            name,
            description: raw.description,
            states,
            events,
            methods,
        })
    }

    pub fn parse_str(text: &str) -> Result<Meta, MetaError> {
        let doc: Value =
            serde_json::from_str(text).map_err(|e| MetaError::Document(e.to_string()))?;
        Meta::parse(&doc)
    }

    /// The model's fully-qualified name (may itself contain `/`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The original schema document, as sent in `meta-info` frames.
    pub fn to_json(&self) -> &Value {
        &self.raw
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.state(name).is_some()
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.event(name).is_some()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.method(name).is_some()
    }

    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn event(&self, name: &str) -> Option<&EventDef> {
        self.events.iter().find(|e| e.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn states(&self) -> &[StateDef] {
        &self.states
    }

    pub fn events(&self) -> &[EventDef] {
        &self.events
    }

    pub fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    // -----------------------------------------------------------------------
    // Verifiers
    // -----------------------------------------------------------------------

    /// Check a value against a declared state's type.
    pub fn verify_state(&self, name: &str, value: &Value) -> Result<(), MetaError> {
        let def = self.state(name).ok_or_else(|| MetaError::Unknown {
            kind: "state",
            name: name.to_owned(),
        })?;
        if !def.ty.admits(value) {
            return Err(MetaError::TypeMismatch {
                kind: "state",
                name: name.to_owned(),
                want: def.ty.name(),
            });
        }
        Ok(())
    }

    /// Check an argument object against a declared event's parameters.
    pub fn verify_event_args(
        &self,
        name: &str,
        args: &serde_json::Map<String, Value>,
    ) -> Result<(), MetaError> {
        let def = self.event(name).ok_or_else(|| MetaError::Unknown {
            kind: "event",
            name: name.to_owned(),
        })?;
        verify_params("argument", &def.args, args, true)
    }

    /// Check a `call` frame's argument object against a declared method.
    ///
    /// Every declared argument must be present with the declared type (and
    /// within its `option` set when constrained); undeclared arguments are
    /// rejected.
    pub fn verify_method_args(
        &self,
        name: &str,
        args: &serde_json::Map<String, Value>,
    ) -> Result<(), MetaError> {
        let def = self.method(name).ok_or_else(|| MetaError::Unknown {
            kind: "method",
            name: name.to_owned(),
        })?;
        verify_params("argument", &def.args, args, true)
    }

    /// Check a method's response object.
    ///
    /// Declared fields must be present and type-correct; extra fields pass
    /// through untouched (the caller may carry auxiliary data).
    pub fn verify_method_resp(
        &self,
        name: &str,
        resp: &serde_json::Map<String, Value>,
    ) -> Result<(), MetaError> {
        let def = self.method(name).ok_or_else(|| MetaError::Unknown {
            kind: "method",
            name: name.to_owned(),
        })?;
        verify_params("response field", &def.response, resp, false)
    }
}

fn verify_params(
    kind: &'static str,
    decls: &[ParamDef],
    values: &serde_json::Map<String, Value>,
    reject_undeclared: bool,
) -> Result<(), MetaError> {
    for decl in decls {
        let value = values.get(&decl.name).ok_or_else(|| MetaError::Missing {
            kind,
            name: decl.name.clone(),
        })?;
        if !decl.ty.admits(value) {
            return Err(MetaError::TypeMismatch {
                kind,
                name: decl.name.clone(),
                want: decl.ty.name(),
            });
        }
        if !decl.option.is_empty() && !decl.option.contains(value) {
            return Err(MetaError::NotInOptions {
                kind,
                name: decl.name.clone(),
            });
        }
    }
    if reject_undeclared {
        for key in values.keys() {
            if !decls.iter().any(|d| &d.name == key) {
                return Err(MetaError::Undeclared {
                    kind,
                    name: key.clone(),
                });
            }
        }
    }
    Ok(())
}
