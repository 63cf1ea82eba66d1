use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// How `perform` reports anything other than success.
#[derive(Debug, Error)]
pub enum PerformError {
    /// Run again later. `None` uses the worker's default retry delay.
    #[error("{reason}")]
    Retry {
        reason: String,
        delay: Option<Duration>,
    },

    #[error("{0}")]
    Failed(String),
}

impl PerformError {
    pub fn retry(reason: impl Into<String>) -> Self {
        PerformError::Retry {
            reason: reason.into(),
            delay: None,
        }
    }

    pub fn retry_in(reason: impl Into<String>, delay: Duration) -> Self {
        PerformError::Retry {
            reason: reason.into(),
            delay: Some(delay),
        }
    }

    pub fn failed(message: impl std::fmt::Display) -> Self {
        PerformError::Failed(message.to_string())
    }
}

impl From<io::Error> for PerformError {
    fn from(e: io::Error) -> Self {
        PerformError::Failed(e.to_string())
    }
}

/// Per-execution state handed to `perform`.
///
/// Writes go to a buffer rather than the process stdout. Whatever ends up
/// there is logged once `perform` returns, or treated as a failure when the
/// worker runs with `fail_on_output`.
#[derive(Debug)]
pub struct JobContext {
    id: String,
    attempt: i32,
    output: Vec<u8>,
}

impl JobContext {
    pub fn new(id: impl Into<String>, attempt: i32) -> Self {
        JobContext {
            id: id.into(),
            attempt,
            output: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 1 on the first run, 2 on the first retry, and so on.
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub(crate) fn take_output(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.output)).into_owned()
    }
}

impl Write for JobContext {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub trait Handler {
    fn perform(&self, ctx: &mut JobContext) -> Result<(), PerformError>;

    /// Called once, when the job is marked permanently failed.
    fn on_permanent_failure(&self, _error: &str) {}
}

/// A handler that can be stored in and restored from the job table.
pub trait NamedHandler: Handler + Serialize + DeserializeOwned + 'static {
    const KIND: &'static str;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Serializes `handler` into the form stored in the `handler` column.
pub fn encode<H: NamedHandler>(handler: &H) -> Result<String, serde_json::Error> {
    encode_raw(H::KIND, serde_json::to_value(handler)?)
}

/// Builds a stored handler from a kind and a payload that have not been typed yet.
pub fn encode_raw(kind: &str, payload: Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope {
        kind: kind.to_string(),
        payload,
    })
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed handler: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("no handler registered for kind {0:?}")]
    UnknownKind(String),

    #[error("invalid payload for {kind:?}: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

type Decoder = fn(Value) -> Result<Box<dyn Handler>, serde_json::Error>;

fn decode_as<H: NamedHandler>(payload: Value) -> Result<Box<dyn Handler>, serde_json::Error> {
    let handler: H = serde_json::from_value(payload)?;
    Ok(Box::new(handler))
}

/// Maps handler kinds to the types that restore them.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// A registry that already knows the stock handlers in [`crate::builtin`].
    pub fn with_builtins() -> Self {
        let mut registry = HandlerRegistry::new();
        crate::builtin::register(&mut registry);
        registry
    }

    pub fn register<H: NamedHandler>(&mut self) -> &mut Self {
        self.decoders.insert(H::KIND, decode_as::<H>);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.decoders.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Fails with [`crate::Error::UnknownKind`] unless `kind` is registered.
    pub fn ensure_known(&self, kind: &str) -> crate::Result<()> {
        if self.contains(kind) {
            return Ok(());
        }

        Err(crate::Error::UnknownKind {
            kind: kind.to_string(),
            known: self.kinds().join(", "),
        })
    }

    pub fn decode(&self, raw: &str) -> Result<Box<dyn Handler>, DecodeError> {
        let envelope: Envelope = serde_json::from_str(raw).map_err(DecodeError::Malformed)?;

        let decoder = self
            .decoders
            .get(envelope.kind.as_str())
            .ok_or_else(|| DecodeError::UnknownKind(envelope.kind.clone()))?;

        decoder(envelope.payload).map_err(|source| DecodeError::InvalidPayload {
            kind: envelope.kind,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    impl Handler for Greet {
        fn perform(&self, ctx: &mut JobContext) -> Result<(), PerformError> {
            write!(ctx, "Hello {}!", self.name)?;
            Ok(())
        }
    }

    impl NamedHandler for Greet {
        const KIND: &'static str = "greet";
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register::<Greet>();
        registry
    }

    #[test]
    fn encodes_kind_and_payload() {
        let raw = encode(&Greet {
            name: "delayq".into(),
        })
        .unwrap();

        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["kind"], "greet");
        assert_eq!(value["payload"]["name"], "delayq");
    }

    #[test]
    fn decodes_registered_kinds() {
        let raw = encode(&Greet {
            name: "github".into(),
        })
        .unwrap();

        let handler = registry().decode(&raw).unwrap();
        let mut ctx = JobContext::new("job-1", 1);
        handler.perform(&mut ctx).unwrap();

        assert_eq!(ctx.take_output(), "Hello github!");
        assert!(ctx.output().is_empty());
    }

    #[test]
    fn rejects_garbage() {
        let err = registry().decode("not json at all").err().unwrap();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn rejects_unknown_kinds() {
        let err = registry()
            .decode(r#"{"kind": "shopify", "payload": {}}"#)
            .err()
            .unwrap();
        assert!(matches!(err, DecodeError::UnknownKind(kind) if kind == "shopify"));
    }

    #[test]
    fn rejects_payloads_of_the_wrong_shape() {
        let err = registry()
            .decode(r#"{"kind": "greet", "payload": {"nom": 3}}"#)
            .err()
            .unwrap();
        assert!(matches!(err, DecodeError::InvalidPayload { .. }));
        assert!(err.to_string().contains("greet"));
    }

    #[test]
    fn retry_helpers() {
        match PerformError::retry_in("busy", Duration::from_secs(30)) {
            PerformError::Retry { reason, delay } => {
                assert_eq!(reason, "busy");
                assert_eq!(delay, Some(Duration::from_secs(30)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            PerformError::retry("later"),
            PerformError::Retry { delay: None, .. }
        ));
        assert_eq!(PerformError::failed("Uh oh").to_string(), "Uh oh");
    }

    #[test]
    fn lists_registered_kinds() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.contains("echo"));
        assert!(registry.contains("command"));
        assert!(!registry.contains("greet"));
        assert_eq!(registry.kinds(), vec!["command", "echo"]);
    }

    #[test]
    fn ensure_known_names_the_alternatives() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.ensure_known("echo").is_ok());

        match registry.ensure_known("greet") {
            Err(crate::Error::UnknownKind { kind, known }) => {
                assert_eq!(kind, "greet");
                assert_eq!(known, "command, echo");
            }
            other => panic!("expected an unknown kind error, got {:?}", other),
        }
    }
}
