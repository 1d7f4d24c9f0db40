//! Finished spans as handed over by the instrumentation API.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Attribute value as produced by the instrumentation API.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    Array(Array),
}

/// Homogeneous attribute array.
#[derive(Debug, Clone, PartialEq)]
pub enum Array {
    Bool(Vec<bool>),
    I64(Vec<i64>),
    F64(Vec<f64>),
    String(Vec<String>),
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident as $wide:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(<$wide>::from(value))
                }
            }
        )*
    };
}

impl_value_from!(
    bool => Bool as bool,
    i8 => I64 as i64,
    i16 => I64 as i64,
    i32 => I64 as i64,
    i64 => I64 as i64,
    u8 => I64 as i64,
    u16 => I64 as i64,
    u32 => I64 as i64,
    f32 => F64 as f64,
    f64 => F64 as f64,
    String => String as String,
);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<Array> for Value {
    fn from(value: Array) -> Self {
        Value::Array(value)
    }
}

/// A single attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Attributes describing the entity producing telemetry (service, host, ...).
///
/// Shared by every span and metric of a provider, hence usually behind an `Arc`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resource {
    attributes: Vec<KeyValue>,
}

impl Resource {
    pub fn new(attributes: Vec<KeyValue>) -> Self {
        Self { attributes }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn attributes(&self) -> &[KeyValue] {
        &self.attributes
    }

    /// Returns a copy with `attributes` appended after the existing ones.
    pub fn with_attributes(mut self, attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        self.attributes.extend(attributes);
        self
    }
}

/// Tracer (or meter) that produced the record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentationScope {
    pub name: String,
    pub version: Option<String>,
}

impl InstrumentationScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Role of a span in a trace (OpenTelemetry span kinds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanKind {
    /// Internal operation span
    #[default]
    Internal,
    /// Server-side RPC span
    Server,
    /// Client-side RPC span
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// Span status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusCode {
    #[default]
    Unset,
    Error,
    Ok,
}

impl StatusCode {
    /// Maps a raw OpenTelemetry status code. Unknown codes become `Unset`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => StatusCode::Error,
            2 => StatusCode::Ok,
            _ => StatusCode::Unset,
        }
    }
}

/// Span execution status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            message: message.into(),
        }
    }
}

/// Timestamped annotation recorded during a span.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub attributes: Vec<KeyValue>,
    /// Unix nanoseconds
    pub time: u64,
}

/// Reference to a span in the same or another trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub trace_id: u128,
    pub span_id: u64,
    pub attributes: Vec<KeyValue>,
}

/// A finished span handed over by the instrumentation API.
#[derive(Debug, Clone)]
pub struct SpanData {
    /// Unique trace identifier (128-bit)
    pub trace_id: u128,
    /// Unique span identifier (64-bit)
    pub span_id: u64,
    /// Parent span identifier (0 if root span)
    pub parent_span_id: u64,
    /// Operation name
    pub name: String,
    pub kind: SpanKind,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds)
    pub end_time: u64,
    pub attributes: Vec<KeyValue>,
    pub status: Status,
    pub events: Vec<Event>,
    pub links: Vec<Link>,
    pub scope: InstrumentationScope,
    pub resource: Arc<Resource>,
}

impl SpanData {
    /// Creates a span starting now; callers fill in the rest and call [`SpanData::end`].
    pub fn new(trace_id: u128, span_id: u64, parent_span_id: u64, name: impl Into<String>) -> Self {
        let now = unix_nanos();
        Self {
            trace_id,
            span_id,
            parent_span_id,
            name: name.into(),
            kind: SpanKind::Internal,
            start_time: now,
            end_time: now,
            attributes: Vec::new(),
            status: Status::default(),
            events: Vec::new(),
            links: Vec::new(),
            scope: InstrumentationScope::default(),
            resource: Arc::new(Resource::empty()),
        }
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_scope(mut self, scope: InstrumentationScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_resource(mut self, resource: Arc<Resource>) -> Self {
        self.resource = resource;
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.push(KeyValue::new(key, value));
    }

    pub fn add_event(&mut self, name: impl Into<String>, attributes: Vec<KeyValue>) {
        self.events.push(Event {
            name: name.into(),
            attributes,
            time: unix_nanos(),
        });
    }

    pub fn add_link(&mut self, trace_id: u128, span_id: u64, attributes: Vec<KeyValue>) {
        self.links.push(Link {
            trace_id,
            span_id,
            attributes,
        });
    }

    /// Marks the span as finished with the given status
    pub fn end(&mut self, status: Status) {
        self.end_time = unix_nanos().max(self.start_time);
        self.status = status;
    }

    /// Returns span duration in nanoseconds
    pub fn duration_nanos(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

/// Current wall-clock time in Unix nanoseconds.
pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_widen() {
        assert_eq!(Value::from(7_i32), Value::I64(7));
        assert_eq!(Value::from(7_u16), Value::I64(7));
        assert_eq!(Value::from(1.5_f32), Value::F64(1.5));
        assert_eq!(Value::from("x"), Value::String("x".into()));
    }

    #[test]
    fn test_status_from_unknown_code() {
        assert_eq!(StatusCode::from_code(0), StatusCode::Unset);
        assert_eq!(StatusCode::from_code(1), StatusCode::Error);
        assert_eq!(StatusCode::from_code(2), StatusCode::Ok);
        assert_eq!(StatusCode::from_code(42), StatusCode::Unset);
    }

    #[test]
    fn test_span_lifecycle() {
        let mut span = SpanData::new(1, 2, 0, "GET /").with_kind(SpanKind::Server);
        span.set_attribute("http.method", "GET");
        span.add_event("log", vec![KeyValue::new("level", "info")]);
        span.end(Status::ok());

        assert_eq!(span.kind, SpanKind::Server);
        assert_eq!(span.attributes.len(), 1);
        assert_eq!(span.events.len(), 1);
        assert_eq!(span.status.code, StatusCode::Ok);
        assert!(span.end_time >= span.start_time);
    }
}
