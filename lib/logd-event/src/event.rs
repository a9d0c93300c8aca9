use ordered_float::NotNan;

/// One unit of a parsed document stream.
///
/// Value-bearing events carry the node tag so that node↔event conversion
/// is lossless. `NullKey` is the event form of the merge-directive key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    BeginObject { tag: Option<String> },
    EndObject,
    BeginArray { tag: Option<String> },
    EndArray,
    Key(String),
    IntKey(i64),
    NullKey,
    String { value: String, tag: Option<String> },
    Int { value: i64, tag: Option<String> },
    Float { value: NotNan<f64>, tag: Option<String> },
    Bool { value: bool, tag: Option<String> },
    Null { tag: Option<String> },
    Comment(Vec<String>),
}

impl Event {
    pub fn begin_object() -> Self {
        Event::BeginObject { tag: None }
    }

    pub fn begin_array() -> Self {
        Event::BeginArray { tag: None }
    }

    pub fn key(name: impl Into<String>) -> Self {
        Event::Key(name.into())
    }

    pub fn string(value: impl Into<String>) -> Self {
        Event::String {
            value: value.into(),
            tag: None,
        }
    }

    pub fn int(value: i64) -> Self {
        Event::Int { value, tag: None }
    }

    pub fn bool(value: bool) -> Self {
        Event::Bool { value, tag: None }
    }

    pub fn null() -> Self {
        Event::Null { tag: None }
    }

    /// The tag carried by a value-bearing event.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Event::BeginObject { tag }
            | Event::BeginArray { tag }
            | Event::String { tag, .. }
            | Event::Int { tag, .. }
            | Event::Float { tag, .. }
            | Event::Bool { tag, .. }
            | Event::Null { tag } => tag.as_deref(),
            _ => None,
        }
    }

    /// Whether this event begins a value (container begin or scalar).
    pub fn starts_value(&self) -> bool {
        matches!(
            self,
            Event::BeginObject { .. }
                | Event::BeginArray { .. }
                | Event::String { .. }
                | Event::Int { .. }
                | Event::Float { .. }
                | Event::Bool { .. }
                | Event::Null { .. }
        )
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Event::String { .. }
                | Event::Int { .. }
                | Event::Float { .. }
                | Event::Bool { .. }
                | Event::Null { .. }
        )
    }

    pub fn is_key(&self) -> bool {
        matches!(self, Event::Key(_) | Event::IntKey(_) | Event::NullKey)
    }
}

/// Receives a stream of events.
///
/// Implemented by plain buffers, the snapshot builder, and the wire
/// encoder, so producers can stream without knowing where events land.
pub trait EventSink {
    fn emit(&mut self, event: Event) -> Result<(), crate::EventError>;
}

impl EventSink for Vec<Event> {
    fn emit(&mut self, event: Event) -> Result<(), crate::EventError> {
        self.push(event);
        Ok(())
    }
}
