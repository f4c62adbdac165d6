//! The event-vector envelope: `[event-id]`, `[event-id data]`, or
//! `[[event-id data] cb-uuid]` when a reply is expected.

use crate::edn::{EdnParseError, EdnValue, Ident};

/// An event id, always a namespaced or bare symbol in the wire form (e.g.
/// `chsk/handshake`, `app/user-joined`) but handled here as a plain string
/// so application code never has to construct an [`Ident`] itself.
pub type EventId = String;

/// A decoded `[event-id data?]` pair, without the optional callback wrapper.
#[derive(Debug, Clone, PartialEq)]
pub struct EventVector {
    pub id: EventId,
    pub data: Option<EdnValue>,
}

impl EventVector {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: None,
        }
    }

    pub fn with_data(id: impl Into<String>, data: EdnValue) -> Self {
        Self {
            id: id.into(),
            data: Some(data),
        }
    }

    fn to_edn(&self) -> EdnValue {
        let id = EdnValue::Symbol(Ident::parse(&self.id));
        match &self.data {
            Some(data) => EdnValue::Vector(vec![id, data.clone()]),
            None => EdnValue::Vector(vec![id]),
        }
    }

    fn from_edn(value: &EdnValue) -> Result<Self, DecodeError> {
        let items = value
            .as_vector()
            .ok_or_else(|| DecodeError::NotAVector("event vector must be a vector".into()))?;
        if items.is_empty() {
            return Err(DecodeError::Empty);
        }
        let id = match &items[0] {
            EdnValue::Symbol(ident) => ident.to_string(),
            EdnValue::Keyword(ident) => ident.to_string(),
            _ => return Err(DecodeError::InvalidEventId("event id must be a symbol or keyword".into())),
        };
        if items.len() > 2 {
            return Err(DecodeError::InvalidFormat(
                "event vector must have at most [id data]".into(),
            ));
        }
        let data = items.get(1).cloned();
        Ok(EventVector { id, data })
    }
}

/// The full wire envelope: an [`EventVector`] plus an optional callback id
/// correlating a reply back to the sender's pending RPC waiter.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: EventVector,
    pub callback_id: Option<String>,
}

impl Envelope {
    pub fn fire_and_forget(event: EventVector) -> Self {
        Self {
            event,
            callback_id: None,
        }
    }

    pub fn with_callback(event: EventVector, callback_id: impl Into<String>) -> Self {
        Self {
            event,
            callback_id: Some(callback_id.into()),
        }
    }
}

/// Errors returned while decoding a wire message into an [`Envelope`],
/// matching the decode error kinds an event vector can fail with.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid EDN: {0}")]
    Edn(#[from] EdnParseError),
    #[error("not a vector: {0}")]
    NotAVector(String),
    #[error("empty event vector")]
    Empty,
    #[error("invalid event id: {0}")]
    InvalidEventId(String),
    #[error("invalid event envelope format: {0}")]
    InvalidFormat(String),
}

/// Encode an envelope to its wire text.
pub fn encode(envelope: &Envelope) -> String {
    let value = match &envelope.callback_id {
        Some(cb) => EdnValue::Vector(vec![
            envelope.event.to_edn(),
            EdnValue::Str(cb.clone()),
        ]),
        None => envelope.event.to_edn(),
    };
    crate::edn::write(&value)
}

/// Decode wire text into an envelope.
///
/// Accepts both bare `[event-id data?]` forms and the callback-wrapped
/// `[[event-id data?] cb-uuid]` form. A top-level vector of length 2 whose
/// first element is itself a vector is always treated as the wrapped form;
/// this is unambiguous because a bare event vector's first element is
/// always a symbol or keyword, never a vector.
pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
    let value = crate::edn::parse(text)?;
    let items = value
        .as_vector()
        .ok_or_else(|| DecodeError::NotAVector("top-level message must be a vector".into()))?;

    if items.len() == 2 {
        if let Some(inner) = items[0].as_vector() {
            let _ = inner; // shape already validated by EventVector::from_edn below
            let event = EventVector::from_edn(&items[0])?;
            let callback_id = match &items[1] {
                EdnValue::Str(s) => Some(s.clone()),
                EdnValue::Nil => None,
                other => {
                    return Err(DecodeError::InvalidFormat(format!(
                        "callback id must be a string or nil, got {other:?}"
                    )))
                }
            };
            return Ok(Envelope {
                event,
                callback_id,
            });
        }
    }

    Ok(Envelope::fire_and_forget(EventVector::from_edn(&value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edn::EdnValue;

    #[test]
    fn round_trips_bare_event_without_data() {
        let env = Envelope::fire_and_forget(EventVector::new("app/ping"));
        let text = encode(&env);
        assert_eq!(decode(&text).unwrap(), env);
    }

    #[test]
    fn round_trips_event_with_data() {
        let env = Envelope::fire_and_forget(EventVector::with_data(
            "app/echo",
            EdnValue::Str("hi".into()),
        ));
        let text = encode(&env);
        assert_eq!(decode(&text).unwrap(), env);
    }

    #[test]
    fn round_trips_event_with_callback_id() {
        let env = Envelope::with_callback(
            EventVector::with_data("app/rpc", EdnValue::Int(7)),
            "cb-1234",
        );
        let text = encode(&env);
        assert_eq!(decode(&text).unwrap(), env);
    }

    #[test]
    fn rejects_empty_vector() {
        assert!(decode("[]").is_err());
    }

    #[test]
    fn rejects_non_vector_top_level() {
        assert!(decode("42").is_err());
    }

    #[test]
    fn disambiguates_two_element_bare_event_from_wrapped_form() {
        // [event-id data] — bare form, *not* mistaken for [[event-id] cb].
        let env = decode("[app/echo \"x\"]").unwrap();
        assert_eq!(env.callback_id, None);
        assert_eq!(env.event.id, "app/echo");
    }
}
