//! Explicit constructor table for tagged objects.
//!
//! Every type that travels as a tagged object registers a name and a
//! decode-time constructor here. Codecs receive the table at construction and
//! consult it when they meet a tag marker; unknown names decode to `Null`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::codec::value::{Tagged, Value};

type Factory = Arc<dyn Fn(&[Value]) -> Option<Tagged> + Send + Sync>;

/// A type that serializes to a constructor name plus argument list.
pub trait Serializable: Sized {
    /// Registered constructor name.
    const NAME: &'static str;

    /// Arguments that rebuild this value through [`Serializable::from_arguments`].
    fn arguments(&self) -> Vec<Value>;

    /// Rebuild from decoded arguments. `None` rejects the object.
    fn from_arguments(arguments: &[Value]) -> Option<Self>;

    fn to_tagged(&self) -> Tagged {
        Tagged::new(Self::NAME, self.arguments())
    }

    fn to_value(&self) -> Value {
        Value::Tagged(self.to_tagged())
    }

    fn from_tagged(tagged: &Tagged) -> Option<Self> {
        if tagged.name != Self::NAME {
            return None;
        }
        Self::from_arguments(&tagged.arguments)
    }
}

/// Name → constructor lookup used by the codecs.
#[derive(Clone)]
pub struct TagRegistry {
    factories: HashMap<String, Factory>,
}

impl TagRegistry {
    /// A registry with nothing registered, not even [`Blob`].
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a [`Serializable`] type under its `NAME`.
    pub fn register<T: Serializable + 'static>(&mut self) -> &mut Self {
        self.factories.insert(
            T::NAME.to_string(),
            Arc::new(|arguments: &[Value]| {
                T::from_arguments(arguments).map(|value| value.to_tagged())
            }),
        );
        self
    }

    /// Register a raw constructor for `name`.
    pub fn register_with<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Option<Tagged> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Run the registered constructor for `name`.
    pub fn reconstruct(&self, name: &str, arguments: &[Value]) -> Option<Value> {
        let factory = self.factories.get(name)?;
        factory(arguments).map(Value::Tagged)
    }

    /// Reconstruct from a decoded `{constructor, arguments}` map; `Null` when
    /// the map is malformed or the name is unknown.
    pub(crate) fn revive(&self, envelope: Value) -> Value {
        match Tagged::from_envelope(envelope) {
            Some(tagged) => match self.reconstruct(&tagged.name, &tagged.arguments) {
                Some(value) => value,
                None => {
                    tracing::debug!(constructor = %tagged.name, "Unknown or rejected tagged object");
                    Value::Null
                }
            },
            None => Value::Null,
        }
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register::<Blob>();
        registry
    }
}

impl fmt::Debug for TagRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("TagRegistry").field("names", &names).finish()
    }
}

/// Opaque bytes, carried as a base64 argument.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob(pub Vec<u8>);

impl Serializable for Blob {
    const NAME: &'static str = "Buffer";

    fn arguments(&self) -> Vec<Value> {
        vec![
            Value::String(STANDARD.encode(&self.0)),
            Value::String("base64".to_string()),
        ]
    }

    fn from_arguments(arguments: &[Value]) -> Option<Self> {
        let encoded = arguments.first()?.as_str()?;
        match arguments.get(1).and_then(Value::as_str) {
            None | Some("base64") => STANDARD.decode(encoded).ok().map(Blob),
            Some("utf8") => Some(Blob(encoded.as_bytes().to_vec())),
            Some(_) => None,
        }
    }
}
