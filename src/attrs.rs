use indexmap::IndexMap;
use tracing::warn;

/// Value of a single element attribute.
///
/// `Flag(true)` is a present boolean attribute (`async`, `defer`), `Flag(false)`
/// means the attribute should be absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrValue {
    Text(String),
    Flag(bool),
}

impl AttrValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(text) => Some(text),
            AttrValue::Flag(_) => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Flag(value)
    }
}

/// Attributes in the order they were first set.
pub type Attributes = IndexMap<String, AttrValue>;

/// Only tables can carry attributes.
pub fn is_object(value: &toml::Value) -> bool {
    matches!(value, toml::Value::Table(_))
}

/// Shallow merge: every key of `overlay` is copied onto `base`, replacing what was there.
pub fn extend(base: &mut Attributes, overlay: &Attributes) {
    for (key, value) in overlay {
        base.insert(key.clone(), value.clone());
    }
}

/// Flatten a toml table into attributes. Nested tables and arrays have no attribute
/// form and are dropped.
pub fn from_toml(table: &toml::Table) -> Attributes {
    let mut attrs = Attributes::new();

    for (key, value) in table {
        use toml::Value::*;
        let value = match value {
            String(text) => AttrValue::Text(text.clone()),
            Boolean(flag) => AttrValue::Flag(*flag),
            Integer(_) | Float(_) | Datetime(_) => AttrValue::Text(value.to_string()),
            Array(_) | Table(_) => {
                warn!("Ignoring attribute `{}`: not a scalar value", key);
                continue;
            }
        };
        attrs.insert(key.clone(), value);
    }

    attrs
}

/// An attribute value as a loosely typed caller hands it over.
#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Text(String),
    Number(f64),
    /// Objects, arrays, functions and the like.
    Other,
}

/// Attributes from loosely typed pairs, keeping their order. Values with no
/// attribute form are dropped.
pub fn from_scalars<I>(entries: I) -> Attributes
where
    I: IntoIterator<Item = (String, Scalar)>,
{
    let mut attrs = Attributes::new();

    for (key, value) in entries {
        let value = match value {
            Scalar::Bool(flag) => AttrValue::Flag(flag),
            Scalar::Text(text) => AttrValue::Text(text),
            Scalar::Number(number) => AttrValue::Text(number.to_string()),
            Scalar::Other => {
                warn!("Ignoring attribute `{}`: not a scalar value", key);
                continue;
            }
        };
        attrs.insert(key, value);
    }

    attrs
}
