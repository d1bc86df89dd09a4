/*!
Typed save records.

Every value in a save file is stored together with a type tag:

```json
{
  "score": { "$type": "i32", "value": 42 },
  "spawn": { "$type": "f32[]", "value": [1.0, 0.5, -3.0] }
}
```

Reading a record as `T` compares the stored tag with `T::type_name()` before
touching the payload, so asking for the wrong type fails that single read
instead of coercing the value. Tags are only compared, never used to pick a
type to construct, so a crafted file cannot make the loader instantiate
anything the caller did not ask for.

Types opt in by implementing [`Savable`], usually through [`impl_savable!`]:

```rust
use esave_core::impl_savable;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Inventory {
    gold: u32,
    items: Vec<String>,
}

impl_savable!(Inventory => "Inventory");
```

JSON has no literal for NaN or the infinities, so `f32` and `f64` records
store them as the strings `"NaN"`, `"Infinity"` and `"-Infinity"`. Float
fields inside derived types need `#[serde(with = "esave_core::savable::non_finite")]`
to get the same treatment.
*/

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, SaveError};

/// A value that can be stored in a save file
pub trait Savable: Serialize + DeserializeOwned {
    /// Stable tag written next to the value. Must be unique per type.
    fn type_name() -> Cow<'static, str>;

    /// The JSON payload stored for this value
    fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild a value from its stored payload
    fn from_payload(value: &Value) -> Result<Self> {
        Ok(Self::deserialize(value)?)
    }
}

/// Serde helpers for float fields that may hold NaN or an infinity
///
/// Use as `#[serde(with = "esave_core::savable::non_finite")]` on an `f32`
/// or `f64` field. Finite values are plain JSON numbers.
pub mod non_finite {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// `f32` or `f64`
    pub trait Float: Copy + Serialize + for<'de> Deserialize<'de> {
        fn to_f64(self) -> f64;
        fn from_f64(value: f64) -> Self;
    }

    impl Float for f32 {
        fn to_f64(self) -> f64 {
            f64::from(self)
        }

        fn from_f64(value: f64) -> Self {
            value as f32
        }
    }

    impl Float for f64 {
        fn to_f64(self) -> f64 {
            self
        }

        fn from_f64(value: f64) -> Self {
            value
        }
    }

    fn label(value: f64) -> Option<&'static str> {
        if value.is_nan() {
            Some("NaN")
        } else if value == f64::INFINITY {
            Some("Infinity")
        } else if value == f64::NEG_INFINITY {
            Some("-Infinity")
        } else {
            None
        }
    }

    fn from_label(label: &str) -> Option<f64> {
        match label {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        }
    }

    pub fn serialize<F: Float, S: Serializer>(
        value: &F,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match label(value.to_f64()) {
            Some(label) => serializer.serialize_str(label),
            None => value.serialize(serializer),
        }
    }

    pub fn deserialize<'de, F: Float, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<F, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<F> {
            Number(F),
            Label(String),
        }

        match Repr::<F>::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Label(text) => from_label(&text)
                .map(F::from_f64)
                .ok_or_else(|| D::Error::custom(format!("'{text}' is not a float"))),
        }
    }
}

/// Implement [`Savable`] for one or more types with fixed tags
#[macro_export]
macro_rules! impl_savable {
    ($($ty:ty => $name:expr),+ $(,)?) => {
        $(
            impl $crate::savable::Savable for $ty {
                fn type_name() -> ::std::borrow::Cow<'static, str> {
                    ::std::borrow::Cow::Borrowed($name)
                }
            }
        )+
    };
}

crate::impl_savable!(
    bool => "bool",
    i8 => "i8",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    u8 => "u8",
    u16 => "u16",
    u32 => "u32",
    u64 => "u64",
    char => "char",
    String => "String",
);

macro_rules! impl_savable_float {
    ($($ty:ty => $name:expr),+ $(,)?) => {
        $(
            impl Savable for $ty {
                fn type_name() -> Cow<'static, str> {
                    Cow::Borrowed($name)
                }

                fn to_payload(&self) -> Result<Value> {
                    Ok(non_finite::serialize(self, serde_json::value::Serializer)?)
                }

                fn from_payload(value: &Value) -> Result<Self> {
                    Ok(non_finite::deserialize(value)?)
                }
            }
        )+
    };
}

impl_savable_float!(f32 => "f32", f64 => "f64");

fn expected_shape(what: &str, value: &Value) -> SaveError {
    SaveError::invalid_format(format!("expected {what}, found {value}"))
}

impl<T: Savable> Savable for Vec<T> {
    fn type_name() -> Cow<'static, str> {
        Cow::Owned(format!("{}[]", T::type_name()))
    }

    fn to_payload(&self) -> Result<Value> {
        self.iter()
            .map(T::to_payload)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array)
    }

    fn from_payload(value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) => items.iter().map(T::from_payload).collect(),
            other => Err(expected_shape("an array", other)),
        }
    }
}

impl<T: Savable> Savable for Option<T> {
    fn type_name() -> Cow<'static, str> {
        Cow::Owned(format!("{}?", T::type_name()))
    }

    fn to_payload(&self) -> Result<Value> {
        match self {
            Some(value) => value.to_payload(),
            None => Ok(Value::Null),
        }
    }

    fn from_payload(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_payload(other).map(Some),
        }
    }
}

fn map_to_payload<'a, T: Savable + 'a>(
    entries: impl Iterator<Item = (&'a String, &'a T)>,
) -> Result<Value> {
    entries
        .map(|(key, value)| Ok((key.clone(), value.to_payload()?)))
        .collect::<Result<serde_json::Map<_, _>>>()
        .map(Value::Object)
}

fn map_from_payload<T: Savable, M: FromIterator<(String, T)>>(value: &Value) -> Result<M> {
    match value {
        Value::Object(entries) => entries
            .iter()
            .map(|(key, value)| Ok((key.clone(), T::from_payload(value)?)))
            .collect(),
        other => Err(expected_shape("an object", other)),
    }
}

impl<T: Savable> Savable for BTreeMap<String, T> {
    fn type_name() -> Cow<'static, str> {
        Cow::Owned(format!("map<{}>", T::type_name()))
    }

    fn to_payload(&self) -> Result<Value> {
        map_to_payload(self.iter())
    }

    fn from_payload(value: &Value) -> Result<Self> {
        map_from_payload(value)
    }
}

impl<T: Savable> Savable for HashMap<String, T> {
    fn type_name() -> Cow<'static, str> {
        Cow::Owned(format!("map<{}>", T::type_name()))
    }

    fn to_payload(&self) -> Result<Value> {
        map_to_payload(self.iter())
    }

    fn from_payload(value: &Value) -> Result<Self> {
        map_from_payload(value)
    }
}

/// A single stored value together with its type tag
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SavableRecord {
    #[serde(rename = "$type")]
    type_name: String,
    value: Value,
}

impl SavableRecord {
    /// Serialize `value` into a tagged record
    pub fn new<T: Savable>(value: &T) -> Result<Self> {
        Ok(Self {
            type_name: T::type_name().into_owned(),
            value: value.to_payload()?,
        })
    }

    /// Build a record from an already serialized value
    ///
    /// Nothing checks that `value` matches `type_name`; a wrong pairing
    /// surfaces as a [`SaveError::TypeMismatch`] on read.
    pub fn from_raw(type_name: impl Into<String>, value: Value) -> Self {
        Self {
            type_name: type_name.into(),
            value,
        }
    }

    /// The stored type tag
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The stored JSON payload
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// True if the record was written from a `T`
    pub fn is<T: Savable>(&self) -> bool {
        self.type_name == T::type_name()
    }

    /// Decode the payload as `T`; `key` is only used for the error
    pub fn decode<T: Savable>(&self, key: &str) -> Result<T> {
        let expected = T::type_name();
        if self.type_name != expected {
            return Err(SaveError::type_mismatch(
                key,
                expected,
                self.type_name.as_str(),
            ));
        }

        T::from_payload(&self.value).map_err(|e| {
            SaveError::type_mismatch(key, expected, format!("{} ({e})", self.type_name))
        })
    }
}
