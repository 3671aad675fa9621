use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// One concrete assignment of scenario-argument keys to values.
///
/// Equality and hashing follow the key/value mapping only, so two runs built
/// in a different insertion order are the same run. The order used when a run
/// is rendered into a file name or an argument vector comes from the schema of
/// its group, see [`Run::values_for`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Run {
    args: BTreeMap<String, String>,
}

impl Run {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            args: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns a copy of this run with `key` set to `value`, replacing any
    /// existing value for that key.
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut args = self.args.clone();
        args.insert(key.into(), value.into());
        Self { args }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.args.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.args.values().map(String::as_str)
    }

    pub fn contains_value(&self, value: &str) -> bool {
        self.args.values().any(|v| v == value)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Values in the order given by `keys`. Keys the run does not carry are
    /// skipped.
    pub fn values_for<'a>(&'a self, keys: &'a [String]) -> impl Iterator<Item = &'a str> + 'a {
        keys.iter().filter_map(move |k| self.get(k))
    }

    /// `key value` pairs in the order given by `keys`.
    pub fn pairs_for<'a>(
        &'a self,
        keys: &'a [String],
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        keys.iter()
            .filter_map(move |k| self.get(k).map(|v| (k.as_str(), v)))
    }

    pub(crate) fn sorted_keys(&self) -> Vec<String> {
        self.args.keys().cloned().collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Run {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

// Scalar values are accepted so that `e1: 100` in a batch file does not need
// quoting. Leading zeros are lost by YAML itself; quote such values.
impl<'de> Deserialize<'de> for Run {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Scalar {
            Text(String),
            Int(i64),
            Float(f64),
            Bool(bool),
        }

        let raw = BTreeMap::<String, Scalar>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    Scalar::Text(s) => s,
                    Scalar::Int(i) => i.to_string(),
                    Scalar::Float(f) => f.to_string(),
                    Scalar::Bool(b) => b.to_string(),
                };
                (k, v)
            })
            .collect())
    }
}

impl fmt::Display for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        f.write_str("}")
    }
}
