use std::collections::BTreeMap;

/// Status attributes the washer reports, keyed by their data-point id.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::VariantArray,
    strum::FromRepr,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ZeoField {
    State = 203,
    Mode = 204,
    Program = 205,
    Temp = 207,
    RinseTimes = 208,
    SpinLevel = 209,
    DryingMode = 210,
    DetergentType = 213,
    SoftenerType = 214,
    Countdown = 217,
    WashingLeft = 218,
    Error = 220,
    SoundSet = 223,
    TimesAfterClean = 224,
    DetergentEmpty = 226,
    SoftenerEmpty = 227,
}

impl ZeoField {
    /// Every field this crate knows how to present, in data-point id order.
    pub const ALL: &'static [ZeoField] = <Self as strum::VariantArray>::VARIANTS;

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::from_repr(id)
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// A single status value as reported by the device, before any presentation.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Boolean(bool),
    Text(String),
}

impl FieldValue {
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        Some(match value {
            serde_json::Value::Bool(b) => Self::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Text(n.to_string()),
            },
            serde_json::Value::String(s) => Self::Text(s.clone()),
            serde_json::Value::Null
            | serde_json::Value::Array(_)
            | serde_json::Value::Object(_) => return None,
        })
    }

    pub fn as_integer(&self) -> Option<i64> {
        match *self {
            Self::Integer(i) => Some(i),
            Self::Boolean(_) | Self::Text(_) => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// The complete set of values fetched in one poll.
///
/// Snapshots are never edited after construction; a newer poll produces a new snapshot that
/// replaces the old one wholesale.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    values: BTreeMap<ZeoField, FieldValue>,
}

impl StatusSnapshot {
    /// Build a snapshot out of raw `dps` entries. Ids this crate does not know are dropped.
    pub fn from_data_points<'a>(
        points: impl IntoIterator<Item = (u32, &'a serde_json::Value)>,
    ) -> Self {
        let mut values = BTreeMap::new();
        for (id, raw) in points {
            let Some(field) = ZeoField::from_id(id) else {
                tracing::trace!(id, "ignoring unknown data point");
                continue;
            };
            let Some(value) = FieldValue::from_json(raw) else {
                tracing::debug!(field = field.name(), ?raw, "data point value has unexpected type");
                continue;
            };
            values.insert(field, value);
        }
        Self { values }
    }

    pub fn get(&self, field: ZeoField) -> Option<&FieldValue> {
        self.values.get(&field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ZeoField, &FieldValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(ZeoField, FieldValue)> for StatusSnapshot {
    fn from_iter<T: IntoIterator<Item = (ZeoField, FieldValue)>>(iter: T) -> Self {
        Self { values: iter.into_iter().collect() }
    }
}
