//! The sixteen washer sensors, each a read-only view of one field of the shared snapshot.

use crate::codes::{
    CodeTable, DecodeError, ZeoDetergentType, ZeoDryingMode, ZeoError, ZeoProgram, ZeoRinse,
    ZeoSoftenerType, ZeoSpin, ZeoTemperature,
};
use crate::coordinator::PollCoordinator;
use crate::protocol::{FieldValue, StatusSnapshot, ZeoField};
use std::sync::Arc;

pub const DOMAIN: &str = "zeo_one";
pub const TEMP_CELSIUS: &str = "°C";

type Decode = fn(ZeoField, Option<&FieldValue>) -> Result<&'static str, DecodeError>;
type Entries = fn() -> Vec<(i64, &'static str)>;

/// How a raw field value turns into a sensor reading.
#[derive(Clone, Copy)]
pub enum Render {
    /// The raw value as reported, or `default` if the field is absent.
    Passthrough { default: Fallback },
    /// Truthiness of the raw value; `false` if absent.
    Flag,
    /// Symbolic name of the code; an absent field reads as code 0.
    Enumerated { decode: Decode, entries: Entries, table: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fallback {
    Unknown,
    Zero,
}

impl Render {
    const fn table<T: CodeTable>() -> Self {
        Self::Enumerated { decode: T::decode, entries: T::entries, table: T::TABLE }
    }
}

impl std::fmt::Debug for Render {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passthrough { default } => f.debug_struct("Passthrough").field("default", default).finish(),
            Self::Flag => f.write_str("Flag"),
            Self::Enumerated { table, .. } => f.debug_struct("Enumerated").field("table", table).finish(),
        }
    }
}

/// The presented value of a sensor.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Integer(i64),
    Boolean(bool),
    Text(String),
    Symbol(&'static str),
}

impl From<&FieldValue> for ReadingValue {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Integer(i) => Self::Integer(*i),
            FieldValue::Boolean(b) => Self::Boolean(*b),
            FieldValue::Text(s) => Self::Text(s.clone()),
        }
    }
}

impl std::fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Text(s) => f.write_str(s),
            Self::Symbol(s) => f.write_str(s),
        }
    }
}

#[derive(Debug)]
pub struct SensorDescription {
    pub suffix: &'static str,
    pub name: &'static str,
    pub field: ZeoField,
    pub render: Render,
    pub unit: Option<&'static str>,
}

impl SensorDescription {
    /// Compute the reading from `snapshot`. Only this sensor's field is consulted.
    pub fn render(&self, snapshot: &StatusSnapshot) -> Result<ReadingValue, DecodeError> {
        let raw = snapshot.get(self.field);
        Ok(match self.render {
            Render::Passthrough { default } => match (raw, default) {
                (Some(v), _) => v.into(),
                (None, Fallback::Unknown) => ReadingValue::Symbol("unknown"),
                (None, Fallback::Zero) => ReadingValue::Integer(0),
            },
            Render::Flag => ReadingValue::Boolean(match raw {
                None => false,
                Some(FieldValue::Boolean(b)) => *b,
                Some(FieldValue::Integer(i)) => *i != 0,
                Some(FieldValue::Text(s)) => text_flag(s),
            }),
            Render::Enumerated { decode, .. } => ReadingValue::Symbol(decode(self.field, raw)?),
        })
    }
}

/// Text flags are set unless empty or spelling out zero or false.
fn text_flag(text: &str) -> bool {
    let text = text.trim();
    !(text.is_empty() || text == "0" || text.eq_ignore_ascii_case("false"))
}

macro_rules! sensor {
    ($suffix:literal, $name:literal, $field:ident, $render:expr) => {
        sensor!($suffix, $name, $field, $render, None)
    };
    ($suffix:literal, $name:literal, $field:ident, $render:expr, $unit:expr) => {
        SensorDescription {
            suffix: $suffix,
            name: concat!("Zeo One ", $name),
            field: ZeoField::$field,
            render: $render,
            unit: $unit,
        }
    };
}

const UNKNOWN: Render = Render::Passthrough { default: Fallback::Unknown };
const ZERO: Render = Render::Passthrough { default: Fallback::Zero };

pub static SENSORS: [SensorDescription; 16] = [
    sensor!("mode", "Mode", Mode, UNKNOWN),
    sensor!("state", "State", State, UNKNOWN),
    sensor!("countdown", "Countdown", Countdown, ZERO),
    sensor!("washing_left", "Washing Left", WashingLeft, ZERO),
    sensor!("error", "Error", Error, Render::table::<ZeoError>()),
    sensor!("times_after_clean", "Times After Clean", TimesAfterClean, ZERO),
    sensor!("detergent_empty", "Detergent Empty", DetergentEmpty, Render::Flag),
    sensor!("softener_empty", "Softener Empty", SoftenerEmpty, Render::Flag),
    sensor!("program", "Program", Program, Render::table::<ZeoProgram>()),
    sensor!("temp", "Temperature", Temp, Render::table::<ZeoTemperature>(), Some(TEMP_CELSIUS)),
    sensor!("rinse_times", "Rinse Times", RinseTimes, Render::table::<ZeoRinse>()),
    sensor!("spin_level", "Spin Level", SpinLevel, Render::table::<ZeoSpin>()),
    sensor!("drying_mode", "Drying Mode", DryingMode, Render::table::<ZeoDryingMode>()),
    sensor!("detergent_type", "Detergent Type", DetergentType, Render::table::<ZeoDetergentType>()),
    sensor!("softener_type", "Softener Type", SoftenerType, Render::table::<ZeoSoftenerType>()),
    sensor!("sound_set", "Sound Set", SoundSet, Render::Flag),
];

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DeviceInfo {
    pub identifiers: (&'static str, String),
    pub name: &'static str,
    pub manufacturer: &'static str,
    pub suggested_area: &'static str,
}

/// One sensor bound to an integration instance.
#[derive(Clone)]
pub struct SensorEntity {
    description: &'static SensorDescription,
    entry_id: Arc<str>,
    coordinator: Arc<PollCoordinator>,
}

impl SensorEntity {
    pub fn new(
        description: &'static SensorDescription,
        entry_id: Arc<str>,
        coordinator: Arc<PollCoordinator>,
    ) -> Self {
        Self { description, entry_id, coordinator }
    }

    /// All sixteen sensors for one integration instance.
    pub fn all(entry_id: &str, coordinator: &Arc<PollCoordinator>) -> Vec<Self> {
        let entry_id = Arc::<str>::from(entry_id);
        SENSORS
            .iter()
            .map(|d| Self::new(d, Arc::clone(&entry_id), Arc::clone(coordinator)))
            .collect()
    }

    pub fn description(&self) -> &'static SensorDescription {
        self.description
    }

    pub fn name(&self) -> &'static str {
        self.description.name
    }

    pub fn unique_id(&self) -> String {
        format!("{}_{}", self.entry_id, self.description.suffix)
    }

    pub fn value(&self) -> Result<ReadingValue, DecodeError> {
        self.description.render(&self.coordinator.snapshot())
    }

    pub fn unit(&self) -> Option<&'static str> {
        self.description.unit
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            identifiers: (DOMAIN, self.entry_id.to_string()),
            name: "Zeo One",
            manufacturer: "Zeo",
            suggested_area: "Bathroom",
        }
    }

    /// Whether the most recent poll succeeded.
    pub fn available(&self) -> bool {
        self.coordinator.last_update_success()
    }
}
