//! Closed code tables for the enumerated status fields.
//!
//! The device reports small integers in place of symbolic names. Each table below lists every
//! code the vendor documents for a field; anything else is reported as a [`DecodeError`] rather
//! than guessed at.

use crate::protocol::{FieldValue, ZeoField};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{field:?} code {code} is not a known {table} value")]
    UnknownCode { field: ZeoField, table: &'static str, code: i64 },
    #[error("{field:?} value `{value}` is not a numeric code")]
    NotACode { field: ZeoField, value: String },
}

/// A field-specific mapping from integer code to symbolic name.
pub trait CodeTable: Sized + Copy + 'static {
    const TABLE: &'static str;
    fn from_code(code: i64) -> Option<Self>;
    fn code(self) -> i64;
    fn symbol(self) -> &'static str;
    /// All `(code, name)` pairs of the table in declaration order.
    fn entries() -> Vec<(i64, &'static str)>;

    fn lookup(field: ZeoField, code: i64) -> Result<&'static str, DecodeError> {
        Self::from_code(code)
            .map(Self::symbol)
            .ok_or(DecodeError::UnknownCode { field, table: Self::TABLE, code })
    }

    /// Decode a raw snapshot value. Absent values read as code `0`.
    fn decode(field: ZeoField, value: Option<&FieldValue>) -> Result<&'static str, DecodeError> {
        let code = match value {
            None => 0,
            Some(v) => v
                .as_integer()
                .ok_or_else(|| DecodeError::NotACode { field, value: v.to_string() })?,
        };
        Self::lookup(field, code)
    }
}

macro_rules! code_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident as $table:literal {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal),* $(,)?
        }
    ) => {
        #[derive(
            strum::VariantNames,
            strum::VariantArray,
            strum::FromRepr,
            strum::IntoStaticStr,
            num_derive::ToPrimitive,
            Clone,
            Copy,
            Debug,
            PartialEq,
            Eq,
        )]
        #[strum(serialize_all = "snake_case")]
        #[repr(u8)]
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $variant = $value),*
        }

        impl $crate::codes::CodeTable for $name {
            const TABLE: &'static str = $table;
            fn from_code(code: i64) -> Option<Self> {
                u8::try_from(code).ok().and_then(Self::from_repr)
            }
            fn code(self) -> i64 {
                num_traits::ToPrimitive::to_i64(&self).unwrap_or_default()
            }
            fn symbol(self) -> &'static str {
                self.into()
            }
            fn entries() -> Vec<(i64, &'static str)> {
                <Self as strum::VariantArray>::VARIANTS
                    .iter()
                    .map(|v| (v.code(), v.symbol()))
                    .collect()
            }
        }
    };
}

code_enum! {
    pub enum ZeoMode as "mode" {
        Wash = 1,
        WashAndDry = 2,
        Dry = 3,
    }
}

code_enum! {
    pub enum ZeoState as "state" {
        Standby = 1,
        Weighing = 2,
        Soaking = 3,
        Washing = 4,
        Rinsing = 5,
        Spinning = 6,
        Drying = 7,
        Cooling = 8,
        UnderDelayStart = 9,
        Done = 10,
    }
}

code_enum! {
    pub enum ZeoProgram as "program" {
        Standard = 1,
        Quick = 2,
        Sanitize = 3,
        Wool = 4,
        AirRefresh = 5,
        Custom = 6,
        Bedding = 7,
        Down = 8,
        Silk = 9,
        RinseAndSpin = 10,
        Spin = 11,
        DownClean = 12,
        BabyCare = 13,
        AntiAllergen = 14,
        Sportswear = 15,
        Night = 16,
        NewClothes = 17,
        Shirts = 18,
        Synthetics = 19,
        Underwear = 20,
        Gentle = 21,
        Intensive = 22,
        CottonLinen = 23,
        Season = 24,
        Warming = 25,
        Bra = 26,
        Panties = 27,
        BoilingWash = 28,
        Socks = 30,
        Towels = 31,
        AntiMite = 32,
        #[strum(to_string = "exo_40_60")]
        Exo40_60 = 33,
        TwentyC = 34,
        TShirts = 35,
        StainRemoval = 36,
    }
}

code_enum! {
    pub enum ZeoTemperature as "temperature" {
        Normal = 1,
        Low = 2,
        Medium = 3,
        High = 4,
        Max = 5,
        TwentyC = 6,
    }
}

code_enum! {
    pub enum ZeoRinse as "rinse" {
        None = 0,
        Min = 1,
        Low = 2,
        Mid = 3,
        High = 4,
        Max = 5,
    }
}

code_enum! {
    pub enum ZeoSpin as "spin" {
        None = 1,
        VeryLow = 2,
        Low = 3,
        Mid = 4,
        High = 5,
        VeryHigh = 6,
        Max = 7,
    }
}

code_enum! {
    pub enum ZeoDryingMode as "drying mode" {
        None = 0,
        Quick = 1,
        Iron = 2,
        Store = 3,
    }
}

code_enum! {
    pub enum ZeoDetergentType as "detergent type" {
        Empty = 0,
        Low = 1,
        Medium = 2,
        High = 3,
    }
}

code_enum! {
    pub enum ZeoSoftenerType as "softener type" {
        Empty = 0,
        Low = 1,
        Medium = 2,
        High = 3,
    }
}

code_enum! {
    pub enum ZeoError as "error" {
        None = 0,
        RefillError = 1,
        DrainError = 2,
        DoorLockError = 3,
        WaterLevelError = 4,
        InverterError = 5,
        HeatingError = 6,
        TemperatureError = 7,
        CommunicationError = 10,
        DryingError = 11,
        #[strum(to_string = "drying_error_e_12")]
        DryingErrorE12 = 12,
        #[strum(to_string = "drying_error_e_13")]
        DryingErrorE13 = 13,
        #[strum(to_string = "drying_error_e_14")]
        DryingErrorE14 = 14,
        #[strum(to_string = "drying_error_e_15")]
        DryingErrorE15 = 15,
        #[strum(to_string = "drying_error_e_16")]
        DryingErrorE16 = 16,
        // Check for normal water flow.
        DryingErrorWaterFlow = 17,
        // Restart the washer and try again.
        DryingErrorRestart = 18,
        // Re-arrange the laundry.
        SpinError = 19,
    }
}

/// The code table documented for `field`, if the field carries codes at all.
///
/// Mode and state have tables even though their sensors show the raw code.
pub fn table_for(field: ZeoField) -> Option<(&'static str, Vec<(i64, &'static str)>)> {
    fn table<T: CodeTable>() -> Option<(&'static str, Vec<(i64, &'static str)>)> {
        Some((T::TABLE, T::entries()))
    }
    match field {
        ZeoField::Mode => table::<ZeoMode>(),
        ZeoField::State => table::<ZeoState>(),
        ZeoField::Program => table::<ZeoProgram>(),
        ZeoField::Temp => table::<ZeoTemperature>(),
        ZeoField::RinseTimes => table::<ZeoRinse>(),
        ZeoField::SpinLevel => table::<ZeoSpin>(),
        ZeoField::DryingMode => table::<ZeoDryingMode>(),
        ZeoField::DetergentType => table::<ZeoDetergentType>(),
        ZeoField::SoftenerType => table::<ZeoSoftenerType>(),
        ZeoField::Error => table::<ZeoError>(),
        ZeoField::Countdown
        | ZeoField::WashingLeft
        | ZeoField::SoundSet
        | ZeoField::TimesAfterClean
        | ZeoField::DetergentEmpty
        | ZeoField::SoftenerEmpty => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `T` lists exactly `expected`, in order, and rejects every code in `unknown`.
    fn assert_table<T: CodeTable>(expected: &[(i64, &str)], unknown: &[i64]) {
        assert_eq!(T::entries(), expected, "{} entries", T::TABLE);
        for &(code, name) in expected {
            assert_eq!(T::lookup(ZeoField::Mode, code), Ok(name), "{} code {code}", T::TABLE);
        }
        for &code in unknown {
            assert!(
                matches!(T::lookup(ZeoField::Mode, code), Err(DecodeError::UnknownCode { .. })),
                "{} code {code} should not decode",
                T::TABLE
            );
        }
    }

    #[test]
    fn mode() {
        assert_table::<ZeoMode>(&[(1, "wash"), (2, "wash_and_dry"), (3, "dry")], &[0, 4, -1]);
    }

    #[test]
    fn state() {
        assert_table::<ZeoState>(
            &[
                (1, "standby"),
                (2, "weighing"),
                (3, "soaking"),
                (4, "washing"),
                (5, "rinsing"),
                (6, "spinning"),
                (7, "drying"),
                (8, "cooling"),
                (9, "under_delay_start"),
                (10, "done"),
            ],
            &[0, 11, 256],
        );
    }

    #[test]
    fn error() {
        assert_table::<ZeoError>(
            &[
                (0, "none"),
                (1, "refill_error"),
                (2, "drain_error"),
                (3, "door_lock_error"),
                (4, "water_level_error"),
                (5, "inverter_error"),
                (6, "heating_error"),
                (7, "temperature_error"),
                (10, "communication_error"),
                (11, "drying_error"),
                (12, "drying_error_e_12"),
                (13, "drying_error_e_13"),
                (14, "drying_error_e_14"),
                (15, "drying_error_e_15"),
                (16, "drying_error_e_16"),
                (17, "drying_error_water_flow"),
                (18, "drying_error_restart"),
                (19, "spin_error"),
            ],
            &[8, 9, 20, -1, i64::MAX],
        );
    }

    #[test]
    fn program() {
        assert_table::<ZeoProgram>(
            &[
                (1, "standard"),
                (2, "quick"),
                (3, "sanitize"),
                (4, "wool"),
                (5, "air_refresh"),
                (6, "custom"),
                (7, "bedding"),
                (8, "down"),
                (9, "silk"),
                (10, "rinse_and_spin"),
                (11, "spin"),
                (12, "down_clean"),
                (13, "baby_care"),
                (14, "anti_allergen"),
                (15, "sportswear"),
                (16, "night"),
                (17, "new_clothes"),
                (18, "shirts"),
                (19, "synthetics"),
                (20, "underwear"),
                (21, "gentle"),
                (22, "intensive"),
                (23, "cotton_linen"),
                (24, "season"),
                (25, "warming"),
                (26, "bra"),
                (27, "panties"),
                (28, "boiling_wash"),
                (30, "socks"),
                (31, "towels"),
                (32, "anti_mite"),
                (33, "exo_40_60"),
                (34, "twenty_c"),
                (35, "t_shirts"),
                (36, "stain_removal"),
            ],
            &[0, 29, 37],
        );
    }

    #[test]
    fn temperature() {
        assert_table::<ZeoTemperature>(
            &[(1, "normal"), (2, "low"), (3, "medium"), (4, "high"), (5, "max"), (6, "twenty_c")],
            &[0, 7],
        );
    }

    #[test]
    fn rinse() {
        assert_table::<ZeoRinse>(
            &[(0, "none"), (1, "min"), (2, "low"), (3, "mid"), (4, "high"), (5, "max")],
            &[6, -1],
        );
    }

    #[test]
    fn spin() {
        assert_table::<ZeoSpin>(
            &[
                (1, "none"),
                (2, "very_low"),
                (3, "low"),
                (4, "mid"),
                (5, "high"),
                (6, "very_high"),
                (7, "max"),
            ],
            &[0, 8],
        );
    }

    #[test]
    fn drying_mode() {
        assert_table::<ZeoDryingMode>(
            &[(0, "none"), (1, "quick"), (2, "iron"), (3, "store")],
            &[4, -1],
        );
    }

    #[test]
    fn detergent_type() {
        assert_table::<ZeoDetergentType>(
            &[(0, "empty"), (1, "low"), (2, "medium"), (3, "high")],
            &[4, -1],
        );
    }

    #[test]
    fn softener_type() {
        assert_table::<ZeoSoftenerType>(
            &[(0, "empty"), (1, "low"), (2, "medium"), (3, "high")],
            &[4, -1],
        );
    }

    #[test]
    fn absent_value_reads_as_zero() {
        assert_eq!(ZeoError::decode(ZeoField::Error, None), Ok("none"));
        assert!(matches!(
            ZeoTemperature::decode(ZeoField::Temp, None),
            Err(DecodeError::UnknownCode { code: 0, .. })
        ));
    }

    #[test]
    fn non_numeric_value_is_not_a_code() {
        let value = FieldValue::Boolean(true);
        assert!(matches!(
            ZeoError::decode(ZeoField::Error, Some(&value)),
            Err(DecodeError::NotACode { .. })
        ));
    }

    #[test]
    fn tables_by_field() {
        let (name, entries) = table_for(ZeoField::State).unwrap();
        assert_eq!(name, "state");
        assert_eq!(entries.first(), Some(&(1, "standby")));
        assert_eq!(table_for(ZeoField::SpinLevel).map(|(n, _)| n), Some("spin"));
        assert!(table_for(ZeoField::Countdown).is_none());
        assert_eq!(ZeoField::ALL.iter().filter(|f| table_for(**f).is_some()).count(), 10);
    }
}
