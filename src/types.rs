//! Canonical type lattice and value semantics.
//!
//! Every dialect type normalises into a [`Canonical`] value; all
//! cross-dialect decisions (can two columns be compared? what does equality
//! mean? what text feeds the checksum hash?) are answered here and nowhere
//! else. Drivers never leak their native type objects past their own
//! boundary.
//!
//! # Comparability
//!
//! Each canonical type has a comparability class (numeric, textual,
//! temporal, opaque). Two types are *Compatible* iff they share a class and
//! their normalised representations round-trip without loss at the shared
//! precision. Integer↔Decimal with zero scale is Compatible; Float↔Decimal
//! is *Lossy* (compared by value after rounding to the coarser precision).
//! Opaque types (JSON, Array, Binary, Unknown) are *Incompatible* for
//! diffing.

use std::cmp::Ordering;
use std::fmt;

use rust_decimal::Decimal;
use serde_json::Value;

/// Dialect-independent representation of a column's type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Canonical {
    Integer { bits: u8, signed: bool },
    Decimal { precision: u32, scale: u32 },
    Float { bits: u8 },
    Text { max_len: Option<u32> },
    Boolean,
    Timestamp { precision: u32, tz_aware: bool },
    Date,
    Binary { max_len: Option<u32> },
    Json,
    Uuid,
    Array(Box<Canonical>),
    Unknown,
}

/// Comparability class of a canonical type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparability {
    Numeric,
    Textual,
    Temporal,
    Opaque,
}

/// Result of comparing two canonical types for diffability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCompat {
    /// Lossless comparison at the shared precision.
    Compatible,
    /// Comparable after rounding to the coarser precision; reported as a
    /// warning on the job.
    Lossy,
    /// Cannot be compared by value.
    Incompatible,
}

// The display text is a standard SQL spelling chosen so that
// `normalise(c.to_string()) == c`; it doubles as the serde form.
impl fmt::Display for Canonical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Canonical::Integer { bits, signed } => {
                let base = match bits {
                    8 => "tinyint",
                    16 => "smallint",
                    32 => "integer",
                    _ => "bigint",
                };
                write!(f, "{base}{}", if *signed { "" } else { " unsigned" })
            }
            Canonical::Decimal { precision, scale } => write!(f, "decimal({precision}, {scale})"),
            Canonical::Float { bits: 32 } => write!(f, "real"),
            Canonical::Float { .. } => write!(f, "double precision"),
            Canonical::Text { max_len: Some(n) } => write!(f, "varchar({n})"),
            Canonical::Text { max_len: None } => write!(f, "text"),
            Canonical::Boolean => write!(f, "boolean"),
            Canonical::Timestamp { precision, tz_aware: true } => {
                write!(f, "timestamptz({precision})")
            }
            Canonical::Timestamp { precision, tz_aware: false } => {
                write!(f, "timestamp({precision})")
            }
            Canonical::Date => write!(f, "date"),
            Canonical::Binary { max_len: Some(n) } => write!(f, "varbinary({n})"),
            Canonical::Binary { max_len: None } => write!(f, "bytea"),
            Canonical::Json => write!(f, "json"),
            Canonical::Uuid => write!(f, "uuid"),
            Canonical::Array(_) => write!(f, "array"),
            Canonical::Unknown => write!(f, "unknown"),
        }
    }
}

// Canonical types persist and travel as their display text; parsing goes
// back through `normalise`.
impl serde::Serialize for Canonical {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Canonical {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(normalise(&text))
    }
}

impl Canonical {
    /// The comparability class this type belongs to.
    pub fn class(&self) -> Comparability {
        match self {
            Canonical::Integer { .. }
            | Canonical::Decimal { .. }
            | Canonical::Float { .. }
            | Canonical::Boolean => Comparability::Numeric,
            Canonical::Text { .. } | Canonical::Uuid => Comparability::Textual,
            Canonical::Timestamp { .. } | Canonical::Date => Comparability::Temporal,
            Canonical::Binary { .. }
            | Canonical::Json
            | Canonical::Array(_)
            | Canonical::Unknown => Comparability::Opaque,
        }
    }

    /// Whether values of this type admit a total order (required for key
    /// columns).
    pub fn is_orderable(&self) -> bool {
        self.class() != Comparability::Opaque
    }
}

// ── Normalisation ──────────────────────────────────────────────────────────

/// Split `"decimal(18, 4)"` into `("decimal", [18, 4])`.
fn split_type(raw: &str) -> (String, Vec<u32>) {
    let raw = raw.trim();
    match raw.find('(') {
        None => (raw.to_ascii_lowercase(), Vec::new()),
        Some(open) => {
            let base = raw[..open].trim().to_ascii_lowercase();
            let args = raw[open + 1..]
                .trim_end_matches(')')
                .split(',')
                .filter_map(|a| a.trim().parse::<u32>().ok())
                .collect();
            (base, args)
        }
    }
}

/// Map a dialect type name to the canonical lattice.
///
/// Covers the union of spellings across the supported dialects; dialects
/// with ambiguous names (e.g. ClickHouse `Int8` meaning 8 bits where
/// PostgreSQL `int8` means 64) override `Dialect::normalise_type` and call
/// back here only for the shared spellings.
pub fn normalise(raw: &str) -> Canonical {
    let lowered = raw.trim().to_ascii_lowercase();
    let unsigned = lowered.ends_with(" unsigned");
    let stripped = lowered.trim_end_matches(" unsigned").trim();
    let (base, args) = split_type(stripped);
    let signed = !unsigned;

    match base.as_str() {
        // Integers
        "tinyint" => Canonical::Integer { bits: 8, signed },
        "smallint" | "int2" | "smallserial" => Canonical::Integer { bits: 16, signed },
        "int" | "integer" | "int4" | "mediumint" | "serial" => {
            Canonical::Integer { bits: 32, signed }
        }
        "bigint" | "int8" | "bigserial" | "int64" => Canonical::Integer { bits: 64, signed },

        // Decimals
        "decimal" | "numeric" | "dec" | "number" | "bignumeric" => {
            let precision = args.first().copied().unwrap_or(38);
            let scale = args.get(1).copied().unwrap_or(0);
            Canonical::Decimal { precision, scale }
        }
        "money" => Canonical::Decimal { precision: 19, scale: 2 },

        // Floats
        "real" | "float4" => Canonical::Float { bits: 32 },
        "double precision" | "double" | "float8" | "float64" | "binary_double" => {
            Canonical::Float { bits: 64 }
        }
        // Bare `float` defaults to 64-bit; `float(n)` follows the SQL rule
        // (n ≤ 24 is single precision).
        "float" => match args.first() {
            Some(&n) if n <= 24 => Canonical::Float { bits: 32 },
            _ => Canonical::Float { bits: 64 },
        },

        // Text
        "varchar" | "character varying" | "char" | "character" | "bpchar" | "nvarchar"
        | "nchar" | "varchar2" | "nvarchar2" => Canonical::Text {
            max_len: args.first().copied(),
        },
        "text" | "string" | "clob" | "nclob" | "mediumtext" | "longtext" | "tinytext" => {
            Canonical::Text { max_len: None }
        }

        // Booleans
        "boolean" | "bool" => Canonical::Boolean,
        "bit" if args.first().copied().unwrap_or(1) == 1 => Canonical::Boolean,

        // Temporal
        "timestamp" | "datetime" | "datetime2" | "smalldatetime" | "timestamp_ntz"
        | "timestamp without time zone" => Canonical::Timestamp {
            precision: args.first().copied().unwrap_or(6).min(6),
            tz_aware: false,
        },
        "timestamptz" | "timestamp with time zone" | "timestamp_tz" | "timestamp_ltz"
        | "datetimeoffset" => Canonical::Timestamp {
            precision: args.first().copied().unwrap_or(6).min(6),
            tz_aware: true,
        },
        "date" => Canonical::Date,

        // Opaque
        "bytea" | "blob" | "mediumblob" | "longblob" | "tinyblob" | "varbinary" | "binary"
        | "bytes" | "raw" | "image" => Canonical::Binary {
            max_len: args.first().copied(),
        },
        "json" | "jsonb" | "variant" | "object" | "struct" | "map" => Canonical::Json,
        "uuid" | "uniqueidentifier" => Canonical::Uuid,
        "array" => Canonical::Array(Box::new(Canonical::Unknown)),
        _ if base.starts_with('_') => {
            // PostgreSQL catalog spelling for arrays: `_int4`, `_text`, …
            Canonical::Array(Box::new(normalise(&base[1..])))
        }

        _ => Canonical::Unknown,
    }
}

// ── Type comparison ────────────────────────────────────────────────────────

/// Compute the coarser common type two columns are compared under, or
/// `None` when no comparison is possible.
pub fn unify(a: &Canonical, b: &Canonical) -> Option<Canonical> {
    use Canonical::*;
    if a.class() == Comparability::Opaque || b.class() == Comparability::Opaque {
        return None;
    }
    if a.class() != b.class() {
        return None;
    }
    Some(match (a, b) {
        (Integer { bits: ba, signed: sa }, Integer { bits: bb, signed: sb }) => Integer {
            bits: *ba.max(bb),
            signed: *sa || *sb,
        },
        (Integer { .. }, Decimal { precision, .. })
        | (Decimal { precision, .. }, Integer { .. }) => Decimal {
            precision: (*precision).max(20),
            scale: 0,
        },
        (Decimal { precision: pa, scale: sa }, Decimal { precision: pb, scale: sb }) => Decimal {
            precision: *pa.max(pb),
            scale: *sa.min(sb),
        },
        (Float { bits: ba }, Float { bits: bb }) => Float { bits: *ba.min(bb) },
        (Float { bits }, Integer { .. })
        | (Integer { .. }, Float { bits })
        | (Float { bits }, Decimal { .. })
        | (Decimal { .. }, Float { bits }) => Float { bits: *bits },
        (Boolean, Boolean) => Boolean,
        (Boolean, other) | (other, Boolean) => other.clone(),

        (Text { max_len: la }, Text { max_len: lb }) => Text {
            max_len: match (la, lb) {
                (Some(a), Some(b)) => Some(*a.max(b)),
                _ => None,
            },
        },
        (Uuid, Uuid) => Uuid,
        (Uuid, Text { .. }) | (Text { .. }, Uuid) => Text { max_len: None },

        (
            Timestamp { precision: pa, tz_aware: ta },
            Timestamp { precision: pb, tz_aware: tb },
        ) => Timestamp {
            precision: *pa.min(pb),
            tz_aware: *ta || *tb,
        },
        (Date, Date) => Date,
        (Date, Timestamp { .. }) | (Timestamp { .. }, Date) => Date,

        _ => return None,
    })
}

/// Classify a column-type pair for diffability.
pub fn compare(a: &Canonical, b: &Canonical) -> TypeCompat {
    use Canonical::*;
    if unify(a, b).is_none() {
        return TypeCompat::Incompatible;
    }
    match (a, b) {
        _ if a == b => TypeCompat::Compatible,
        (Integer { .. }, Integer { .. }) => TypeCompat::Compatible,
        // Integer ↔ zero-scale decimal round-trips exactly.
        (Integer { .. }, Decimal { scale: 0, .. })
        | (Decimal { scale: 0, .. }, Integer { .. }) => TypeCompat::Compatible,
        (Integer { .. }, Decimal { .. }) | (Decimal { .. }, Integer { .. }) => TypeCompat::Lossy,
        (Decimal { scale: sa, .. }, Decimal { scale: sb, .. }) if sa == sb => TypeCompat::Compatible,
        (Decimal { .. }, Decimal { .. }) => TypeCompat::Lossy,
        (Float { .. }, Float { .. }) => TypeCompat::Compatible,
        // Float ↔ Decimal is compared after rounding; always lossy.
        (Float { .. }, _) | (_, Float { .. }) => TypeCompat::Lossy,
        (Boolean, _) | (_, Boolean) => TypeCompat::Lossy,
        (Text { .. }, Text { .. }) => TypeCompat::Compatible,
        (Uuid, Text { .. }) | (Text { .. }, Uuid) => TypeCompat::Compatible,
        (Timestamp { precision: pa, .. }, Timestamp { precision: pb, .. }) if pa == pb => {
            TypeCompat::Compatible
        }
        (Timestamp { .. }, Timestamp { .. }) => TypeCompat::Lossy,
        (Date, Timestamp { .. }) | (Timestamp { .. }, Date) => TypeCompat::Lossy,
        // unify() succeeded, so the pair is at worst lossy.
        _ => TypeCompat::Lossy,
    }
}

// ── Canonical value representations ────────────────────────────────────────

/// Marker string standing in for NULL in canonical representations.
///
/// Printable so every dialect can embed it in a `COALESCE` literal; the
/// checksum treats it exactly like the drivers' SQL rendering does.
pub const NULL_MARKER: &str = "<null>";

/// Canonical text form of a float: significand with up to 8 fractional
/// digits (9 significant digits), trailing zeros stripped, two-digit
/// signed exponent. `NaN` canonicalises to `nan` so NaN = NaN.
pub fn float_repr(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if x == 0.0 {
        return "0".to_string();
    }
    let formatted = format!("{x:.8e}"); // "1.50000000e0"
    let Some((mantissa, exp)) = formatted.split_once('e') else {
        return formatted;
    };
    let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
    let Ok(exp) = exp.parse::<i32>() else {
        return formatted;
    };
    if exp >= 0 {
        format!("{mantissa}e+{exp:02}")
    } else {
        format!("{mantissa}e-{:02}", -exp)
    }
}

/// Canonical text form of a decimal at a fixed scale.
pub fn decimal_repr(raw: &str, scale: u32) -> String {
    match Decimal::from_str_exact(raw.trim()) {
        Ok(mut d) => {
            d.rescale(scale);
            d.to_string()
        }
        Err(_) => raw.trim().to_string(),
    }
}

/// Canonical text form of a value under its unified canonical type.
///
/// `None` means SQL NULL; callers substitute [`NULL_MARKER`] when hashing.
/// This function is the client-side mirror of `Dialect::canonical_expr` —
/// the two must agree byte-for-byte or checksums misfire.
pub fn canonical_repr(canon: &Canonical, value: &Value) -> Option<String> {
    if value.is_null() {
        return None;
    }
    Some(match canon {
        Canonical::Integer { .. } => match value {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.trim().to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            other => other.to_string(),
        },
        Canonical::Decimal { scale, .. } => match value {
            Value::String(s) => decimal_repr(s, *scale),
            Value::Number(n) => decimal_repr(&n.to_string(), *scale),
            other => other.to_string(),
        },
        Canonical::Float { .. } => match value_as_f64(value) {
            Some(x) => float_repr(x),
            None => value.to_string(),
        },
        Canonical::Boolean => match value {
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Number(n) => if n.as_f64() == Some(0.0) { "0" } else { "1" }.to_string(),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "1" | "yes" => "1".to_string(),
                _ => "0".to_string(),
            },
            other => other.to_string(),
        },
        Canonical::Timestamp { precision, .. } => match value {
            // Already epoch microseconds from the driver projection.
            Value::Number(n) => truncate_micros(n.as_i64().unwrap_or(0), *precision).to_string(),
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(micros) => truncate_micros(micros, *precision).to_string(),
                Err(_) => s.trim().to_string(),
            },
            other => other.to_string(),
        },
        Canonical::Date => match value {
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        },
        Canonical::Uuid => match value {
            Value::String(s) => s.trim().to_ascii_lowercase(),
            other => other.to_string(),
        },
        Canonical::Text { .. } => match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        // Opaque types are excluded from comparison before this point.
        Canonical::Binary { .. } | Canonical::Json | Canonical::Array(_) | Canonical::Unknown => {
            value.to_string()
        }
    })
}

/// Truncate epoch microseconds to the given fractional-second precision.
fn truncate_micros(micros: i64, precision: u32) -> i64 {
    let p = precision.min(6);
    let factor = 10_i64.pow(6 - p);
    micros.div_euclid(factor) * factor
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let t = s.trim();
            match t.to_ascii_lowercase().as_str() {
                "nan" => Some(f64::NAN),
                "inf" | "infinity" => Some(f64::INFINITY),
                "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
                _ => t.parse::<f64>().ok(),
            }
        }
        _ => None,
    }
}

// ── Value equality and ordering ────────────────────────────────────────────

/// Options carried from the comparison config into value semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueCompareOptions {
    /// Absolute tolerance for float comparisons; 0 means exact.
    pub tolerance: f64,
    /// Fold text to lowercase before comparing.
    pub case_insensitive: bool,
}

/// Compare two decoded values for equality under a canonical type.
///
/// NULL equals NULL. Floats honour the tolerance; NaN equals NaN.
pub fn value_equal(
    canon: &Canonical,
    a: &Value,
    b: &Value,
    opts: ValueCompareOptions,
) -> bool {
    match (a.is_null(), b.is_null()) {
        (true, true) => return true,
        (true, false) | (false, true) => return false,
        _ => {}
    }
    match canon {
        Canonical::Float { .. } => match (value_as_f64(a), value_as_f64(b)) {
            (Some(x), Some(y)) => {
                if x.is_nan() && y.is_nan() {
                    true
                } else if opts.tolerance > 0.0 {
                    (x - y).abs() <= opts.tolerance
                } else {
                    x == y
                }
            }
            _ => canonical_repr(canon, a) == canonical_repr(canon, b),
        },
        Canonical::Text { .. } if opts.case_insensitive => match (a, b) {
            (Value::String(x), Value::String(y)) => x.to_lowercase() == y.to_lowercase(),
            _ => canonical_repr(canon, a) == canonical_repr(canon, b),
        },
        _ => canonical_repr(canon, a) == canonical_repr(canon, b),
    }
}

/// Total order over decoded key values within one comparability class.
///
/// NULL sorts first and equals NULL (a composite key with a NULL component
/// is a distinct key value). The order must agree with the SQL rendering of
/// segment bounds in `dialect::key_bound_predicate`.
pub fn compare_values(canon: &Canonical, a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    match canon.class() {
        Comparability::Numeric => {
            let x = value_as_f64(a);
            let y = value_as_f64(b);
            match (x, y) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => cmp_repr(canon, a, b),
            }
        }
        // ISO-formatted temporals and text order lexicographically.
        Comparability::Textual | Comparability::Temporal => {
            match (canon, a, b) {
                (Canonical::Timestamp { .. }, Value::Number(x), Value::Number(y)) => x
                    .as_i64()
                    .unwrap_or(0)
                    .cmp(&y.as_i64().unwrap_or(0)),
                _ => cmp_repr(canon, a, b),
            }
        }
        Comparability::Opaque => cmp_repr(canon, a, b),
    }
}

fn cmp_repr(canon: &Canonical, a: &Value, b: &Value) -> Ordering {
    canonical_repr(canon, a).cmp(&canonical_repr(canon, b))
}

/// Decode a canonical-repr text cell (as fetched from a driver projection)
/// into a typed JSON value.
pub fn decode_text(canon: &Canonical, raw: Option<String>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    match canon {
        Canonical::Integer { .. } => raw
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(raw)),
        Canonical::Float { .. } => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or(Value::String(raw)),
        Canonical::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "1" => Value::Bool(true),
            "f" | "false" | "0" => Value::Bool(false),
            _ => Value::String(raw),
        },
        Canonical::Timestamp { .. } => raw
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(raw)),
        // Decimals stay textual: JSON numbers cannot hold them exactly.
        _ => Value::String(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── normalise ───────────────────────────────────────────────────

    #[test]
    fn test_normalise_integers() {
        assert_eq!(normalise("int"), Canonical::Integer { bits: 32, signed: true });
        assert_eq!(normalise("BIGINT"), Canonical::Integer { bits: 64, signed: true });
        assert_eq!(normalise("int8"), Canonical::Integer { bits: 64, signed: true });
        assert_eq!(normalise("smallint"), Canonical::Integer { bits: 16, signed: true });
        assert_eq!(
            normalise("int unsigned"),
            Canonical::Integer { bits: 32, signed: false }
        );
        assert_eq!(normalise("int64"), Canonical::Integer { bits: 64, signed: true });
    }

    #[test]
    fn test_normalise_decimals() {
        assert_eq!(
            normalise("numeric(18,4)"),
            Canonical::Decimal { precision: 18, scale: 4 }
        );
        assert_eq!(
            normalise("decimal(18, 4)"),
            Canonical::Decimal { precision: 18, scale: 4 }
        );
        assert_eq!(
            normalise("number(10,2)"),
            Canonical::Decimal { precision: 10, scale: 2 }
        );
        assert_eq!(
            normalise("numeric"),
            Canonical::Decimal { precision: 38, scale: 0 }
        );
    }

    #[test]
    fn test_normalise_floats() {
        assert_eq!(normalise("double precision"), Canonical::Float { bits: 64 });
        assert_eq!(normalise("real"), Canonical::Float { bits: 32 });
        assert_eq!(normalise("float(24)"), Canonical::Float { bits: 32 });
        assert_eq!(normalise("float(53)"), Canonical::Float { bits: 64 });
        assert_eq!(normalise("float64"), Canonical::Float { bits: 64 });
    }

    #[test]
    fn test_normalise_text_and_misc() {
        assert_eq!(
            normalise("character varying(255)"),
            Canonical::Text { max_len: Some(255) }
        );
        assert_eq!(normalise("text"), Canonical::Text { max_len: None });
        assert_eq!(normalise("string"), Canonical::Text { max_len: None });
        assert_eq!(normalise("boolean"), Canonical::Boolean);
        assert_eq!(normalise("uuid"), Canonical::Uuid);
        assert_eq!(normalise("uniqueidentifier"), Canonical::Uuid);
        assert_eq!(normalise("date"), Canonical::Date);
    }

    #[test]
    fn test_normalise_temporal() {
        assert_eq!(
            normalise("timestamp with time zone"),
            Canonical::Timestamp { precision: 6, tz_aware: true }
        );
        assert_eq!(
            normalise("timestamp(3)"),
            Canonical::Timestamp { precision: 3, tz_aware: false }
        );
        assert_eq!(
            normalise("datetime"),
            Canonical::Timestamp { precision: 6, tz_aware: false }
        );
    }

    #[test]
    fn test_normalise_opaque() {
        assert_eq!(normalise("jsonb"), Canonical::Json);
        assert_eq!(normalise("bytea"), Canonical::Binary { max_len: None });
        assert!(matches!(normalise("_int4"), Canonical::Array(_)));
        assert_eq!(normalise("geometry"), Canonical::Unknown);
    }

    #[test]
    fn test_display_round_trips_through_normalise() {
        for t in [
            "tinyint", "smallint", "int", "bigint", "int unsigned", "numeric(18,4)",
            "real", "double precision", "varchar(255)", "text", "boolean",
            "timestamp(3)", "timestamptz", "date", "bytea", "varbinary(16)",
            "json", "uuid",
        ] {
            let c = normalise(t);
            assert_eq!(normalise(&c.to_string()), c, "spelling {t}");
        }
    }

    #[test]
    fn test_serde_uses_display_text() {
        let c = normalise("numeric(18,4)");
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\"decimal(18, 4)\"");
        let back: Canonical = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    // ── compare / unify ─────────────────────────────────────────────

    #[test]
    fn test_round_trip_is_compatible() {
        // compare(normalise(t), normalise(t)) = Compatible for every t.
        for t in [
            "int", "bigint", "numeric(18,4)", "double precision", "varchar(20)", "text",
            "boolean", "timestamp", "timestamptz", "date", "uuid",
        ] {
            let c = normalise(t);
            assert_eq!(compare(&c, &c), TypeCompat::Compatible, "type {t}");
        }
    }

    #[test]
    fn test_integer_vs_zero_scale_decimal_compatible() {
        let a = normalise("bigint");
        let b = normalise("numeric(20,0)");
        assert_eq!(compare(&a, &b), TypeCompat::Compatible);
    }

    #[test]
    fn test_float_vs_decimal_lossy() {
        let a = normalise("double precision");
        let b = normalise("numeric(18,4)");
        assert_eq!(compare(&a, &b), TypeCompat::Lossy);
        assert_eq!(unify(&a, &b), Some(Canonical::Float { bits: 64 }));
    }

    #[test]
    fn test_numeric_18_4_matches_decimal_18_4() {
        // PostgreSQL numeric(18,4) vs another engine's decimal(18,4).
        assert_eq!(
            compare(&normalise("numeric(18,4)"), &normalise("decimal(18,4)")),
            TypeCompat::Compatible
        );
    }

    #[test]
    fn test_opaque_incompatible() {
        assert_eq!(
            compare(&normalise("jsonb"), &normalise("jsonb")),
            TypeCompat::Incompatible
        );
        assert_eq!(
            compare(&normalise("int"), &normalise("text")),
            TypeCompat::Incompatible
        );
    }

    #[test]
    fn test_unify_decimal_takes_coarser_scale() {
        let u = unify(&normalise("decimal(18,4)"), &normalise("decimal(12,2)"));
        assert_eq!(u, Some(Canonical::Decimal { precision: 18, scale: 2 }));
    }

    // ── canonical reprs ─────────────────────────────────────────────

    #[test]
    fn test_float_repr_basics() {
        assert_eq!(float_repr(1.5), "1.5e+00");
        assert_eq!(float_repr(-2.25), "-2.25e+00");
        assert_eq!(float_repr(0.0), "0");
        assert_eq!(float_repr(1234.5), "1.2345e+03");
        assert_eq!(float_repr(0.001), "1e-03");
        assert_eq!(float_repr(f64::NAN), "nan");
        assert_eq!(float_repr(f64::INFINITY), "inf");
    }

    #[test]
    fn test_float_repr_rounds_to_nine_significant_digits() {
        assert_eq!(float_repr(1.23456789012), "1.23456789e+00");
        assert_eq!(float_repr(9.999999999), "1e+01");
    }

    #[test]
    fn test_decimal_repr_fixed_scale() {
        assert_eq!(decimal_repr("1.5", 4), "1.5000");
        assert_eq!(decimal_repr("1.50000", 4), "1.5000");
        assert_eq!(decimal_repr("-3", 2), "-3.00");
        assert_eq!(decimal_repr("2.71828", 2), "2.72");
    }

    #[test]
    fn test_canonical_repr_null_is_none() {
        let c = normalise("int");
        assert_eq!(canonical_repr(&c, &Value::Null), None);
    }

    #[test]
    fn test_canonical_repr_boolean() {
        let c = Canonical::Boolean;
        assert_eq!(canonical_repr(&c, &json!(true)).unwrap(), "1");
        assert_eq!(canonical_repr(&c, &json!(false)).unwrap(), "0");
        assert_eq!(canonical_repr(&c, &json!("t")).unwrap(), "1");
    }

    #[test]
    fn test_canonical_repr_timestamp_truncates_to_precision() {
        let c = Canonical::Timestamp { precision: 3, tz_aware: false };
        // 1_577_836_800_123_456 µs truncated to millisecond precision.
        assert_eq!(
            canonical_repr(&c, &json!(1_577_836_800_123_456_i64)).unwrap(),
            "1577836800123000"
        );
    }

    // ── value_equal ─────────────────────────────────────────────────

    #[test]
    fn test_value_equal_null_semantics() {
        let c = normalise("int");
        assert!(value_equal(&c, &Value::Null, &Value::Null, Default::default()));
        assert!(!value_equal(&c, &Value::Null, &json!(1), Default::default()));
    }

    #[test]
    fn test_value_equal_float_tolerance() {
        let c = normalise("double precision");
        let opts = ValueCompareOptions { tolerance: 1e-3, case_insensitive: false };
        assert!(value_equal(&c, &json!(1.0), &json!(1.0004), opts));
        assert!(!value_equal(&c, &json!(1.0), &json!(1.01), opts));
        // Exact mode
        assert!(!value_equal(&c, &json!(1.0), &json!(1.0004), Default::default()));
    }

    #[test]
    fn test_value_equal_nan_equals_nan() {
        let c = normalise("double precision");
        let nan = json!("nan");
        assert!(value_equal(&c, &nan, &nan, Default::default()));
    }

    #[test]
    fn test_value_equal_case_insensitive_opt_in() {
        let c = normalise("text");
        let opts = ValueCompareOptions { tolerance: 0.0, case_insensitive: true };
        assert!(value_equal(&c, &json!("Alice"), &json!("ALICE"), opts));
        assert!(!value_equal(&c, &json!("Alice"), &json!("ALICE"), Default::default()));
    }

    #[test]
    fn test_value_equal_decimal_at_shared_scale() {
        let c = Canonical::Decimal { precision: 18, scale: 2 };
        assert!(value_equal(&c, &json!("1.50"), &json!("1.5000"), Default::default()));
        assert!(!value_equal(&c, &json!("1.50"), &json!("1.51"), Default::default()));
    }

    // ── ordering ────────────────────────────────────────────────────

    #[test]
    fn test_compare_values_null_first() {
        let c = normalise("int");
        assert_eq!(compare_values(&c, &Value::Null, &json!(1)), Ordering::Less);
        assert_eq!(compare_values(&c, &Value::Null, &Value::Null), Ordering::Equal);
    }

    #[test]
    fn test_compare_values_numeric_not_lexicographic() {
        let c = normalise("int");
        assert_eq!(compare_values(&c, &json!(2), &json!(10)), Ordering::Less);
    }

    #[test]
    fn test_compare_values_text() {
        let c = normalise("text");
        assert_eq!(compare_values(&c, &json!("a"), &json!("b")), Ordering::Less);
    }

    // ── decode_text ─────────────────────────────────────────────────

    #[test]
    fn test_decode_text_typed() {
        assert_eq!(decode_text(&normalise("int"), Some("42".into())), json!(42));
        assert_eq!(decode_text(&normalise("boolean"), Some("1".into())), json!(true));
        assert_eq!(decode_text(&normalise("text"), None), Value::Null);
        assert_eq!(
            decode_text(&normalise("numeric(18,4)"), Some("1.5000".into())),
            json!("1.5000")
        );
    }
}
