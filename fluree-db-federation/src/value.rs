//! RDF term values carried by federated bindings
//!
//! `Value` is the term model for everything that crosses a federation
//! boundary. Two notions of comparison live here:
//!
//! - **Term identity** (`Eq`/`Hash`): structural, used by join keys. `Long(1)`
//!   and `Double(1.0)` are different terms; doubles compare by bit pattern.
//! - **Ordering** ([`compare_values`]): SPARQL ORDER BY semantics as a total
//!   order. Literals are ranked by class; numerics compare by value across
//!   `Long`/`Double`/`Decimal` and XSD-typed numeric literals, temporals by
//!   instant, everything else by lexical form.

use bigdecimal::BigDecimal;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use num_traits::{ToPrimitive, Zero};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

/// XSD / RDF datatype IRIs
pub mod xsd {
    pub const STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
    pub const BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
    pub const LONG: &str = "http://www.w3.org/2001/XMLSchema#long";
    pub const INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
    pub const INT: &str = "http://www.w3.org/2001/XMLSchema#int";
    pub const SHORT: &str = "http://www.w3.org/2001/XMLSchema#short";
    pub const BYTE: &str = "http://www.w3.org/2001/XMLSchema#byte";
    pub const NON_NEGATIVE_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#nonNegativeInteger";
    pub const POSITIVE_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#positiveInteger";
    pub const NON_POSITIVE_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#nonPositiveInteger";
    pub const NEGATIVE_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#negativeInteger";
    pub const UNSIGNED_LONG: &str = "http://www.w3.org/2001/XMLSchema#unsignedLong";
    pub const UNSIGNED_INT: &str = "http://www.w3.org/2001/XMLSchema#unsignedInt";
    pub const UNSIGNED_SHORT: &str = "http://www.w3.org/2001/XMLSchema#unsignedShort";
    pub const UNSIGNED_BYTE: &str = "http://www.w3.org/2001/XMLSchema#unsignedByte";
    pub const DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
    pub const FLOAT: &str = "http://www.w3.org/2001/XMLSchema#float";
    pub const DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
    pub const DATE_TIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";
    pub const DATE: &str = "http://www.w3.org/2001/XMLSchema#date";
    pub const LANG_STRING: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#langString";

    /// xsd:integer and the types derived from it
    pub fn is_integer_type(datatype: &str) -> bool {
        matches!(
            datatype,
            INTEGER
                | LONG
                | INT
                | SHORT
                | BYTE
                | NON_NEGATIVE_INTEGER
                | POSITIVE_INTEGER
                | NON_POSITIVE_INTEGER
                | NEGATIVE_INTEGER
                | UNSIGNED_LONG
                | UNSIGNED_INT
                | UNSIGNED_SHORT
                | UNSIGNED_BYTE
        )
    }
}

/// A bound RDF term
#[derive(Clone, Debug)]
pub enum Value {
    /// IRI reference
    Iri(Arc<str>),
    /// Blank node label (scoped to the member that produced it)
    Blank(Arc<str>),
    /// Plain / xsd:string literal
    String(Arc<str>),
    /// rdf:langString literal
    LangString { value: Arc<str>, lang: Arc<str> },
    /// xsd:boolean
    Boolean(bool),
    /// xsd:long / xsd:integer within i64 range
    Long(i64),
    /// xsd:double / xsd:float
    Double(f64),
    /// xsd:decimal (boxed to keep the enum small)
    Decimal(Box<BigDecimal>),
    /// xsd:dateTime with its original offset
    DateTime(DateTime<FixedOffset>),
    /// xsd:date
    Date(NaiveDate),
    /// Literal with a datatype this layer does not interpret
    Typed { lexical: Arc<str>, datatype: Arc<str> },
}

impl Value {
    pub fn iri(iri: impl Into<Arc<str>>) -> Self {
        Value::Iri(iri.into())
    }

    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn lang_string(value: impl Into<Arc<str>>, lang: impl Into<Arc<str>>) -> Self {
        Value::LangString {
            value: value.into(),
            lang: lang.into(),
        }
    }

    pub fn typed(lexical: impl Into<Arc<str>>, datatype: impl Into<Arc<str>>) -> Self {
        Value::Typed {
            lexical: lexical.into(),
            datatype: datatype.into(),
        }
    }

    pub fn decimal(d: BigDecimal) -> Self {
        Value::Decimal(Box::new(d))
    }

    /// True for IRIs and blank nodes
    pub fn is_node(&self) -> bool {
        matches!(self, Value::Iri(_) | Value::Blank(_))
    }

    pub fn is_literal(&self) -> bool {
        !self.is_node()
    }

    /// Numeric terms, including literals typed with a valid XSD numeric datatype
    pub fn is_numeric(&self) -> bool {
        match self {
            Value::Long(_) | Value::Double(_) | Value::Decimal(_) => true,
            Value::Typed { .. } => matches!(SortKey::of(self), SortKey::Numeric(_)),
            _ => false,
        }
    }

    /// Integer view, used for synthetic columns such as `__index`
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(n) => Some(*n),
            Value::Decimal(d) if d.is_integer() => d.to_i64(),
            Value::Typed { lexical, .. } | Value::String(lexical) => lexical.parse().ok(),
            _ => None,
        }
    }

    /// Datatype IRI of a literal; `None` for IRIs and blank nodes
    pub fn datatype(&self) -> Option<&str> {
        match self {
            Value::Iri(_) | Value::Blank(_) => None,
            Value::String(_) => Some(xsd::STRING),
            Value::LangString { .. } => Some(xsd::LANG_STRING),
            Value::Boolean(_) => Some(xsd::BOOLEAN),
            Value::Long(_) => Some(xsd::LONG),
            Value::Double(_) => Some(xsd::DOUBLE),
            Value::Decimal(_) => Some(xsd::DECIMAL),
            Value::DateTime(_) => Some(xsd::DATE_TIME),
            Value::Date(_) => Some(xsd::DATE),
            Value::Typed { datatype, .. } => Some(&**datatype),
        }
    }

    /// Lexical form (IRI string / blank label for nodes)
    pub fn lexical_form(&self) -> Cow<'_, str> {
        match self {
            Value::Iri(s) | Value::Blank(s) | Value::String(s) => Cow::Borrowed(&**s),
            Value::LangString { value, .. } => Cow::Borrowed(&**value),
            Value::Typed { lexical, .. } => Cow::Borrowed(&**lexical),
            Value::Boolean(b) => Cow::Owned(b.to_string()),
            Value::Long(n) => Cow::Owned(n.to_string()),
            Value::Double(d) => Cow::Owned(d.to_string()),
            Value::Decimal(d) => Cow::Owned(d.to_string()),
            Value::DateTime(dt) => Cow::Owned(dt.to_rfc3339()),
            Value::Date(d) => Cow::Owned(d.format("%Y-%m-%d").to_string()),
        }
    }

    fn lang(&self) -> Option<&str> {
        match self {
            Value::LangString { lang, .. } => Some(&**lang),
            _ => None,
        }
    }

    /// Node class rank: blank < IRI < literal
    fn class_rank(&self) -> u8 {
        match self {
            Value::Blank(_) => 0,
            Value::Iri(_) => 1,
            _ => 2,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Iri(a), Value::Iri(b)) => a == b,
            (Value::Blank(a), Value::Blank(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (
                Value::LangString { value: v1, lang: l1 },
                Value::LangString { value: v2, lang: l2 },
            ) => v1 == v2 && l1.eq_ignore_ascii_case(l2),
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b && a.offset() == b.offset(),
            (Value::Date(a), Value::Date(b)) => a == b,
            (
                Value::Typed {
                    lexical: l1,
                    datatype: d1,
                },
                Value::Typed {
                    lexical: l2,
                    datatype: d2,
                },
            ) => l1 == l2 && d1 == d2,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Iri(s) | Value::Blank(s) | Value::String(s) => s.hash(state),
            Value::LangString { value, lang } => {
                value.hash(state);
                lang.to_ascii_lowercase().hash(state);
            }
            Value::Boolean(b) => b.hash(state),
            Value::Long(n) => n.hash(state),
            Value::Double(d) => d.to_bits().hash(state),
            // BigDecimal equality ignores scale (1.0 == 1.00); normalize before hashing
            Value::Decimal(d) => d.normalized().to_string().hash(state),
            Value::DateTime(dt) => {
                dt.timestamp_nanos_opt().hash(state);
                dt.offset().local_minus_utc().hash(state);
            }
            Value::Date(d) => d.hash(state),
            Value::Typed { lexical, datatype } => {
                lexical.hash(state);
                datatype.hash(state);
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Iri(s) => write!(f, "<{}>", s),
            Value::Blank(s) => write!(f, "_:{}", s),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::LangString { value, lang } => write!(f, "\"{}\"@{}", value, lang),
            Value::Typed { lexical, datatype } => write!(f, "\"{}\"^^<{}>", lexical, datatype),
            other => f.write_str(&other.lexical_form()),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

/// Compare two possibly-unbound values for ORDER BY
///
/// This is a total order, so it is safe to hand to `sort_by`:
/// 1. Unbound sorts lowest
/// 2. Blank nodes < IRIs < literals
/// 3. Literals order by class first: numeric < boolean < dateTime < date < other
/// 4. Numerics compare by value (`-INF` < finite < `INF` < `NaN`); typed
///    literals with a known XSD numeric, boolean or temporal datatype are
///    parsed and compared the same way
/// 5. dateTimes compare by instant, dates by day, booleans false < true
/// 6. Other literals compare by lexical form, then datatype, then language tag
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_terms(a, b),
    }
}

/// Compare two bound values (see [`compare_values`])
pub fn compare_terms(a: &Value, b: &Value) -> Ordering {
    let rank = a.class_rank().cmp(&b.class_rank());
    if rank != Ordering::Equal {
        return rank;
    }

    let (ka, kb) = (SortKey::of(a), SortKey::of(b));
    ka.rank().cmp(&kb.rank()).then_with(|| match (&ka, &kb) {
        (SortKey::Numeric(x), SortKey::Numeric(y)) => x.cmp_value(y),
        (SortKey::Boolean(x), SortKey::Boolean(y)) => x.cmp(y),
        (SortKey::DateTime(x), SortKey::DateTime(y)) => x.cmp(y),
        (SortKey::Date(x), SortKey::Date(y)) => x.cmp(y),
        (SortKey::Lexical(x), SortKey::Lexical(y)) => x
            .lexical_form()
            .cmp(&y.lexical_form())
            .then_with(|| x.datatype().cmp(&y.datatype()))
            .then_with(|| x.lang().cmp(&y.lang())),
        // ranks differ, already decided
        _ => Ordering::Equal,
    })
}

/// Value class of a term for ordering
enum SortKey<'a> {
    Numeric(Num<'a>),
    Boolean(bool),
    DateTime(DateTime<FixedOffset>),
    Date(NaiveDate),
    Lexical(&'a Value),
}

impl<'a> SortKey<'a> {
    fn of(v: &'a Value) -> Self {
        match v {
            Value::Long(n) => SortKey::Numeric(Num::Long(*n)),
            Value::Double(d) => SortKey::Numeric(Num::Double(*d)),
            Value::Decimal(d) => SortKey::Numeric(Num::Decimal(Cow::Borrowed(&**d))),
            Value::Boolean(b) => SortKey::Boolean(*b),
            Value::DateTime(dt) => SortKey::DateTime(*dt),
            Value::Date(d) => SortKey::Date(*d),
            Value::Typed { lexical, datatype } => {
                parse_typed(lexical.trim(), datatype).unwrap_or(SortKey::Lexical(v))
            }
            _ => SortKey::Lexical(v),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SortKey::Numeric(_) => 0,
            SortKey::Boolean(_) => 1,
            SortKey::DateTime(_) => 2,
            SortKey::Date(_) => 3,
            SortKey::Lexical(_) => 4,
        }
    }
}

/// Interpret a typed literal; `None` for unknown datatypes and invalid lexical forms
fn parse_typed<'a>(lexical: &str, datatype: &str) -> Option<SortKey<'a>> {
    let num = if xsd::is_integer_type(datatype) {
        match lexical.parse::<i64>() {
            Ok(n) => Num::Long(n),
            Err(_) => Num::Decimal(Cow::Owned(parse_integer_decimal(lexical)?)),
        }
    } else if datatype == xsd::DECIMAL {
        Num::Decimal(Cow::Owned(BigDecimal::from_str(lexical).ok()?))
    } else if datatype == xsd::DOUBLE || datatype == xsd::FLOAT {
        Num::Double(parse_xsd_double(lexical)?)
    } else {
        return match datatype {
            xsd::BOOLEAN => match lexical {
                "true" | "1" => Some(SortKey::Boolean(true)),
                "false" | "0" => Some(SortKey::Boolean(false)),
                _ => None,
            },
            xsd::DATE_TIME => parse_xsd_date_time(lexical).map(SortKey::DateTime),
            xsd::DATE => parse_xsd_date(lexical).map(SortKey::Date),
            _ => None,
        };
    };
    Some(SortKey::Numeric(num))
}

/// Integers outside the i64 range
fn parse_integer_decimal(lexical: &str) -> Option<BigDecimal> {
    let digits = lexical.strip_prefix(['+', '-']).unwrap_or(lexical);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    BigDecimal::from_str(lexical).ok()
}

fn parse_xsd_double(lexical: &str) -> Option<f64> {
    match lexical {
        "INF" | "+INF" => Some(f64::INFINITY),
        "-INF" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => lexical.parse().ok().filter(|d: &f64| d.is_finite()),
    }
}

/// xsd:dateTime; a value without a timezone is read as UTC
fn parse_xsd_date_time(lexical: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(lexical) {
        return Some(dt);
    }
    let naive = NaiveDateTime::parse_from_str(lexical, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(lexical, "%Y-%m-%dT%H:%M:%S"))
        .ok()?;
    Some(DateTime::from_naive_utc_and_offset(naive, FixedOffset::east_opt(0)?))
}

/// xsd:date; a trailing timezone is ignored
fn parse_xsd_date(lexical: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(lexical, "%Y-%m-%d")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(lexical.get(..10)?, "%Y-%m-%d").ok())
}

/// Numeric value for ordering
enum Num<'a> {
    Long(i64),
    Double(f64),
    Decimal(Cow<'a, BigDecimal>),
}

impl Num<'_> {
    /// -INF < finite < INF < NaN
    fn band(&self) -> u8 {
        match self {
            Num::Double(d) if d.is_nan() => 3,
            Num::Double(d) if *d == f64::INFINITY => 2,
            Num::Double(d) if *d == f64::NEG_INFINITY => 0,
            _ => 1,
        }
    }

    /// Exact for longs and decimals. A double maps to its shortest round-trip
    /// decimal, which preserves the order between doubles.
    fn to_decimal(&self) -> Cow<'_, BigDecimal> {
        match self {
            Num::Long(n) => Cow::Owned(BigDecimal::from(*n)),
            Num::Decimal(d) => Cow::Borrowed(&**d),
            Num::Double(d) => Cow::Owned(
                BigDecimal::from_str(&format!("{:e}", d)).unwrap_or_else(|_| BigDecimal::zero()),
            ),
        }
    }

    fn cmp_value(&self, other: &Num<'_>) -> Ordering {
        match (self, other) {
            (Num::Long(x), Num::Long(y)) => x.cmp(y),
            (Num::Decimal(x), Num::Decimal(y)) => (**x).cmp(&**y),
            _ => {
                let band = self.band().cmp(&other.band());
                if band != Ordering::Equal || self.band() != 1 {
                    return band;
                }
                match (self, other) {
                    (Num::Double(x), Num::Double(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
                    _ => self.to_decimal().cmp(&other.to_decimal()),
                }
            }
        }
    }
}
