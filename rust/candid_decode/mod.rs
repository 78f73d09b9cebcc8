//! Self-contained decoder for the Candid binary wire format.
//!
//! This is deliberately independent of the `candid` crate's typed decoding:
//! the broker receives opaque argument blobs (icrc49 call forwarding) and has
//! to render them without knowing the canister's interface. The decoder
//! parses the type table and value section into a generic [`CandidValue`]
//! tree, reporting the exact byte offset on failure.

mod reader;

use std::collections::HashMap;
use std::fmt;

use ic_agent::export::Principal;
use num_bigint::{BigInt, BigUint};
use thiserror::Error;
use tracing::warn;

pub use reader::ByteReader;

// Primitive and composite type codes of the Candid spec (SLEB128-encoded).
const TYPE_NULL: i64 = -1;
const TYPE_BOOL: i64 = -2;
const TYPE_NAT: i64 = -3;
const TYPE_INT: i64 = -4;
const TYPE_NAT8: i64 = -5;
const TYPE_NAT16: i64 = -6;
const TYPE_NAT32: i64 = -7;
const TYPE_NAT64: i64 = -8;
const TYPE_INT8: i64 = -9;
const TYPE_INT16: i64 = -10;
const TYPE_INT32: i64 = -11;
const TYPE_INT64: i64 = -12;
const TYPE_FLOAT32: i64 = -13;
const TYPE_FLOAT64: i64 = -14;
const TYPE_TEXT: i64 = -15;
const TYPE_RESERVED: i64 = -16;
const TYPE_EMPTY: i64 = -17;
const TYPE_OPT: i64 = -18;
const TYPE_VEC: i64 = -19;
const TYPE_RECORD: i64 = -20;
const TYPE_VARIANT: i64 = -21;
const TYPE_FUNC: i64 = -22;
const TYPE_SERVICE: i64 = -23;
const TYPE_PRINCIPAL: i64 = -24;

const MAX_PRINCIPAL_LEN: usize = 29;

// A self-referential type table entry plus a long run of tag bytes could
// otherwise recurse until the stack is exhausted, which aborts the process.
const MAX_VALUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Error)]
#[error("{message} (at byte {offset})")]
pub struct CandidError {
    pub message: String,
    pub offset: usize,
}

impl CandidError {
    pub fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Decode failure carrying the top-level values that were fully decoded
/// before the error, for diagnostics.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct DecodeError {
    #[source]
    pub error: CandidError,
    pub partial: Vec<CandidValue>,
}

/// Field or variant-option label: the 32-bit Candid hash plus the resolved
/// name when the caller supplied a lookup that knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLabel {
    pub id: u32,
    pub name: Option<String>,
}

impl fmt::Display for FieldLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => f.write_str(name),
            None => write!(f, "_{}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CandidValue {
    Null,
    Bool(bool),
    Nat(BigUint),
    Int(BigInt),
    Nat8(u8),
    Nat16(u16),
    Nat32(u32),
    Nat64(u64),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Principal(Principal),
    Opt(Option<Box<CandidValue>>),
    Vec(Vec<CandidValue>),
    /// Fields in ascending order of their 32-bit hash.
    Record(Vec<(FieldLabel, CandidValue)>),
    Variant(FieldLabel, Box<CandidValue>),
    Func(Principal, String),
    Service(Principal),
}

/// Reverse lookup from field hash to human-readable name, precomputed from a
/// literal field-name list.
#[derive(Debug, Default, Clone)]
pub struct NameLookup {
    names: HashMap<u32, String>,
}

impl NameLookup {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut map: HashMap<u32, String> = HashMap::new();
        for name in names {
            let name = name.as_ref();
            let hash = field_hash(name);
            match map.get_mut(&hash) {
                Some(existing) => {
                    // Both names hash to the same id; keep them joined so the
                    // ambiguity stays visible to the caller.
                    existing.push('|');
                    existing.push_str(name);
                    warn!(hash, names = %existing, "field name hash collision");
                }
                None => {
                    map.insert(hash, name.to_string());
                }
            }
        }
        Self { names: map }
    }

    pub fn resolve(&self, id: u32) -> FieldLabel {
        FieldLabel {
            id,
            name: self.names.get(&id).cloned(),
        }
    }
}

/// The Candid field/option hash: iterate the UTF-8 bytes of the name with
/// `hash = hash * 223 + byte (mod 2^32)`.
pub fn field_hash(name: &str) -> u32 {
    name.bytes()
        .fold(0u32, |hash, byte| hash.wrapping_mul(223).wrapping_add(byte as u32))
}

#[derive(Debug, Clone)]
enum TypeTableEntry {
    Opt {
        inner: i64,
    },
    Vec {
        elem: i64,
    },
    /// `(hash, type ref)` pairs sorted ascending by hash.
    Record {
        fields: Vec<(u32, i64)>,
    },
    Variant {
        options: Vec<(u32, i64)>,
    },
    Func,
    Service,
}

impl TypeTableEntry {
    fn type_code(&self) -> i64 {
        match self {
            TypeTableEntry::Opt { .. } => TYPE_OPT,
            TypeTableEntry::Vec { .. } => TYPE_VEC,
            TypeTableEntry::Record { .. } => TYPE_RECORD,
            TypeTableEntry::Variant { .. } => TYPE_VARIANT,
            TypeTableEntry::Func => TYPE_FUNC,
            TypeTableEntry::Service => TYPE_SERVICE,
        }
    }
}

/// Decode a Candid message into its argument values.
///
/// Composite record/variant members are resolved to names through `lookup`
/// when provided; unknown hashes render as `_<hash>`.
pub fn decode(buffer: &[u8], lookup: Option<&NameLookup>) -> Result<Vec<CandidValue>, DecodeError> {
    let mut reader = ByteReader::new(buffer);
    let mut decoded: Vec<CandidValue> = Vec::new();
    match decode_inner(&mut reader, lookup, &mut decoded) {
        Ok(()) => Ok(decoded),
        Err(error) => Err(DecodeError {
            error,
            partial: decoded,
        }),
    }
}

fn decode_inner(
    reader: &mut ByteReader<'_>,
    lookup: Option<&NameLookup>,
    out: &mut Vec<CandidValue>,
) -> Result<(), CandidError> {
    // Magic bytes "DIDL".
    let magic = reader.read_bytes(4)?;
    if magic != b"DIDL" {
        return Err(CandidError::new("Invalid Candid magic bytes, expected 'DIDL'", 0));
    }

    let table = parse_type_table(reader)?;

    // Argument type references. Func/Service tags may only appear through the
    // type table, never directly as an argument type.
    let arg_count = reader.read_len()?;
    let mut arg_types = Vec::with_capacity(arg_count);
    for _ in 0..arg_count {
        let at = reader.offset();
        let type_ref = reader.read_type_ref()?;
        if type_ref == TYPE_FUNC || type_ref == TYPE_SERVICE {
            return Err(CandidError::new(
                format!("Reference type {type_ref} cannot be used directly as an argument"),
                at,
            ));
        }
        arg_types.push(type_ref);
    }

    for type_ref in arg_types {
        let value = decode_value(reader, type_ref, &table, lookup, 0)?;
        out.push(value);
    }

    if reader.has_more() {
        return Err(CandidError::new(
            "Trailing bytes found after decoding all expected values",
            reader.offset(),
        ));
    }
    Ok(())
}

fn parse_type_table(reader: &mut ByteReader<'_>) -> Result<Vec<TypeTableEntry>, CandidError> {
    let count = reader.read_len()?;
    let mut table = Vec::with_capacity(count.min(1024));
    for index in 0..count {
        let at = reader.offset();
        let code = reader.read_type_ref()?;
        let entry = match code {
            TYPE_OPT => TypeTableEntry::Opt {
                inner: reader.read_type_ref()?,
            },
            TYPE_VEC => TypeTableEntry::Vec {
                elem: reader.read_type_ref()?,
            },
            TYPE_RECORD | TYPE_VARIANT => {
                let members = reader.read_len()?;
                let mut pairs = Vec::with_capacity(members.min(1024));
                for _ in 0..members {
                    let id_at = reader.offset();
                    let id = reader.read_uleb128()?;
                    let id = u32::try_from(&id).map_err(|_| {
                        CandidError::new(format!("Field id {id} exceeds 32 bits"), id_at)
                    })?;
                    let type_ref = reader.read_type_ref()?;
                    pairs.push((id, type_ref));
                }
                // The hash order is canonical; sort immediately so that field
                // and option resolution is independent of wire order.
                pairs.sort_by_key(|(id, _)| *id);
                if code == TYPE_RECORD {
                    TypeTableEntry::Record { fields: pairs }
                } else {
                    TypeTableEntry::Variant { options: pairs }
                }
            }
            TYPE_FUNC => {
                let args = reader.read_len()?;
                for _ in 0..args {
                    reader.read_type_ref()?;
                }
                let rets = reader.read_len()?;
                for _ in 0..rets {
                    reader.read_type_ref()?;
                }
                let modes = reader.read_len()?;
                for _ in 0..modes {
                    let mode = reader.read_byte()?;
                    // 1: oneway, 2: query
                    if mode != 1 && mode != 2 {
                        return Err(CandidError::new(
                            format!("Invalid function mode byte {mode}, expected 1 or 2"),
                            reader.offset() - 1,
                        ));
                    }
                }
                TypeTableEntry::Func
            }
            TYPE_SERVICE => {
                let methods = reader.read_len()?;
                for _ in 0..methods {
                    let name_len = reader.read_len()?;
                    reader.read_utf8(name_len)?;
                    reader.read_type_ref()?;
                }
                TypeTableEntry::Service
            }
            _ => {
                return Err(CandidError::new(
                    format!("Unexpected type code {code} in type table definition at index {index}"),
                    at,
                ));
            }
        };
        table.push(entry);
    }
    Ok(table)
}

fn decode_principal(reader: &mut ByteReader<'_>) -> Result<Principal, CandidError> {
    let tag = reader.read_byte()?;
    if tag != 0x01 {
        return Err(CandidError::new(
            format!("Unsupported principal tag {tag}, expected 1"),
            reader.offset() - 1,
        ));
    }
    let len_at = reader.offset();
    let len = reader.read_len()?;
    if len > MAX_PRINCIPAL_LEN {
        return Err(CandidError::new(
            format!("Invalid principal length {len}, must be at most {MAX_PRINCIPAL_LEN} bytes"),
            len_at,
        ));
    }
    let bytes = reader.read_bytes(len)?;
    Ok(Principal::from_slice(bytes))
}

fn decode_value(
    reader: &mut ByteReader<'_>,
    type_ref: i64,
    table: &[TypeTableEntry],
    lookup: Option<&NameLookup>,
    depth: usize,
) -> Result<CandidValue, CandidError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(CandidError::new(
            format!("Value nesting exceeds {MAX_VALUE_DEPTH} levels"),
            reader.offset(),
        ));
    }
    let entry = if type_ref >= 0 {
        let index = type_ref as usize;
        let Some(entry) = table.get(index) else {
            return Err(CandidError::new(
                format!(
                    "Type index {index} is out of bounds for type table of size {}",
                    table.len()
                ),
                reader.offset(),
            ));
        };
        Some(entry)
    } else {
        None
    };
    let code = entry.map_or(type_ref, TypeTableEntry::type_code);

    match code {
        TYPE_NULL | TYPE_RESERVED => Ok(CandidValue::Null),
        TYPE_BOOL => {
            let byte = reader.read_byte()?;
            match byte {
                0 => Ok(CandidValue::Bool(false)),
                1 => Ok(CandidValue::Bool(true)),
                other => Err(CandidError::new(
                    format!("Invalid boolean value {other}, expected 0 or 1"),
                    reader.offset() - 1,
                )),
            }
        }
        TYPE_NAT => Ok(CandidValue::Nat(reader.read_uleb128()?)),
        TYPE_INT => Ok(CandidValue::Int(reader.read_sleb128()?)),
        TYPE_NAT8 => Ok(CandidValue::Nat8(reader.read_fixed(1, false)? as u8)),
        TYPE_NAT16 => Ok(CandidValue::Nat16(reader.read_fixed(2, false)? as u16)),
        TYPE_NAT32 => Ok(CandidValue::Nat32(reader.read_fixed(4, false)? as u32)),
        TYPE_NAT64 => Ok(CandidValue::Nat64(reader.read_fixed(8, false)? as u64)),
        TYPE_INT8 => Ok(CandidValue::Int8(reader.read_fixed(1, true)? as i8)),
        TYPE_INT16 => Ok(CandidValue::Int16(reader.read_fixed(2, true)? as i16)),
        TYPE_INT32 => Ok(CandidValue::Int32(reader.read_fixed(4, true)? as i32)),
        TYPE_INT64 => Ok(CandidValue::Int64(reader.read_fixed(8, true)? as i64)),
        TYPE_FLOAT32 => Ok(CandidValue::Float32(reader.read_f32()?)),
        TYPE_FLOAT64 => Ok(CandidValue::Float64(reader.read_f64()?)),
        TYPE_TEXT => {
            let len = reader.read_len()?;
            Ok(CandidValue::Text(reader.read_utf8(len)?))
        }
        TYPE_EMPTY => Err(CandidError::new(
            "Attempted to decode 'empty' type as a value; it has no encoded form",
            reader.offset(),
        )),
        TYPE_PRINCIPAL => Ok(CandidValue::Principal(decode_principal(reader)?)),
        TYPE_SERVICE => Ok(CandidValue::Service(decode_principal(reader)?)),
        TYPE_OPT => {
            let inner = match entry {
                Some(TypeTableEntry::Opt { inner }) => *inner,
                _ => {
                    return Err(CandidError::new(
                        "Composite type 'opt' is not valid outside the type table",
                        reader.offset(),
                    ));
                }
            };
            let present = reader.read_byte()?;
            match present {
                0 => Ok(CandidValue::Opt(None)),
                1 => {
                    let value = decode_value(reader, inner, table, lookup, depth + 1)?;
                    Ok(CandidValue::Opt(Some(Box::new(value))))
                }
                other => Err(CandidError::new(
                    format!("Invalid option tag {other}, expected 0 or 1"),
                    reader.offset() - 1,
                )),
            }
        }
        TYPE_VEC => {
            let elem = match entry {
                Some(TypeTableEntry::Vec { elem }) => *elem,
                _ => {
                    return Err(CandidError::new(
                        "Composite type 'vec' is not valid outside the type table",
                        reader.offset(),
                    ));
                }
            };
            let len = reader.read_len()?;
            let mut values = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                values.push(decode_value(reader, elem, table, lookup, depth + 1)?);
            }
            Ok(CandidValue::Vec(values))
        }
        TYPE_RECORD => {
            let fields = match entry {
                Some(TypeTableEntry::Record { fields }) => fields,
                _ => {
                    return Err(CandidError::new(
                        "Composite type 'record' is not valid outside the type table",
                        reader.offset(),
                    ));
                }
            };
            let mut values = Vec::with_capacity(fields.len());
            for (id, field_type) in fields {
                let value = decode_value(reader, *field_type, table, lookup, depth + 1)?;
                values.push((resolve_label(*id, lookup), value));
            }
            Ok(CandidValue::Record(values))
        }
        TYPE_VARIANT => {
            let options = match entry {
                Some(TypeTableEntry::Variant { options }) => options,
                _ => {
                    return Err(CandidError::new(
                        "Composite type 'variant' is not valid outside the type table",
                        reader.offset(),
                    ));
                }
            };
            let index_at = reader.offset();
            let index = reader.read_len()?;
            let Some((id, option_type)) = options.get(index) else {
                return Err(CandidError::new(
                    format!(
                        "Variant option index {index} out of bounds, variant has {} options",
                        options.len()
                    ),
                    index_at,
                ));
            };
            let value = decode_value(reader, *option_type, table, lookup, depth + 1)?;
            Ok(CandidValue::Variant(
                resolve_label(*id, lookup),
                Box::new(value),
            ))
        }
        TYPE_FUNC => {
            let tag = reader.read_byte()?;
            if tag != 0x01 {
                return Err(CandidError::new(
                    format!("Unsupported function tag {tag}, expected 1 for reference type"),
                    reader.offset() - 1,
                ));
            }
            let principal = decode_principal(reader)?;
            let name_len = reader.read_len()?;
            let method = reader.read_utf8(name_len)?;
            Ok(CandidValue::Func(principal, method))
        }
        other => Err(CandidError::new(
            format!("Unsupported or unknown Candid type tag {other}"),
            reader.offset(),
        )),
    }
}

fn resolve_label(id: u32, lookup: Option<&NameLookup>) -> FieldLabel {
    match lookup {
        Some(lookup) => lookup.resolve(id),
        None => FieldLabel { id, name: None },
    }
}
