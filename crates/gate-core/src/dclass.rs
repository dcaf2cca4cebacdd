//! Distributed-class registry: field metadata, send permissions, and the
//! declaration hash exchanged during the client handshake.
//!
//! Classes are described in the agent configuration and frozen into a
//! [`ClassRegistry`] at role startup; afterwards the registry is shared
//! read-only across sessions.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::{self, Deserializer};
use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Field Types
// ============================================================================

/// Wire type of a distributed-class field.
///
/// `fixed_size` distinguishes types the codec can skip by length from
/// types that carry their own u16 byte-length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float64,
    /// u16-length-prefixed UTF-8 bytes.
    String,
    /// u16-length-prefixed opaque bytes.
    Blob,
    /// Fixed-count array of a single element type.
    Array(Box<FieldType>, u16),
    /// Variable array: u16 byte-length prefix followed by packed elements.
    VarArray(Box<FieldType>),
    /// Inline struct of member types, packed in declaration order.
    Struct(Vec<FieldType>),
}

impl FieldType {
    /// Packed size in bytes, or `None` for variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Self::Uint8 | Self::Int8 => Some(1),
            Self::Uint16 | Self::Int16 => Some(2),
            Self::Uint32 | Self::Int32 => Some(4),
            Self::Uint64 | Self::Int64 | Self::Float64 => Some(8),
            Self::String | Self::Blob | Self::VarArray(_) => None,
            Self::Array(elem, count) => {
                elem.fixed_size().map(|s| s * usize::from(*count))
            }
            Self::Struct(members) => {
                let mut total = 0;
                for m in members {
                    total += m.fixed_size()?;
                }
                Some(total)
            }
        }
    }

    /// Token used for the declaration hash.
    fn token(&self) -> String {
        match self {
            Self::Uint8 => "uint8".into(),
            Self::Uint16 => "uint16".into(),
            Self::Uint32 => "uint32".into(),
            Self::Uint64 => "uint64".into(),
            Self::Int8 => "int8".into(),
            Self::Int16 => "int16".into(),
            Self::Int32 => "int32".into(),
            Self::Int64 => "int64".into(),
            Self::Float64 => "float64".into(),
            Self::String => "string".into(),
            Self::Blob => "blob".into(),
            Self::Array(elem, count) => format!("{}[{count}]", elem.token()),
            Self::VarArray(elem) => format!("{}[]", elem.token()),
            Self::Struct(members) => {
                let inner: Vec<String> = members.iter().map(FieldType::token).collect();
                format!("{{{}}}", inner.join(","))
            }
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

impl FromStr for FieldType {
    type Err = DcError;

    /// Parses the configuration syntax: a primitive name, optionally
    /// suffixed with `[]` (variable array) or `[N]` (fixed array).
    fn from_str(s: &str) -> Result<Self, DcError> {
        let s = s.trim();
        if let Some(base) = s.strip_suffix("[]") {
            return Ok(Self::VarArray(Box::new(base.parse()?)));
        }
        if let Some(open) = s.find('[') {
            let close = s
                .strip_suffix(']')
                .ok_or_else(|| DcError::BadFieldType(s.to_string()))?;
            let count: u16 = close[open + 1..]
                .parse()
                .map_err(|_| DcError::BadFieldType(s.to_string()))?;
            return Ok(Self::Array(Box::new(s[..open].parse()?), count));
        }
        match s {
            "uint8" => Ok(Self::Uint8),
            "uint16" => Ok(Self::Uint16),
            "uint32" => Ok(Self::Uint32),
            "uint64" => Ok(Self::Uint64),
            "int8" => Ok(Self::Int8),
            "int16" => Ok(Self::Int16),
            "int32" => Ok(Self::Int32),
            "int64" => Ok(Self::Int64),
            "float64" => Ok(Self::Float64),
            "string" => Ok(Self::String),
            "blob" => Ok(Self::Blob),
            other => Err(DcError::BadFieldType(other.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for FieldType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ============================================================================
// Fields and Classes
// ============================================================================

/// Send-permission and distribution keywords on a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldKeywords {
    /// Any client may send this field.
    pub clsend: bool,
    /// The owning client may send this field.
    pub ownsend: bool,
    /// Updates are broadcast to the object's location channel.
    pub broadcast: bool,
    /// Part of the REQUIRED snapshot sent on entry.
    pub required: bool,
}

impl FieldKeywords {
    /// Parses a keyword list from configuration.
    pub fn parse(words: &[String]) -> Result<Self, DcError> {
        let mut kw = Self::default();
        for w in words {
            match w.as_str() {
                "clsend" => kw.clsend = true,
                "ownsend" => kw.ownsend = true,
                "broadcast" => kw.broadcast = true,
                "required" => kw.required = true,
                other => return Err(DcError::BadKeyword(other.to_string())),
            }
        }
        Ok(kw)
    }
}

/// One field of a distributed class.
#[derive(Debug, Clone)]
pub struct DcField {
    index: u16,
    name: String,
    field_type: FieldType,
    keywords: FieldKeywords,
}

impl DcField {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &FieldType {
        &self.field_type
    }

    pub fn is_clsend(&self) -> bool {
        self.keywords.clsend
    }

    pub fn is_ownsend(&self) -> bool {
        self.keywords.ownsend
    }

    pub fn keywords(&self) -> FieldKeywords {
        self.keywords
    }
}

/// A distributed class: ordered fields addressable by index.
#[derive(Debug)]
pub struct DcClass {
    id: u16,
    name: String,
    fields: Vec<DcField>,
}

impl DcClass {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up a field by its per-class index.
    pub fn field_by_index(&self, index: u16) -> Option<&DcField> {
        self.fields.get(usize::from(index))
    }

    pub fn fields(&self) -> &[DcField] {
        &self.fields
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Configuration description of one class.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassConfig {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

/// Configuration description of one field.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Errors raised while building the class registry.
#[derive(Debug, Clone, Error)]
pub enum DcError {
    #[error("unknown field type: {0}")]
    BadFieldType(String),

    #[error("unknown field keyword: {0}")]
    BadKeyword(String),

    #[error("duplicate class name: {0}")]
    DuplicateClass(String),
}

/// Immutable registry of all distributed classes known to this process.
///
/// Class ids are assigned by declaration order; the 32-bit hash is derived
/// from the full declaration (names, types, keywords, in order), so any
/// change to the class file changes the hash and fails the client handshake.
#[derive(Debug)]
pub struct ClassRegistry {
    classes: Vec<Arc<DcClass>>,
    by_name: HashMap<String, u16>,
    hash: u32,
}

impl ClassRegistry {
    /// Builds the registry from configuration.
    pub fn from_config(classes: &[ClassConfig]) -> Result<Self, DcError> {
        let mut out = Vec::with_capacity(classes.len());
        let mut by_name = HashMap::new();
        let mut gen = HashGenerator::new();

        for (class_id, cc) in classes.iter().enumerate() {
            let id = class_id as u16;
            if by_name.insert(cc.name.clone(), id).is_some() {
                return Err(DcError::DuplicateClass(cc.name.clone()));
            }
            gen.add_string(&cc.name);

            let mut fields = Vec::with_capacity(cc.fields.len());
            for (field_index, fc) in cc.fields.iter().enumerate() {
                let keywords = FieldKeywords::parse(&fc.keywords)?;
                gen.add_string(&fc.name);
                gen.add_string(&fc.field_type.token());
                gen.add_u8(u8::from(keywords.clsend));
                gen.add_u8(u8::from(keywords.ownsend));
                gen.add_u8(u8::from(keywords.broadcast));
                gen.add_u8(u8::from(keywords.required));

                fields.push(DcField {
                    index: field_index as u16,
                    name: fc.name.clone(),
                    field_type: fc.field_type.clone(),
                    keywords,
                });
            }

            out.push(Arc::new(DcClass {
                id,
                name: cc.name.clone(),
                fields,
            }));
        }

        Ok(Self {
            classes: out,
            by_name,
            hash: gen.finish(),
        })
    }

    /// Looks up a class by numeric id.
    pub fn get_class(&self, id: u16) -> Option<Arc<DcClass>> {
        self.classes.get(usize::from(id)).cloned()
    }

    /// Looks up a class by declared name.
    pub fn get_class_by_name(&self, name: &str) -> Option<Arc<DcClass>> {
        self.by_name
            .get(name)
            .and_then(|id| self.get_class(*id))
    }

    /// Declaration hash clients must present in CLIENT_HELLO.
    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Accumulating FNV-1a hash over the class declaration.
struct HashGenerator {
    state: u32,
}

impl HashGenerator {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    fn new() -> Self {
        Self {
            state: Self::OFFSET,
        }
    }

    fn add_u8(&mut self, byte: u8) {
        self.state ^= u32::from(byte);
        self.state = self.state.wrapping_mul(Self::PRIME);
    }

    fn add_string(&mut self, s: &str) {
        for b in s.as_bytes() {
            self.add_u8(*b);
        }
        // Length terminator keeps "ab","c" distinct from "a","bc".
        self.add_u8(0);
    }

    fn finish(self) -> u32 {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Vec<ClassConfig> {
        serde_json::from_value(serde_json::json!([
            {
                "name": "LoginManager",
                "fields": [
                    {"name": "login", "type": "string", "keywords": ["clsend"]},
                    {"name": "loginResp", "type": "uint8", "keywords": ["broadcast"]}
                ]
            },
            {
                "name": "Avatar",
                "fields": [
                    {"name": "setName", "type": "string", "keywords": ["ownsend", "required"]},
                    {"name": "setXYZ", "type": "uint32[3]", "keywords": ["clsend", "broadcast"]}
                ]
            }
        ]))
        .unwrap()
    }

    #[test]
    fn test_field_type_parse() {
        assert_eq!("uint32".parse::<FieldType>().unwrap(), FieldType::Uint32);
        assert_eq!(
            "uint8[]".parse::<FieldType>().unwrap(),
            FieldType::VarArray(Box::new(FieldType::Uint8))
        );
        assert_eq!(
            "uint32[3]".parse::<FieldType>().unwrap(),
            FieldType::Array(Box::new(FieldType::Uint32), 3)
        );
        assert!("complex128".parse::<FieldType>().is_err());
        assert!("uint32[x]".parse::<FieldType>().is_err());
    }

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(FieldType::Uint8.fixed_size(), Some(1));
        assert_eq!(FieldType::Uint64.fixed_size(), Some(8));
        assert_eq!(FieldType::String.fixed_size(), None);
        assert_eq!(
            FieldType::Array(Box::new(FieldType::Uint32), 3).fixed_size(),
            Some(12)
        );
        assert_eq!(
            FieldType::VarArray(Box::new(FieldType::Uint8)).fixed_size(),
            None
        );
        assert_eq!(
            FieldType::Struct(vec![FieldType::Uint16, FieldType::Uint32]).fixed_size(),
            Some(6)
        );
        assert_eq!(
            FieldType::Struct(vec![FieldType::Uint16, FieldType::String]).fixed_size(),
            None
        );
    }

    #[test]
    fn test_registry_lookup() {
        let reg = ClassRegistry::from_config(&sample_config()).unwrap();
        assert_eq!(reg.len(), 2);

        let avatar = reg.get_class_by_name("Avatar").unwrap();
        assert_eq!(avatar.id(), 1);
        assert_eq!(avatar.field_by_index(0).unwrap().name(), "setName");
        assert!(avatar.field_by_index(0).unwrap().is_ownsend());
        assert!(!avatar.field_by_index(0).unwrap().is_clsend());
        assert!(avatar.field_by_index(2).is_none());

        assert!(reg.get_class_by_name("Missing").is_none());
        assert!(reg.get_class(7).is_none());
    }

    #[test]
    fn test_hash_is_stable_and_declaration_sensitive() {
        let a = ClassRegistry::from_config(&sample_config()).unwrap();
        let b = ClassRegistry::from_config(&sample_config()).unwrap();
        assert_eq!(a.hash(), b.hash());

        let mut altered = sample_config();
        altered[0].fields[0].keywords.push("ownsend".to_string());
        let c = ClassRegistry::from_config(&altered).unwrap();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_duplicate_class_rejected() {
        let mut cfg = sample_config();
        cfg[1].name = cfg[0].name.clone();
        assert!(matches!(
            ClassRegistry::from_config(&cfg),
            Err(DcError::DuplicateClass(_))
        ));
    }

    #[test]
    fn test_unknown_keyword_rejected() {
        let mut cfg = sample_config();
        cfg[0].fields[0].keywords.push("airdrop".to_string());
        assert!(matches!(
            ClassRegistry::from_config(&cfg),
            Err(DcError::BadKeyword(_))
        ));
    }
}
