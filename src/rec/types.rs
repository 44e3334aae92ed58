use serde::Serialize;

/// Element type of a record field.
///
/// `String` and `Bytes` are variable-length; every other scalar type has a
/// fixed width and a homogeneous array variant (also variable-length, with
/// the scalar as its element).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
#[allow(missing_docs)]
pub enum FieldType {
    String,
    Bytes,
    Char,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float,
    Double,
    Ip,
    Mac,
    Time,
    CharArr,
    Uint8Arr,
    Int8Arr,
    Uint16Arr,
    Int16Arr,
    Uint32Arr,
    Int32Arr,
    Uint64Arr,
    Int64Arr,
    FloatArr,
    DoubleArr,
    IpArr,
    MacArr,
    TimeArr,
}

/// All field types in declaration order.
pub(crate) const ALL_TYPES: [FieldType; 30] = [
    FieldType::String,
    FieldType::Bytes,
    FieldType::Char,
    FieldType::Uint8,
    FieldType::Int8,
    FieldType::Uint16,
    FieldType::Int16,
    FieldType::Uint32,
    FieldType::Int32,
    FieldType::Uint64,
    FieldType::Int64,
    FieldType::Float,
    FieldType::Double,
    FieldType::Ip,
    FieldType::Mac,
    FieldType::Time,
    FieldType::CharArr,
    FieldType::Uint8Arr,
    FieldType::Int8Arr,
    FieldType::Uint16Arr,
    FieldType::Int16Arr,
    FieldType::Uint32Arr,
    FieldType::Int32Arr,
    FieldType::Uint64Arr,
    FieldType::Int64Arr,
    FieldType::FloatArr,
    FieldType::DoubleArr,
    FieldType::IpArr,
    FieldType::MacArr,
    FieldType::TimeArr,
];

impl FieldType {
    /// Size of the field in bytes. Fixed types have a positive size;
    /// variable-length types encode the per-element size as a negative
    /// sentinel (string and bytes count one byte per element).
    pub fn size(&self) -> i16 {
        match self {
            FieldType::String | FieldType::Bytes => -1,
            FieldType::Char | FieldType::Uint8 | FieldType::Int8 => 1,
            FieldType::Uint16 | FieldType::Int16 => 2,
            FieldType::Uint32 | FieldType::Int32 | FieldType::Float => 4,
            FieldType::Uint64 | FieldType::Int64 | FieldType::Double | FieldType::Time => 8,
            FieldType::Ip => 16,
            FieldType::Mac => 6,
            FieldType::CharArr | FieldType::Uint8Arr | FieldType::Int8Arr => -1,
            FieldType::Uint16Arr | FieldType::Int16Arr => -2,
            FieldType::Uint32Arr | FieldType::Int32Arr | FieldType::FloatArr => -4,
            FieldType::Uint64Arr | FieldType::Int64Arr | FieldType::DoubleArr => -8,
            FieldType::TimeArr => -8,
            FieldType::IpArr => -16,
            FieldType::MacArr => -6,
        }
    }

    /// Size of a single element in bytes (absolute value of [`size`](Self::size)).
    pub fn elem_size(&self) -> usize {
        self.size().unsigned_abs() as usize
    }

    /// True for fields whose payload length is per-record.
    pub fn is_variable(&self) -> bool {
        self.size() < 0
    }

    /// True for homogeneous array types.
    pub fn is_array(&self) -> bool {
        !matches!(self, FieldType::String | FieldType::Bytes) && self.is_variable()
    }

    /// Scalar type of an array element; scalar types return themselves.
    pub fn elem_type(&self) -> FieldType {
        match self {
            FieldType::CharArr => FieldType::Char,
            FieldType::Uint8Arr => FieldType::Uint8,
            FieldType::Int8Arr => FieldType::Int8,
            FieldType::Uint16Arr => FieldType::Uint16,
            FieldType::Int16Arr => FieldType::Int16,
            FieldType::Uint32Arr => FieldType::Uint32,
            FieldType::Int32Arr => FieldType::Int32,
            FieldType::Uint64Arr => FieldType::Uint64,
            FieldType::Int64Arr => FieldType::Int64,
            FieldType::FloatArr => FieldType::Float,
            FieldType::DoubleArr => FieldType::Double,
            FieldType::IpArr => FieldType::Ip,
            FieldType::MacArr => FieldType::Mac,
            FieldType::TimeArr => FieldType::Time,
            other => *other,
        }
    }

    /// Canonical name used in template spec strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
            FieldType::Char => "char",
            FieldType::Uint8 => "uint8",
            FieldType::Int8 => "int8",
            FieldType::Uint16 => "uint16",
            FieldType::Int16 => "int16",
            FieldType::Uint32 => "uint32",
            FieldType::Int32 => "int32",
            FieldType::Uint64 => "uint64",
            FieldType::Int64 => "int64",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Ip => "ipaddr",
            FieldType::Mac => "macaddr",
            FieldType::Time => "time",
            FieldType::CharArr => "char*",
            FieldType::Uint8Arr => "uint8*",
            FieldType::Int8Arr => "int8*",
            FieldType::Uint16Arr => "uint16*",
            FieldType::Int16Arr => "int16*",
            FieldType::Uint32Arr => "uint32*",
            FieldType::Int32Arr => "int32*",
            FieldType::Uint64Arr => "uint64*",
            FieldType::Int64Arr => "int64*",
            FieldType::FloatArr => "float*",
            FieldType::DoubleArr => "double*",
            FieldType::IpArr => "ipaddr*",
            FieldType::MacArr => "macaddr*",
            FieldType::TimeArr => "time*",
        }
    }
}

impl TryFrom<&str> for FieldType {
    type Error = ();

    fn try_from(v: &str) -> std::result::Result<Self, Self::Error> {
        ALL_TYPES.iter().find(|t| t.as_str() == v).copied().ok_or(())
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
