//! Textual conversion of record fields, used by CSV-style export and by
//! set-from-string loaders.

use crate::rec::data::Record;
use crate::rec::ipaddr::IpAddr;
use crate::rec::macaddr::MacAddr;
use crate::rec::registry::FieldId;
use crate::rec::template::Template;
use crate::rec::time::MsgTime;
use crate::rec::types::FieldType;
use crate::tools::error::{Error, Result};

fn parse_scalar_into(
    rec: &mut Record,
    tpl: &Template,
    id: FieldId,
    ty: FieldType,
    v: &str,
) -> Result<()> {
    let v = v.trim();
    let bad = |what: &str| Error::spec(format!("bad {} value {:?}", what, v));
    match ty {
        FieldType::Char => {
            let b = *v.as_bytes().first().ok_or_else(|| bad("char"))?;
            rec.set(tpl, id, b)
        }
        FieldType::Uint8 => rec.set(tpl, id, v.parse::<u8>().map_err(|_| bad("uint8"))?),
        FieldType::Int8 => rec.set(tpl, id, v.parse::<i8>().map_err(|_| bad("int8"))?),
        FieldType::Uint16 => rec.set(tpl, id, v.parse::<u16>().map_err(|_| bad("uint16"))?),
        FieldType::Int16 => rec.set(tpl, id, v.parse::<i16>().map_err(|_| bad("int16"))?),
        FieldType::Uint32 => rec.set(tpl, id, v.parse::<u32>().map_err(|_| bad("uint32"))?),
        FieldType::Int32 => rec.set(tpl, id, v.parse::<i32>().map_err(|_| bad("int32"))?),
        FieldType::Uint64 => rec.set(tpl, id, v.parse::<u64>().map_err(|_| bad("uint64"))?),
        FieldType::Int64 => rec.set(tpl, id, v.parse::<i64>().map_err(|_| bad("int64"))?),
        FieldType::Float => rec.set(tpl, id, v.parse::<f32>().map_err(|_| bad("float"))?),
        FieldType::Double => rec.set(tpl, id, v.parse::<f64>().map_err(|_| bad("double"))?),
        FieldType::Ip => rec.set(tpl, id, v.parse::<IpAddr>()?),
        FieldType::Mac => rec.set(tpl, id, v.parse::<MacAddr>()?),
        FieldType::Time => rec.set(tpl, id, v.parse::<MsgTime>()?),
        _ => Err(Error::InvalidFieldId(id)),
    }
}

fn push_array_elem(
    rec: &mut Record,
    tpl: &Template,
    id: FieldId,
    elem: FieldType,
    v: &str,
) -> Result<()> {
    let bad = |what: &str| Error::spec(format!("bad {} value {:?}", what, v));
    match elem {
        FieldType::Char | FieldType::Uint8 => {
            rec.array_push(tpl, id, v.parse::<u8>().map_err(|_| bad("uint8"))?)
        }
        FieldType::Int8 => rec.array_push(tpl, id, v.parse::<i8>().map_err(|_| bad("int8"))?),
        FieldType::Uint16 => rec.array_push(tpl, id, v.parse::<u16>().map_err(|_| bad("uint16"))?),
        FieldType::Int16 => rec.array_push(tpl, id, v.parse::<i16>().map_err(|_| bad("int16"))?),
        FieldType::Uint32 => rec.array_push(tpl, id, v.parse::<u32>().map_err(|_| bad("uint32"))?),
        FieldType::Int32 => rec.array_push(tpl, id, v.parse::<i32>().map_err(|_| bad("int32"))?),
        FieldType::Uint64 => rec.array_push(tpl, id, v.parse::<u64>().map_err(|_| bad("uint64"))?),
        FieldType::Int64 => rec.array_push(tpl, id, v.parse::<i64>().map_err(|_| bad("int64"))?),
        FieldType::Float => rec.array_push(tpl, id, v.parse::<f32>().map_err(|_| bad("float"))?),
        FieldType::Double => rec.array_push(tpl, id, v.parse::<f64>().map_err(|_| bad("double"))?),
        FieldType::Ip => rec.array_push(tpl, id, v.parse::<IpAddr>()?),
        FieldType::Mac => rec.array_push(tpl, id, v.parse::<MacAddr>()?),
        FieldType::Time => rec.array_push(tpl, id, v.parse::<MsgTime>()?),
        _ => Err(Error::InvalidFieldId(id)),
    }
}

fn scalar_to_string(rec: &Record, tpl: &Template, id: FieldId, ty: FieldType) -> Result<String> {
    Ok(match ty {
        FieldType::Char => (rec.get::<u8>(tpl, id)? as char).to_string(),
        FieldType::Uint8 => rec.get::<u8>(tpl, id)?.to_string(),
        FieldType::Int8 => rec.get::<i8>(tpl, id)?.to_string(),
        FieldType::Uint16 => rec.get::<u16>(tpl, id)?.to_string(),
        FieldType::Int16 => rec.get::<i16>(tpl, id)?.to_string(),
        FieldType::Uint32 => rec.get::<u32>(tpl, id)?.to_string(),
        FieldType::Int32 => rec.get::<i32>(tpl, id)?.to_string(),
        FieldType::Uint64 => rec.get::<u64>(tpl, id)?.to_string(),
        FieldType::Int64 => rec.get::<i64>(tpl, id)?.to_string(),
        FieldType::Float => rec.get::<f32>(tpl, id)?.to_string(),
        FieldType::Double => rec.get::<f64>(tpl, id)?.to_string(),
        FieldType::Ip => rec.get::<IpAddr>(tpl, id)?.to_string(),
        FieldType::Mac => rec.get::<MacAddr>(tpl, id)?.to_string(),
        FieldType::Time => rec.get::<MsgTime>(tpl, id)?.to_string(),
        _ => return Err(Error::InvalidFieldId(id)),
    })
}

fn array_elem_to_string(
    rec: &Record,
    tpl: &Template,
    id: FieldId,
    elem: FieldType,
    index: usize,
) -> Result<String> {
    Ok(match elem {
        FieldType::Char | FieldType::Uint8 => rec.array_get::<u8>(tpl, id, index)?.to_string(),
        FieldType::Int8 => rec.array_get::<i8>(tpl, id, index)?.to_string(),
        FieldType::Uint16 => rec.array_get::<u16>(tpl, id, index)?.to_string(),
        FieldType::Int16 => rec.array_get::<i16>(tpl, id, index)?.to_string(),
        FieldType::Uint32 => rec.array_get::<u32>(tpl, id, index)?.to_string(),
        FieldType::Int32 => rec.array_get::<i32>(tpl, id, index)?.to_string(),
        FieldType::Uint64 => rec.array_get::<u64>(tpl, id, index)?.to_string(),
        FieldType::Int64 => rec.array_get::<i64>(tpl, id, index)?.to_string(),
        FieldType::Float => rec.array_get::<f32>(tpl, id, index)?.to_string(),
        FieldType::Double => rec.array_get::<f64>(tpl, id, index)?.to_string(),
        FieldType::Ip => rec.array_get::<IpAddr>(tpl, id, index)?.to_string(),
        FieldType::Mac => rec.array_get::<MacAddr>(tpl, id, index)?.to_string(),
        FieldType::Time => rec.array_get::<MsgTime>(tpl, id, index)?.to_string(),
        _ => return Err(Error::InvalidFieldId(id)),
    })
}

fn decode_hex(v: &str) -> Result<Vec<u8>> {
    let v = v.trim();
    if v.len() % 2 != 0 {
        return Err(Error::spec(format!("odd-length hex string {:?}", v)));
    }
    (0..v.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&v[i..i + 2], 16)
                .map_err(|_| Error::spec(format!("bad hex string {:?}", v)))
        })
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

impl Record {
    /// Set a field from its canonical string form.
    ///
    /// Integers parse from decimals, IP addresses from dotted or colon-hex
    /// form, MAC addresses from colon-hex, timestamps from
    /// `YYYY-MM-DDTHH:MM:SS[.frac][Z]`, opaque bytes from hex pairs, strings
    /// verbatim. Array fields take a space- or `|`-delimited element list,
    /// optionally wrapped in `[...]`.
    pub fn set_from_string(&mut self, tpl: &Template, id: FieldId, v: &str) -> Result<()> {
        let ty = tpl.type_of(id).ok_or(Error::InvalidFieldId(id))?;
        match ty {
            FieldType::String => {
                let unquoted = v
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .map(|s| s.replace("\"\"", "\""));
                let text = unquoted.as_deref().unwrap_or(v);
                self.set_var(tpl, id, text.as_bytes())
            }
            FieldType::Bytes => {
                let bytes = decode_hex(v)?;
                self.set_var(tpl, id, &bytes)
            }
            _ if ty.is_array() => {
                self.array_resize(tpl, id, 0)?;
                let body = v
                    .trim()
                    .strip_prefix('[')
                    .and_then(|s| s.strip_suffix(']'))
                    .unwrap_or(v);
                for elem in body.split([' ', '|']).filter(|e| !e.is_empty()) {
                    push_array_elem(self, tpl, id, ty.elem_type(), elem)?;
                }
                Ok(())
            }
            _ => parse_scalar_into(self, tpl, id, ty, v),
        }
    }

    /// Produce the canonical string form of a field, the inverse of
    /// [`set_from_string`](Self::set_from_string). Strings are quoted with
    /// embedded quotes doubled; arrays are emitted as `[e1|e2|…]`.
    pub fn field_to_string(&self, tpl: &Template, id: FieldId) -> Result<String> {
        let ty = tpl.type_of(id).ok_or(Error::InvalidFieldId(id))?;
        match ty {
            FieldType::String => {
                let text = self.var_as_str(tpl, id)?;
                Ok(format!("\"{}\"", text.replace('"', "\"\"")))
            }
            FieldType::Bytes => Ok(encode_hex(self.var(tpl, id)?)),
            _ if ty.is_array() => {
                let count = self.array_len(tpl, id)?;
                let mut out = String::from("[");
                for i in 0..count {
                    if i > 0 {
                        out.push('|');
                    }
                    out.push_str(&array_elem_to_string(self, tpl, id, ty.elem_type(), i)?);
                }
                out.push(']');
                Ok(out)
            }
            _ => scalar_to_string(self, tpl, id, ty),
        }
    }

    /// Render the whole record as one delimited line, fields in canonical
    /// order.
    pub fn to_line(&self, tpl: &Template, sep: char) -> Result<String> {
        let mut out = String::new();
        for (i, id) in tpl.ids().enumerate() {
            if i > 0 {
                out.push(sep);
            }
            out.push_str(&self.field_to_string(tpl, id)?);
        }
        Ok(out)
    }
}

/// Render a header line with the field names of a template in canonical
/// order, for pairing with [`Record::to_line`].
pub fn header_line(tpl: &Template, sep: char) -> String {
    let mut out = String::new();
    for (i, id) in tpl.ids().enumerate() {
        if i > 0 {
            out.push(sep);
        }
        out.push_str(tpl.name_of(id).unwrap_or(""));
    }
    out
}
