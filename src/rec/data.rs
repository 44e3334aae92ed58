use crate::rec::ipaddr::IpAddr;
use crate::rec::macaddr::MacAddr;
use crate::rec::registry::FieldId;
use crate::rec::template::Template;
use crate::rec::time::MsgTime;
use crate::rec::types::FieldType;
use crate::tools::error::{Error, Result};

/// Largest possible record, fixed part and variable tail together.
pub const MAX_RECORD_SIZE: usize = 0xFFFF;

mod sealed {
    pub trait Sealed {}
}

/// A value that can live in a fixed-width record slot.
///
/// Implemented for the primitive integers and floats and for
/// [`MsgTime`], [`IpAddr`] and [`MacAddr`]. Values are stored
/// little-endian so records are byte-identical across machines.
pub trait FixedField: sealed::Sealed + Copy {
    /// Width of the slot in bytes.
    const WIDTH: usize;

    #[doc(hidden)]
    fn compatible(ty: FieldType) -> bool;

    #[doc(hidden)]
    fn read_slot(slot: &[u8]) -> Self;

    #[doc(hidden)]
    fn write_slot(self, slot: &mut [u8]);
}

macro_rules! impl_fixed_int {
    ($t:ty, $w:expr, $($variant:pat_param)|+) => {
        impl sealed::Sealed for $t {}
        impl FixedField for $t {
            const WIDTH: usize = $w;

            fn compatible(ty: FieldType) -> bool {
                matches!(ty, $($variant)|+)
            }

            fn read_slot(slot: &[u8]) -> Self {
                let mut bytes = [0u8; $w];
                bytes.copy_from_slice(&slot[..$w]);
                <$t>::from_le_bytes(bytes)
            }

            fn write_slot(self, slot: &mut [u8]) {
                slot[..$w].copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_fixed_int!(u8, 1, FieldType::Uint8 | FieldType::Char);
impl_fixed_int!(i8, 1, FieldType::Int8);
impl_fixed_int!(u16, 2, FieldType::Uint16);
impl_fixed_int!(i16, 2, FieldType::Int16);
impl_fixed_int!(u32, 4, FieldType::Uint32);
impl_fixed_int!(i32, 4, FieldType::Int32);
impl_fixed_int!(u64, 8, FieldType::Uint64);
impl_fixed_int!(i64, 8, FieldType::Int64);
impl_fixed_int!(f32, 4, FieldType::Float);
impl_fixed_int!(f64, 8, FieldType::Double);

impl sealed::Sealed for MsgTime {}
impl FixedField for MsgTime {
    const WIDTH: usize = 8;

    fn compatible(ty: FieldType) -> bool {
        matches!(ty, FieldType::Time)
    }

    fn read_slot(slot: &[u8]) -> Self {
        MsgTime::from_raw(u64::read_slot(slot))
    }

    fn write_slot(self, slot: &mut [u8]) {
        self.raw().write_slot(slot)
    }
}

impl sealed::Sealed for IpAddr {}
impl FixedField for IpAddr {
    const WIDTH: usize = 16;

    fn compatible(ty: FieldType) -> bool {
        matches!(ty, FieldType::Ip)
    }

    fn read_slot(slot: &[u8]) -> Self {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&slot[..16]);
        IpAddr::from_bytes(bytes)
    }

    fn write_slot(self, slot: &mut [u8]) {
        slot[..16].copy_from_slice(self.bytes());
    }
}

impl sealed::Sealed for MacAddr {}
impl FixedField for MacAddr {
    const WIDTH: usize = 6;

    fn compatible(ty: FieldType) -> bool {
        matches!(ty, FieldType::Mac)
    }

    fn read_slot(slot: &[u8]) -> Self {
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&slot[..6]);
        MacAddr::from_bytes(bytes)
    }

    fn write_slot(self, slot: &mut [u8]) {
        slot[..6].copy_from_slice(self.bytes());
    }
}

/// An instance of a template's layout carrying values.
///
/// The buffer holds the fixed part followed by the variable payloads, packed
/// in canonical order with no gaps. For each variable field the fixed part
/// stores a 2-byte offset (from the end of the fixed part) and a 2-byte
/// length. A freshly created record has every variable field empty.
///
/// Every accessor takes the template; a record used with a template other
/// than the one it was created with is a caller error and surfaces as
/// `InvalidFieldId` or garbage values, never as memory unsafety.
#[derive(Debug, Clone)]
pub struct Record {
    buf: Vec<u8>,
}

impl Record {
    /// Allocate a zero-initialized record for `tpl` with `extra` bytes of
    /// headroom for variable payloads. The allocation is capped at
    /// [`MAX_RECORD_SIZE`]; use `extra = 0` for templates without variable
    /// fields and [`MAX_RECORD_SIZE`] when the payload sizes are unknown.
    pub fn new(tpl: &Template, extra: u16) -> Record {
        let size = (tpl.static_size() as usize + extra as usize).min(MAX_RECORD_SIZE);
        Record { buf: vec![0; size] }
    }

    /// Rebuild a record from wire bytes. The buffer must hold the whole
    /// fixed part and every variable payload the headers describe.
    pub fn from_bytes(tpl: &Template, bytes: &[u8]) -> Result<Record> {
        let static_size = tpl.static_size() as usize;
        if bytes.len() < static_size || bytes.len() > MAX_RECORD_SIZE {
            return Err(Error::overflow(format!(
                "record of {} bytes does not fit template (fixed part {})",
                bytes.len(),
                static_size
            )));
        }
        let rec = Record {
            buf: bytes.to_vec(),
        };
        let tail = bytes.len() - static_size;
        if let Some(first) = tpl.first_var() {
            for ord in first..tpl.count() {
                let id = tpl.id_at(ord).unwrap_or_default();
                let off = rec.var_offset(tpl, id) as usize;
                let len = rec.var_len(tpl, id) as usize;
                if off + len > tail {
                    return Err(Error::overflow(format!(
                        "variable field {} points outside the record",
                        id
                    )));
                }
            }
        }
        Ok(rec)
    }

    /// Total wire size: fixed part plus current variable payloads.
    pub fn size(&self, tpl: &Template) -> usize {
        tpl.static_size() as usize + self.var_size(tpl)
    }

    /// Sum of the current variable payload lengths.
    pub fn var_size(&self, tpl: &Template) -> usize {
        match tpl.first_var() {
            None => 0,
            Some(first) => (first..tpl.count())
                .map(|ord| self.var_len(tpl, tpl.id_at(ord).unwrap_or_default()) as usize)
                .sum(),
        }
    }

    /// The record's wire bytes.
    pub fn as_bytes(&self, tpl: &Template) -> &[u8] {
        &self.buf[..self.size(tpl)]
    }

    /// Read a fixed field.
    pub fn get<T: FixedField>(&self, tpl: &Template, id: FieldId) -> Result<T> {
        let slot = self.fixed_slot(tpl, id)?;
        let ty = tpl.type_of(id).unwrap_or(FieldType::Bytes);
        if !T::compatible(ty) {
            return Err(Error::TypeMismatch(format!(
                "field {} has type {}",
                id, ty
            )));
        }
        Ok(T::read_slot(slot))
    }

    /// Write a fixed field.
    pub fn set<T: FixedField>(&mut self, tpl: &Template, id: FieldId, value: T) -> Result<()> {
        let ty = tpl.type_of(id).unwrap_or(FieldType::Bytes);
        if !T::compatible(ty) {
            return Err(Error::TypeMismatch(format!(
                "field {} has type {}",
                id, ty
            )));
        }
        let slot = self.fixed_slot_mut(tpl, id)?;
        value.write_slot(slot);
        Ok(())
    }

    /// Payload of a variable-length field.
    pub fn var(&self, tpl: &Template, id: FieldId) -> Result<&[u8]> {
        self.check_var(tpl, id)?;
        let start = tpl.static_size() as usize + self.var_offset(tpl, id) as usize;
        let len = self.var_len(tpl, id) as usize;
        if start + len > self.buf.len() {
            return Err(Error::overflow(format!(
                "variable field {} points outside the record",
                id
            )));
        }
        Ok(&self.buf[start..start + len])
    }

    /// Payload of a variable-length field as UTF-8 text (lossy).
    pub fn var_as_str(&self, tpl: &Template, id: FieldId) -> Result<String> {
        Ok(String::from_utf8_lossy(self.var(tpl, id)?).into_owned())
    }

    /// Replace the payload of a variable-length field.
    ///
    /// When the length changes, every following variable payload is shifted
    /// and its stored offset patched, so the packing invariants hold.
    pub fn set_var(&mut self, tpl: &Template, id: FieldId, value: &[u8]) -> Result<()> {
        self.resize_var(tpl, id, value.len())?;
        let start = tpl.static_size() as usize + self.var_offset(tpl, id) as usize;
        self.buf[start..start + value.len()].copy_from_slice(value);
        Ok(())
    }

    /// Resize a homogeneous array field to `len` bytes. New bytes are zero.
    pub fn array_resize(&mut self, tpl: &Template, id: FieldId, len: usize) -> Result<()> {
        self.resize_var(tpl, id, len)
    }

    /// Number of elements currently stored in an array field.
    pub fn array_len(&self, tpl: &Template, id: FieldId) -> Result<usize> {
        self.check_var(tpl, id)?;
        let ty = tpl.type_of(id).unwrap_or(FieldType::Bytes);
        Ok(self.var_len(tpl, id) as usize / ty.elem_size())
    }

    /// Grow an array field by one element and return the new slot.
    pub fn array_append_slot(&mut self, tpl: &Template, id: FieldId) -> Result<&mut [u8]> {
        self.check_var(tpl, id)?;
        let elem = tpl.type_of(id).unwrap_or(FieldType::Bytes).elem_size();
        let old = self.var_len(tpl, id) as usize;
        self.resize_var(tpl, id, old + elem)?;
        let start = tpl.static_size() as usize + self.var_offset(tpl, id) as usize + old;
        Ok(&mut self.buf[start..start + elem])
    }

    /// Read one element of an array field.
    pub fn array_get<T: FixedField>(
        &self,
        tpl: &Template,
        id: FieldId,
        index: usize,
    ) -> Result<T> {
        let ty = tpl.type_of(id).ok_or(Error::InvalidFieldId(id))?;
        if !ty.is_array() || !T::compatible(ty.elem_type()) {
            return Err(Error::TypeMismatch(format!(
                "field {} has type {}",
                id, ty
            )));
        }
        let payload = self.var(tpl, id)?;
        let elem = ty.elem_size();
        let start = index * elem;
        if start + elem > payload.len() {
            return Err(Error::InvalidFieldId(id));
        }
        Ok(T::read_slot(&payload[start..start + elem]))
    }

    /// Write one element of an array field, growing it when `index` is past
    /// the end.
    pub fn array_set<T: FixedField>(
        &mut self,
        tpl: &Template,
        id: FieldId,
        index: usize,
        value: T,
    ) -> Result<()> {
        let ty = tpl.type_of(id).ok_or(Error::InvalidFieldId(id))?;
        if !ty.is_array() || !T::compatible(ty.elem_type()) {
            return Err(Error::TypeMismatch(format!(
                "field {} has type {}",
                id, ty
            )));
        }
        let elem = ty.elem_size();
        if (index + 1) * elem > self.var_len(tpl, id) as usize {
            self.resize_var(tpl, id, (index + 1) * elem)?;
        }
        let start = tpl.static_size() as usize + self.var_offset(tpl, id) as usize + index * elem;
        value.write_slot(&mut self.buf[start..start + elem]);
        Ok(())
    }

    /// Append one element to an array field.
    pub fn array_push<T: FixedField>(
        &mut self,
        tpl: &Template,
        id: FieldId,
        value: T,
    ) -> Result<()> {
        let len = self.array_len(tpl, id)?;
        self.array_set(tpl, id, len, value)
    }

    /// Reset every variable field to the empty payload. A bulk shortcut
    /// before filling a new set of variable fields.
    pub fn clear_var(&mut self, tpl: &Template) {
        if let Some(first) = tpl.first_var() {
            for ord in first..tpl.count() {
                let id = tpl.id_at(ord).unwrap_or_default();
                self.set_var_offset(tpl, id, 0);
                self.set_var_len(tpl, id, 0);
            }
        }
    }

    /// Copy every field present in both templates from `src` into this
    /// record. Variable fields go through [`set_var`](Self::set_var) so the
    /// destination layout stays valid.
    pub fn copy_fields_from(
        &mut self,
        tpl: &Template,
        src: &Record,
        src_tpl: &Template,
    ) -> Result<()> {
        for id in src_tpl.ids() {
            if !tpl.is_present(id) {
                continue;
            }
            let ty = src_tpl.type_of(id).unwrap_or(FieldType::Bytes);
            if tpl.type_of(id) != Some(ty) {
                continue;
            }
            if ty.is_variable() {
                let payload = src.var(src_tpl, id)?.to_vec();
                self.set_var(tpl, id, &payload)?;
            } else {
                let value = src.fixed_slot(src_tpl, id)?.to_vec();
                let slot = self.fixed_slot_mut(tpl, id)?;
                slot.copy_from_slice(&value);
            }
        }
        Ok(())
    }

    fn fixed_slot(&self, tpl: &Template, id: FieldId) -> Result<&[u8]> {
        let (off, len) = self.fixed_span(tpl, id)?;
        Ok(&self.buf[off..off + len])
    }

    fn fixed_slot_mut(&mut self, tpl: &Template, id: FieldId) -> Result<&mut [u8]> {
        let (off, len) = self.fixed_span(tpl, id)?;
        Ok(&mut self.buf[off..off + len])
    }

    fn fixed_span(&self, tpl: &Template, id: FieldId) -> Result<(usize, usize)> {
        let ty = tpl.type_of(id).ok_or(Error::InvalidFieldId(id))?;
        if ty.is_variable() {
            return Err(Error::InvalidFieldId(id));
        }
        let off = tpl.offset_of(id).ok_or(Error::InvalidFieldId(id))? as usize;
        if off + ty.elem_size() > self.buf.len() {
            return Err(Error::overflow(format!(
                "field {} lies outside the record buffer",
                id
            )));
        }
        Ok((off, ty.elem_size()))
    }

    fn check_var(&self, tpl: &Template, id: FieldId) -> Result<()> {
        let ty = tpl.type_of(id).ok_or(Error::InvalidFieldId(id))?;
        if !ty.is_variable() {
            return Err(Error::InvalidFieldId(id));
        }
        Ok(())
    }

    /// Stored offset of a variable payload, relative to the end of the
    /// fixed part.
    pub(crate) fn var_offset(&self, tpl: &Template, id: FieldId) -> u16 {
        let off = tpl.offset_of(id).unwrap_or(0) as usize;
        u16::from_le_bytes([self.buf[off], self.buf[off + 1]])
    }

    /// Stored length of a variable payload.
    pub(crate) fn var_len(&self, tpl: &Template, id: FieldId) -> u16 {
        let off = tpl.offset_of(id).unwrap_or(0) as usize + 2;
        u16::from_le_bytes([self.buf[off], self.buf[off + 1]])
    }

    fn set_var_offset(&mut self, tpl: &Template, id: FieldId, value: u16) {
        let off = tpl.offset_of(id).unwrap_or(0) as usize;
        self.buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn set_var_len(&mut self, tpl: &Template, id: FieldId, value: u16) {
        let off = tpl.offset_of(id).unwrap_or(0) as usize + 2;
        self.buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Change the payload length of a variable field: shift the payloads of
    /// every following variable field by the delta and patch their offsets.
    fn resize_var(&mut self, tpl: &Template, id: FieldId, new_len: usize) -> Result<()> {
        self.check_var(tpl, id)?;
        let old_len = self.var_len(tpl, id) as usize;
        if old_len == new_len {
            return Ok(());
        }
        if new_len > u16::MAX as usize {
            return Err(Error::overflow(format!(
                "variable payload of {} bytes",
                new_len
            )));
        }
        let new_total = self.size(tpl) - old_len + new_len;
        if new_total > self.buf.len() {
            return Err(Error::overflow(format!(
                "record needs {} bytes but was allocated {}",
                new_total,
                self.buf.len()
            )));
        }

        let static_size = tpl.static_size() as usize;
        let ord = tpl.ordinal_of(id).unwrap_or_default();
        let field_off = self.var_offset(tpl, id) as usize;

        // patch offsets of the variable fields behind the resized one and
        // count the tail bytes to move
        let mut moved = field_off + new_len;
        let mut tail = 0usize;
        for next in ord + 1..tpl.count() {
            let next_id = tpl.id_at(next).unwrap_or_default();
            tail += self.var_len(tpl, next_id) as usize;
            self.set_var_offset(tpl, next_id, moved as u16);
            moved += self.var_len(tpl, next_id) as usize;
        }

        let src = static_size + field_off + old_len;
        let dst = static_size + field_off + new_len;
        self.buf.copy_within(src..src + tail, dst);
        if new_len > old_len {
            // zero the grown span so array growth is deterministic
            let start = static_size + field_off + old_len;
            self.buf[start..start + (new_len - old_len)].fill(0);
        }
        self.set_var_len(tpl, id, new_len as u16);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Record;
    use crate::rec::ipaddr::IpAddr;
    use crate::rec::registry::Registry;
    use crate::rec::template::Template;
    use crate::rec::time::MsgTime;
    use crate::tools::error::Error;

    fn setup() -> (Registry, Template) {
        let mut reg = Registry::new();
        reg.define_set(
            "uint32 COUNT,uint64 TOTAL,ipaddr ADDR,time SEEN,\
             string NAME,bytes BLOB,uint32* HITS",
        )
        .unwrap();
        let tpl = Template::new(&reg, "COUNT,TOTAL,ADDR,SEEN,NAME,BLOB,HITS").unwrap();
        (reg, tpl)
    }

    #[test]
    pub fn fixed_access() {
        crate::tests::init();
        let (reg, tpl) = setup();
        let mut rec = Record::new(&tpl, 64);

        let count = reg.lookup("COUNT").unwrap();
        let addr = reg.lookup("ADDR").unwrap();
        let seen = reg.lookup("SEEN").unwrap();

        rec.set(&tpl, count, 42u32).unwrap();
        rec.set(&tpl, addr, IpAddr::from_v4_int(0x0A000001)).unwrap();
        rec.set(&tpl, seen, MsgTime::from_sec_msec(100, 250)).unwrap();

        assert_eq!(rec.get::<u32>(&tpl, count).unwrap(), 42);
        assert_eq!(rec.get::<IpAddr>(&tpl, addr).unwrap().v4_int(), 0x0A000001);
        assert_eq!(rec.get::<MsgTime>(&tpl, seen).unwrap().msec(), 250);

        // wrong value type is rejected
        assert!(matches!(
            rec.get::<u64>(&tpl, count),
            Err(Error::TypeMismatch(_))
        ));
        // absent field is rejected
        assert!(rec.get::<u32>(&tpl, 999).is_err());
    }

    #[test]
    pub fn var_set_get_roundtrip() {
        crate::tests::init();
        let (reg, tpl) = setup();
        let mut rec = Record::new(&tpl, 256);
        let name = reg.lookup("NAME").unwrap();
        let blob = reg.lookup("BLOB").unwrap();

        rec.set_var(&tpl, name, b"alpha").unwrap();
        rec.set_var(&tpl, blob, &[1, 2, 3]).unwrap();
        assert_eq!(rec.var(&tpl, name).unwrap(), b"alpha");
        assert_eq!(rec.var(&tpl, blob).unwrap(), &[1, 2, 3]);
        assert_eq!(rec.var_size(&tpl), 8);
        assert_eq!(rec.size(&tpl), tpl.static_size() as usize + 8);

        // a fixed field is not a variable field
        let count = reg.lookup("COUNT").unwrap();
        assert!(rec.set_var(&tpl, count, b"x").is_err());
    }

    #[test]
    pub fn resize_shifts_following_payloads() {
        crate::tests::init();
        let mut reg = Registry::new();
        reg.define_set("string S1,string S2").unwrap();
        let tpl = Template::new(&reg, "S1,S2").unwrap();
        let s1 = reg.lookup("S1").unwrap();
        let s2 = reg.lookup("S2").unwrap();

        let mut rec = Record::new(&tpl, 64);
        rec.set_var(&tpl, s1, b"abc").unwrap();
        rec.set_var(&tpl, s2, b"12345").unwrap();

        rec.set_var(&tpl, s1, b"ABCDEF").unwrap();
        assert_eq!(rec.var(&tpl, s1).unwrap(), b"ABCDEF");
        assert_eq!(rec.var(&tpl, s2).unwrap(), b"12345");
        assert_eq!(rec.var_offset(&tpl, s2), 6);

        // shrink back
        rec.set_var(&tpl, s1, b"x").unwrap();
        assert_eq!(rec.var(&tpl, s1).unwrap(), b"x");
        assert_eq!(rec.var(&tpl, s2).unwrap(), b"12345");
        assert_eq!(rec.var_offset(&tpl, s2), 1);
    }

    #[test]
    pub fn resize_last_field_leaves_others_alone() {
        crate::tests::init();
        let mut reg = Registry::new();
        reg.define_set("string S1,string S2").unwrap();
        let tpl = Template::new(&reg, "S1,S2").unwrap();
        let s1 = reg.lookup("S1").unwrap();
        let s2 = reg.lookup("S2").unwrap();

        let mut rec = Record::new(&tpl, 64);
        rec.set_var(&tpl, s1, b"abc").unwrap();
        rec.set_var(&tpl, s2, b"12").unwrap();
        let s1_off = rec.var_offset(&tpl, s1);

        rec.set_var(&tpl, s2, b"123456789").unwrap();
        assert_eq!(rec.var_offset(&tpl, s1), s1_off);
        assert_eq!(rec.var(&tpl, s1).unwrap(), b"abc");
    }

    #[test]
    pub fn overflow_is_checked() {
        crate::tests::init();
        let mut reg = Registry::new();
        reg.define_set("string S1").unwrap();
        let tpl = Template::new(&reg, "S1").unwrap();
        let s1 = reg.lookup("S1").unwrap();

        let mut rec = Record::new(&tpl, 4);
        assert!(rec.set_var(&tpl, s1, b"1234").is_ok());
        assert!(matches!(
            rec.set_var(&tpl, s1, b"12345"),
            Err(Error::RecordOverflow(_))
        ));
        // the failed resize left the record untouched
        assert_eq!(rec.var(&tpl, s1).unwrap(), b"1234");
    }

    #[test]
    pub fn arrays() {
        crate::tests::init();
        let (reg, tpl) = setup();
        let hits = reg.lookup("HITS").unwrap();
        let mut rec = Record::new(&tpl, 256);

        rec.array_push(&tpl, hits, 7u32).unwrap();
        rec.array_push(&tpl, hits, 8u32).unwrap();
        assert_eq!(rec.array_len(&tpl, hits).unwrap(), 2);
        assert_eq!(rec.array_get::<u32>(&tpl, hits, 0).unwrap(), 7);
        assert_eq!(rec.array_get::<u32>(&tpl, hits, 1).unwrap(), 8);
        assert!(rec.array_get::<u32>(&tpl, hits, 2).is_err());

        // sparse set grows and zero-fills
        rec.array_set(&tpl, hits, 4, 99u32).unwrap();
        assert_eq!(rec.array_len(&tpl, hits).unwrap(), 5);
        assert_eq!(rec.array_get::<u32>(&tpl, hits, 3).unwrap(), 0);
        assert_eq!(rec.array_get::<u32>(&tpl, hits, 4).unwrap(), 99);

        rec.array_resize(&tpl, hits, 4).unwrap();
        assert_eq!(rec.array_len(&tpl, hits).unwrap(), 1);

        let slot = rec.array_append_slot(&tpl, hits).unwrap();
        slot.copy_from_slice(&55u32.to_le_bytes());
        assert_eq!(rec.array_get::<u32>(&tpl, hits, 1).unwrap(), 55);
    }

    #[test]
    pub fn clear_and_clone() {
        crate::tests::init();
        let (reg, tpl) = setup();
        let name = reg.lookup("NAME").unwrap();
        let blob = reg.lookup("BLOB").unwrap();
        let count = reg.lookup("COUNT").unwrap();

        let mut rec = Record::new(&tpl, 64);
        rec.set(&tpl, count, 3u32).unwrap();
        rec.set_var(&tpl, name, b"hello").unwrap();
        rec.set_var(&tpl, blob, &[9, 9]).unwrap();

        let copy = rec.clone();
        assert_eq!(copy.as_bytes(&tpl), rec.as_bytes(&tpl));

        rec.clear_var(&tpl);
        assert_eq!(rec.var_size(&tpl), 0);
        assert_eq!(rec.var(&tpl, name).unwrap(), b"");
        assert_eq!(rec.get::<u32>(&tpl, count).unwrap(), 3);
        assert_eq!(copy.var(&tpl, name).unwrap(), b"hello");
    }

    #[test]
    pub fn copy_fields_between_templates() {
        crate::tests::init();
        let mut reg = Registry::new();
        reg.define_set("uint32 A,uint32 B,string C").unwrap();
        let src_tpl = Template::new(&reg, "A,B,C").unwrap();
        let dst_tpl = Template::new(&reg, "A,C").unwrap();
        let a = reg.lookup("A").unwrap();
        let b = reg.lookup("B").unwrap();
        let c = reg.lookup("C").unwrap();

        let mut src = Record::new(&src_tpl, 32);
        src.set(&src_tpl, a, 1u32).unwrap();
        src.set(&src_tpl, b, 2u32).unwrap();
        src.set_var(&src_tpl, c, b"zzz").unwrap();

        let mut dst = Record::new(&dst_tpl, 32);
        dst.copy_fields_from(&dst_tpl, &src, &src_tpl).unwrap();
        assert_eq!(dst.get::<u32>(&dst_tpl, a).unwrap(), 1);
        assert_eq!(dst.var(&dst_tpl, c).unwrap(), b"zzz");
        assert!(!dst_tpl.is_present(b));
    }

    #[test]
    pub fn wire_roundtrip() {
        crate::tests::init();
        let (reg, tpl) = setup();
        let name = reg.lookup("NAME").unwrap();
        let count = reg.lookup("COUNT").unwrap();

        let mut rec = Record::new(&tpl, 16);
        rec.set(&tpl, count, 77u32).unwrap();
        rec.set_var(&tpl, name, b"wire").unwrap();

        let bytes = rec.as_bytes(&tpl).to_vec();
        let back = Record::from_bytes(&tpl, &bytes).unwrap();
        assert_eq!(back.get::<u32>(&tpl, count).unwrap(), 77);
        assert_eq!(back.var(&tpl, name).unwrap(), b"wire");

        // truncated fixed part is rejected
        assert!(Record::from_bytes(&tpl, &bytes[..4]).is_err());
        // header pointing outside the buffer is rejected
        let mut bad = bytes.clone();
        let off = tpl.offset_of(name).unwrap() as usize;
        bad[off + 2] = 0xFF;
        bad[off + 3] = 0xFF;
        assert!(Record::from_bytes(&tpl, &bad).is_err());
    }
}
