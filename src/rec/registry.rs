use crate::rec::types::FieldType;
use crate::tools::error::{Error, Result};

/// Numeric identifier of a registered field.
pub type FieldId = u16;

/// Sentinel id meaning "no field".
pub const INVALID_FIELD: FieldId = 0xFFFF;

/// Highest id the registry will ever issue.
const MAX_FIELD_ID: usize = 0x7FFF;

/// Field set the default registry is seeded with: the basic flow-telemetry
/// fields every pipeline exchanges.
const DEFAULT_FIELDS: &str = "time TIME_FIRST,time TIME_LAST,\
                              ipaddr SRC_IP,ipaddr DST_IP,\
                              uint16 SRC_PORT,uint16 DST_PORT,\
                              uint8 PROTOCOL,uint32 PACKETS,uint64 BYTES";

#[derive(Debug, Clone)]
struct FieldDef {
    name: String,
    ty: FieldType,
}

/// Registry of field definitions: the mapping from field name to numeric
/// identifier, element type and element size.
///
/// The registry is an explicit value; templates resolve names against it at
/// creation time and are self-contained afterwards. Fields present at
/// construction ("seeded" fields) may not be undefined; ids of undefined
/// runtime fields go to a free list and are reissued to later definitions.
#[derive(Debug)]
pub struct Registry {
    fields: Vec<Option<FieldDef>>,
    free: Vec<FieldId>,
    seeded: usize,
}

impl Registry {
    /// An empty registry with no seeded fields.
    pub fn new() -> Self {
        Registry {
            fields: Vec::new(),
            free: Vec::new(),
            seeded: 0,
        }
    }

    /// A registry seeded with the crate's built-in telemetry field set.
    pub fn with_defaults() -> Self {
        Registry::from_spec(DEFAULT_FIELDS).unwrap_or_else(|_| Registry::new())
    }

    /// A registry seeded from a `"<type> <name>,…"` spec string. The seeded
    /// fields may not be undefined later.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let mut reg = Registry::new();
        reg.define_set(spec)?;
        reg.seeded = reg.fields.len();
        Ok(reg)
    }

    /// Number of ids ever issued (including undefined ones).
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no field was ever defined.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Define a field, or look it up when it already exists.
    ///
    /// Re-defining an existing name with the same type returns the existing
    /// id; with a different type it fails. Freed ids are reused before new
    /// ones are issued.
    pub fn define(&mut self, name: &str, ty: FieldType) -> Result<FieldId> {
        check_name(name)?;
        for (id, def) in self.fields.iter().enumerate() {
            if let Some(def) = def {
                if def.name == name {
                    if def.ty == ty {
                        return Ok(id as FieldId);
                    }
                    return Err(Error::TypeMismatch(format!(
                        "field {} is already defined as {}",
                        name, def.ty
                    )));
                }
            }
        }
        let def = FieldDef {
            name: name.to_owned(),
            ty,
        };
        if let Some(id) = self.free.pop() {
            self.fields[id as usize] = Some(def);
            return Ok(id);
        }
        if self.fields.len() > MAX_FIELD_ID {
            return Err(Error::resource("no free field ids left"));
        }
        self.fields.push(Some(def));
        Ok((self.fields.len() - 1) as FieldId)
    }

    /// Define every field of a `"<type> <name>,…"` spec string.
    pub fn define_set(&mut self, spec: &str) -> Result<()> {
        for (ty, name) in parse_spec(spec)? {
            self.define(&name, ty)?;
        }
        Ok(())
    }

    /// Undefine a runtime-defined field by name. Its id goes to the free
    /// list; templates that referenced it must be recreated before use.
    pub fn undefine(&mut self, name: &str) -> Result<()> {
        let id = self
            .lookup(name)
            .ok_or_else(|| Error::UnknownField(name.to_owned()))?;
        self.undefine_id(id)
    }

    /// Undefine a runtime-defined field by id. Fields seeded at
    /// construction cannot be undefined.
    pub fn undefine_id(&mut self, id: FieldId) -> Result<()> {
        if (id as usize) < self.seeded {
            return Err(Error::InvalidFieldId(id));
        }
        match self.fields.get_mut(id as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.free.push(id);
                Ok(())
            }
            _ => Err(Error::InvalidFieldId(id)),
        }
    }

    /// Resolve a field name to its id.
    pub fn lookup(&self, name: &str) -> Option<FieldId> {
        self.fields.iter().position(|def| {
            def.as_ref().map(|d| d.name == name).unwrap_or(false)
        }).map(|id| id as FieldId)
    }

    /// Name of a field by id.
    pub fn name(&self, id: FieldId) -> Option<&str> {
        self.fields
            .get(id as usize)
            .and_then(|d| d.as_ref())
            .map(|d| d.name.as_str())
    }

    /// Type of a field by id.
    pub fn field_type(&self, id: FieldId) -> Option<FieldType> {
        self.fields
            .get(id as usize)
            .and_then(|d| d.as_ref())
            .map(|d| d.ty)
    }

    /// Size of a field by id (negative sentinel for variable-length types).
    pub fn size(&self, id: FieldId) -> Option<i16> {
        self.field_type(id).map(|t| t.size())
    }

    /// Drop every runtime-defined field and reset to the seeded state.
    pub fn finalize(&mut self) {
        self.fields.truncate(self.seeded);
        self.free.clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::with_defaults()
    }
}

/// Validate a field name against `[A-Za-z][A-Za-z0-9_]*`.
fn check_name(name: &str) -> Result<()> {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() => {}
        _ => return Err(Error::InvalidName(name.to_owned())),
    }
    if bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_owned()))
    }
}

/// Parse a `"<type> <name>,…"` spec string into (type, name) pairs.
/// Whitespace around commas and between tokens is tolerated.
pub(crate) fn parse_spec(spec: &str) -> Result<Vec<(FieldType, String)>> {
    let mut out = Vec::new();
    for item in spec.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let mut tokens = item.split_whitespace();
        let ty_str = tokens.next().unwrap_or_default();
        let name = tokens
            .next()
            .ok_or_else(|| Error::spec(format!("missing field name in {:?}", item)))?;
        if tokens.next().is_some() {
            return Err(Error::spec(format!("trailing tokens in {:?}", item)));
        }
        let ty = FieldType::try_from(ty_str)
            .map_err(|_| Error::spec(format!("unknown field type {:?}", ty_str)))?;
        out.push((ty, name.to_owned()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{parse_spec, Registry};
    use crate::rec::types::FieldType;
    use crate::tools::error::Error;

    #[test]
    pub fn define_and_lookup() {
        crate::tests::init();
        let mut reg = Registry::new();
        let a = reg.define("FOO", FieldType::Uint32).unwrap();
        let b = reg.define("BAR", FieldType::String).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.lookup("FOO"), Some(a));
        assert_eq!(reg.name(b), Some("BAR"));
        assert_eq!(reg.field_type(a), Some(FieldType::Uint32));
        assert_eq!(reg.size(b), Some(-1));

        // same name and type is a no-op returning the existing id
        assert_eq!(reg.define("FOO", FieldType::Uint32).unwrap(), a);
        // same name with a different type fails
        assert!(matches!(
            reg.define("FOO", FieldType::Uint64),
            Err(Error::TypeMismatch(_))
        ));
    }

    #[test]
    pub fn name_validation() {
        crate::tests::init();
        let mut reg = Registry::new();
        assert!(matches!(reg.define("", FieldType::Char), Err(Error::InvalidName(_))));
        assert!(matches!(reg.define("1ABC", FieldType::Char), Err(Error::InvalidName(_))));
        assert!(matches!(reg.define("A-B", FieldType::Char), Err(Error::InvalidName(_))));
        assert!(reg.define("A1_b", FieldType::Char).is_ok());
    }

    #[test]
    pub fn free_list_reuse() {
        crate::tests::init();
        let mut reg = Registry::new();
        let a = reg.define("A", FieldType::Uint8).unwrap();
        let b = reg.define("B", FieldType::Uint8).unwrap();
        reg.undefine("A").unwrap();
        assert_eq!(reg.lookup("A"), None);
        assert_eq!(reg.name(a), None);
        // the freed id is reissued to the next definition
        let c = reg.define("C", FieldType::Time).unwrap();
        assert_eq!(c, a);
        assert_eq!(reg.lookup("B"), Some(b));
        // double undefine fails
        assert!(reg.undefine("A").is_err());
    }

    #[test]
    pub fn seeded_fields_are_protected() {
        crate::tests::init();
        let mut reg = Registry::from_spec("uint32 KEEP,string ALSO_KEEP").unwrap();
        assert!(reg.undefine("KEEP").is_err());
        let tmp = reg.define("TMP", FieldType::Uint8).unwrap();
        reg.undefine_id(tmp).unwrap();

        let again = reg.define("TMP", FieldType::Uint8).unwrap();
        reg.finalize();
        assert_eq!(reg.lookup("KEEP"), Some(0));
        assert_eq!(reg.name(again), None);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    pub fn defaults_are_seeded() {
        crate::tests::init();
        let reg = Registry::with_defaults();
        assert!(reg.lookup("SRC_IP").is_some());
        assert_eq!(
            reg.field_type(reg.lookup("BYTES").unwrap()),
            Some(FieldType::Uint64)
        );
    }

    #[test]
    pub fn spec_parsing() {
        crate::tests::init();
        let pairs = parse_spec(" uint32 FOO , string BAR,time* TS ").unwrap();
        assert_eq!(
            pairs,
            vec![
                (FieldType::Uint32, "FOO".to_owned()),
                (FieldType::String, "BAR".to_owned()),
                (FieldType::TimeArr, "TS".to_owned()),
            ]
        );
        assert!(parse_spec("uint32").is_err());
        assert!(parse_spec("nosuchtype FOO").is_err());
        assert!(parse_spec("uint32 FOO BAR").is_err());
    }
}
