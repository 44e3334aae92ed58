use crate::rec::registry::{parse_spec, FieldId, Registry};
use crate::rec::types::FieldType;
use crate::tools::error::{Error, Result};

/// Sentinel in the offset table for fields absent from the template.
pub(crate) const INVALID_OFFSET: u16 = 0xFFFF;

/// Endpoint coupling of a template.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Direction {
    /// Not attached to any endpoint.
    #[default]
    None,
    /// Attached to an input endpoint.
    In,
    /// Attached to an output endpoint.
    Out,
    /// Attached to both an input and an output endpoint.
    Bi,
}

#[derive(Debug, Clone)]
struct TemplateField {
    id: FieldId,
    name: String,
    ty: FieldType,
}

/// An ordered set of fields defining a record layout.
///
/// Fields are kept in canonical order: decreasing raw element size, ties
/// broken by ascending name. Since variable-length types carry a negative
/// size sentinel, every fixed field precedes every variable field, which is
/// also the on-wire payload order. The template snapshots name, type and
/// size of its fields at creation, so records never consult the registry.
#[derive(Debug, Clone)]
pub struct Template {
    fields: Vec<TemplateField>,
    /// Field id -> byte offset in the fixed part, `INVALID_OFFSET` if absent.
    offsets: Vec<u16>,
    /// Field id -> ordinal in `fields`, `INVALID_OFFSET` if absent.
    ordinals: Vec<u16>,
    static_size: u16,
    first_var: Option<usize>,
    direction: Direction,
    out_endpoint: u32,
}

impl Template {
    /// Create a template from a list of field names separated by commas
    /// (whitespace tolerated). Duplicates are removed; every name must be
    /// defined in the registry.
    pub fn new(registry: &Registry, field_names: &str) -> Result<Template> {
        let mut seen: Vec<FieldId> = Vec::new();
        for name in field_names
            .split(',')
            .flat_map(|part| part.split_whitespace())
        {
            let id = registry
                .lookup(name)
                .ok_or_else(|| Error::UnknownField(name.to_owned()))?;
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        Template::from_ids(registry, seen)
    }

    /// Create a template from a `"<type> <name>,…"` spec string. The names
    /// are resolved against the registry; the types in the string are
    /// checked against the registered ones.
    pub fn from_spec(registry: &Registry, spec: &str) -> Result<Template> {
        let mut seen: Vec<FieldId> = Vec::new();
        for (ty, name) in parse_spec(spec)? {
            let id = registry
                .lookup(&name)
                .ok_or_else(|| Error::UnknownField(name.clone()))?;
            let registered = registry.field_type(id).unwrap_or(ty);
            if registered != ty {
                return Err(Error::TypeMismatch(format!(
                    "field {} is registered as {}, spec says {}",
                    name, registered, ty
                )));
            }
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        Template::from_ids(registry, seen)
    }

    /// Create a template from a spec string, defining unknown fields in the
    /// registry on the fly.
    pub fn define_and_create(registry: &mut Registry, spec: &str) -> Result<Template> {
        registry.define_set(spec)?;
        Template::from_spec(registry, spec)
    }

    /// Return a new template whose field set is the union of this one and
    /// the parsed spec. The old template is consumed.
    pub fn expand(self, registry: &Registry, spec: &str) -> Result<Template> {
        let mut ids: Vec<FieldId> = Vec::new();
        for (_, name) in parse_spec(spec)? {
            let id = registry
                .lookup(&name)
                .ok_or_else(|| Error::UnknownField(name.clone()))?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        for f in &self.fields {
            if !ids.contains(&f.id) {
                ids.push(f.id);
            }
        }
        let mut tpl = Template::from_ids(registry, ids)?;
        tpl.direction = self.direction;
        tpl.out_endpoint = self.out_endpoint;
        Ok(tpl)
    }

    /// [`define_set`](Registry::define_set) followed by
    /// [`expand`](Self::expand).
    pub fn define_and_expand(self, registry: &mut Registry, spec: &str) -> Result<Template> {
        registry.define_set(spec)?;
        self.expand(registry, spec)
    }

    fn from_ids(registry: &Registry, ids: Vec<FieldId>) -> Result<Template> {
        let mut fields: Vec<TemplateField> = ids
            .into_iter()
            .map(|id| {
                let name = registry
                    .name(id)
                    .ok_or(Error::InvalidFieldId(id))?
                    .to_owned();
                let ty = registry.field_type(id).ok_or(Error::InvalidFieldId(id))?;
                Ok(TemplateField { id, name, ty })
            })
            .collect::<Result<_>>()?;

        // canonical order: raw size descending, name ascending
        fields.sort_by(|a, b| {
            b.ty.size()
                .cmp(&a.ty.size())
                .then_with(|| a.name.cmp(&b.name))
        });

        let table_len = fields.iter().map(|f| f.id as usize + 1).max().unwrap_or(0);
        let mut offsets = vec![INVALID_OFFSET; table_len];
        let mut ordinals = vec![INVALID_OFFSET; table_len];
        let mut offset = 0u32;
        let mut first_var = None;
        for (ord, f) in fields.iter().enumerate() {
            offsets[f.id as usize] = offset as u16;
            ordinals[f.id as usize] = ord as u16;
            if f.ty.is_variable() {
                // 2-byte offset plus 2-byte length header in the fixed part
                offset += 4;
                if first_var.is_none() {
                    first_var = Some(ord);
                }
            } else {
                offset += f.ty.size() as u32;
            }
            if offset > u16::MAX as u32 {
                return Err(Error::overflow("template fixed part exceeds 65535 bytes"));
            }
        }
        Ok(Template {
            fields,
            offsets,
            ordinals,
            static_size: offset as u16,
            first_var,
            direction: Direction::None,
            out_endpoint: 0,
        })
    }

    /// Number of fields in the template.
    pub fn count(&self) -> usize {
        self.fields.len()
    }

    /// Size of the fixed part of a record with this template.
    pub fn static_size(&self) -> u16 {
        self.static_size
    }

    /// Ordinal of the first variable-length field, if any.
    pub fn first_var(&self) -> Option<usize> {
        self.first_var
    }

    /// True when the template contains the given field.
    pub fn is_present(&self, id: FieldId) -> bool {
        self.offset_of(id).is_some()
    }

    /// Byte offset of a field in the fixed part (for variable fields, of its
    /// 4-byte offset/length header).
    pub fn offset_of(&self, id: FieldId) -> Option<u16> {
        match self.offsets.get(id as usize) {
            Some(&off) if off != INVALID_OFFSET => Some(off),
            _ => None,
        }
    }

    /// Ordinal of a field in canonical order.
    pub fn ordinal_of(&self, id: FieldId) -> Option<usize> {
        match self.ordinals.get(id as usize) {
            Some(&ord) if ord != INVALID_OFFSET => Some(ord as usize),
            _ => None,
        }
    }

    /// Field id at the given canonical ordinal.
    pub fn id_at(&self, ordinal: usize) -> Option<FieldId> {
        self.fields.get(ordinal).map(|f| f.id)
    }

    /// Type of a field in the template.
    pub fn type_of(&self, id: FieldId) -> Option<FieldType> {
        self.ordinal_of(id).map(|ord| self.fields[ord].ty)
    }

    /// Name of a field in the template.
    pub fn name_of(&self, id: FieldId) -> Option<&str> {
        self.ordinal_of(id).map(|ord| self.fields[ord].name.as_str())
    }

    /// Iterate over field ids in canonical order.
    pub fn ids(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.fields.iter().map(|f| f.id)
    }

    /// Iterate over field ids in record-storage order. This coincides with
    /// the canonical order.
    pub fn ids_record_order(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.ids()
    }

    /// Produce the `"<type> <name><sep>…"` spec string in canonical order.
    pub fn to_spec_string(&self, sep: char) -> String {
        let mut out = String::new();
        for (i, f) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(sep);
            }
            out.push_str(f.ty.as_str());
            out.push(' ');
            out.push_str(&f.name);
        }
        out
    }

    /// Endpoint coupling of the template.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Index of the output endpoint the template is installed on.
    pub fn out_endpoint(&self) -> u32 {
        self.out_endpoint
    }

    /// Mark the template as installed on an input endpoint.
    pub fn mark_input(&mut self) {
        self.direction = match self.direction {
            Direction::Out | Direction::Bi => Direction::Bi,
            _ => Direction::In,
        };
    }

    /// Mark the template as installed on the given output endpoint.
    pub fn mark_output(&mut self, endpoint: u32) {
        self.direction = match self.direction {
            Direction::In | Direction::Bi => Direction::Bi,
            _ => Direction::Out,
        };
        self.out_endpoint = endpoint;
    }
}

impl PartialEq for Template {
    /// Templates are equal iff they hold the same field ids in the same
    /// canonical order.
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self.ids().zip(other.ids()).all(|(a, b)| a == b)
    }
}

impl Eq for Template {}
