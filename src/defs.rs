//! Schema defs: messages, fields and enums, mutable until frozen.
//!
//! The whole descriptor graph lives in one [`DefPool`] arena; references
//! between defs are index newtypes, so recursive message types need no
//! back-pointers. Freezing validates the graph, resolves symbolic links and
//! assigns handler selectors, after which the pool is immutable and can be
//! shared freely across threads.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::debug;

use crate::error::DefError;
use crate::handlers;
use crate::wire::{WireType, MAX_FIELDNUMBER};

/// Field types as numbered in descriptor.proto. Each value determines the
/// field's native wire type and its integer encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DescriptorType {
    Double = 1,
    Float = 2,
    Int64 = 3,
    Uint64 = 4,
    Int32 = 5,
    Fixed64 = 6,
    Fixed32 = 7,
    Bool = 8,
    String = 9,
    Group = 10,
    Message = 11,
    Bytes = 12,
    Uint32 = 13,
    Enum = 14,
    Sfixed32 = 15,
    Sfixed64 = 16,
    Sint32 = 17,
    Sint64 = 18,
}

impl DescriptorType {
    pub const ALL: [DescriptorType; 18] = [
        DescriptorType::Double,
        DescriptorType::Float,
        DescriptorType::Int64,
        DescriptorType::Uint64,
        DescriptorType::Int32,
        DescriptorType::Fixed64,
        DescriptorType::Fixed32,
        DescriptorType::Bool,
        DescriptorType::String,
        DescriptorType::Group,
        DescriptorType::Message,
        DescriptorType::Bytes,
        DescriptorType::Uint32,
        DescriptorType::Enum,
        DescriptorType::Sfixed32,
        DescriptorType::Sfixed64,
        DescriptorType::Sint32,
        DescriptorType::Sint64,
    ];

    pub fn native_wire_type(self) -> WireType {
        use DescriptorType::*;
        match self {
            Double | Fixed64 | Sfixed64 => WireType::Fixed64,
            Float | Fixed32 | Sfixed32 => WireType::Fixed32,
            Int64 | Uint64 | Int32 | Bool | Uint32 | Enum | Sint32 | Sint64 => WireType::Varint,
            String | Bytes | Message => WireType::Delimited,
            Group => WireType::StartGroup,
        }
    }

    /// Whether repeated fields of this type may be packed on the wire.
    pub fn is_packable(self) -> bool {
        matches!(
            self.native_wire_type(),
            WireType::Varint | WireType::Fixed32 | WireType::Fixed64
        )
    }

    pub fn is_string(self) -> bool {
        matches!(self, DescriptorType::String | DescriptorType::Bytes)
    }

    pub fn is_submessage(self) -> bool {
        matches!(self, DescriptorType::Message | DescriptorType::Group)
    }

    pub fn field_type(self) -> FieldType {
        use DescriptorType::*;
        match self {
            Double => FieldType::Double,
            Float => FieldType::Float,
            Int64 | Sfixed64 | Sint64 => FieldType::Int64,
            Uint64 | Fixed64 => FieldType::Uint64,
            Int32 | Sfixed32 | Sint32 => FieldType::Int32,
            Uint32 | Fixed32 => FieldType::Uint32,
            Bool => FieldType::Bool,
            String => FieldType::String,
            Bytes => FieldType::Bytes,
            Message | Group => FieldType::Message,
            Enum => FieldType::Enum,
        }
    }

    pub fn integer_format(self) -> IntegerFormat {
        use DescriptorType::*;
        match self {
            Fixed32 | Fixed64 | Sfixed32 | Sfixed64 => IntegerFormat::Fixed,
            Sint32 | Sint64 => IntegerFormat::Zigzag,
            _ => IntegerFormat::Variable,
        }
    }

    pub fn is_tag_delimited(self) -> bool {
        matches!(self, DescriptorType::Group)
    }
}

/// The semantic type of a field, collapsing the encoding distinctions that
/// [`DescriptorType`] keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Double,
    Float,
    Int64,
    Uint64,
    Int32,
    Uint32,
    Bool,
    String,
    Bytes,
    Message,
    Enum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegerFormat {
    Variable,
    Fixed,
    Zigzag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Optional,
    Required,
    Repeated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgRef(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumRef(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldRef(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubDef {
    Message(MsgRef),
    Enum(EnumRef),
}

#[derive(Debug, Clone)]
enum SubLink {
    None,
    Symbolic(String),
    Resolved(SubDef),
}

/// A typed default value attached to a field before freezing.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
enum DefaultValue {
    Unset,
    Value(Value),
    /// Enum default given by value name; resolved at freeze time.
    SymbolicEnum(String),
}

#[derive(Debug)]
pub struct FieldDef {
    name: String,
    number: u32,
    label: Label,
    dtype: DescriptorType,
    parent: MsgRef,
    sub: SubLink,
    default: DefaultValue,
    selector_base: u32,
}

impl FieldDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn label(&self) -> Label {
        self.label
    }

    pub fn descriptor_type(&self) -> DescriptorType {
        self.dtype
    }

    pub fn field_type(&self) -> FieldType {
        self.dtype.field_type()
    }

    pub fn integer_format(&self) -> IntegerFormat {
        self.dtype.integer_format()
    }

    pub fn is_tag_delimited(&self) -> bool {
        self.dtype.is_tag_delimited()
    }

    pub fn message_def(&self) -> MsgRef {
        self.parent
    }

    pub fn is_sequence(&self) -> bool {
        self.label == Label::Repeated
    }

    pub fn is_string(&self) -> bool {
        self.dtype.is_string()
    }

    pub fn is_submessage(&self) -> bool {
        self.dtype.is_submessage()
    }

    pub fn is_primitive(&self) -> bool {
        !self.is_string() && !self.is_submessage()
    }

    /// The linked sub-def, available once frozen (or once set concretely).
    pub fn subdef(&self) -> Option<SubDef> {
        match self.sub {
            SubLink::Resolved(sub) => Some(sub),
            _ => None,
        }
    }

    pub fn default_value(&self) -> Option<&Value> {
        match &self.default {
            DefaultValue::Value(v) => Some(v),
            _ => None,
        }
    }

    /// First selector reserved for this field; assigned during freezing.
    pub fn selector_base(&self) -> u32 {
        self.selector_base
    }
}

#[derive(Debug)]
pub struct MessageDef {
    name: String,
    fields_by_number: BTreeMap<u32, FieldRef>,
    fields_by_name: HashMap<String, FieldRef>,
    selector_count: u32,
}

impl MessageDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_count(&self) -> usize {
        self.fields_by_number.len()
    }

    /// Total handler slots this message's tables need; valid once frozen.
    pub fn selector_count(&self) -> u32 {
        self.selector_count
    }

    pub fn field_by_number(&self, number: u32) -> Option<FieldRef> {
        self.fields_by_number.get(&number).copied()
    }

    pub fn field_by_name(&self, name: &str) -> Option<FieldRef> {
        self.fields_by_name.get(name).copied()
    }

    /// Fields in ascending field-number order.
    pub fn fields(&self) -> impl Iterator<Item = FieldRef> + '_ {
        self.fields_by_number.values().copied()
    }
}

#[derive(Debug)]
pub struct EnumDef {
    name: String,
    ntoi: HashMap<String, i32>,
    iton: HashMap<i32, String>,
    default: i32,
}

impl EnumDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_value(&self) -> i32 {
        self.default
    }

    pub fn value_count(&self) -> usize {
        self.ntoi.len()
    }

    pub fn number_by_name(&self, name: &str) -> Option<i32> {
        self.ntoi.get(name).copied()
    }

    /// First name added for `number`, if any.
    pub fn name_by_number(&self, number: i32) -> Option<&str> {
        self.iton.get(&number).map(String::as_str)
    }
}

#[derive(Debug)]
enum NamedDef {
    Message(MsgRef),
    Enum(EnumRef),
}

/// Arena of defs. Built mutable, then frozen into an `Arc` for sharing.
#[derive(Debug)]
pub struct DefPool {
    msgs: Vec<MessageDef>,
    fields: Vec<FieldDef>,
    enums: Vec<EnumDef>,
    by_name: HashMap<String, NamedDef>,
    frozen: bool,
}

impl Default for DefPool {
    fn default() -> Self {
        Self::new()
    }
}

impl DefPool {
    pub fn new() -> Self {
        DefPool {
            msgs: Vec::new(),
            fields: Vec::new(),
            enums: Vec::new(),
            by_name: HashMap::new(),
            frozen: false,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn check_mutable(&self) -> Result<(), DefError> {
        if self.frozen {
            return Err(DefError::Frozen);
        }
        Ok(())
    }

    pub fn message(&self, m: MsgRef) -> &MessageDef {
        &self.msgs[m.0 as usize]
    }

    pub fn field(&self, f: FieldRef) -> &FieldDef {
        &self.fields[f.0 as usize]
    }

    pub fn enum_def(&self, e: EnumRef) -> &EnumDef {
        &self.enums[e.0 as usize]
    }

    pub fn message_by_name(&self, name: &str) -> Option<MsgRef> {
        match self.by_name.get(name) {
            Some(NamedDef::Message(m)) => Some(*m),
            _ => None,
        }
    }

    pub fn enum_by_name(&self, name: &str) -> Option<EnumRef> {
        match self.by_name.get(name) {
            Some(NamedDef::Enum(e)) => Some(*e),
            _ => None,
        }
    }

    pub fn add_message(&mut self, name: &str) -> Result<MsgRef, DefError> {
        self.check_mutable()?;
        if self.by_name.contains_key(name) {
            return Err(DefError::NameCollision {
                scope: "pool".to_string(),
                name: name.to_string(),
            });
        }
        let m = MsgRef(self.msgs.len() as u32);
        self.msgs.push(MessageDef {
            name: name.to_string(),
            fields_by_number: BTreeMap::new(),
            fields_by_name: HashMap::new(),
            selector_count: 0,
        });
        self.by_name.insert(name.to_string(), NamedDef::Message(m));
        Ok(m)
    }

    pub fn add_enum(&mut self, name: &str, default: i32) -> Result<EnumRef, DefError> {
        self.check_mutable()?;
        if self.by_name.contains_key(name) {
            return Err(DefError::NameCollision {
                scope: "pool".to_string(),
                name: name.to_string(),
            });
        }
        let e = EnumRef(self.enums.len() as u32);
        self.enums.push(EnumDef {
            name: name.to_string(),
            ntoi: HashMap::new(),
            iton: HashMap::new(),
            default,
        });
        self.by_name.insert(name.to_string(), NamedDef::Enum(e));
        Ok(e)
    }

    pub fn add_enum_value(&mut self, e: EnumRef, name: &str, number: i32) -> Result<(), DefError> {
        self.check_mutable()?;
        let def = &mut self.enums[e.0 as usize];
        if def.ntoi.contains_key(name) {
            return Err(DefError::NameCollision {
                scope: def.name.clone(),
                name: name.to_string(),
            });
        }
        def.ntoi.insert(name.to_string(), number);
        // Multiple names may share a number; the first one wins for iton.
        def.iton.entry(number).or_insert_with(|| name.to_string());
        Ok(())
    }

    pub fn add_field(
        &mut self,
        msg: MsgRef,
        name: &str,
        number: u32,
        label: Label,
        dtype: DescriptorType,
    ) -> Result<FieldRef, DefError> {
        self.check_mutable()?;
        if number == 0 || number > MAX_FIELDNUMBER {
            return Err(DefError::FieldNumberOutOfRange(number));
        }
        let def = &self.msgs[msg.0 as usize];
        if def.fields_by_number.contains_key(&number) {
            return Err(DefError::DuplicateFieldNumber {
                message: def.name.clone(),
                number,
            });
        }
        if def.fields_by_name.contains_key(name) {
            return Err(DefError::NameCollision {
                scope: def.name.clone(),
                name: name.to_string(),
            });
        }
        let f = FieldRef(self.fields.len() as u32);
        self.fields.push(FieldDef {
            name: name.to_string(),
            number,
            label,
            dtype,
            parent: msg,
            sub: SubLink::None,
            default: DefaultValue::Unset,
            selector_base: 0,
        });
        let def = &mut self.msgs[msg.0 as usize];
        def.fields_by_number.insert(number, f);
        def.fields_by_name.insert(name.to_string(), f);
        Ok(f)
    }

    pub fn set_subdef(&mut self, f: FieldRef, sub: SubDef) -> Result<(), DefError> {
        self.check_mutable()?;
        let field = &self.fields[f.0 as usize];
        let ok = match (field.dtype, sub) {
            (DescriptorType::Message | DescriptorType::Group, SubDef::Message(_)) => true,
            (DescriptorType::Enum, SubDef::Enum(_)) => true,
            _ => false,
        };
        if !ok {
            return Err(DefError::SubDefKind {
                field: field.name.clone(),
            });
        }
        self.fields[f.0 as usize].sub = SubLink::Resolved(sub);
        Ok(())
    }

    /// Links the sub-def by pool name; resolved when the pool is frozen.
    pub fn set_subdef_name(&mut self, f: FieldRef, name: &str) -> Result<(), DefError> {
        self.check_mutable()?;
        let field = &self.fields[f.0 as usize];
        if !field.dtype.is_submessage() && field.dtype != DescriptorType::Enum {
            return Err(DefError::SubDefKind {
                field: field.name.clone(),
            });
        }
        self.fields[f.0 as usize].sub = SubLink::Symbolic(name.to_string());
        Ok(())
    }

    pub fn set_default(&mut self, f: FieldRef, value: Value) -> Result<(), DefError> {
        self.check_mutable()?;
        self.fields[f.0 as usize].default = DefaultValue::Value(value);
        Ok(())
    }

    /// Sets an enum default by value name; resolved when the pool is frozen.
    pub fn set_default_enum_name(&mut self, f: FieldRef, name: &str) -> Result<(), DefError> {
        self.check_mutable()?;
        let field = &self.fields[f.0 as usize];
        if field.dtype != DescriptorType::Enum {
            return Err(DefError::BadDefault {
                field: field.name.clone(),
            });
        }
        self.fields[f.0 as usize].default = DefaultValue::SymbolicEnum(name.to_string());
        Ok(())
    }

    /// Validates the graph, resolves symbolic references, assigns selectors
    /// and locks the pool.
    pub fn freeze(mut self) -> Result<Arc<DefPool>, DefError> {
        self.check_mutable()?;
        self.resolve_sub_links()?;
        self.resolve_defaults()?;
        self.check_required_cycles()?;
        self.assign_selectors();
        self.frozen = true;
        debug!(
            "froze def pool: {} messages, {} fields, {} enums",
            self.msgs.len(),
            self.fields.len(),
            self.enums.len()
        );
        Ok(Arc::new(self))
    }

    fn resolve_sub_links(&mut self) -> Result<(), DefError> {
        for i in 0..self.fields.len() {
            let (dtype, name, link) = {
                let f = &self.fields[i];
                (f.dtype, f.name.clone(), f.sub.clone())
            };
            let needs_sub = dtype.is_submessage() || dtype == DescriptorType::Enum;
            match link {
                SubLink::Resolved(_) => {}
                SubLink::Symbolic(symbol) => {
                    let sub = match (self.by_name.get(&symbol), dtype) {
                        (Some(NamedDef::Message(m)), d) if d.is_submessage() => SubDef::Message(*m),
                        (Some(NamedDef::Enum(e)), DescriptorType::Enum) => SubDef::Enum(*e),
                        (Some(_), _) => return Err(DefError::SubDefKind { field: name }),
                        (None, _) => return Err(DefError::UnresolvedSymbol(symbol)),
                    };
                    self.fields[i].sub = SubLink::Resolved(sub);
                }
                SubLink::None if needs_sub => {
                    return Err(DefError::MissingSubDef { field: name });
                }
                SubLink::None => {}
            }
        }
        Ok(())
    }

    fn resolve_defaults(&mut self) -> Result<(), DefError> {
        for i in 0..self.fields.len() {
            let (dtype, label, name, default, sub) = {
                let f = &self.fields[i];
                (f.dtype, f.label, f.name.clone(), f.default.clone(), f.sub.clone())
            };
            match default {
                DefaultValue::Unset => {}
                DefaultValue::SymbolicEnum(symbol) => {
                    let SubLink::Resolved(SubDef::Enum(e)) = sub else {
                        return Err(DefError::BadDefault { field: name });
                    };
                    let Some(number) = self.enums[e.0 as usize].number_by_name(&symbol) else {
                        return Err(DefError::UnresolvedSymbol(symbol));
                    };
                    self.fields[i].default = DefaultValue::Value(Value::I32(number));
                }
                DefaultValue::Value(v) => {
                    if label == Label::Repeated || !default_matches(dtype, &v) {
                        return Err(DefError::BadDefault { field: name });
                    }
                }
            }
        }
        Ok(())
    }

    fn check_required_cycles(&self) -> Result<(), DefError> {
        // Three-color DFS over the required-submessage edges.
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;
        let mut color = vec![WHITE; self.msgs.len()];
        let mut stack: Vec<(usize, Vec<usize>)> = Vec::new();
        for start in 0..self.msgs.len() {
            if color[start] != WHITE {
                continue;
            }
            stack.push((start, self.required_children(start)));
            color[start] = GRAY;
            while let Some(top) = stack.last_mut() {
                let node = top.0;
                match top.1.pop() {
                    Some(child) => match color[child] {
                        GRAY => {
                            return Err(DefError::RequiredCycle(self.msgs[child].name.clone()));
                        }
                        WHITE => {
                            color[child] = GRAY;
                            let grand = self.required_children(child);
                            stack.push((child, grand));
                        }
                        _ => {}
                    },
                    None => {
                        color[node] = BLACK;
                        stack.pop();
                    }
                }
            }
        }
        Ok(())
    }

    fn required_children(&self, msg: usize) -> Vec<usize> {
        let mut out = Vec::new();
        for f in self.msgs[msg].fields_by_number.values() {
            let field = &self.fields[f.0 as usize];
            if field.label != Label::Required || !field.dtype.is_submessage() {
                continue;
            }
            if let SubLink::Resolved(SubDef::Message(m)) = field.sub {
                out.push(m.0 as usize);
            }
        }
        out
    }

    fn assign_selectors(&mut self) {
        for mi in 0..self.msgs.len() {
            // Selectors 0 and 1 are startmsg/endmsg.
            let mut count = 2u32;
            let fields: Vec<FieldRef> = self.msgs[mi].fields_by_number.values().copied().collect();
            for f in fields {
                let span = handlers::selector_span(&self.fields[f.0 as usize]);
                self.fields[f.0 as usize].selector_base = count;
                count += span;
            }
            self.msgs[mi].selector_count = count;
        }
    }
}

fn default_matches(dtype: DescriptorType, value: &Value) -> bool {
    use DescriptorType::*;
    matches!(
        (dtype, value),
        (Bool, Value::Bool(_))
            | (Int32 | Sfixed32 | Sint32 | Enum, Value::I32(_))
            | (Int64 | Sfixed64 | Sint64, Value::I64(_))
            | (Uint32 | Fixed32, Value::U32(_))
            | (Uint64 | Fixed64, Value::U64(_))
            | (Float, Value::F32(_))
            | (Double, Value::F64(_))
            | (String | Bytes, Value::Bytes(_))
    )
}
