//! Handler tables: per-message callback slots addressed by selector.
//!
//! A [`HandlerSet`] is an arena of tables, one per message type the caller
//! cares about; sub-message fields link to other tables by [`HandlersId`],
//! so self-recursive message types work without reference cycles. Tables
//! are built against a frozen [`DefPool`] and frozen themselves before a
//! decode plan can use them.

use std::sync::Arc;

use crate::defs::{DefPool, DescriptorType, FieldDef, FieldRef, MsgRef, SubDef};
use crate::error::DefError;

pub type Selector = u32;

/// Opaque per-scope user state threaded through callbacks. Start-style
/// callbacks may return a new closure for the scope they open.
pub type Closure = *mut ();

/// Per-slot user data bound at registration time.
pub type HandlerData = *const ();

pub const STARTMSG_SELECTOR: Selector = 0;
pub const ENDMSG_SELECTOR: Selector = 1;

/// The callback kinds a field can reserve selectors for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    StartSeq,
    EndSeq,
    Value,
    StartStr,
    StrChunk,
    EndStr,
    StartSubMsg,
    EndSubMsg,
}

/// Number of selectors a field reserves from its selector base.
pub(crate) fn selector_span(f: &FieldDef) -> u32 {
    let inner = if f.is_string() {
        3
    } else if f.is_submessage() {
        2
    } else {
        1
    };
    if f.is_sequence() {
        2 + inner
    } else {
        inner
    }
}

/// Selector of `kind` for `f`, if the field's shape reserves that kind.
///
/// Repeated fields lay out startseq, endseq first; the value / string /
/// sub-message kinds follow.
pub fn selector(f: &FieldDef, kind: HandlerKind) -> Option<Selector> {
    let base = f.selector_base();
    let seq = f.is_sequence();
    let inner = base + if seq { 2 } else { 0 };
    match kind {
        HandlerKind::StartSeq if seq => Some(base),
        HandlerKind::EndSeq if seq => Some(base + 1),
        HandlerKind::Value if f.is_primitive() => Some(inner),
        HandlerKind::StartStr if f.is_string() => Some(inner),
        HandlerKind::StrChunk if f.is_string() => Some(inner + 1),
        HandlerKind::EndStr if f.is_string() => Some(inner + 2),
        HandlerKind::StartSubMsg if f.is_submessage() => Some(inner),
        HandlerKind::EndSubMsg if f.is_submessage() => Some(inner + 1),
        _ => None,
    }
}

pub type StartMsgFn = fn(Closure, HandlerData) -> bool;
pub type EndMsgFn = fn(Closure, HandlerData) -> bool;
pub type ValueBoolFn = fn(Closure, HandlerData, bool) -> bool;
pub type ValueI32Fn = fn(Closure, HandlerData, i32) -> bool;
pub type ValueU32Fn = fn(Closure, HandlerData, u32) -> bool;
pub type ValueI64Fn = fn(Closure, HandlerData, i64) -> bool;
pub type ValueU64Fn = fn(Closure, HandlerData, u64) -> bool;
pub type ValueF32Fn = fn(Closure, HandlerData, f32) -> bool;
pub type ValueF64Fn = fn(Closure, HandlerData, f64) -> bool;
/// Opens a scope (sequence or sub-message); `None` signals failure.
pub type StartFn = fn(Closure, HandlerData) -> Option<Closure>;
/// Opens a string scope with a size hint; `None` signals failure.
pub type StartStrFn = fn(Closure, HandlerData, u64) -> Option<Closure>;
/// Receives a chunk; returns how many bytes were accepted (a prefix
/// suspends the decoder) or `None` to fail.
pub type StrChunkFn = fn(Closure, HandlerData, &[u8]) -> Option<usize>;
pub type EndFn = fn(Closure, HandlerData) -> bool;

#[derive(Clone, Copy)]
pub(crate) enum HandlerFn {
    StartMsg(StartMsgFn),
    EndMsg(EndMsgFn),
    Bool(ValueBoolFn),
    I32(ValueI32Fn),
    U32(ValueU32Fn),
    I64(ValueI64Fn),
    U64(ValueU64Fn),
    F32(ValueF32Fn),
    F64(ValueF64Fn),
    Start(StartFn),
    StartStr(StartStrFn),
    StrChunk(StrChunkFn),
    End(EndFn),
}

#[derive(Clone, Copy)]
pub(crate) struct Slot {
    pub(crate) func: Option<HandlerFn>,
    pub(crate) data: HandlerData,
    pub(crate) sub: Option<HandlersId>,
}

impl Slot {
    const EMPTY: Slot = Slot {
        func: None,
        data: std::ptr::null(),
        sub: None,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlersId(pub(crate) u32);

/// Callback slots for one message type.
pub struct HandlerTable {
    msg: MsgRef,
    slots: Vec<Slot>,
}

impl HandlerTable {
    pub fn message(&self) -> MsgRef {
        self.msg
    }

    #[inline]
    pub(crate) fn slot(&self, sel: Selector) -> Slot {
        self.slots[sel as usize]
    }

    pub(crate) fn subhandlers(&self, sel: Selector) -> Option<HandlersId> {
        self.slots[sel as usize].sub
    }
}

/// The value shape a field's value handler must take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Bool,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

fn value_kind(dtype: DescriptorType) -> Option<ValueKind> {
    use DescriptorType::*;
    match dtype {
        Bool => Some(ValueKind::Bool),
        Int32 | Sfixed32 | Sint32 | Enum => Some(ValueKind::I32),
        Uint32 | Fixed32 => Some(ValueKind::U32),
        Int64 | Sfixed64 | Sint64 => Some(ValueKind::I64),
        Uint64 | Fixed64 => Some(ValueKind::U64),
        Float => Some(ValueKind::F32),
        Double => Some(ValueKind::F64),
        String | Bytes | Message | Group => None,
    }
}

/// Registry of handler tables over one frozen def pool.
///
/// The tables hold raw user-data pointers; the caller guarantees the
/// pointed-to data outlives every decoder using the set and is safe to
/// share between the threads that do.
pub struct HandlerSet {
    defs: Arc<DefPool>,
    tables: Vec<HandlerTable>,
    frozen: bool,
}

unsafe impl Send for HandlerSet {}
unsafe impl Sync for HandlerSet {}

impl HandlerSet {
    pub fn new(defs: Arc<DefPool>) -> Self {
        HandlerSet {
            defs,
            tables: Vec::new(),
            frozen: false,
        }
    }

    pub fn defs(&self) -> &Arc<DefPool> {
        &self.defs
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn table(&self, id: HandlersId) -> &HandlerTable {
        &self.tables[id.0 as usize]
    }

    fn check_mutable(&self) -> Result<(), DefError> {
        if self.frozen {
            return Err(DefError::Frozen);
        }
        Ok(())
    }

    pub fn add_table(&mut self, msg: MsgRef) -> Result<HandlersId, DefError> {
        self.check_mutable()?;
        let count = self.defs.message(msg).selector_count() as usize;
        let id = HandlersId(self.tables.len() as u32);
        self.tables.push(HandlerTable {
            msg,
            slots: vec![Slot::EMPTY; count],
        });
        Ok(id)
    }

    /// Seals the set; after this the tables are immutable and shareable.
    pub fn freeze(mut self) -> Arc<HandlerSet> {
        self.frozen = true;
        Arc::new(self)
    }

    pub fn set_start_message_handler(
        &mut self,
        t: HandlersId,
        f: StartMsgFn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        self.check_mutable()?;
        self.put(t, STARTMSG_SELECTOR, HandlerFn::StartMsg(f), data);
        Ok(())
    }

    pub fn set_end_message_handler(
        &mut self,
        t: HandlersId,
        f: EndMsgFn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        self.check_mutable()?;
        self.put(t, ENDMSG_SELECTOR, HandlerFn::EndMsg(f), data);
        Ok(())
    }

    pub fn set_bool_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: ValueBoolFn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.value_selector(t, field, ValueKind::Bool)?;
        self.put(t, sel, HandlerFn::Bool(f), data);
        Ok(())
    }

    pub fn set_int32_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: ValueI32Fn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.value_selector(t, field, ValueKind::I32)?;
        self.put(t, sel, HandlerFn::I32(f), data);
        Ok(())
    }

    pub fn set_uint32_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: ValueU32Fn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.value_selector(t, field, ValueKind::U32)?;
        self.put(t, sel, HandlerFn::U32(f), data);
        Ok(())
    }

    pub fn set_int64_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: ValueI64Fn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.value_selector(t, field, ValueKind::I64)?;
        self.put(t, sel, HandlerFn::I64(f), data);
        Ok(())
    }

    pub fn set_uint64_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: ValueU64Fn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.value_selector(t, field, ValueKind::U64)?;
        self.put(t, sel, HandlerFn::U64(f), data);
        Ok(())
    }

    pub fn set_float_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: ValueF32Fn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.value_selector(t, field, ValueKind::F32)?;
        self.put(t, sel, HandlerFn::F32(f), data);
        Ok(())
    }

    pub fn set_double_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: ValueF64Fn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.value_selector(t, field, ValueKind::F64)?;
        self.put(t, sel, HandlerFn::F64(f), data);
        Ok(())
    }

    pub fn set_start_sequence_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: StartFn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.kind_selector(t, field, HandlerKind::StartSeq)?;
        self.put(t, sel, HandlerFn::Start(f), data);
        Ok(())
    }

    pub fn set_end_sequence_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: EndFn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.kind_selector(t, field, HandlerKind::EndSeq)?;
        self.put(t, sel, HandlerFn::End(f), data);
        Ok(())
    }

    pub fn set_start_string_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: StartStrFn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.kind_selector(t, field, HandlerKind::StartStr)?;
        self.put(t, sel, HandlerFn::StartStr(f), data);
        Ok(())
    }

    pub fn set_string_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: StrChunkFn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.kind_selector(t, field, HandlerKind::StrChunk)?;
        self.put(t, sel, HandlerFn::StrChunk(f), data);
        Ok(())
    }

    pub fn set_end_string_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: EndFn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.kind_selector(t, field, HandlerKind::EndStr)?;
        self.put(t, sel, HandlerFn::End(f), data);
        Ok(())
    }

    pub fn set_start_submessage_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: StartFn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.kind_selector(t, field, HandlerKind::StartSubMsg)?;
        self.put(t, sel, HandlerFn::Start(f), data);
        Ok(())
    }

    pub fn set_end_submessage_handler(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        f: EndFn,
        data: HandlerData,
    ) -> Result<(), DefError> {
        let sel = self.kind_selector(t, field, HandlerKind::EndSubMsg)?;
        self.put(t, sel, HandlerFn::End(f), data);
        Ok(())
    }

    /// Links the table used for a sub-message field's contents. The linked
    /// table must be built for the field's sub-message type.
    pub fn set_subhandlers(
        &mut self,
        t: HandlersId,
        field: FieldRef,
        sub: HandlersId,
    ) -> Result<(), DefError> {
        let sel = self.kind_selector(t, field, HandlerKind::StartSubMsg)?;
        let fd = self.defs.field(field);
        match fd.subdef() {
            Some(SubDef::Message(m)) if self.table(sub).msg == m => {}
            _ => {
                return Err(DefError::SubHandlersMismatch {
                    field: fd.name().to_string(),
                });
            }
        }
        self.tables[t.0 as usize].slots[sel as usize].sub = Some(sub);
        Ok(())
    }

    fn put(&mut self, t: HandlersId, sel: Selector, func: HandlerFn, data: HandlerData) {
        let slot = &mut self.tables[t.0 as usize].slots[sel as usize];
        slot.func = Some(func);
        slot.data = data;
    }

    fn field_checked(&self, t: HandlersId, field: FieldRef) -> Result<&FieldDef, DefError> {
        let fd = self.defs.field(field);
        if fd.message_def() != self.table(t).msg {
            return Err(DefError::HandlerType {
                field: fd.name().to_string(),
            });
        }
        Ok(fd)
    }

    fn value_selector(
        &self,
        t: HandlersId,
        field: FieldRef,
        kind: ValueKind,
    ) -> Result<Selector, DefError> {
        self.check_mutable()?;
        let fd = self.field_checked(t, field)?;
        if value_kind(fd.descriptor_type()) != Some(kind) {
            return Err(DefError::HandlerType {
                field: fd.name().to_string(),
            });
        }
        selector(fd, HandlerKind::Value).ok_or_else(|| DefError::HandlerKind {
            field: fd.name().to_string(),
        })
    }

    fn kind_selector(
        &self,
        t: HandlersId,
        field: FieldRef,
        kind: HandlerKind,
    ) -> Result<Selector, DefError> {
        self.check_mutable()?;
        let fd = self.field_checked(t, field)?;
        selector(fd, kind).ok_or_else(|| DefError::HandlerKind {
            field: fd.name().to_string(),
        })
    }
}
