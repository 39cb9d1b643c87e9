//! The sink: routes decoder events to handler slots.
//!
//! Holds a LIFO of (handler table, closure) scopes. Start-style events run
//! the slot's callback with the current closure and push the closure it
//! returns; end-style events pop first and run the callback with the
//! restored scope closure. Missing slots are no-ops that inherit the
//! current closure, so a decoder always consumes input at full speed even
//! with a sparse table.

use crate::error::{Error, PipelineStatus};
use crate::handlers::{
    Closure, HandlerFn, HandlerSet, HandlerTable, HandlersId, Selector, Slot, ENDMSG_SELECTOR,
    STARTMSG_SELECTOR,
};

struct SinkFrame<'p> {
    table: Option<&'p HandlerTable>,
    closure: Closure,
}

pub struct Sink<'p> {
    set: &'p HandlerSet,
    root: HandlersId,
    stack: Vec<SinkFrame<'p>>,
    status: PipelineStatus,
}

impl<'p> Sink<'p> {
    pub fn new(set: &'p HandlerSet, root: HandlersId, closure: Closure) -> Self {
        let mut sink = Sink {
            set,
            root,
            stack: Vec::new(),
            status: PipelineStatus::default(),
        };
        sink.reset(closure);
        sink
    }

    /// Drops every open scope and rearms the sink on the root table.
    pub fn reset(&mut self, closure: Closure) {
        self.status.clear();
        self.stack.clear();
        self.stack.push(SinkFrame {
            table: Some(self.set.table(self.root)),
            closure,
        });
    }

    pub fn status(&self) -> &PipelineStatus {
        &self.status
    }

    pub(crate) fn fail(&mut self, err: Error) {
        self.status.fail(err);
    }

    fn closure(&self) -> Closure {
        self.stack.last().map_or(std::ptr::null_mut(), |f| f.closure)
    }

    fn table(&self) -> Option<&'p HandlerTable> {
        self.stack.last().and_then(|f| f.table)
    }

    fn slot(&self, sel: Selector) -> Option<Slot> {
        self.table().map(|t| t.slot(sel))
    }

    fn handler_failed(&mut self, sel: Selector) -> bool {
        self.fail(Error::Handler { selector: sel });
        false
    }

    pub fn start_message(&mut self) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        if let Some(slot) = self.slot(STARTMSG_SELECTOR) {
            if let Some(HandlerFn::StartMsg(f)) = slot.func {
                if !f(self.closure(), slot.data) {
                    return self.handler_failed(STARTMSG_SELECTOR);
                }
            }
        }
        true
    }

    pub fn end_message(&mut self) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        if let Some(slot) = self.slot(ENDMSG_SELECTOR) {
            if let Some(HandlerFn::EndMsg(f)) = slot.func {
                if !f(self.closure(), slot.data) {
                    return self.handler_failed(ENDMSG_SELECTOR);
                }
            }
        }
        true
    }

    pub fn put_bool(&mut self, sel: Selector, val: bool) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        match self.slot(sel) {
            Some(Slot { func: Some(HandlerFn::Bool(f)), data, .. }) => {
                f(self.closure(), data, val) || self.handler_failed(sel)
            }
            _ => true,
        }
    }

    pub fn put_i32(&mut self, sel: Selector, val: i32) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        match self.slot(sel) {
            Some(Slot { func: Some(HandlerFn::I32(f)), data, .. }) => {
                f(self.closure(), data, val) || self.handler_failed(sel)
            }
            _ => true,
        }
    }

    pub fn put_u32(&mut self, sel: Selector, val: u32) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        match self.slot(sel) {
            Some(Slot { func: Some(HandlerFn::U32(f)), data, .. }) => {
                f(self.closure(), data, val) || self.handler_failed(sel)
            }
            _ => true,
        }
    }

    pub fn put_i64(&mut self, sel: Selector, val: i64) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        match self.slot(sel) {
            Some(Slot { func: Some(HandlerFn::I64(f)), data, .. }) => {
                f(self.closure(), data, val) || self.handler_failed(sel)
            }
            _ => true,
        }
    }

    pub fn put_u64(&mut self, sel: Selector, val: u64) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        match self.slot(sel) {
            Some(Slot { func: Some(HandlerFn::U64(f)), data, .. }) => {
                f(self.closure(), data, val) || self.handler_failed(sel)
            }
            _ => true,
        }
    }

    pub fn put_f32(&mut self, sel: Selector, val: f32) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        match self.slot(sel) {
            Some(Slot { func: Some(HandlerFn::F32(f)), data, .. }) => {
                f(self.closure(), data, val) || self.handler_failed(sel)
            }
            _ => true,
        }
    }

    pub fn put_f64(&mut self, sel: Selector, val: f64) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        match self.slot(sel) {
            Some(Slot { func: Some(HandlerFn::F64(f)), data, .. }) => {
                f(self.closure(), data, val) || self.handler_failed(sel)
            }
            _ => true,
        }
    }

    /// Opens a scope whose start slot holds a [`HandlerFn::Start`] callback;
    /// the scope keeps the current table.
    fn start_scope(&mut self, sel: Selector) -> bool {
        let parent = self.closure();
        let closure = match self.slot(sel) {
            Some(Slot { func: Some(HandlerFn::Start(f)), data, .. }) => match f(parent, data) {
                Some(c) => c,
                None => return self.handler_failed(sel),
            },
            _ => parent,
        };
        let table = self.table();
        self.stack.push(SinkFrame { table, closure });
        true
    }

    /// Pops a scope and runs the end slot with the restored closure.
    fn end_scope(&mut self, sel: Selector) -> bool {
        self.stack.pop();
        match self.slot(sel) {
            Some(Slot { func: Some(HandlerFn::End(f)), data, .. }) => {
                f(self.closure(), data) || self.handler_failed(sel)
            }
            _ => true,
        }
    }

    pub fn start_sequence(&mut self, sel: Selector) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        self.start_scope(sel)
    }

    pub fn end_sequence(&mut self, sel: Selector) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        self.end_scope(sel)
    }

    pub fn start_string(&mut self, sel: Selector, size_hint: u64) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        let parent = self.closure();
        let closure = match self.slot(sel) {
            Some(Slot { func: Some(HandlerFn::StartStr(f)), data, .. }) => {
                match f(parent, data, size_hint) {
                    Some(c) => c,
                    None => return self.handler_failed(sel),
                }
            }
            _ => parent,
        };
        let table = self.table();
        self.stack.push(SinkFrame { table, closure });
        true
    }

    /// Offers `bytes` to the string-chunk slot; returns how many were
    /// accepted. A missing slot accepts everything. Accepting a prefix
    /// suspends the decoder until the rest is re-presented.
    pub fn put_string_chunk(&mut self, sel: Selector, bytes: &[u8]) -> usize {
        if !self.status.is_ok() {
            return 0;
        }
        match self.slot(sel) {
            Some(Slot { func: Some(HandlerFn::StrChunk(f)), data, .. }) => {
                match f(self.closure(), data, bytes) {
                    Some(n) => n.min(bytes.len()),
                    None => {
                        self.handler_failed(sel);
                        0
                    }
                }
            }
            _ => bytes.len(),
        }
    }

    pub fn end_string(&mut self, sel: Selector) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        self.end_scope(sel)
    }

    /// Opens a sub-message scope. The pushed scope switches to the slot's
    /// linked sub-table (or no table at all when none was linked).
    pub fn start_submessage(&mut self, sel: Selector) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        let parent = self.closure();
        let (closure, sub) = match self.slot(sel) {
            Some(Slot { func, data, sub }) => {
                let closure = match func {
                    Some(HandlerFn::Start(f)) => match f(parent, data) {
                        Some(c) => c,
                        None => return self.handler_failed(sel),
                    },
                    _ => parent,
                };
                (closure, sub)
            }
            None => (parent, None),
        };
        let table = sub.map(|id| self.set.table(id));
        self.stack.push(SinkFrame { table, closure });
        true
    }

    pub fn end_submessage(&mut self, sel: Selector) -> bool {
        if !self.status.is_ok() {
            return false;
        }
        self.end_scope(sel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{DefPool, DescriptorType, Label};
    use crate::handlers::{HandlerData, HandlerSet};

    fn count_u32(c: Closure, _d: HandlerData, _v: u32) -> bool {
        let n = unsafe { &mut *(c as *mut u32) };
        *n += 1;
        true
    }

    fn reject_u32(_c: Closure, _d: HandlerData, _v: u32) -> bool {
        false
    }

    fn fixture(f: crate::handlers::ValueU32Fn) -> (std::sync::Arc<HandlerSet>, Selector) {
        let mut pool = DefPool::new();
        let m = pool.add_message("M").unwrap();
        pool.add_field(m, "n", 1, Label::Optional, DescriptorType::Uint32)
            .unwrap();
        let pool = pool.freeze().unwrap();
        let m = pool.message_by_name("M").unwrap();
        let fr = pool.message(m).field_by_number(1).unwrap();
        let sel = crate::handlers::selector(pool.field(fr), crate::handlers::HandlerKind::Value)
            .unwrap();
        let mut set = HandlerSet::new(pool);
        let t = set.add_table(m).unwrap();
        set.set_uint32_handler(t, fr, f, std::ptr::null()).unwrap();
        (set.freeze(), sel)
    }

    #[test]
    fn value_dispatch_reaches_handler() {
        let (set, sel) = fixture(count_u32);
        let mut hits = 0u32;
        let mut sink = Sink::new(&set, HandlersId(0), &mut hits as *mut u32 as Closure);
        assert!(sink.start_message());
        assert!(sink.put_u32(sel, 7));
        assert!(sink.put_u32(sel, 8));
        assert!(sink.end_message());
        assert_eq!(hits, 2);
    }

    #[test]
    fn missing_slot_is_noop() {
        let (set, _sel) = fixture(count_u32);
        let mut sink = Sink::new(&set, HandlersId(0), std::ptr::null_mut());
        // No startmsg/endmsg handlers were registered: both are no-ops.
        assert!(sink.start_message());
        assert!(sink.end_message());
        assert!(sink.status().is_ok());
    }

    #[test]
    fn handler_failure_is_sticky() {
        let (set, sel) = fixture(reject_u32);
        let mut sink = Sink::new(&set, HandlersId(0), std::ptr::null_mut());
        assert!(!sink.put_u32(sel, 1));
        assert_eq!(sink.status().error(), Some(&Error::Handler { selector: sel }));
        // Short-circuits from here on.
        assert!(!sink.put_u32(sel, 2));
        assert!(!sink.end_message());
        assert_eq!(sink.status().error(), Some(&Error::Handler { selector: sel }));
    }

    #[test]
    fn reset_clears_failure() {
        let (set, sel) = fixture(reject_u32);
        let mut sink = Sink::new(&set, HandlersId(0), std::ptr::null_mut());
        assert!(!sink.put_u32(sel, 1));
        sink.reset(std::ptr::null_mut());
        assert!(sink.status().is_ok());
    }
}
