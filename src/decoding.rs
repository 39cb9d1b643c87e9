//! The streaming decoder: a resumable push parser over protobuf wire data.
//!
//! The decoder is an explicit state machine with an explicit frame stack.
//! Frames correspond one to one with protocol nesting (the top-level
//! message, sub-messages and groups), which keeps depth limits and
//! delimited-region checks inspectable. Suspension is a first-class state:
//! a varint straddling a chunk boundary is buffered in a fixed ten-byte
//! accumulator, a fixed-width value accumulates inside the machine state,
//! and everything else lives in the frames, so `feed` can hand back control
//! at any byte boundary and resume exactly where it stopped.

use std::sync::Arc;

use log::trace;

use crate::defs::{DescriptorType, FieldDef, MsgRef, SubDef};
use crate::error::Error;
use crate::handlers::{Closure, HandlerSet, HandlersId, Selector};
use crate::sink::Sink;
use crate::wire::{zigzag_decode, PartialVarint, WireType, MAX_FIELDNUMBER};

/// Default limit on decoder stack depth; the top-level message counts as
/// one frame.
pub const DEFAULT_MAX_NESTING: usize = 64;

/// A frozen handler plan the decoder executes.
pub struct DecodePlan {
    set: Arc<HandlerSet>,
    root: HandlersId,
    jit_requested: bool,
}

impl DecodePlan {
    /// Builds a plan rooted at `root`. `want_jit` is recorded for callers
    /// probing the backend; decoding always runs the interpreter, and any
    /// generated backend must be byte-for-byte indistinguishable from it.
    pub fn new(set: Arc<HandlerSet>, root: HandlersId, want_jit: bool) -> Self {
        DecodePlan {
            set,
            root,
            jit_requested: want_jit,
        }
    }

    pub fn handler_set(&self) -> &HandlerSet {
        &self.set
    }

    pub fn root(&self) -> HandlersId {
        self.root
    }

    pub fn jit_requested(&self) -> bool {
        self.jit_requested
    }

    pub fn uses_jit(&self) -> bool {
        false
    }
}

/// Compact copy of the dispatch-relevant parts of a field def. Lives inside
/// the machine state across suspensions.
#[derive(Debug, Clone, Copy)]
struct FieldInfo {
    number: u32,
    base: Selector,
    dtype: DescriptorType,
    repeated: bool,
}

impl FieldInfo {
    fn from_def(f: &FieldDef) -> Self {
        FieldInfo {
            number: f.number(),
            base: f.selector_base(),
            dtype: f.descriptor_type(),
            repeated: f.is_sequence(),
        }
    }

    // Selector layout mirrors handlers::selector.
    fn inner(&self) -> Selector {
        self.base + if self.repeated { 2 } else { 0 }
    }

    fn startseq_sel(&self) -> Selector {
        self.base
    }

    fn endseq_sel(&self) -> Selector {
        self.base + 1
    }

    fn value_sel(&self) -> Selector {
        self.inner()
    }

    fn startstr_sel(&self) -> Selector {
        self.inner()
    }

    fn chunk_sel(&self) -> Selector {
        self.inner() + 1
    }

    fn endstr_sel(&self) -> Selector {
        self.inner() + 2
    }

    fn startsub_sel(&self) -> Selector {
        self.inner()
    }

    fn endsub_sel(&self) -> Selector {
        self.inner() + 1
    }
}

#[derive(Clone, Copy)]
struct SeqState {
    field_number: u32,
    endseq_sel: Selector,
}

/// One level of protocol nesting.
struct Frame {
    /// Handler table for fields of this message; `None` inside an unknown
    /// group or an unlinked sub-message table.
    handlers: Option<HandlersId>,
    /// Message def used for field lookup; `None` makes every field unknown.
    msg: Option<MsgRef>,
    /// Absolute end offset of a length-delimited frame.
    end: Option<u64>,
    /// Innermost binding delimited end, inherited through group frames.
    delim_end: Option<u64>,
    /// Field number of the enclosing group tag, 0 otherwise.
    group_number: u32,
    /// Currently open implicit sequence, if any.
    seq: Option<SeqState>,
    /// Parent-table endsubmsg selector fired on exit; `None` marks a frame
    /// that never announced itself to the sink (unknown-group skip frames
    /// and the root).
    endsub_sel: Option<Selector>,
}

#[derive(Clone, Copy)]
enum LenKind {
    Str(FieldInfo),
    SubMsg {
        info: FieldInfo,
        sub_handlers: Option<HandlersId>,
        sub_msg: Option<MsgRef>,
    },
    Packed(FieldInfo),
    Skip,
}

#[derive(Clone, Copy)]
enum State {
    /// Expecting a tag at the current offset.
    Tag,
    /// Expecting the value varint of a matched field.
    VarintValue(FieldInfo),
    /// Expecting a length prefix.
    Length(LenKind),
    /// Accumulating a 4- or 8-byte fixed value.
    FixedValue {
        info: FieldInfo,
        need: u8,
        have: u8,
        buf: [u8; 8],
    },
    /// Streaming the body of a string/bytes value to the sink.
    StringBody {
        chunk_sel: Selector,
        endstr_sel: Selector,
        remaining: u64,
    },
    /// Discarding an unknown varint value.
    SkipVarint,
    /// Discarding unknown bytes (length-delimited or fixed).
    SkipBytes { remaining: u64 },
    /// Inside a packed region, reading untagged elements.
    PackedBody {
        info: FieldInfo,
        end: u64,
        have: u8,
        buf: [u8; 8],
    },
    /// The top-level message was closed by `finish`.
    Finished,
}

enum Flow {
    Continue,
    Suspend,
}

/// A resumable decode over one plan.
///
/// Construction and reset are cheap; descriptors and handler tables are
/// shared by the plan. The decoder owns only its frame stack and partial
/// buffers.
pub struct Decoder<'p, const MAX_NESTING: usize = DEFAULT_MAX_NESTING> {
    plan: &'p DecodePlan,
    sink: Sink<'p>,
    frames: Vec<Frame>,
    state: State,
    partial: PartialVarint,
    offset: u64,
}

impl<'p, const MAX_NESTING: usize> Decoder<'p, MAX_NESTING> {
    pub fn new(plan: &'p DecodePlan, top_closure: Closure) -> Self {
        let mut decoder = Decoder {
            plan,
            sink: Sink::new(plan.handler_set(), plan.root(), top_closure),
            frames: Vec::with_capacity(MAX_NESTING),
            state: State::Tag,
            partial: PartialVarint::default(),
            offset: 0,
        };
        decoder.arm();
        decoder
    }

    /// Rearms the decoder for a fresh parse and fires startmsg on the top
    /// closure.
    pub fn reset(&mut self, top_closure: Closure) {
        self.sink.reset(top_closure);
        self.arm();
    }

    fn arm(&mut self) {
        self.frames.clear();
        self.partial.clear();
        self.offset = 0;
        self.state = State::Tag;
        let root = self.plan.root();
        let msg = self.plan.handler_set().table(root).message();
        self.frames.push(Frame {
            handlers: Some(root),
            msg: Some(msg),
            end: None,
            delim_end: None,
            group_number: 0,
            seq: None,
            endsub_sel: None,
        });
        self.sink.start_message();
    }

    pub fn status(&self) -> &crate::error::PipelineStatus {
        self.sink.status()
    }

    /// Total bytes consumed across all `feed` calls since the last reset.
    pub fn bytes_consumed(&self) -> u64 {
        self.offset
    }

    /// Whether the decoder stopped mid-element and needs more input.
    pub fn suspended(&self) -> bool {
        !self.partial.is_empty() || !matches!(self.state, State::Tag | State::Finished)
    }

    /// Feeds one chunk; returns how many of its bytes were consumed.
    ///
    /// Fewer than `buf.len()` means either the pipeline failed (check
    /// [`status`](Self::status)) or a string handler accepted a prefix; in
    /// the latter case the caller re-presents the unconsumed suffix.
    pub fn feed(&mut self, buf: &[u8]) -> usize {
        if !self.sink.status().is_ok() || matches!(self.state, State::Finished) {
            return 0;
        }
        let mut pos = 0usize;
        loop {
            self.settle(pos);
            if !self.sink.status().is_ok() || pos == buf.len() {
                break;
            }
            match self.step(buf, &mut pos) {
                Ok(Flow::Continue) => {
                    if !self.sink.status().is_ok() {
                        break;
                    }
                }
                Ok(Flow::Suspend) => break,
                Err(err) => {
                    self.sink.fail(err);
                    break;
                }
            }
        }
        self.offset += pos as u64;
        pos
    }

    /// Declares end of input. Any suspended element is an error: a pending
    /// partial varint reports `MalformedVarint`, everything else
    /// `Truncated`. On success fires the top-level endmsg.
    pub fn finish(&mut self) -> Result<(), Error> {
        if let Some(err) = self.sink.status().error() {
            return Err(err.clone());
        }
        if matches!(self.state, State::Finished) {
            return Ok(());
        }
        if !self.partial.is_empty() {
            self.sink.fail(Error::MalformedVarint);
            return Err(Error::MalformedVarint);
        }
        if !matches!(self.state, State::Tag) || self.frames.len() > 1 {
            self.sink.fail(Error::Truncated);
            return Err(Error::Truncated);
        }
        self.close_seq();
        self.sink.end_message();
        self.state = State::Finished;
        match self.sink.status().error() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn delim_end(&self) -> Option<u64> {
        self.frames.last().and_then(|f| f.delim_end)
    }

    /// Runs every transition that needs no input bytes: closing packed and
    /// skip regions and exiting frames whose delimited end was reached.
    fn settle(&mut self, pos: usize) {
        loop {
            let off = self.offset + pos as u64;
            match self.state {
                State::PackedBody { end, have, .. } if off == end => {
                    debug_assert_eq!(have, 0);
                    self.state = State::Tag;
                }
                State::StringBody { endstr_sel, remaining: 0, .. } => {
                    self.sink.end_string(endstr_sel);
                    self.state = State::Tag;
                }
                State::SkipBytes { remaining: 0 } => {
                    self.state = State::Tag;
                }
                State::Tag => {
                    let Some(frame) = self.frames.last() else {
                        return;
                    };
                    if frame.end == Some(off) {
                        self.exit_frame();
                    } else {
                        return;
                    }
                }
                _ => return,
            }
            if !self.sink.status().is_ok() {
                return;
            }
        }
    }

    fn step(&mut self, buf: &[u8], pos: &mut usize) -> Result<Flow, Error> {
        match self.state {
            State::Tag => self.step_tag(buf, pos),
            State::VarintValue(info) => {
                let bound = self.delim_end();
                match self.pull_varint(buf, pos, bound)? {
                    None => Ok(Flow::Suspend),
                    Some(raw) => {
                        self.put_scalar_varint(&info, raw);
                        self.state = State::Tag;
                        Ok(Flow::Continue)
                    }
                }
            }
            State::Length(kind) => self.step_length(kind, buf, pos),
            State::FixedValue { info, need, have, buf: held } => {
                self.step_fixed(info, need, have, held, buf, pos)
            }
            State::StringBody { chunk_sel, endstr_sel, remaining } => {
                self.step_string(chunk_sel, endstr_sel, remaining, buf, pos)
            }
            State::SkipVarint => {
                let bound = self.delim_end();
                match self.pull_varint(buf, pos, bound)? {
                    None => Ok(Flow::Suspend),
                    Some(_) => {
                        self.state = State::Tag;
                        Ok(Flow::Continue)
                    }
                }
            }
            State::SkipBytes { remaining } => {
                let take = remaining.min((buf.len() - *pos) as u64);
                *pos += take as usize;
                self.state = State::SkipBytes { remaining: remaining - take };
                Ok(Flow::Continue)
            }
            State::PackedBody { info, end, have, buf: held } => {
                self.step_packed(info, end, have, held, buf, pos)
            }
            State::Finished => Ok(Flow::Suspend),
        }
    }

    /// Pulls one varint through the partial accumulator. `bound` is the
    /// absolute offset the varint must terminate before; reaching it
    /// mid-varint is malformed. `None` means the chunk ran out.
    fn pull_varint(
        &mut self,
        buf: &[u8],
        pos: &mut usize,
        bound: Option<u64>,
    ) -> Result<Option<u64>, Error> {
        loop {
            if let Some(b) = bound {
                if self.offset + *pos as u64 == b {
                    return Err(Error::MalformedVarint);
                }
            }
            if *pos == buf.len() {
                return Ok(None);
            }
            let byte = buf[*pos];
            *pos += 1;
            match self.partial.push(byte) {
                Err(()) => return Err(Error::MalformedVarint),
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
            }
        }
    }

    fn step_tag(&mut self, buf: &[u8], pos: &mut usize) -> Result<Flow, Error> {
        let bound = self.delim_end();
        let Some(tag) = self.pull_varint(buf, pos, bound)? else {
            return Ok(Flow::Suspend);
        };
        let wire_bits = (tag & 7) as u8;
        let field_number64 = tag >> 3;
        if field_number64 == 0 || field_number64 > MAX_FIELDNUMBER as u64 {
            return Err(Error::BadFieldNumber(field_number64));
        }
        let field_number = field_number64 as u32;
        let Some(wire_type) = WireType::from_bits(wire_bits) else {
            return Err(Error::BadWireType(wire_bits));
        };
        trace!("tag: field {} wire type {:?}", field_number, wire_type);
        if wire_type == WireType::EndGroup {
            return self.end_group(field_number);
        }
        // Leaving a repeated field's run closes its implicit sequence.
        let open_seq = self.frames.last().and_then(|f| f.seq);
        if let Some(seq) = open_seq {
            if seq.field_number != field_number {
                self.close_seq();
            }
        }
        let plan = self.plan;
        let defs = plan.handler_set().defs();
        let frame_msg = self.frames.last().and_then(|f| f.msg);
        let field = frame_msg
            .and_then(|m| defs.message(m).field_by_number(field_number))
            .map(|fr| defs.field(fr));
        match field {
            Some(field) => self.dispatch_field(field, wire_type, pos),
            None => self.skip_unknown(field_number, wire_type, pos),
        }
    }

    fn dispatch_field(
        &mut self,
        field: &FieldDef,
        wire_type: WireType,
        pos: &mut usize,
    ) -> Result<Flow, Error> {
        let info = FieldInfo::from_def(field);
        let native = info.dtype.native_wire_type();
        if wire_type == native {
            if info.repeated {
                self.open_seq(&info);
            }
            match native {
                WireType::Varint => {
                    self.state = State::VarintValue(info);
                    Ok(Flow::Continue)
                }
                WireType::Fixed32 => self.begin_fixed(info, 4, pos),
                WireType::Fixed64 => self.begin_fixed(info, 8, pos),
                WireType::Delimited => {
                    if info.dtype.is_string() {
                        self.state = State::Length(LenKind::Str(info));
                    } else {
                        let (sub_handlers, sub_msg) = self.sub_links(field, &info);
                        self.state = State::Length(LenKind::SubMsg {
                            info,
                            sub_handlers,
                            sub_msg,
                        });
                    }
                    Ok(Flow::Continue)
                }
                WireType::StartGroup => self.enter_group(field, &info),
                WireType::EndGroup => unreachable!("end-group handled at tag dispatch"),
            }
        } else if wire_type == WireType::Delimited && info.repeated && info.dtype.is_packable() {
            self.open_seq(&info);
            self.state = State::Length(LenKind::Packed(info));
            Ok(Flow::Continue)
        } else {
            Err(Error::BadWireType(wire_type as u8))
        }
    }

    fn open_seq(&mut self, info: &FieldInfo) {
        let already_open = self
            .frames
            .last()
            .and_then(|f| f.seq)
            .map_or(false, |s| s.field_number == info.number);
        if already_open {
            return;
        }
        self.sink.start_sequence(info.startseq_sel());
        if let Some(frame) = self.frames.last_mut() {
            frame.seq = Some(SeqState {
                field_number: info.number,
                endseq_sel: info.endseq_sel(),
            });
        }
    }

    fn close_seq(&mut self) {
        let seq = self.frames.last_mut().and_then(|f| f.seq.take());
        if let Some(seq) = seq {
            self.sink.end_sequence(seq.endseq_sel);
        }
    }

    fn sub_links(
        &self,
        field: &FieldDef,
        info: &FieldInfo,
    ) -> (Option<HandlersId>, Option<MsgRef>) {
        let plan = self.plan;
        let sub_handlers = self
            .frames
            .last()
            .and_then(|f| f.handlers)
            .and_then(|id| plan.handler_set().table(id).subhandlers(info.startsub_sel()));
        let sub_msg = match field.subdef() {
            Some(SubDef::Message(m)) => Some(m),
            _ => None,
        };
        (sub_handlers, sub_msg)
    }

    fn begin_fixed(&mut self, info: FieldInfo, need: u8, pos: &mut usize) -> Result<Flow, Error> {
        // The value may not cross the innermost delimited boundary.
        if let Some(de) = self.delim_end() {
            if de - (self.offset + *pos as u64) < need as u64 {
                return Err(Error::Truncated);
            }
        }
        self.state = State::FixedValue {
            info,
            need,
            have: 0,
            buf: [0; 8],
        };
        Ok(Flow::Continue)
    }

    fn enter_group(&mut self, field: &FieldDef, info: &FieldInfo) -> Result<Flow, Error> {
        if self.frames.len() == MAX_NESTING {
            return Err(Error::NestingTooDeep);
        }
        let (sub_handlers, sub_msg) = self.sub_links(field, info);
        let parent_delim = self.delim_end();
        self.sink.start_submessage(info.startsub_sel());
        self.sink.start_message();
        self.frames.push(Frame {
            handlers: sub_handlers,
            msg: sub_msg,
            end: None,
            delim_end: parent_delim,
            group_number: info.number,
            seq: None,
            endsub_sel: Some(info.endsub_sel()),
        });
        self.state = State::Tag;
        Ok(Flow::Continue)
    }

    fn end_group(&mut self, field_number: u32) -> Result<Flow, Error> {
        let Some(frame) = self.frames.last() else {
            return Err(Error::UnbalancedGroup);
        };
        if frame.group_number == 0 || frame.group_number != field_number {
            return Err(Error::UnbalancedGroup);
        }
        self.close_seq();
        let frame = self.frames.pop().expect("group frame present");
        if let Some(endsub_sel) = frame.endsub_sel {
            self.sink.end_message();
            self.sink.end_submessage(endsub_sel);
        }
        self.state = State::Tag;
        Ok(Flow::Continue)
    }

    /// Pops a frame whose delimited end was reached.
    fn exit_frame(&mut self) {
        self.close_seq();
        let frame = self.frames.pop().expect("delimited frame present");
        debug_assert_eq!(frame.group_number, 0);
        if let Some(endsub_sel) = frame.endsub_sel {
            self.sink.end_message();
            self.sink.end_submessage(endsub_sel);
        }
    }

    fn skip_unknown(
        &mut self,
        field_number: u32,
        wire_type: WireType,
        pos: &mut usize,
    ) -> Result<Flow, Error> {
        match wire_type {
            WireType::Varint => {
                self.state = State::SkipVarint;
                Ok(Flow::Continue)
            }
            WireType::Fixed32 => self.begin_skip_fixed(4, pos),
            WireType::Fixed64 => self.begin_skip_fixed(8, pos),
            WireType::Delimited => {
                self.state = State::Length(LenKind::Skip);
                Ok(Flow::Continue)
            }
            WireType::StartGroup => {
                if self.frames.len() == MAX_NESTING {
                    return Err(Error::NestingTooDeep);
                }
                let parent_delim = self.delim_end();
                self.frames.push(Frame {
                    handlers: None,
                    msg: None,
                    end: None,
                    delim_end: parent_delim,
                    group_number: field_number,
                    seq: None,
                    endsub_sel: None,
                });
                self.state = State::Tag;
                Ok(Flow::Continue)
            }
            WireType::EndGroup => unreachable!("end-group handled at tag dispatch"),
        }
    }

    fn begin_skip_fixed(&mut self, need: u8, pos: &mut usize) -> Result<Flow, Error> {
        if let Some(de) = self.delim_end() {
            if de - (self.offset + *pos as u64) < need as u64 {
                return Err(Error::Truncated);
            }
        }
        self.state = State::SkipBytes {
            remaining: need as u64,
        };
        Ok(Flow::Continue)
    }

    fn step_length(&mut self, kind: LenKind, buf: &[u8], pos: &mut usize) -> Result<Flow, Error> {
        let bound = self.delim_end();
        let Some(len) = self.pull_varint(buf, pos, bound)? else {
            return Ok(Flow::Suspend);
        };
        if len > i32::MAX as u64 {
            return Err(Error::LengthOverflow);
        }
        let off = self.offset + *pos as u64;
        let Some(end) = off.checked_add(len) else {
            return Err(Error::LengthOverflow);
        };
        if let Some(de) = self.delim_end() {
            if end > de {
                return Err(Error::LengthOverflow);
            }
        }
        match kind {
            LenKind::Skip => {
                self.state = State::SkipBytes { remaining: len };
            }
            LenKind::Str(info) => {
                self.sink.start_string(info.startstr_sel(), len);
                self.state = State::StringBody {
                    chunk_sel: info.chunk_sel(),
                    endstr_sel: info.endstr_sel(),
                    remaining: len,
                };
            }
            LenKind::SubMsg { info, sub_handlers, sub_msg } => {
                if self.frames.len() == MAX_NESTING {
                    return Err(Error::NestingTooDeep);
                }
                self.sink.start_submessage(info.startsub_sel());
                self.sink.start_message();
                self.frames.push(Frame {
                    handlers: sub_handlers,
                    msg: sub_msg,
                    end: Some(end),
                    delim_end: Some(end),
                    group_number: 0,
                    seq: None,
                    endsub_sel: Some(info.endsub_sel()),
                });
                self.state = State::Tag;
            }
            LenKind::Packed(info) => {
                self.state = State::PackedBody {
                    info,
                    end,
                    have: 0,
                    buf: [0; 8],
                };
            }
        }
        Ok(Flow::Continue)
    }

    fn step_fixed(
        &mut self,
        info: FieldInfo,
        need: u8,
        have: u8,
        mut held: [u8; 8],
        buf: &[u8],
        pos: &mut usize,
    ) -> Result<Flow, Error> {
        let take = ((need - have) as usize).min(buf.len() - *pos);
        held[have as usize..have as usize + take].copy_from_slice(&buf[*pos..*pos + take]);
        *pos += take;
        let have = have + take as u8;
        if have < need {
            self.state = State::FixedValue { info, need, have, buf: held };
            return Ok(Flow::Suspend);
        }
        self.put_scalar_fixed(&info, &held);
        self.state = State::Tag;
        Ok(Flow::Continue)
    }

    fn step_string(
        &mut self,
        chunk_sel: Selector,
        endstr_sel: Selector,
        remaining: u64,
        buf: &[u8],
        pos: &mut usize,
    ) -> Result<Flow, Error> {
        let avail = remaining.min((buf.len() - *pos) as u64) as usize;
        let accepted = self.sink.put_string_chunk(chunk_sel, &buf[*pos..*pos + avail]);
        *pos += accepted;
        let remaining = remaining - accepted as u64;
        self.state = State::StringBody { chunk_sel, endstr_sel, remaining };
        if !self.sink.status().is_ok() || remaining == 0 {
            // settle fires endstr once remaining hits zero.
            return Ok(Flow::Continue);
        }
        // A short write is handler backpressure: suspend and let the caller
        // re-present the rest.
        Ok(Flow::Suspend)
    }

    fn step_packed(
        &mut self,
        info: FieldInfo,
        end: u64,
        mut have: u8,
        mut held: [u8; 8],
        buf: &[u8],
        pos: &mut usize,
    ) -> Result<Flow, Error> {
        let native = info.dtype.native_wire_type();
        loop {
            let off = self.offset + *pos as u64;
            if off == end {
                self.state = State::Tag;
                return Ok(Flow::Continue);
            }
            if *pos == buf.len() {
                self.state = State::PackedBody { info, end, have, buf: held };
                return Ok(Flow::Suspend);
            }
            match native {
                WireType::Varint => match self.pull_varint(buf, pos, Some(end))? {
                    None => {
                        self.state = State::PackedBody { info, end, have, buf: held };
                        return Ok(Flow::Suspend);
                    }
                    Some(raw) => {
                        self.put_scalar_varint(&info, raw);
                    }
                },
                WireType::Fixed32 | WireType::Fixed64 => {
                    let need: u8 = if native == WireType::Fixed32 { 4 } else { 8 };
                    if have == 0 && end - off < need as u64 {
                        // Packed region ends in the middle of an element.
                        return Err(Error::Truncated);
                    }
                    let take = ((need - have) as usize).min(buf.len() - *pos);
                    held[have as usize..have as usize + take]
                        .copy_from_slice(&buf[*pos..*pos + take]);
                    *pos += take;
                    have += take as u8;
                    if have == need {
                        self.put_scalar_fixed(&info, &held);
                        have = 0;
                    }
                }
                _ => unreachable!("packed fields are numeric"),
            }
            if !self.sink.status().is_ok() {
                self.state = State::PackedBody { info, end, have, buf: held };
                return Ok(Flow::Continue);
            }
        }
    }

    /// Delivers a varint-sourced value converted per the descriptor type.
    fn put_scalar_varint(&mut self, info: &FieldInfo, raw: u64) {
        use DescriptorType::*;
        let sel = info.value_sel();
        match info.dtype {
            Int64 => self.sink.put_i64(sel, raw as i64),
            Uint64 => self.sink.put_u64(sel, raw),
            Int32 | Enum => self.sink.put_i32(sel, raw as i32),
            Uint32 => self.sink.put_u32(sel, raw as u32),
            Bool => self.sink.put_bool(sel, raw != 0),
            Sint32 => self.sink.put_i32(sel, zigzag_decode(raw as u32 as u64) as i32),
            Sint64 => self.sink.put_i64(sel, zigzag_decode(raw)),
            _ => unreachable!("field dispatched as varint"),
        };
    }

    /// Delivers a fixed-width value converted per the descriptor type.
    fn put_scalar_fixed(&mut self, info: &FieldInfo, held: &[u8; 8]) {
        use DescriptorType::*;
        let sel = info.value_sel();
        let four: [u8; 4] = held[..4].try_into().expect("four bytes");
        match info.dtype {
            Fixed64 => self.sink.put_u64(sel, u64::from_le_bytes(*held)),
            Sfixed64 => self.sink.put_i64(sel, i64::from_le_bytes(*held)),
            Double => self.sink.put_f64(sel, f64::from_le_bytes(*held)),
            Fixed32 => self.sink.put_u32(sel, u32::from_le_bytes(four)),
            Sfixed32 => self.sink.put_i32(sel, i32::from_le_bytes(four)),
            Float => self.sink.put_f32(sel, f32::from_le_bytes(four)),
            _ => unreachable!("field dispatched as fixed"),
        };
    }
}
