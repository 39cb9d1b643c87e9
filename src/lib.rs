//! A minimalist streaming protocol-buffers engine.
//!
//! Schema defs are built mutable, frozen into an immutable pool, and a
//! handler plan derived from them drives the decoder: bytes go in, typed
//! callbacks come out (message start/end, field values, string chunks,
//! sub-message and sequence boundaries). There is no in-memory message
//! tree; unknown fields are consumed and discarded. Input may arrive in
//! arbitrarily fragmented chunks and the decoder suspends and resumes at
//! any byte boundary.

pub mod decoding;
pub mod defs;
pub mod error;
pub mod handlers;
pub mod sink;
pub mod wire;

pub use decoding::{DecodePlan, Decoder, DEFAULT_MAX_NESTING};
pub use defs::{DefPool, DescriptorType, FieldType, IntegerFormat, Label, SubDef, Value};
pub use error::{DefError, Error, PipelineStatus};
pub use handlers::{Closure, HandlerData, HandlerKind, HandlerSet, HandlersId, Selector};
pub use sink::Sink;

/// Decodes a complete in-memory buffer.
#[must_use = "the decode may have failed"]
pub fn decode_flat<const MAX_NESTING: usize>(
    plan: &DecodePlan,
    top_closure: Closure,
    buf: &[u8],
) -> Result<(), Error> {
    let mut decoder = Decoder::<MAX_NESTING>::new(plan, top_closure);
    let mut fed = 0;
    while fed < buf.len() {
        let n = decoder.feed(&buf[fed..]);
        fed += n;
        if let Some(err) = decoder.status().error() {
            return Err(err.clone());
        }
        if n == 0 {
            // A stalled string handler; finish reports the open element.
            break;
        }
    }
    decoder.finish()
}

pub fn decode_from_bufread<const MAX_NESTING: usize>(
    plan: &DecodePlan,
    top_closure: Closure,
    reader: &mut impl std::io::BufRead,
) -> anyhow::Result<()> {
    let mut decoder = Decoder::<MAX_NESTING>::new(plan, top_closure);
    loop {
        let buffer = reader.fill_buf()?;
        if buffer.is_empty() {
            break;
        }
        let n = decoder.feed(buffer);
        if let Some(err) = decoder.status().error() {
            return Err(err.clone().into());
        }
        if n == 0 {
            anyhow::bail!("string handler made no progress");
        }
        reader.consume(n);
    }
    decoder.finish()?;
    Ok(())
}

pub fn decode_from_read<const MAX_NESTING: usize>(
    plan: &DecodePlan,
    top_closure: Closure,
    reader: &mut impl std::io::Read,
) -> anyhow::Result<()> {
    let mut buf_reader = std::io::BufReader::new(reader);
    decode_from_bufread::<MAX_NESTING>(plan, top_closure, &mut buf_reader)
}

pub async fn decode_from_async_bufread<const MAX_NESTING: usize>(
    plan: &DecodePlan,
    top_closure: Closure,
    reader: &mut (impl futures::io::AsyncBufRead + Unpin),
) -> anyhow::Result<()> {
    use futures::io::AsyncBufReadExt;

    let mut decoder = Decoder::<MAX_NESTING>::new(plan, top_closure);
    loop {
        let buffer = reader.fill_buf().await?;
        if buffer.is_empty() {
            break;
        }
        let n = decoder.feed(buffer);
        if let Some(err) = decoder.status().error() {
            return Err(err.clone().into());
        }
        if n == 0 {
            anyhow::bail!("string handler made no progress");
        }
        reader.consume_unpin(n);
    }
    decoder.finish()?;
    Ok(())
}

pub async fn decode_from_async_read<const MAX_NESTING: usize>(
    plan: &DecodePlan,
    top_closure: Closure,
    reader: &mut (impl futures::io::AsyncRead + Unpin),
) -> anyhow::Result<()> {
    let mut buf_reader = futures::io::BufReader::new(reader);
    decode_from_async_bufread::<MAX_NESTING>(plan, top_closure, &mut buf_reader).await
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fmt::Write as _;

    use super::*;
    use crate::wire::{encode_tag, encode_varint, WireType};

    // Handlers append a compact trace so tests can assert on ordering.
    struct Trace(RefCell<String>);

    fn trace(d: HandlerData) -> &'static Trace {
        unsafe { &*(d as *const Trace) }
    }

    fn startmsg(_c: Closure, d: HandlerData) -> bool {
        trace(d).0.borrow_mut().push('<');
        true
    }

    fn endmsg(_c: Closure, d: HandlerData) -> bool {
        trace(d).0.borrow_mut().push('>');
        true
    }

    fn value_u64(_c: Closure, d: HandlerData, v: u64) -> bool {
        write!(trace(d).0.borrow_mut(), "[{}]", v).unwrap();
        true
    }

    fn startstr(c: Closure, d: HandlerData, hint: u64) -> Option<Closure> {
        write!(trace(d).0.borrow_mut(), "({}:", hint).unwrap();
        Some(c)
    }

    fn strchunk(_c: Closure, d: HandlerData, bytes: &[u8]) -> Option<usize> {
        trace(d)
            .0
            .borrow_mut()
            .push_str(&String::from_utf8_lossy(bytes));
        Some(bytes.len())
    }

    fn endstr(_c: Closure, d: HandlerData) -> bool {
        trace(d).0.borrow_mut().push(')');
        true
    }

    fn build_plan(out: &Trace) -> DecodePlan {
        let data = out as *const Trace as HandlerData;
        let mut pool = DefPool::new();
        let m = pool.add_message("Record").unwrap();
        pool.add_field(m, "count", 1, Label::Optional, DescriptorType::Uint64)
            .unwrap();
        pool.add_field(m, "name", 2, Label::Optional, DescriptorType::String)
            .unwrap();
        let pool = pool.freeze().unwrap();
        let m = pool.message_by_name("Record").unwrap();
        let count = pool.message(m).field_by_number(1).unwrap();
        let name = pool.message(m).field_by_number(2).unwrap();
        let mut set = HandlerSet::new(pool);
        let t = set.add_table(m).unwrap();
        set.set_start_message_handler(t, startmsg, data).unwrap();
        set.set_end_message_handler(t, endmsg, data).unwrap();
        set.set_uint64_handler(t, count, value_u64, data).unwrap();
        set.set_start_string_handler(t, name, startstr, data).unwrap();
        set.set_string_handler(t, name, strchunk, data).unwrap();
        set.set_end_string_handler(t, name, endstr, data).unwrap();
        DecodePlan::new(set.freeze(), t, false)
    }

    fn record_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        encode_tag(1, WireType::Varint, &mut buf);
        encode_varint(42, &mut buf);
        encode_tag(2, WireType::Delimited, &mut buf);
        encode_varint(5, &mut buf);
        buf.extend_from_slice(b"hello");
        buf
    }

    #[test]
    fn decode_flat_roundtrip() {
        let out = Box::new(Trace(RefCell::new(String::new())));
        let plan = build_plan(&out);
        decode_flat::<64>(&plan, std::ptr::null_mut(), &record_bytes()).unwrap();
        assert_eq!(out.0.borrow().as_str(), "<[42](5:hello)>");
    }

    #[test]
    fn decode_from_read_small_buffer() {
        let out = Box::new(Trace(RefCell::new(String::new())));
        let plan = build_plan(&out);
        let bytes = record_bytes();
        // A two-byte reader buffer forces many suspensions.
        let mut reader = std::io::BufReader::with_capacity(2, bytes.as_slice());
        decode_from_bufread::<64>(&plan, std::ptr::null_mut(), &mut reader).unwrap();
        assert_eq!(out.0.borrow().as_str(), "<[42](5:hello)>");
    }

    #[test]
    fn decode_from_async_bufread_matches() {
        let out = Box::new(Trace(RefCell::new(String::new())));
        let plan = build_plan(&out);
        let bytes = record_bytes();
        let mut reader = futures::io::BufReader::with_capacity(3, bytes.as_slice());
        futures::executor::block_on(decode_from_async_bufread::<64>(
            &plan,
            std::ptr::null_mut(),
            &mut reader,
        ))
        .unwrap();
        assert_eq!(out.0.borrow().as_str(), "<[42](5:hello)>");
    }

    #[test]
    fn decode_flat_reports_truncation() {
        let out = Box::new(Trace(RefCell::new(String::new())));
        let plan = build_plan(&out);
        let mut bytes = record_bytes();
        bytes.pop();
        assert_eq!(
            decode_flat::<64>(&plan, std::ptr::null_mut(), &bytes),
            Err(Error::Truncated)
        );
    }
}
