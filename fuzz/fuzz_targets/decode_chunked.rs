#![no_main]

use std::sync::OnceLock;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use protopush::decoding::{DecodePlan, Decoder};
use protopush::defs::{DefPool, DescriptorType, Label, SubDef};
use protopush::handlers::{Closure, HandlerData, HandlerSet};

#[derive(Arbitrary, Debug)]
struct ChunkedInput {
    data: Vec<u8>,
    chunk_sizes: Vec<u8>,
}

fn value_i64(_c: Closure, _d: HandlerData, _v: i64) -> bool {
    true
}

fn value_f32(_c: Closure, _d: HandlerData, _v: f32) -> bool {
    true
}

fn strchunk(_c: Closure, _d: HandlerData, bytes: &[u8]) -> Option<usize> {
    Some(bytes.len())
}

fn start(c: Closure, _d: HandlerData) -> Option<Closure> {
    Some(c)
}

fn plan() -> &'static DecodePlan {
    static PLAN: OnceLock<DecodePlan> = OnceLock::new();
    PLAN.get_or_init(|| {
        let mut pool = DefPool::new();
        let m = pool.add_message("Fuzz").unwrap();
        pool.add_field(m, "a", 1, Label::Optional, DescriptorType::Sint64)
            .unwrap();
        pool.add_field(m, "b", 2, Label::Repeated, DescriptorType::Float)
            .unwrap();
        pool.add_field(m, "s", 3, Label::Repeated, DescriptorType::Bytes)
            .unwrap();
        let child = pool
            .add_field(m, "child", 4, Label::Optional, DescriptorType::Message)
            .unwrap();
        pool.set_subdef(child, SubDef::Message(m)).unwrap();
        let grp = pool
            .add_field(m, "grp", 5, Label::Repeated, DescriptorType::Group)
            .unwrap();
        pool.set_subdef(grp, SubDef::Message(m)).unwrap();
        let pool = pool.freeze().unwrap();
        let m = pool.message_by_name("Fuzz").unwrap();
        let a = pool.message(m).field_by_number(1).unwrap();
        let b = pool.message(m).field_by_number(2).unwrap();
        let s = pool.message(m).field_by_number(3).unwrap();
        let child = pool.message(m).field_by_number(4).unwrap();
        let grp = pool.message(m).field_by_number(5).unwrap();
        let mut set = HandlerSet::new(pool);
        let t = set.add_table(m).unwrap();
        set.set_int64_handler(t, a, value_i64, std::ptr::null()).unwrap();
        set.set_float_handler(t, b, value_f32, std::ptr::null()).unwrap();
        set.set_string_handler(t, s, strchunk, std::ptr::null()).unwrap();
        set.set_start_submessage_handler(t, child, start, std::ptr::null())
            .unwrap();
        set.set_subhandlers(t, child, t).unwrap();
        set.set_subhandlers(t, grp, t).unwrap();
        DecodePlan::new(set.freeze(), t, false)
    })
}

fuzz_target!(|input: ChunkedInput| {
    let mut decoder = Decoder::<32>::new(plan(), std::ptr::null_mut());

    let mut pos = 0;
    let mut chunk_idx = 0;

    while pos < input.data.len() {
        let size = input
            .chunk_sizes
            .get(chunk_idx)
            .copied()
            .unwrap_or(16)
            .max(1) as usize;
        let end = (pos + size).min(input.data.len());
        let consumed = decoder.feed(&input.data[pos..end]);

        if decoder.status().error().is_some() {
            return; // Decode error is fine for fuzz testing.
        }
        if consumed == 0 {
            break;
        }

        pos += consumed;
        chunk_idx += 1;
    }

    let _ = decoder.finish();
});
