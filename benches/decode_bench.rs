use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use protopush::decoding::{DecodePlan, Decoder};
use protopush::defs::{DefPool, DescriptorType, Label, SubDef};
use protopush::handlers::{Closure, HandlerData, HandlerSet};
use protopush::wire::{encode_tag, encode_varint, WireType};

fn count_u64(c: Closure, _d: HandlerData, _v: u64) -> bool {
    unsafe { *(c as *mut u64) += 1 };
    true
}

fn count_f64(c: Closure, _d: HandlerData, _v: f64) -> bool {
    unsafe { *(c as *mut u64) += 1 };
    true
}

fn sink_str(_c: Closure, _d: HandlerData, bytes: &[u8]) -> Option<usize> {
    Some(bytes.len())
}

fn start(c: Closure, _d: HandlerData) -> Option<Closure> {
    Some(c)
}

fn build_plan() -> DecodePlan {
    let mut pool = DefPool::new();
    let m = pool.add_message("Sample").unwrap();
    pool.add_field(m, "id", 1, Label::Optional, DescriptorType::Uint64)
        .unwrap();
    pool.add_field(m, "values", 2, Label::Repeated, DescriptorType::Double)
        .unwrap();
    pool.add_field(m, "payload", 3, Label::Optional, DescriptorType::Bytes)
        .unwrap();
    let child = pool
        .add_field(m, "child", 4, Label::Optional, DescriptorType::Message)
        .unwrap();
    pool.set_subdef(child, SubDef::Message(m)).unwrap();
    let pool = pool.freeze().unwrap();
    let m = pool.message_by_name("Sample").unwrap();
    let id = pool.message(m).field_by_number(1).unwrap();
    let values = pool.message(m).field_by_number(2).unwrap();
    let payload = pool.message(m).field_by_number(3).unwrap();
    let child = pool.message(m).field_by_number(4).unwrap();
    let mut set = HandlerSet::new(pool);
    let t = set.add_table(m).unwrap();
    set.set_uint64_handler(t, id, count_u64, std::ptr::null()).unwrap();
    set.set_double_handler(t, values, count_f64, std::ptr::null()).unwrap();
    set.set_string_handler(t, payload, sink_str, std::ptr::null()).unwrap();
    set.set_start_submessage_handler(t, child, start, std::ptr::null()).unwrap();
    set.set_subhandlers(t, child, t).unwrap();
    DecodePlan::new(set.freeze(), t, false)
}

fn build_input() -> Vec<u8> {
    let mut inner = Vec::new();
    encode_tag(1, WireType::Varint, &mut inner);
    encode_varint(123456789, &mut inner);
    // Packed run of 32 doubles.
    encode_tag(2, WireType::Delimited, &mut inner);
    encode_varint(32 * 8, &mut inner);
    for i in 0..32 {
        inner.extend_from_slice(&(i as f64).to_le_bytes());
    }
    encode_tag(3, WireType::Delimited, &mut inner);
    encode_varint(256, &mut inner);
    inner.extend_from_slice(&[0xab; 256]);

    let mut buf = Vec::new();
    for _ in 0..16 {
        encode_tag(4, WireType::Delimited, &mut buf);
        encode_varint(inner.len() as u64, &mut buf);
        buf.extend_from_slice(&inner);
    }
    buf
}

fn bench_decode(c: &mut Criterion) {
    let plan = build_plan();
    let data = build_input();
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("flat", |b| {
        b.iter(|| {
            let mut hits = 0u64;
            let mut decoder = Decoder::<64>::new(&plan, &mut hits as *mut u64 as Closure);
            decoder.feed(black_box(&data));
            decoder.finish().unwrap();
            black_box(hits)
        })
    });

    group.bench_function("chunked64", |b| {
        b.iter(|| {
            let mut hits = 0u64;
            let mut decoder = Decoder::<64>::new(&plan, &mut hits as *mut u64 as Closure);
            for chunk in black_box(&data).chunks(64) {
                decoder.feed(chunk);
            }
            decoder.finish().unwrap();
            black_box(hits)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
