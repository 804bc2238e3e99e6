//! Wire protocol hot paths.

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Cursor;
use std::time::Duration;
use tether_core::wire::{Request, Scanner, Token};

fn bench_scan_mem_read_reply(c: &mut Criterion) {
    let mut reply = String::from("NO_ERROR");
    for byte in 0..64u32 {
        reply.push_str(&format!(", {byte:#x}"));
    }
    reply.push('\n');
    let reply = reply.into_bytes();

    c.bench_function("scan_64_byte_reply", |b| {
        b.iter(|| {
            let mut scanner = Scanner::new(4096, Duration::from_secs(1));
            let mut source = Cursor::new(reply.as_slice());
            let mut tokens = 0;
            while scanner.next_token(&mut source) != Token::EndOfInput {
                tokens += 1;
            }
            black_box(tokens)
        })
    });
}

fn bench_encode_mem_write(c: &mut Criterion) {
    let request = Request::MemWrite { address: 0x2000_0000, data: (0..64).collect() };
    c.bench_function("encode_mem_write", |b| b.iter(|| black_box(request.encode())));
}

fn bench_parse_request(c: &mut Criterion) {
    let line = Request::RegsWrite { mask: tether_core::RegisterMask::new(0xffff), values: (0..16).collect() }
        .to_string();
    c.bench_function("parse_regs_write", |b| b.iter(|| black_box(line.parse::<Request>())));
}

criterion_group!(benches, bench_scan_mem_read_reply, bench_encode_mem_write, bench_parse_request);
criterion_main!(benches);
