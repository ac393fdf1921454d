// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::hint::black_box;
use std::ptr;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use delay_memcpy::test_utils::AlignedBuffer;
use delay_memcpy::{PageSize, delay_memcpy, initialize};

/// Touches one byte on each of the first `pages` pages of `buffer`.
fn touch(buffer: &AlignedBuffer, page: usize, pages: usize) {
    for offset in (0..pages).map(|n| n * page) {
        black_box(buffer.read(offset..offset + 1));
    }
}

fn bench_copies(c: &mut Criterion) {
    initialize().unwrap();
    let page = PageSize::system().unwrap().get();

    let mut group = c.benchmark_group("copy");
    for pages in [1, 4, 16] {
        let len = pages * page;
        let src = AlignedBuffer::new(len, page);
        let dst = AlignedBuffer::new(len, page);
        src.fill(0);

        group.bench_with_input(BenchmarkId::new("eager", pages), &pages, |b, &pages| {
            b.iter(|| {
                // Safety: distinct mappings of `len` bytes each
                unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), len) };
                touch(&dst, page, pages);
            });
        });

        group.bench_with_input(BenchmarkId::new("deferred", pages), &pages, |b, &pages| {
            b.iter(|| {
                // Safety: both mappings outlive the copy and every page is touched right away
                unsafe { delay_memcpy(dst.as_mut_ptr(), src.as_ptr(), len).unwrap() };
                touch(&dst, page, pages);
            });
        });

        group.bench_with_input(
            BenchmarkId::new("deferred, first page only", pages),
            &pages,
            |b, &pages| {
                b.iter_custom(|iters| {
                    let mut elapsed = Duration::ZERO;
                    for _ in 0..iters {
                        let start = Instant::now();
                        // Safety: both mappings outlive the copy, the remaining pages are
                        // touched before the next iteration
                        unsafe { delay_memcpy(dst.as_mut_ptr(), src.as_ptr(), len).unwrap() };
                        touch(&dst, page, 1);
                        elapsed += start.elapsed();

                        touch(&dst, page, pages);
                    }
                    elapsed
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_copies);
criterion_main!(benches);
