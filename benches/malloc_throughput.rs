use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use segheap::{Config, Heap, VecArena};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// segheap alloc/free throughput.
fn segheap_malloc_free(heap: &mut Heap, size: usize) {
  for _ in 0..OPS {
    let p = heap.allocate(size);
    black_box(p);
    heap.free(p);
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    let mut heap = Heap::init(VecArena::default()).unwrap();
    group.bench_with_input(BenchmarkId::new("segheap", size), &size, |b, &size| {
      b.iter(|| segheap_malloc_free(&mut heap, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

/// Interleaved lifetimes: keeps `WINDOW` blocks live, freeing the oldest each step.
fn benchmark_fit_candidates(c: &mut Criterion) {
  const WINDOW: usize = 256;
  let mut group = c.benchmark_group("fit_candidates");
  group.throughput(Throughput::Elements(OPS));

  for cap in [1, 8, 32] {
    group.bench_with_input(BenchmarkId::new("window", cap), &cap, |b, &cap| {
      b.iter(|| {
        let config = Config::new().fit_candidates(cap);
        let mut heap = Heap::with_config(VecArena::default(), config).unwrap();
        let mut live = std::collections::VecDeque::with_capacity(WINDOW);
        for i in 0..OPS as usize {
          if live.len() == WINDOW {
            heap.free(live.pop_front());
          }
          live.push_back(heap.allocate(16 + (i * 97) % 2000));
        }
        black_box(heap.stats())
      })
    });
  }

  group.finish();
}

/// Repeated growth of one block, the case realloc slack targets.
fn benchmark_realloc_growth(c: &mut Criterion) {
  let mut group = c.benchmark_group("realloc_growth");

  for slack in [0, 256, 1024] {
    group.bench_with_input(BenchmarkId::new("slack", slack), &slack, |b, &slack| {
      b.iter(|| {
        let config = Config::new().realloc_slack(slack);
        let mut heap = Heap::with_config(VecArena::default(), config).unwrap();
        let mut p = heap.allocate(8);
        heap.allocate(8);
        for size in (16..64 * 1024).step_by(24) {
          p = heap.resize(p, size);
        }
        black_box(heap.stats())
      })
    });
  }

  group.finish();
}

criterion_group!(
  benches,
  benchmark_malloc_throughput,
  benchmark_fit_candidates,
  benchmark_realloc_growth
);
criterion_main!(benches);
