use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use harmoniq_module_db::{
    BoundedQueue, DynamicLinker, EntryPoints, LinkError, LoadedUnit, ModuleDatabase,
    ModuleDbConfig, ModuleRegistration, ModuleSource, ModuleType, StaticProperties,
    STATIC_PROPERTIES_SUFFIX,
};

unsafe extern "C" fn bench_props(props: *mut StaticProperties) -> i32 {
    (*props).version_major = 1;
    0
}

unsafe extern "C" fn bench_init(_instance: *mut c_void) -> i32 {
    0
}

/// Linker whose units resolve every symbol to the bench entry points.
struct InProcessLinker;

struct InProcessUnit(PathBuf);

impl DynamicLinker for InProcessLinker {
    fn open(&self, path: &Path) -> Result<Box<dyn LoadedUnit>, LinkError> {
        Ok(Box::new(InProcessUnit(path.to_path_buf())))
    }
}

impl LoadedUnit for InProcessUnit {
    fn symbol(&self, name: &str) -> Result<*const c_void, LinkError> {
        if name.ends_with(STATIC_PROPERTIES_SUFFIX) {
            Ok(bench_props as *const c_void)
        } else {
            Ok(bench_init as *const c_void)
        }
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

fn database(modules: u32, dynamic: bool) -> ModuleDatabase {
    let db = ModuleDatabase::builder(ModuleDbConfig::default())
        .linker(Arc::new(InProcessLinker))
        .build()
        .expect("module database");
    for id in 0..modules {
        let source = if dynamic {
            ModuleSource::dynamic(format!("/lib/bench_{id}.so"), format!("bench_{id}"))
        } else {
            ModuleSource::Static(EntryPoints::new(bench_props, bench_init))
        };
        db.register(ModuleRegistration::new(ModuleType::GENERIC, id, source))
            .expect("register");
    }
    db
}

fn bounded_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounded_queue");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("push_pop_single_thread", |b| {
        let queue = BoundedQueue::new(64);
        b.iter(|| {
            for value in 0..64u32 {
                queue.push(value);
            }
            for _ in 0..64 {
                criterion::black_box(queue.pop());
            }
        });
    });

    group.bench_function("producer_consumer_4k", |b| {
        b.iter(|| {
            let queue = Arc::new(BoundedQueue::new(64));
            let consumer = {
                let queue = Arc::clone(&queue);
                thread::spawn(move || (0..4096).map(|_| queue.pop()).sum::<u64>())
            };
            for value in 0..4096u64 {
                queue.push(value);
            }
            criterion::black_box(consumer.join().expect("consumer"));
        });
    });

    group.finish();
}

fn handle_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_batches");
    group.measurement_time(Duration::from_secs(5));

    for modules in [8u32, 64] {
        let ids: Vec<u32> = (0..modules).collect();

        let db = database(modules, false);
        group.bench_with_input(BenchmarkId::new("static", modules), &ids, |b, ids| {
            b.iter(|| {
                let mut batch = db.request_handles(ids);
                db.release_handles(&mut batch);
            });
        });

        let db = database(modules, true);
        group.bench_with_input(BenchmarkId::new("dynamic_cold", modules), &ids, |b, ids| {
            b.iter(|| {
                let mut batch = db.request_handles(ids);
                db.release_handles(&mut batch);
            });
        });

        let mut pinned = db.request_handles(&ids);
        group.bench_with_input(BenchmarkId::new("dynamic_warm", modules), &ids, |b, ids| {
            b.iter(|| {
                let mut batch = db.request_handles(ids);
                db.release_handles(&mut batch);
            });
        });
        db.release_handles(&mut pinned);
    }

    group.finish();
}

criterion_group!(benches, bounded_queue, handle_batches);
criterion_main!(benches);
