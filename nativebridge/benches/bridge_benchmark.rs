//! Crossing costs of the bridge against the in-process host:
//!   cargo bench --bench bridge_benchmark

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use nativebridge::{
    Action, Int32, Object, String, Vector3, demo,
    host::{self, HostConfig, Session},
};

fn boot() -> Session {
    let config = HostConfig {
        base_script_slot_size: demo::BASE_SCRIPT_SLOT_SIZE,
        ..HostConfig::default()
    };
    let session = host::boot(&config, nativebridge::Init);
    if let Some(exception) = host::take_exception() {
        panic!("Init raised {exception}");
    }
    session
}

fn bench_box_unbox(c: &mut Criterion) {
    let _session = boot();
    c.bench_function("box_unbox_int32", |b| {
        b.iter(|| {
            let object = Int32(black_box(42)).to_object().expect("box");
            black_box(Int32::try_from(&object).expect("unbox"))
        })
    });
}

fn bench_mirror_clone(c: &mut Criterion) {
    let _session = boot();
    let text = String::new("hello").expect("StringNew");
    c.bench_function("string_clone_drop", |b| {
        b.iter(|| {
            let copy = black_box(text.clone());
            let object = Object::from(&copy);
            black_box(object.handle())
        })
    });
}

fn bench_trampoline(c: &mut Criterion) {
    let _session = boot();
    let v = Vector3::new(1.0, 2.0, 2.0);
    c.bench_function("vector3_magnitude", |b| {
        b.iter(|| black_box(v).magnitude().expect("magnitude"))
    });
}

fn bench_virtual_dispatch(c: &mut Criterion) {
    let _session = boot();
    let script = host::create_base_script().expect("spawn");
    c.bench_function("managed_update_to_native", |b| {
        b.iter(|| host::update(black_box(script)).expect("update"))
    });
    host::destroy_base_script(script).expect("destroy");
}

fn bench_native_action(c: &mut Criterion) {
    let _session = boot();
    let action = Action::new(|| Ok(())).expect("action");
    c.bench_function("native_action_via_managed_invoke", |b| {
        b.iter(|| host::invoke(black_box(action.handle())).expect("invoke"))
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(50);
    targets = bench_box_unbox, bench_mirror_clone, bench_trampoline,
        bench_virtual_dispatch, bench_native_action
}
criterion_main!(benches);
