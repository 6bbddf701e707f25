//! End-to-end runs against the in-process host.

use std::cell::Cell;

use crate::{
    Action, BaseScript, BaseScriptBase, BridgeError, ExceptionClass, Int32,
    ManagedException, NativeCoreFunctions, NativeGeneratedFunctions,
    Object, PluginDescriptor, Result, String, Subclass, SubclassFactory,
    IComparable, current, entry,
    host::{self, HostConfig},
};

thread_local! {
    static MAIN_RAN: Cell<bool> = const { Cell::new(false) };
    static FAULTY_UPDATES: Cell<u32> = const { Cell::new(0) };
    static BREACH_ON_CONSTRUCT: Cell<bool> = const { Cell::new(false) };
}

fn recording_main(_: &mut [u8], _: bool) -> Result<()> {
    MAIN_RAN.with(|ran| ran.set(true));
    Ok(())
}

unsafe extern "C" fn init_recording(
    memory: *mut u8,
    memory_size: i32,
    init_mode: u8,
    core_out: *mut NativeCoreFunctions,
    generated_out: *mut NativeGeneratedFunctions,
) {
    const PLUGIN: PluginDescriptor = PluginDescriptor::new(recording_main);
    // SAFETY: forwarded from the host
    unsafe { entry::init(&PLUGIN, memory, memory_size, init_mode, core_out, generated_out) }
}

/// Updates once, then overheats.
struct Faulty {
    base: BaseScriptBase,
    updates: u32,
}

impl BaseScript for Faulty {
    fn base(&self) -> &BaseScriptBase {
        &self.base
    }

    fn update(&mut self) -> Result<()> {
        self.updates += 1;
        FAULTY_UPDATES.with(|count| count.set(count.get() + 1));
        if self.updates > 1 {
            return Err(BridgeError::native("turret overheated"));
        }
        Ok(())
    }
}

impl Subclass for Faulty {
    fn construct(base: BaseScriptBase) -> Self {
        Faulty { base, updates: 0 }
    }
}

/// Panics in its constructor while the breach flag is set, and always
/// in `update`.
struct Reactor {
    base: BaseScriptBase,
}

impl BaseScript for Reactor {
    fn base(&self) -> &BaseScriptBase {
        &self.base
    }

    fn update(&mut self) -> Result<()> {
        panic!("core temperature {} exceeded", 9000);
    }
}

impl Subclass for Reactor {
    fn construct(base: BaseScriptBase) -> Self {
        if BREACH_ON_CONSTRUCT.with(Cell::get) {
            panic!("containment breach");
        }
        Reactor { base }
    }
}

#[test]
fn boxed_integer_comes_back_and_leaves_nothing_referenced() {
    let _session = host::boot_default();
    let context = current().expect("booted");

    let object = Int32(42).to_object().expect("box");
    let handle = object.handle();
    assert_eq!(context.objects.count(handle), 1);
    assert_eq!(i32::from(Int32::try_from(&object).expect("unbox")), 42);

    drop(object);
    assert_eq!(context.objects.count(handle), 0);
    assert_eq!(host::released_objects(), vec![handle]);
}

#[test]
fn copies_of_a_string_release_their_handle_exactly_once() {
    let _session = host::boot_default();
    let context = current().expect("booted");

    let hello = String::new("hello").expect("StringNew");
    let handle = hello.handle();
    let copies = [hello.clone(), hello.clone(), hello.clone()];
    assert_eq!(context.objects.count(handle), 4);

    drop(copies);
    assert!(host::released_objects().is_empty());
    drop(hello);
    assert_eq!(host::released_objects(), vec![handle]);
}

#[test]
fn base_conversions_share_one_refcount() {
    let _session = host::boot_default();
    let context = current().expect("booted");

    let text = String::new("shared").expect("StringNew");
    let handle = text.handle();
    let object = Object::from(&text);
    let comparable = IComparable::from(&text);
    assert_eq!(object.handle(), handle);
    assert_eq!(comparable.handle(), handle);
    assert_eq!(context.objects.count(handle), 3);

    let again = String::acquire(handle);
    drop(text);
    assert_eq!(context.objects.count(handle), 3, "second mirror keeps it live");
    assert_eq!(again.to_rust_string().expect("utf8"), "shared");

    drop((object, comparable, again));
    assert_eq!(host::released_objects(), vec![handle]);
}

#[test]
fn null_reference_arrives_typed_with_the_installed_handle() {
    let _session = host::boot_default();

    let error = Object::null()
        .to_managed_string()
        .expect_err("ToString on null");
    let exception = error.managed().expect("managed");
    assert!(matches!(exception, ManagedException::NullReference(_)));

    let installed = host::exception_at(exception.handle()).expect("live exception");
    assert_eq!(installed.class, ExceptionClass::NullReference);
    assert_eq!(exception.message().expect("message"), installed.message);
}

#[test]
fn rethrown_exceptions_keep_their_managed_identity() {
    let _session = host::boot_default();

    let original = host::new_exception(ExceptionClass::InvalidOperation, "boom");
    let throwing = Action::acquire(host::new_rethrowing_action(original));
    let observed = std::rc::Rc::new(Cell::new(None));
    let seen = observed.clone();
    let relay = Action::new(move || {
        let error = throwing.invoke().expect_err("managed delegate throws");
        seen.set(error.managed().map(ManagedException::class));
        Err(error)
    })
    .expect("action");

    let exception = host::invoke(relay.handle()).expect_err("rethrown");
    assert_eq!(observed.get(), Some(ExceptionClass::InvalidOperation));
    assert_eq!(exception.object, original);
    assert_eq!(exception.class, ExceptionClass::InvalidOperation);
    assert_eq!(exception.message, "boom");
}

#[test]
fn managed_update_dispatches_to_the_native_override() {
    let _session = host::boot_with_script::<Faulty>();
    FAULTY_UPDATES.with(|count| count.set(0));

    let script = host::create_base_script().expect("NewBaseScript");
    host::update(script).expect("first update");
    assert_eq!(FAULTY_UPDATES.with(Cell::get), 1);
    assert_eq!(host::managed_updates(script), Some(0), "base body not run");

    let exception = host::update(script).expect_err("overheats");
    assert_eq!(FAULTY_UPDATES.with(Cell::get), 2);
    assert_eq!(exception.class, ExceptionClass::Exception);
    assert_eq!(exception.message, "turret overheated");

    host::destroy_base_script(script).expect("destroy");
    assert_eq!(host::companion_cpp_handle(script), None);
    assert_eq!(host::released_base_scripts(), vec![script]);
}

#[test]
fn init_with_one_byte_too_few_raises_and_runs_nothing() {
    MAIN_RAN.with(|ran| ran.set(false));
    let mut config = HostConfig::default();
    config.memory_size = Some(config.required_memory() - 1);

    let _session = host::boot(&config, init_recording);
    let exception = host::take_exception().expect("installed exception");
    assert_eq!(exception.class, ExceptionClass::Exception);
    assert!(exception.message.contains("too low"), "{}", exception.message);
    assert!(!MAIN_RAN.with(Cell::get));
    assert!(crate::try_current().is_none());
}

#[test]
fn exact_memory_size_is_enough() {
    MAIN_RAN.with(|ran| ran.set(false));
    let mut config = HostConfig::default();
    config.memory_size = Some(config.required_memory());

    let _session = host::boot_checked(&config, init_recording);
    assert!(MAIN_RAN.with(Cell::get));
    let context = current().expect("booted");
    // SAFETY: the plugin is not running
    assert!(unsafe { context.plugin_memory() }.is_empty());
}

#[test]
fn init_aligns_working_memory_in_a_skewed_region() {
    MAIN_RAN.with(|ran| ran.set(false));
    let aligned = HostConfig::default().required_memory();
    let config = HostConfig {
        skew: 8,
        ..HostConfig::default()
    };
    assert!(config.required_memory() < aligned + crate::SECTION_ALIGN);

    let _session = host::boot_checked(&config, init_recording);
    assert!(MAIN_RAN.with(Cell::get));
    let context = current().expect("booted");

    let hits = std::rc::Rc::new(Cell::new(0));
    let counter = hits.clone();
    let action = Action::new(move || {
        counter.set(counter.get() + 1);
        Ok(())
    })
    .expect("action");
    host::invoke(action.handle()).expect("through the managed side");
    assert_eq!(hits.get(), 1);

    let text = String::new("skewed").expect("StringNew");
    assert_eq!(context.objects.count(text.handle()), 1);
}

#[test]
fn skewed_region_one_byte_short_is_too_low() {
    let mut config = HostConfig {
        skew: 8,
        ..HostConfig::default()
    };
    config.memory_size = Some(config.required_memory() - 1);

    let _session = host::boot(&config, init_recording);
    let exception = host::take_exception().expect("installed exception");
    assert!(exception.message.contains("too low"), "{}", exception.message);
    assert!(crate::try_current().is_none());
}

#[test]
fn panicking_constructor_returns_both_slots_and_the_handle() {
    let _session = host::boot_with_script::<Reactor>();
    let context = current().expect("booted");
    let free_objects = context.base_script_objects.free_len();
    let free_pointers = context.base_script_pointers.free_len();

    BREACH_ON_CONSTRUCT.with(|flag| flag.set(true));
    let exception = host::create_base_script().expect_err("constructor panics");
    BREACH_ON_CONSTRUCT.with(|flag| flag.set(false));

    assert_eq!(exception.class, ExceptionClass::Exception);
    assert_eq!(exception.message, "containment breach");
    assert_eq!(context.base_script_pointers.occupied_len(), 0);
    assert_eq!(context.base_script_pointers.free_len(), free_pointers);
    assert_eq!(context.base_script_objects.free_len(), free_objects);
    let released = host::released_base_scripts();
    assert_eq!(released.len(), 1);
    assert_eq!(context.objects.count(released[0]), 0);
}

#[test]
fn panicking_override_arrives_as_a_managed_exception() {
    let _session = host::boot_with_script::<Reactor>();
    let context = current().expect("booted");
    let free_objects = context.base_script_objects.free_len();

    let script = host::create_base_script().expect("NewBaseScript");
    let exception = host::update(script).expect_err("update panics");
    assert_eq!(exception.class, ExceptionClass::Exception);
    assert_eq!(exception.message, "core temperature 9000 exceeded");

    host::update(script).expect_err("still connected after the panic");
    host::destroy_base_script(script).expect("destroy");
    assert_eq!(context.base_script_pointers.occupied_len(), 0);
    assert_eq!(context.base_script_objects.free_len(), free_objects);
}

#[test]
fn reload_keeps_handles_and_refcounts() {
    let session = host::boot_default();

    let strings: Vec<String> = (0..100)
        .map(|i| String::new(&format!("object {i}")).expect("StringNew"))
        .collect();
    let extra = strings[7].clone();
    let before = current().expect("booted");
    let counts: Vec<i32> = strings
        .iter()
        .map(|text| before.objects.count(text.handle()))
        .collect();
    drop(before);

    session.reload();
    assert!(host::take_exception().is_none());

    let after = current().expect("reloaded");
    for (text, count) in strings.iter().zip(&counts) {
        assert_eq!(after.objects.count(text.handle()), *count);
    }
    assert_eq!(after.objects.count(extra.handle()), 2);
    assert_eq!(strings[99].to_rust_string().expect("utf8"), "object 99");
    drop(after);

    drop(extra);
    drop(strings);
    assert_eq!(host::released_objects().len(), 100);
}

#[test]
fn reloads_are_idempotent() {
    let session = host::boot_default();
    let _kept = String::new("kept").expect("StringNew");
    let action = Action::new(|| Ok(())).expect("action");

    let layout = current().expect("booted").layout;
    let working = |bytes: Vec<u8>| bytes[layout.start..layout.end].to_vec();

    session.reload();
    let first = working(host::region_bytes());
    session.reload();
    let second = working(host::region_bytes());
    assert_eq!(first, second);

    let context = current().expect("reloaded");
    assert_eq!(context.actions.occupied_len(), 1);
    drop(context);
    action.invoke().expect("closure survives reload");
}

#[test]
fn pool_cycles_return_every_slot() {
    let _session = host::boot_with_script::<Faulty>();
    let context = current().expect("booted");
    let pool = &context.base_script_objects;
    let initial = pool.free_len();

    let mut slots: Vec<_> = (0..initial).map(|_| pool.reserve().1).collect();
    assert_eq!(pool.free_len(), 0);
    // Release odd positions first, then the rest backwards.
    let (odd, even): (Vec<_>, Vec<_>) = slots
        .drain(..)
        .enumerate()
        .partition(|(i, _)| i % 2 == 1);
    for (_, slot) in odd.into_iter().chain(even.into_iter().rev()) {
        pool.release(slot);
    }
    assert_eq!(pool.free_len(), initial);
}

#[cfg(feature = "demo")]
#[test]
fn demo_plugin_spins_and_counts_boots() {
    let config = HostConfig {
        base_script_slot_size: crate::demo::BASE_SCRIPT_SLOT_SIZE,
        ..HostConfig::default()
    };
    let session = host::boot_checked(&config, crate::Init);

    let script = host::create_base_script().expect("spawn");
    for _ in 0..3 {
        host::update(script).expect("update");
    }
    let mut lethal = false;
    for _ in 0..5 {
        lethal = host::receive_damage(script, 1.0).expect("damage");
    }
    assert!(lethal);

    session.reload();
    let context = current().expect("reloaded");
    // SAFETY: the plugin is not running
    let boots = crate::demo::boot_count(unsafe { context.plugin_memory() });
    assert_eq!(boots, Some(2));
    drop(context);
    host::destroy_base_script(script).expect("destroy");
}
