//! The demonstration plugin behind the exported `Init`: a `BaseScript`
//! subclass the managed side spawns, and a `PluginMain` that exercises
//! strings, physics and a native-backed delegate.

use std::cell::Cell;
use std::rc::Rc;

use crate::{
    Action, BaseScript, BaseScriptBase, PluginDescriptor, Physics, Result,
    String, Subclass, SubclassFactory, Vector3, slot_size_of,
};

/// Degrees turned per update.
const SPIN: f32 = 15.0;

pub struct Spinner {
    base: BaseScriptBase,
    angle: f32,
    health: f32,
}

impl Spinner {
    pub const HEALTH: f32 = 5.0;

    pub fn angle(&self) -> f32 {
        self.angle
    }
}

impl BaseScript for Spinner {
    fn base(&self) -> &BaseScriptBase {
        &self.base
    }

    fn update(&mut self) -> Result<()> {
        self.angle = (self.angle + SPIN) % 360.0;
        log::trace!("spinner {} at {}°", self.base.cpp_handle(), self.angle);
        Ok(())
    }

    fn receive_damage(&mut self, amount: f32) -> Result<bool> {
        self.health -= amount;
        Ok(self.health <= 0.0)
    }
}

impl Subclass for Spinner {
    fn construct(base: BaseScriptBase) -> Self {
        Spinner {
            base,
            angle: 0.0,
            health: Spinner::HEALTH,
        }
    }
}

/// Slot size the managed side must lay out `BaseScript` objects with.
pub const BASE_SCRIPT_SLOT_SIZE: usize = slot_size_of(&[size_of::<Spinner>()]);

pub const PLUGIN: PluginDescriptor = PluginDescriptor::new(plugin_main)
    .with_base_script(SubclassFactory::of::<Spinner>(), BASE_SCRIPT_SLOT_SIZE);

fn plugin_main(memory: &mut [u8], first_boot: bool) -> Result<()> {
    log::info!(
        "demo plugin up, {} bytes of plugin memory, first boot: {first_boot}",
        memory.len()
    );
    // The boot counter lives in plugin memory and survives reloads.
    if let Some(counter) = memory.first_chunk_mut::<4>() {
        let boots = if first_boot { 1 } else { u32::from_le_bytes(*counter) + 1 };
        *counter = boots.to_le_bytes();
        log::debug!("boot #{boots}");
    }
    if !first_boot {
        return Ok(());
    }

    let greeting = String::new("hello")?.concat(&String::new(" from native")?)?;
    log::info!("{}", greeting.to_rust_string()?);

    if let Some(hit) = Physics::raycast(Vector3::new(0.0, 10.0, 0.0), Vector3::DOWN)? {
        log::info!("ground {} below, at {:?}", hit.distance()?, hit.point()?);
    }

    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let action = Action::new(move || {
        counter.set(counter.get() + 1);
        Ok(())
    })?;
    let twice = action.combine(&action)?;
    twice.invoke()?;
    log::info!("native delegate ran {} times through the managed side", calls.get());
    Ok(())
}

/// How often `PluginMain` ran on this plugin memory.
pub fn boot_count(memory: &[u8]) -> Option<u32> {
    memory.first_chunk::<4>().map(|counter| u32::from_le_bytes(*counter))
}
