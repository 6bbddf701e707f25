mod arrays;
mod collections;
mod context;
mod delegates;
mod engine;
mod error;
mod functions;
mod handles;
mod layout;
mod pools;
mod primitives;
mod subclass;
mod system;

#[cfg(feature = "demo")]
pub mod demo;
pub mod entry;
pub mod host;

#[cfg(test)]
mod scenarios;

pub use arrays::*;
pub use collections::*;
pub use context::*;
pub use delegates::*;
pub use engine::*;
pub use entry::{InitMode, PluginDescriptor, PluginMain};
pub use error::*;
pub use functions::*;
pub use handles::*;
pub use layout::*;
pub use pools::*;
pub use primitives::*;
pub use subclass::*;
pub use system::*;

#[cfg(feature = "demo")]
crate::export_plugin!(demo::PLUGIN);
