// Weir container core - library exports

pub mod checkpoint;
pub mod chooser;
pub mod consumers;
pub mod container;
pub mod producers;
pub mod registry;
pub mod reporters;
pub mod runloop;
pub mod serdes;
pub mod storage;
pub mod task;

pub use self::container::Container;
pub use self::registry::ComponentRegistry;
