pub mod slot_map;

pub use slot_map::SlotMap;
