//! Persistent regions: metadata table, fixed-address mapping, and the
//! address classifier used by the logger.

pub mod extent_map;
pub mod manager;
pub mod table;

pub use extent_map::{Extent, ExtentMap};
pub use manager::{region_base, RegionManager, F_READONLY, F_READWRITE};
pub use table::{RegionTable, SlotRecord};
