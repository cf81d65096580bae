pub mod location;
pub mod reading;

pub use location::{Location, NewLocation};
pub use reading::{
    ParseCategoryError, RawReading, TrafficCategory, TrafficDataRow, TrafficReading, MAX_VEHICLE_COUNT,
};
