//! Data containers for the calibration of imaging
//! atmospheric Cherenkov telescope cameras.
//!
//! * run header and telescope events as they come
//!   from the event files
//! * calibration products (pedestals, gains, time
//!   offsets, IPR curves)
//! * running statistics and charge histograms
//! * binary serialization and file readers/writers
//!

#[macro_use] extern crate log;

pub mod constants;
pub mod errors;
pub mod serialization;
pub mod run;
pub mod events;
pub mod calibrations;
pub mod stats;
pub mod io;

pub use run::{RunHeader,
              TelescopeDescription,
              TelescopeType};
pub use events::{TelescopeEvent,
                 ChannelData,
                 EventType,
                 GainPath};

#[cfg(feature = "random")]
pub trait FromRandom {
  fn from_random() -> Self;
}
