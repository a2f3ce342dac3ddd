pub mod domain;
pub mod mapbook;
pub mod mapfile;
pub mod ops;

pub use domain::Domain;
pub use mapbook::{Mapbook, StatusCounts};
pub use mapfile::{MapData, SaveMeta};
