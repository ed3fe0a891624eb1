pub mod nhl_api;

pub use nhl_api::*;
