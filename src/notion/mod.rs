pub mod blocks;
pub mod calendar;
pub mod client;
pub mod projector;

pub use calendar::{CalendarOutcome, CalendarProjector};
pub use client::{NotionApi, NotionClient, NotionError};
pub use projector::{ProjectError, Projector};
