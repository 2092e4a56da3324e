pub mod backfill;
pub mod health;
pub mod list;
pub mod read;
pub mod stats;
