mod db_setup;
mod extract;
mod illness;
mod illness_keys;
mod loader;
mod matrix;
mod metadata;
mod orchestrator;
mod platform;
mod run;
#[cfg(test)]
mod tests;
mod transform;

pub use run::run;

use db_setup::*;
use extract::*;
use illness::*;
use illness_keys::*;
use loader::*;
use matrix::*;
use metadata::*;
use orchestrator::*;
use platform::*;
use transform::*;

pub(crate) use db_setup::{DB_SCHEMA_VERSION, WAREHOUSE_TABLES, count_rows};
