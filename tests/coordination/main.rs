mod common;

mod break_protocol;
mod garbage_collection;
mod open_conflicts;
