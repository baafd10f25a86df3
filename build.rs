//! Build script for the scanmaster project.
//!
//! Ensures the crate is recompiled when migration files change, which the
//! `SQLx` `migrate!()` macro needs to pick up new schema revisions.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
