//! Datera CSI driver

#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    // box_pointers,
    // elided_lifetimes_in_paths, // allow anonymous lifetime
    // missing_copy_implementations, // Copy may cause unnecessary memory copy
    missing_debug_implementations,
    missing_docs,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    // unreachable_pub, allow clippy::redundant_pub_crate lint instead
    // unsafe_code,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    // unused_results,
    variant_size_differences,

    clippy::all,
    clippy::restriction,
    clippy::pedantic,
    clippy::cargo
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::blanket_clippy_restriction_lints, // allow clippy::restriction
    clippy::implicit_return, // actually omitting the return keyword is idiomatic Rust code
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::panic, // allow debug_assert, panic in production code
    clippy::unreachable,  // Use `unreachable!` instead of `panic!` when impossible cases occurs
    // clippy::panic_in_result_fn,
    clippy::separated_literal_suffix, // conflict with unseparated_literal_suffix
    clippy::shadow_unrelated, //it’s a common pattern in Rust code
    clippy::shadow_reuse, //it’s a common pattern in Rust code
    clippy::shadow_same, //it’s a common pattern in Rust code
    clippy::missing_errors_doc,
    clippy::exhaustive_structs,
    clippy::exhaustive_enums,
    clippy::missing_panics_doc,
    clippy::panic_in_result_fn,
    clippy::mod_module_files,
    clippy::std_instead_of_core, // Cause false positive in src/common/error.rs
    clippy::std_instead_of_alloc,
    clippy::question_mark_used,  // it’s a common pattern in Rust code
    clippy::absolute_paths,      // Allow use through absolute paths,like `std::env::current_dir`
    clippy::ref_patterns,   // Allow Some(ref x)
    clippy::single_call_fn, // Allow function is called only once
    clippy::pub_with_shorthand, // Allow pub(super)
    clippy::min_ident_chars, // Allow Err(e)
    clippy::missing_assert_message,  // Allow assert! without message, mainly in test code
    clippy::impl_trait_in_params, // Allow impl AsRef<Path>, it's common in Rust
    clippy::module_inception, // We consider mod.rs as a declaration file.
    clippy::pub_use, // pub use mod::item as new_name is common in Rust,
)]

/// Backend resource client
pub mod backend;
pub mod common;
/// Configurations
pub mod config;
pub mod csi;
/// Local command execution
pub mod exec;
