pub mod cache;
pub mod config_parser;
pub mod endpoints;
pub mod error;
pub mod function;
pub mod gateway_util;
pub mod inference;
pub mod jsonschema_util;
pub mod minijinja_util;
pub mod model;
pub mod observability;
pub mod tool;
pub mod uuid_util;
pub mod variant;

pub use error::{Error, ErrorDetails};
