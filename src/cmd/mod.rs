//! CLI command implementations.
//!
//! | Module      | Commands handled |
//! |-------------|------------------|
//! | `serve`     | `Serve`          |
//! | `research`  | `Research`       |

pub mod research;
pub mod serve;

pub use research::cmd_research;
pub use serve::cmd_serve;
