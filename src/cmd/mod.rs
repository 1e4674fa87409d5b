//! CLI command implementations.
//!
//! | Module    | Commands handled                                              |
//! |-----------|---------------------------------------------------------------|
//! | `session` | `Create`, `Advance`, `Resume`, `Status`, `History`, `Submit`, `Chat` |
//! | `serve`   | `Serve`                                                       |
//! | `config`  | `Config`                                                      |

pub mod config;
pub mod serve;
pub mod session;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use session::{
    cmd_advance, cmd_chat, cmd_create, cmd_history, cmd_resume, cmd_status, cmd_submit,
};
