//! HTTP front-end for submitting and inspecting research runs.
//!
//! | Route          | Handler                                          |
//! |----------------|--------------------------------------------------|
//! | `GET /`        | `{"running": bool}` across all runs              |
//! | `POST /start`  | submit `{"research_content": ...}` as a new run  |
//! | `GET /status`  | one run (`?run_id=`) or all runs                 |
//! | `GET /log`     | tail of a run log (`?run_id=&bytes=`)            |
//! | `GET /blobs`   | documents stored for `?run_folder=`              |
//! | `GET /blob/download` | one document (`?name=`) as an attachment   |
//! | `GET /debug`   | resolved paths and configuration flags           |
//! | `GET /health`  | plain `ok`                                       |

pub mod api;
pub mod server;

pub use api::{AppState, SharedState};
pub use server::{ServerConfig, build_router, start_server};
