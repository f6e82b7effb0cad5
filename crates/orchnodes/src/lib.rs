//! Standard node library
//!
//! The node executor and the handlers for every built-in node kind, plus the
//! collaborators they call out to (HTTP client, subprocess launcher).

mod control;
mod data;
mod executor;
mod http;
mod human;
mod loops;
mod subprocess;

pub use executor::NodeExecutor;
pub use http::{HttpAuth, HttpClient, HttpRequest, HttpResponse, ReqwestClient};
pub use loops::{LoopContext, LoopStack};
pub use subprocess::{
    ExecutionTreeNode, SubprocessLauncher, SubprocessManager, ValidationReport, LATEST, PUBLISHED,
};
