pub mod capture;
pub mod scheduler;
pub mod server;

pub use scheduler::Scheduler;
pub use server::{build_router, ApiError, AppState};
