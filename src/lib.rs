mod app;
mod domain;
mod gateway;
mod infra;
mod shared;

pub use app::logging;
pub use gateway::manager::run;
