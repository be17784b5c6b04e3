pub mod flow;
pub mod provider;
pub mod session;
pub mod state;
